//! Server-side credential checks.
//!
//! The server asks a callback whether a `(user, secret)` pair is valid. The
//! helpers here build the common callbacks; every mismatch returns the same
//! [`AuthError`] so clients cannot tell an unknown user from a bad secret.
//!
//! # Example
//!
//! ```rust
//! use sftpfs_proto::ssh::auth::multi_user_password_auth;
//! use std::collections::HashMap;
//!
//! let users = HashMap::from([
//!     ("alice".to_string(), "password1".to_string()),
//!     ("bob".to_string(), "password2".to_string()),
//! ]);
//! let check = multi_user_password_auth(users);
//!
//! assert!(check("alice", b"password1").is_ok());
//! assert!(check("charlie", b"anything").is_err());
//! ```

use russh::keys::ssh_key::PublicKey;
use sftpfs_platform::{ErrorKind, FsError};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Rejection returned by credential callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuthError;

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("authentication failed")
    }
}

impl std::error::Error for AuthError {}

impl From<AuthError> for FsError {
    fn from(err: AuthError) -> Self {
        FsError::new(ErrorKind::AuthenticationFailed, err.to_string())
    }
}

/// `(user, password) -> Ok(())` to accept.
pub type PasswordCallback = Arc<dyn Fn(&str, &[u8]) -> Result<(), AuthError> + Send + Sync>;

/// `(user, offered key) -> Ok(())` to accept.
pub type PublicKeyCallback = Arc<dyn Fn(&str, &PublicKey) -> Result<(), AuthError> + Send + Sync>;

/// Compares two secrets in constant time.
///
/// Both sides are hashed first so the comparison does not depend on where
/// or whether the lengths differ.
///
/// ```rust
/// use sftpfs_proto::ssh::auth::constant_time_compare;
///
/// assert!(constant_time_compare(b"secret", b"secret"));
/// assert!(!constant_time_compare(b"secret", b"wrong"));
/// ```
pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    let hash_a = Sha256::digest(a);
    let hash_b = Sha256::digest(b);
    hash_a.ct_eq(&hash_b).into()
}

/// Accepts exactly one user with one password.
pub fn simple_password_auth(user: impl Into<String>, password: impl Into<String>) -> PasswordCallback {
    let user = user.into();
    let password = password.into();
    Arc::new(move |u: &str, p: &[u8]| {
        let user_ok = constant_time_compare(u.as_bytes(), user.as_bytes());
        let pass_ok = constant_time_compare(p, password.as_bytes());
        if user_ok & pass_ok {
            Ok(())
        } else {
            Err(AuthError)
        }
    })
}

/// Accepts any user in `users` with that user's password.
pub fn multi_user_password_auth(users: HashMap<String, String>) -> PasswordCallback {
    Arc::new(move |u: &str, p: &[u8]| {
        let (known, expected) = match users.get(u) {
            Some(expected) => (true, expected.as_bytes()),
            None => (false, &[][..]),
        };
        // Compare even for unknown users so timing does not reveal them.
        let pass_ok = constant_time_compare(p, expected);
        if known & pass_ok {
            Ok(())
        } else {
            Err(AuthError)
        }
    })
}

/// Accepts `user` presenting any of `keys`.
pub fn public_key_auth(user: impl Into<String>, keys: Vec<PublicKey>) -> PublicKeyCallback {
    let user = user.into();
    Arc::new(move |u: &str, offered: &PublicKey| {
        let user_ok = constant_time_compare(u.as_bytes(), user.as_bytes());
        let key_ok = keys.iter().any(|k| k.key_data() == offered.key_data());
        if user_ok & key_ok {
            Ok(())
        } else {
            Err(AuthError)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::ssh_key::Algorithm;
    use russh::keys::PrivateKey;

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare(b"password123", b"password123"));
        assert!(!constant_time_compare(b"password123", b"password124"));
        assert!(!constant_time_compare(b"short", b"verylongpassword"));
        assert!(constant_time_compare(b"", b""));
    }

    #[test]
    fn test_simple_password_auth() {
        let check = simple_password_auth("test", "secret");
        assert!(check("test", b"secret").is_ok());
        assert_eq!(check("test", b"wrong"), Err(AuthError));
        assert_eq!(check("other", b"secret"), Err(AuthError));
    }

    #[test]
    fn test_multi_user_password_auth() {
        let check = multi_user_password_auth(HashMap::from([
            ("alice".to_string(), "password1".to_string()),
            ("bob".to_string(), "password2".to_string()),
        ]));
        assert!(check("alice", b"password1").is_ok());
        assert!(check("bob", b"password2").is_ok());
        assert!(check("alice", b"password2").is_err());
        assert!(check("charlie", b"anything").is_err());
        // Unknown user with an empty password must not match the empty default.
        assert!(check("charlie", b"").is_err());
    }

    #[test]
    fn test_public_key_auth() {
        let key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519).unwrap();
        let other = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519).unwrap();
        let check = public_key_auth("deploy", vec![key.public_key().clone()]);

        assert!(check("deploy", key.public_key()).is_ok());
        assert!(check("deploy", other.public_key()).is_err());
        assert!(check("root", key.public_key()).is_err());
    }

    #[test]
    fn test_auth_error_kind() {
        let err: FsError = AuthError.into();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
        assert_eq!(AuthError.to_string(), "authentication failed");
    }
}
