//! Server host key verification for the client side.
//!
//! The default policy accepts any key and is only suitable for tests and
//! trusted networks. Production clients pin a key, point at an OpenSSH
//! `known_hosts` file, or supply their own callback.
//!
//! # Example
//!
//! ```rust,no_run
//! use sftpfs_proto::ssh::client::ClientConfig;
//! use sftpfs_proto::ssh::known_hosts::HostKeyPolicy;
//!
//! let config = ClientConfig::password("files.example.com", "alice", "secret")
//!     .with_host_key(HostKeyPolicy::KnownHosts("/home/alice/.ssh/known_hosts".into()));
//! ```

use russh::keys::known_hosts::known_host_keys_path;
use russh::keys::ssh_key::PublicKey;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, warn};

/// Caller-supplied verification: `(host, port, key) -> accept`.
pub type HostKeyCallback = Arc<dyn Fn(&str, u16, &PublicKey) -> bool + Send + Sync>;

/// Outcome of checking a key against stored entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyStatus {
    /// An entry for the host matches the key.
    Known,
    /// Entries exist for the host but none match.
    Changed {
        /// Line of the first stored entry
        line: usize,
    },
    /// No entry for the host.
    Unknown,
}

/// How the client decides whether to trust a server's host key.
#[derive(Clone, Default)]
pub enum HostKeyPolicy {
    /// Accept every key. Insecure; logs a warning on each connection.
    #[default]
    AcceptAny,
    /// Accept exactly this key.
    Fixed(PublicKey),
    /// Accept keys recorded for the host in an OpenSSH `known_hosts` file.
    /// Unknown hosts and changed keys are rejected.
    KnownHosts(PathBuf),
    /// Delegate to a callback.
    Callback(HostKeyCallback),
}

impl HostKeyPolicy {
    /// Wraps a closure as a [`HostKeyPolicy::Callback`].
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(&str, u16, &PublicKey) -> bool + Send + Sync + 'static,
    {
        HostKeyPolicy::Callback(Arc::new(f))
    }

    /// Decides whether `key`, presented by `host:port`, is trusted.
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> bool {
        match self {
            HostKeyPolicy::AcceptAny => {
                warn!(host, port, "accepting host key without verification");
                true
            }
            HostKeyPolicy::Fixed(expected) => {
                let ok = expected.key_data() == key.key_data();
                if !ok {
                    error!(host, port, "host key does not match the pinned key");
                }
                ok
            }
            HostKeyPolicy::KnownHosts(path) => match known_hosts_status(host, port, key, path) {
                HostKeyStatus::Known => true,
                HostKeyStatus::Changed { line } => {
                    error!(
                        host,
                        port,
                        known_hosts = %path.display(),
                        line,
                        "host key changed"
                    );
                    false
                }
                HostKeyStatus::Unknown => {
                    warn!(host, port, known_hosts = %path.display(), "unknown host");
                    false
                }
            },
            HostKeyPolicy::Callback(f) => f(host, port, key),
        }
    }
}

impl fmt::Debug for HostKeyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostKeyPolicy::AcceptAny => f.write_str("AcceptAny"),
            HostKeyPolicy::Fixed(key) => f
                .debug_tuple("Fixed")
                .field(&key.algorithm().as_str())
                .finish(),
            HostKeyPolicy::KnownHosts(path) => f.debug_tuple("KnownHosts").field(path).finish(),
            HostKeyPolicy::Callback(_) => f.write_str("Callback(<callback>)"),
        }
    }
}

/// Looks `host:port` up in an OpenSSH `known_hosts` file. A missing or
/// unreadable file counts as unknown.
pub fn known_hosts_status(
    host: &str,
    port: u16,
    key: &PublicKey,
    path: &std::path::Path,
) -> HostKeyStatus {
    let known = match known_host_keys_path(host, port, path) {
        Ok(known) => known,
        Err(e) => {
            warn!(known_hosts = %path.display(), "cannot read known_hosts: {}", e);
            return HostKeyStatus::Unknown;
        }
    };

    if known
        .iter()
        .any(|(_, stored)| stored.key_data() == key.key_data())
    {
        return HostKeyStatus::Known;
    }
    match known.first() {
        Some((line, _)) => HostKeyStatus::Changed { line: *line },
        None => HostKeyStatus::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::ssh_key::Algorithm;
    use russh::keys::PrivateKey;
    use std::io::Write;

    fn public_key() -> PublicKey {
        PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
            .unwrap()
            .public_key()
            .clone()
    }

    #[test]
    fn test_accept_any() {
        assert!(HostKeyPolicy::default().verify("h", 22, &public_key()));
    }

    #[test]
    fn test_fixed() {
        let key = public_key();
        let policy = HostKeyPolicy::Fixed(key.clone());
        assert!(policy.verify("h", 22, &key));
        assert!(!policy.verify("h", 22, &public_key()));
    }

    #[test]
    fn test_callback() {
        let policy = HostKeyPolicy::callback(|host, port, _| host == "trusted" && port == 2222);
        let key = public_key();
        assert!(policy.verify("trusted", 2222, &key));
        assert!(!policy.verify("other", 2222, &key));
        assert_eq!(format!("{:?}", policy), "Callback(<callback>)");
    }

    #[test]
    fn test_known_hosts_file() {
        let key = public_key();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[localhost]:2222 {}", key.to_openssh().unwrap()).unwrap();
        file.flush().unwrap();

        let path = file.path();
        assert_eq!(known_hosts_status("localhost", 2222, &key, path), HostKeyStatus::Known);
        assert_eq!(
            known_hosts_status("otherhost", 2222, &key, path),
            HostKeyStatus::Unknown
        );
        assert!(matches!(
            known_hosts_status("localhost", 2222, &public_key(), path),
            HostKeyStatus::Changed { .. }
        ));

        let policy = HostKeyPolicy::KnownHosts(path.to_path_buf());
        assert!(policy.verify("localhost", 2222, &key));
        assert!(!policy.verify("otherhost", 2222, &key));
    }
}
