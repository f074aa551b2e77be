//! SSH client connection driver.
//!
//! Dials the server, authenticates, opens the `sftp` subsystem and hands the
//! session to [`RusshTransport`]. Connection setup is retried per
//! [`RetryPolicy`]; nothing after that is.
//!
//! # Example
//!
//! ```rust,no_run
//! use sftpfs_proto::ssh::client::ClientConfig;
//! use sftpfs_proto::ssh::sftp::SftpFs;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::password("127.0.0.1:2222", "alice", "password1")
//!     .with_timeout(Duration::from_secs(5))
//!     .with_max_retries(1);
//! let fs = SftpFs::connect(&config).await?;
//! fs.close().await?;
//! # Ok(())
//! # }
//! ```

use crate::ssh::known_hosts::HostKeyPolicy;
use crate::ssh::session::{connect_with_retry, RetryPolicy};
use crate::ssh::sftp::RusshTransport;
use russh::client::{self, Handle};
use russh::keys::ssh_key::PublicKey;
use russh::keys::{decode_secret_key, PrivateKey, PrivateKeyWithHashAlg};
use russh::Disconnect;
use russh_sftp::client::SftpSession;
use sftpfs_platform::{ErrorKind, FsError, FsResult};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Port used when the host string has none.
pub const DEFAULT_PORT: u16 = 22;

/// Client credentials. One method per connection.
#[derive(Clone)]
pub enum Auth {
    /// Password, as bytes.
    Password(Vec<u8>),
    /// PEM or OpenSSH encoded private key, unencrypted.
    Key(Vec<u8>),
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Auth::Password(_) => f.write_str("Password(<redacted>)"),
            Auth::Key(_) => f.write_str("Key(<redacted>)"),
        }
    }
}

/// Client connection settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host` or `host:port`; `[addr]:port` for IPv6.
    pub host: String,
    /// Login name.
    pub user: String,
    /// Credentials.
    pub auth: Auth,
    /// Bound on each connection attempt (default: 30s).
    pub timeout: Duration,
    /// Server key verification (default: accept any, insecure).
    pub host_key: HostKeyPolicy,
    /// Connection retries (default: 3 retries from 1s).
    pub retry: RetryPolicy,
}

impl ClientConfig {
    /// Settings for `user@host` with `auth` and defaults elsewhere.
    pub fn new(host: impl Into<String>, user: impl Into<String>, auth: Auth) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            auth,
            timeout: Duration::from_secs(30),
            host_key: HostKeyPolicy::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Password authentication.
    pub fn password(
        host: impl Into<String>,
        user: impl Into<String>,
        password: impl AsRef<[u8]>,
    ) -> Self {
        Self::new(host, user, Auth::Password(password.as_ref().to_vec()))
    }

    /// Public key authentication with an encoded private key.
    pub fn key(host: impl Into<String>, user: impl Into<String>, pem: impl AsRef<[u8]>) -> Self {
        Self::new(host, user, Auth::Key(pem.as_ref().to_vec()))
    }

    /// Sets the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the host key policy.
    pub fn with_host_key(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key = policy;
        self
    }

    /// Replaces the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the number of retries after the first attempt.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    /// Sets the delay before the first retry.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry.initial_delay = delay;
        self
    }
}

/// russh client callbacks. Only host key verification is customised.
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(self.policy.verify(&self.host, self.port, server_public_key))
    }
}

/// Credentials checked once, before any network traffic.
enum Credential {
    Password(String),
    Key(Arc<PrivateKey>),
}

impl Credential {
    fn from_auth(auth: &Auth) -> FsResult<Self> {
        match auth {
            Auth::Password(bytes) => String::from_utf8(bytes.clone())
                .map(Credential::Password)
                .map_err(|_| FsError::invalid("password is not valid UTF-8")),
            Auth::Key(pem) => {
                let text = std::str::from_utf8(pem)
                    .map_err(|_| FsError::invalid("private key is not valid UTF-8"))?;
                let key = decode_secret_key(text, None)
                    .map_err(|e| FsError::invalid(format!("cannot parse private key: {}", e)))?;
                Ok(Credential::Key(Arc::new(key)))
            }
        }
    }
}

/// Connects per `config` and opens an SFTP session.
///
/// # Errors
///
/// - `InvalidInput` for a malformed host or key, without any attempt.
/// - [`FsError::Connect`] once every attempt has failed; its kind is that of
///   the last attempt (`AuthenticationFailed`, `TimedOut`, ...).
pub async fn connect(config: &ClientConfig) -> FsResult<RusshTransport> {
    let (host, port) = split_host_port(&config.host)?;
    let credential = Credential::from_auth(&config.auth)?;
    info!(host = %host, port, user = %config.user, "connecting");

    let host = host.as_str();
    let credential = &credential;
    connect_with_retry(&config.retry, |attempt| async move {
        debug!(host, port, attempt, "dialing");
        match tokio::time::timeout(
            config.timeout,
            connect_once(config, host, port, credential),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(FsError::new(
                ErrorKind::TimedOut,
                format!("connecting to {}:{} timed out after {:?}", host, port, config.timeout),
            )),
        }
    })
    .await
}

async fn connect_once(
    config: &ClientConfig,
    host: &str,
    port: u16,
    credential: &Credential,
) -> FsResult<RusshTransport> {
    let ssh_config = Arc::new(client::Config::default());
    let handler = ClientHandler {
        host: host.to_string(),
        port,
        policy: config.host_key.clone(),
    };
    let mut session = client::connect(ssh_config, (host, port), handler)
        .await
        .map_err(ssh_error)?;

    match open_sftp(&mut session, &config.user, credential).await {
        Ok(sftp) => {
            info!(host, port, user = %config.user, "sftp session established");
            Ok(RusshTransport::new(sftp, session))
        }
        Err(err) => {
            if let Err(e) = session
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
            {
                debug!("disconnect after failed setup: {}", e);
            }
            Err(err)
        }
    }
}

async fn open_sftp(
    session: &mut Handle<ClientHandler>,
    user: &str,
    credential: &Credential,
) -> FsResult<SftpSession> {
    let result = match credential {
        Credential::Password(password) => session
            .authenticate_password(user, password.as_str())
            .await
            .map_err(ssh_error)?,
        Credential::Key(key) => {
            let hash = session
                .best_supported_rsa_hash()
                .await
                .map_err(ssh_error)?
                .flatten();
            session
                .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::clone(key), hash))
                .await
                .map_err(ssh_error)?
        }
    };
    if !result.success() {
        warn!(user, "authentication rejected");
        return Err(FsError::new(
            ErrorKind::AuthenticationFailed,
            format!("authentication failed for user {}", user),
        ));
    }

    let channel = session.channel_open_session().await.map_err(ssh_error)?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(ssh_error)?;
    SftpSession::new(channel.into_stream())
        .await
        .map_err(super::sftp::types::sftp_error)
}

/// Splits `host[:port]`, accepting `[v6]:port`. The port defaults to 22.
pub fn split_host_port(host: &str) -> FsResult<(String, u16)> {
    let bad = || FsError::invalid(format!("invalid host: {:?}", host));

    if let Some(rest) = host.strip_prefix('[') {
        let (addr, tail) = rest.split_once(']').ok_or_else(bad)?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().map_err(|_| bad())?,
            None if tail.is_empty() => DEFAULT_PORT,
            None => return Err(bad()),
        };
        return Ok((addr.to_string(), port));
    }

    match host.rsplit_once(':') {
        // Bare IPv6 address
        Some((addr, _)) if addr.contains(':') => Ok((host.to_string(), DEFAULT_PORT)),
        Some((addr, port)) if !addr.is_empty() => {
            Ok((addr.to_string(), port.parse().map_err(|_| bad())?))
        }
        Some(_) => Err(bad()),
        None if host.is_empty() => Err(bad()),
        None => Ok((host.to_string(), DEFAULT_PORT)),
    }
}

/// Classifies a russh error.
pub fn ssh_error(err: russh::Error) -> FsError {
    let kind = match &err {
        russh::Error::IO(e) => return FsError::new(ErrorKind::from(e.kind()), e.to_string()),
        russh::Error::Disconnect | russh::Error::HUP | russh::Error::SendError => {
            ErrorKind::TransportClosed
        }
        russh::Error::ConnectionTimeout
        | russh::Error::InactivityTimeout
        | russh::Error::KeepaliveTimeout
        | russh::Error::Elapsed(_) => ErrorKind::TimedOut,
        russh::Error::NotAuthenticated => ErrorKind::AuthenticationFailed,
        russh::Error::UnknownKey | russh::Error::KeyChanged { .. } => {
            ErrorKind::PermissionDenied
        }
        _ => ErrorKind::Other,
    };
    FsError::new(kind, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("example.com").unwrap(), ("example.com".into(), 22));
        assert_eq!(split_host_port("example.com:2222").unwrap(), ("example.com".into(), 2222));
        assert_eq!(split_host_port("[::1]:2022").unwrap(), ("::1".into(), 2022));
        assert_eq!(split_host_port("[::1]").unwrap(), ("::1".into(), 22));
        assert_eq!(split_host_port("::1").unwrap(), ("::1".into(), 22));

        for bad in ["", ":22", "host:port", "[::1", "[::1]x", "host:70000"] {
            assert_eq!(
                split_host_port(bad).unwrap_err().kind(),
                ErrorKind::InvalidInput,
                "{bad}"
            );
        }
    }

    #[test]
    fn test_config_defaults_and_builders() {
        let config = ClientConfig::password("h", "u", "p");
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.retry, RetryPolicy::default());
        assert!(matches!(config.host_key, HostKeyPolicy::AcceptAny));

        let config = config
            .with_timeout(Duration::from_secs(2))
            .with_max_retries(0)
            .with_retry_delay(Duration::from_millis(5));
        assert_eq!(config.timeout, Duration::from_secs(2));
        assert_eq!(config.retry.max_retries, 0);
        assert_eq!(config.retry.initial_delay, Duration::from_millis(5));

        let debug = format!("{:?}", config);
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("[112]"));
    }

    #[tokio::test]
    async fn test_bad_key_is_not_retried() {
        let config = ClientConfig::key("127.0.0.1:1", "u", "not a key")
            .with_retry_delay(Duration::from_secs(60));
        let err = connect(&config).await.err().expect("connect with a bad key must fail");
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(!matches!(err, FsError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_refused_connection_exhausts_retries() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = ClientConfig::password(addr.to_string(), "u", "p")
            .with_max_retries(1)
            .with_retry_delay(Duration::from_millis(10));
        match connect(&config).await {
            Err(FsError::Connect { attempts, .. }) => assert_eq!(attempts, 2),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("connected to a closed port"),
        }
    }
}
