//! SFTP server runtime.
//!
//! Accepts SSH connections, authenticates them through the configured
//! callbacks and serves the `sftp` subsystem from a backing filesystem.
//!
//! # Example
//!
//! ```rust,no_run
//! use sftpfs_platform::MemFs;
//! use sftpfs_proto::ssh::auth::simple_password_auth;
//! use sftpfs_proto::ssh::server::{ServerConfig, SftpServer};
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerConfig::new()
//!     .with_host_key(ServerConfig::generate_host_key()?)
//!     .with_password_auth(simple_password_auth("admin", "secret"));
//!
//! let server = SftpServer::new(Arc::new(MemFs::new()), config)?;
//! let listener = TcpListener::bind("127.0.0.1:2222").await?;
//! server.serve(listener).await?;
//! # Ok(())
//! # }
//! ```

use crate::ssh::auth::{PasswordCallback, PublicKeyCallback};
use crate::ssh::client::ssh_error;
use crate::ssh::session::{SessionMachine, SessionState};
use crate::ssh::sftp::{Handlers, RequestServer, ServerHandler};
use russh::keys::ssh_key::{Algorithm, PublicKey};
use russh::keys::PrivateKey;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet, SshId};
use sftpfs_platform::{FileSystem, FsError, FsResult};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Default cap on authentication attempts per connection.
pub const DEFAULT_MAX_AUTH_TRIES: usize = 6;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Host keys offered during key exchange. At least one is required.
    pub host_keys: Vec<PrivateKey>,
    /// Password check.
    pub password_callback: Option<PasswordCallback>,
    /// Public key check.
    pub public_key_callback: Option<PublicKeyCallback>,
    /// Accept clients without authentication. Tests only.
    pub no_client_auth: bool,
    /// Authentication attempts allowed per connection.
    pub max_auth_tries: usize,
    /// Identification string sent to clients.
    pub server_version: String,
    /// Delay before answering a rejected authentication attempt.
    pub auth_rejection_time: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host_keys: Vec::new(),
            password_callback: None,
            public_key_callback: None,
            no_client_auth: false,
            max_auth_tries: DEFAULT_MAX_AUTH_TRIES,
            server_version: format!("SSH-2.0-sftpfs_{}", env!("CARGO_PKG_VERSION")),
            auth_rejection_time: Duration::from_secs(1),
        }
    }
}

impl ServerConfig {
    /// Empty configuration; add a host key and an auth mechanism.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a host key.
    pub fn with_host_key(mut self, key: PrivateKey) -> Self {
        self.host_keys.push(key);
        self
    }

    /// Sets the password check.
    pub fn with_password_auth(mut self, callback: PasswordCallback) -> Self {
        self.password_callback = Some(callback);
        self
    }

    /// Sets the public key check.
    pub fn with_public_key_auth(mut self, callback: PublicKeyCallback) -> Self {
        self.public_key_callback = Some(callback);
        self
    }

    /// Accepts every client without authentication.
    pub fn with_no_client_auth(mut self) -> Self {
        self.no_client_auth = true;
        self
    }

    /// Sets the per-connection authentication attempt cap.
    pub fn with_max_auth_tries(mut self, tries: usize) -> Self {
        self.max_auth_tries = tries;
        self
    }

    /// Sets the identification string.
    pub fn with_server_version(mut self, version: impl Into<String>) -> Self {
        self.server_version = version.into();
        self
    }

    /// Sets the delay applied to rejected authentication attempts.
    pub fn with_auth_rejection_time(mut self, delay: Duration) -> Self {
        self.auth_rejection_time = delay;
        self
    }

    /// Checks the configuration is usable.
    ///
    /// # Errors
    ///
    /// `InvalidInput` when there is no host key, or no authentication
    /// mechanism and `no_client_auth` is unset.
    pub fn validate(&self) -> FsResult<()> {
        if self.host_keys.is_empty() {
            return Err(FsError::invalid("server config: at least one host key is required"));
        }
        if !self.no_client_auth
            && self.password_callback.is_none()
            && self.public_key_callback.is_none()
        {
            return Err(FsError::invalid(
                "server config: no authentication mechanism configured",
            ));
        }
        if self.max_auth_tries == 0 {
            return Err(FsError::invalid("server config: max_auth_tries must be positive"));
        }
        Ok(())
    }

    /// Generates a fresh Ed25519 host key.
    pub fn generate_host_key() -> FsResult<PrivateKey> {
        PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
            .map_err(|e| FsError::invalid(format!("host key generation failed: {}", e)))
    }

    fn methods(&self) -> MethodSet {
        let mut kinds = Vec::new();
        if self.no_client_auth {
            kinds.push(MethodKind::None);
        }
        if self.password_callback.is_some() {
            kinds.push(MethodKind::Password);
        }
        if self.public_key_callback.is_some() {
            kinds.push(MethodKind::PublicKey);
        }
        MethodSet::from(&kinds[..])
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("host_keys", &self.host_keys.len())
            .field("password_callback", &self.password_callback.is_some())
            .field("public_key_callback", &self.public_key_callback.is_some())
            .field("no_client_auth", &self.no_client_auth)
            .field("max_auth_tries", &self.max_auth_tries)
            .field("server_version", &self.server_version)
            .field("auth_rejection_time", &self.auth_rejection_time)
            .finish()
    }
}

/// Produces the handler roles for one connection.
type HandlerFactory = Arc<dyn Fn() -> Handlers + Send + Sync>;

/// SFTP server over a filesystem.
///
/// Cheap to clone; clones share the configuration.
#[derive(Clone)]
pub struct SftpServer {
    config: Arc<ServerConfig>,
    ssh_config: Arc<russh::server::Config>,
    handlers: HandlerFactory,
}

impl SftpServer {
    /// Builds a server serving `fs`.
    ///
    /// Each connection gets its own [`ServerHandler`], so request ordering is
    /// coordinated within a session and sessions do not block each other.
    ///
    /// # Errors
    ///
    /// Fails when [`ServerConfig::validate`] does.
    pub fn new(fs: Arc<dyn FileSystem>, config: ServerConfig) -> FsResult<Self> {
        Self::build(Arc::new(move || ServerHandler::handlers(fs.clone())), config)
    }

    /// Builds a server dispatching to caller-supplied handler roles, shared
    /// by every connection.
    pub fn with_handlers(handlers: Handlers, config: ServerConfig) -> FsResult<Self> {
        Self::build(Arc::new(move || handlers.clone()), config)
    }

    fn build(handlers: HandlerFactory, config: ServerConfig) -> FsResult<Self> {
        config.validate()?;

        let ssh_config = russh::server::Config {
            server_id: SshId::Standard(config.server_version.clone()),
            methods: config.methods(),
            max_auth_attempts: config.max_auth_tries,
            auth_rejection_time: config.auth_rejection_time,
            auth_rejection_time_initial: Some(Duration::ZERO),
            keys: config.host_keys.clone(),
            ..Default::default()
        };

        Ok(Self {
            config: Arc::new(config),
            ssh_config: Arc::new(ssh_config),
            handlers,
        })
    }

    /// The russh configuration derived from [`ServerConfig`].
    pub fn ssh_config(&self) -> &Arc<russh::server::Config> {
        &self.ssh_config
    }

    /// The handler roles for a new connection.
    fn session_handlers(&self) -> Handlers {
        (self.handlers)()
    }

    /// Accepts connections until `accept` fails, serving each on its own task.
    ///
    /// # Errors
    ///
    /// Returns the `accept` error that ended the loop. Sessions already
    /// running are left to finish.
    pub async fn serve(&self, listener: TcpListener) -> FsResult<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "sftp server listening");
        }
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("accept failed: {}", e);
                    return Err(e.into());
                }
            };
            debug!(%peer, "connection accepted");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve_conn(stream).await {
                    debug!(%peer, "connection ended with error: {}", e);
                }
            });
        }
    }

    /// Serves one connection until the client disconnects.
    pub async fn serve_conn(&self, stream: TcpStream) -> FsResult<()> {
        let peer = stream.peer_addr().ok();
        let handler = ConnectionHandler::new(peer, self.config.clone(), self.session_handlers());

        let running = russh::server::run_stream(self.ssh_config.clone(), stream, handler)
            .await
            .map_err(|e| {
                warn!(peer = ?peer, "ssh handshake failed: {}", e);
                ssh_error(e)
            })?;
        running.await.map_err(ssh_error)
    }
}

impl fmt::Debug for SftpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SftpServer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Per-connection russh handler.
struct ConnectionHandler {
    machine: SessionMachine,
    config: Arc<ServerConfig>,
    handlers: Handlers,
    channels: HashMap<ChannelId, Channel<Msg>>,
}

impl ConnectionHandler {
    fn new(peer: Option<SocketAddr>, config: Arc<ServerConfig>, handlers: Handlers) -> Self {
        let peer = peer.map_or_else(|| "unknown".to_string(), |p| p.to_string());
        let mut machine = SessionMachine::new(peer);
        let _ = machine.transition(SessionState::Handshaking);
        Self {
            machine,
            config,
            handlers,
            channels: HashMap::new(),
        }
    }

    fn enter(&mut self, next: SessionState) {
        if let Err(e) = self.machine.transition(next) {
            warn!("{}", e);
        }
    }

    fn reject(&self) -> Auth {
        Auth::Reject {
            proceed_with_methods: Some(self.config.methods()),
            partial_success: false,
        }
    }

    fn accept(&mut self, user: &str, method: &str) -> Auth {
        info!(user, method, "authentication accepted");
        self.enter(SessionState::Authenticated);
        Auth::Accept
    }

    fn check_key(&self, user: &str, key: &PublicKey) -> bool {
        match &self.config.public_key_callback {
            Some(check) => check(user, key).is_ok(),
            None => false,
        }
    }
}

impl russh::server::Handler for ConnectionHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        if self.config.no_client_auth {
            return Ok(self.accept(user, "none"));
        }
        Ok(self.reject())
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let ok = match &self.config.password_callback {
            Some(check) => check(user, password.as_bytes()).is_ok(),
            None => false,
        };
        if ok {
            return Ok(self.accept(user, "password"));
        }
        warn!(user, method = "password", "authentication rejected");
        Ok(self.reject())
    }

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.check_key(user, public_key) {
            return Ok(Auth::Accept);
        }
        debug!(user, "public key not acceptable");
        Ok(self.reject())
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.check_key(user, public_key) {
            return Ok(self.accept(user, "publickey"));
        }
        warn!(user, method = "publickey", "authentication rejected");
        Ok(self.reject())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(channel = ?channel.id(), "session channel opened");
        self.enter(SessionState::ChannelOpen);
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name != "sftp" {
            warn!(channel = ?channel_id, subsystem = name, "unsupported subsystem");
            session.channel_failure(channel_id)?;
            return Ok(());
        }
        let Some(channel) = self.channels.remove(&channel_id) else {
            warn!(channel = ?channel_id, "subsystem request on unknown channel");
            session.channel_failure(channel_id)?;
            return Ok(());
        };

        session.channel_success(channel_id)?;
        self.enter(SessionState::SftpActive);
        info!(channel = ?channel_id, "sftp subsystem started");
        russh_sftp::server::run(channel.into_stream(), RequestServer::new(self.handlers.clone()))
            .await;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(channel = ?channel, command = %String::from_utf8_lossy(data), "exec refused");
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(channel = ?channel, "shell refused");
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(channel = ?channel, "channel eof");
        session.close(channel)?;
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(channel = ?channel, "channel closed");
        self.channels.remove(&channel);
        Ok(())
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        self.machine.close("connection ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::auth::simple_password_auth;
    use sftpfs_platform::{ErrorKind, MemFs};

    fn host_key() -> PrivateKey {
        ServerConfig::generate_host_key().unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.max_auth_tries, 6);
        assert!(config.server_version.starts_with("SSH-2.0-sftpfs"));
        assert!(!config.no_client_auth);
    }

    #[test]
    fn test_validate_requires_host_key() {
        let config = ServerConfig::new().with_password_auth(simple_password_auth("a", "b"));
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_validate_requires_auth() {
        let config = ServerConfig::new().with_host_key(host_key());
        assert_eq!(config.validate().unwrap_err().kind(), ErrorKind::InvalidInput);

        assert!(config.clone().with_no_client_auth().validate().is_ok());
        assert!(config
            .with_password_auth(simple_password_auth("a", "b"))
            .validate()
            .is_ok());
    }

    #[test]
    fn test_server_builds_ssh_config() {
        let config = ServerConfig::new()
            .with_host_key(host_key())
            .with_password_auth(simple_password_auth("a", "b"))
            .with_max_auth_tries(2)
            .with_server_version("SSH-2.0-test");
        let server = SftpServer::new(Arc::new(MemFs::new()), config).unwrap();
        assert_eq!(server.ssh_config().max_auth_attempts, 2);
        assert_eq!(server.ssh_config().keys.len(), 1);

        let debug = format!("{:?}", server);
        assert!(debug.contains("SSH-2.0-test"));
        assert!(debug.contains("password_callback: true"));
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let err = SftpServer::new(Arc::new(MemFs::new()), ServerConfig::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_handlers_built_per_connection() {
        let config = || {
            ServerConfig::new()
                .with_host_key(host_key())
                .with_password_auth(simple_password_auth("a", "b"))
        };
        let addr = |h: &Handlers| Arc::as_ptr(&h.file_put) as *const ();

        let server = SftpServer::new(Arc::new(MemFs::new()), config()).unwrap();
        let (first, second) = (server.session_handlers(), server.session_handlers());
        assert_ne!(addr(&first), addr(&second));
        assert_eq!(addr(&first), Arc::as_ptr(&first.file_cmd) as *const ());

        let shared = ServerHandler::handlers(Arc::new(MemFs::new()));
        let server = SftpServer::with_handlers(shared.clone(), config()).unwrap();
        assert_eq!(addr(&server.session_handlers()), addr(&shared));
        assert_eq!(addr(&server.clone().session_handlers()), addr(&shared));
    }

    #[test]
    fn test_handler_state_on_accept() {
        let config = Arc::new(
            ServerConfig::new()
                .with_host_key(host_key())
                .with_password_auth(simple_password_auth("a", "b")),
        );
        let handlers = ServerHandler::handlers(Arc::new(MemFs::new()));
        let mut handler = ConnectionHandler::new(None, config, handlers);
        assert_eq!(handler.machine.state(), SessionState::Handshaking);

        assert!(matches!(handler.accept("a", "password"), Auth::Accept));
        assert_eq!(handler.machine.state(), SessionState::Authenticated);
        assert!(matches!(handler.reject(), Auth::Reject { .. }));
    }
}
