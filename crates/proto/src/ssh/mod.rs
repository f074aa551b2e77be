//! SSH plumbing for the SFTP filesystem adapter.
//!
//! The SSH transport itself comes from `russh`; this module wires it to the
//! filesystem capability in both directions.
//!
//! # Architecture
//!
//! 1. **Connection driver** ([`client`], [`session`]) - dial, authenticate,
//!    open the `sftp` subsystem, retry with exponential backoff
//! 2. **Host key policy** ([`known_hosts`]) - pinned key, `known_hosts` file
//!    or callback
//! 3. **Client adapter** ([`sftp::SftpFs`]) - a filesystem backed by a
//!    remote SFTP server
//! 4. **Server runtime** ([`server`]) - accepts SSH connections and serves
//!    the `sftp` subsystem from any filesystem
//! 5. **Credential helpers** ([`auth`]) - constant-time password and key checks
//!
//! # Security Considerations
//!
//! - The default [`HostKeyPolicy::AcceptAny`] does not verify the server and
//!   logs a warning on every connection. Production clients pin a key or use
//!   a `known_hosts` file.
//! - Server credential checks compare in constant time and return the same
//!   error for unknown users and bad secrets.
//! - No-auth server mode must be enabled explicitly.
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [SFTP Draft v3](https://datatracker.ietf.org/doc/html/draft-ietf-secsh-filexfer-02)

pub mod auth;
pub mod client;
pub mod known_hosts;
pub mod server;
pub mod session;
pub mod sftp;

pub use auth::{
    constant_time_compare, multi_user_password_auth, public_key_auth, simple_password_auth,
    AuthError, PasswordCallback, PublicKeyCallback,
};
pub use client::{connect, split_host_port, Auth, ClientConfig, DEFAULT_PORT};
pub use known_hosts::{HostKeyCallback, HostKeyPolicy, HostKeyStatus};
pub use server::{ServerConfig, SftpServer};
pub use session::{connect_with_retry, ExponentialBackoff, RetryPolicy, SessionMachine, SessionState};
pub use sftp::{SftpFile, SftpFs};
