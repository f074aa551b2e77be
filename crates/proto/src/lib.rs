//! SFTP in both directions over the `sftpfs` filesystem capability.
//!
//! - **Client**: [`ssh::sftp::SftpFs`] makes a remote SFTP server look like a
//!   local [`FileSystem`](sftpfs_platform::FileSystem).
//! - **Server**: [`ssh::server::SftpServer`] exposes any `FileSystem` to
//!   SFTP clients.
//!
//! # Features
//!
//! - `ssh` (default) - SSH transport, SFTP client and server
//!
//! # Example
//!
//! ```rust,no_run
//! use sftpfs_platform::{FileMode, FileSystem, MemFs};
//! use sftpfs_proto::ssh::auth::simple_password_auth;
//! use sftpfs_proto::ssh::client::ClientConfig;
//! use sftpfs_proto::ssh::server::{ServerConfig, SftpServer};
//! use sftpfs_proto::ssh::sftp::SftpFs;
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerConfig::new()
//!     .with_host_key(ServerConfig::generate_host_key()?)
//!     .with_password_auth(simple_password_auth("alice", "secret"));
//! let server = SftpServer::new(Arc::new(MemFs::new()), config)?;
//! let listener = TcpListener::bind("127.0.0.1:0").await?;
//! let addr = listener.local_addr()?;
//! tokio::spawn(async move { server.serve(listener).await });
//!
//! let fs = SftpFs::connect(&ClientConfig::password(addr.to_string(), "alice", "secret")).await?;
//! fs.mkdir_all("/data/in", FileMode::dir(0o755)).await?;
//! fs.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - SSH transport and key handling come from `russh`
//! - Constant-time credential comparison
//! - No `unsafe` code

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
