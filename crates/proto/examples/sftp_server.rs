//! SFTP Server Example
//!
//! Serves a local directory over SFTP.
//!
//! Usage:
//!   cargo run --example sftp_server [bind_address] [root_dir]
//!
//! Example:
//!   cargo run --example sftp_server 127.0.0.1:2222 /tmp/share
//!
//! Then connect with a client:
//!   cargo run --example sftp_client 127.0.0.1:2222 testuser testpass ls /

use sftpfs_platform::OsFs;
use sftpfs_proto::ssh::auth::multi_user_password_auth;
use sftpfs_proto::ssh::server::{ServerConfig, SftpServer};
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let bind_addr = args.get(1).map_or("127.0.0.1:2222", String::as_str);
    let root = args.get(2).cloned().unwrap_or_else(|| ".".to_string());

    // A fresh key per run; persistent servers load one from disk so clients
    // can pin it.
    let host_key = ServerConfig::generate_host_key()?;
    println!("Host key: {}", host_key.public_key().fingerprint(Default::default()));

    let users = HashMap::from([
        ("testuser".to_string(), "testpass".to_string()),
        ("admin".to_string(), "secret".to_string()),
    ]);
    let config = ServerConfig::new()
        .with_host_key(host_key)
        .with_password_auth(multi_user_password_auth(users))
        .with_server_version("SSH-2.0-sftpfs_example");

    let server = SftpServer::new(Arc::new(OsFs::new(&root)), config)?;
    let listener = TcpListener::bind(bind_addr).await?;
    println!("Serving {} on {}", root, listener.local_addr()?);
    println!("Accepted credentials: testuser/testpass, admin/secret");

    server.serve(listener).await?;
    Ok(())
}
