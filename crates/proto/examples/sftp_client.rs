//! SFTP Client Example
//!
//! Uses a remote SFTP server as a filesystem.
//!
//! Usage:
//!   cargo run --example sftp_client <host:port> <username> <password> ls <dir>
//!   cargo run --example sftp_client <host:port> <username> <password> cat <file>
//!   cargo run --example sftp_client <host:port> <username> <password> put <file> <text>
//!
//! Example:
//!   cargo run --example sftp_client 127.0.0.1:2222 testuser testpass ls /

use sftpfs_platform::{read_to_end, write_all, FileSystem};
use sftpfs_proto::ssh::client::ClientConfig;
use sftpfs_proto::ssh::sftp::SftpFs;
use std::env;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 6 {
        eprintln!(
            "Usage: {} <host:port> <username> <password> <ls|cat|put> <path> [text]",
            args[0]
        );
        std::process::exit(1);
    }
    let (host, user, password) = (&args[1], &args[2], &args[3]);
    let (command, path) = (args[4].as_str(), args[5].as_str());

    // Accepts any host key; pin one with `with_host_key` outside of demos.
    let config = ClientConfig::password(host.as_str(), user.as_str(), password.as_str());
    let fs = SftpFs::connect(&config).await?;

    match command {
        "ls" => {
            for info in fs.read_dir(path).await? {
                let kind = if info.is_dir() { "d" } else { "-" };
                println!("{} {:o} {:>10} {}", kind, info.mode.perm(), info.size, info.name);
            }
        }
        "cat" => {
            let mut file = fs.open(path).await?;
            let body = read_to_end(file.as_mut()).await?;
            file.close().await?;
            print!("{}", String::from_utf8_lossy(&body));
        }
        "put" => {
            let text = args.get(6).map_or("", String::as_str);
            let mut file = fs.create(path).await?;
            write_all(file.as_mut(), text.as_bytes()).await?;
            file.close().await?;
            println!("wrote {} bytes to {}", text.len(), path);
        }
        other => eprintln!("unknown command: {}", other),
    }

    fs.close().await?;
    Ok(())
}
