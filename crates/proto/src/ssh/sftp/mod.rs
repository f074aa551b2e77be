//! SFTP v3 in both directions over the filesystem capability.
//!
//! # Architecture
//!
//! Client face: [`SftpFs`] implements [`FileSystem`](sftpfs_platform::FileSystem)
//! on top of an [`SftpTransport`]. Production code uses [`RusshTransport`]
//! (a live SFTP session); tests use [`LoopbackTransport`] over an in-memory
//! filesystem.
//!
//! Server face: [`RequestServer`] decodes SFTP packets into [`Request`]s and
//! hands them to the four [`Handlers`] roles, which [`ServerHandler`]
//! implements over any filesystem.
//!
//! # Protocol Flow
//!
//! ```text
//! SftpFs                                     ServerHandler
//!   |                                             |
//!   |-- SSH_FXP_INIT ------------> RequestServer  |
//!   |<- SSH_FXP_VERSION ----------                |
//!   |                                             |
//!   |-- SSH_FXP_OPEN (write) ----> file_put ----->|  open_file
//!   |<- SSH_FXP_HANDLE -----------                |
//!   |-- SSH_FXP_WRITE -----------> write_at ----->|  seek + write
//!   |-- SSH_FXP_CLOSE -----------> close -------->|
//!   |                                             |
//!   |-- SSH_FXP_OPENDIR ---------> file_list ---->|  read_dir, sorted
//!   |-- SSH_FXP_READDIR ---------> list_at        |
//!   |<- SSH_FXP_NAME / EOF -------                |
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use sftpfs_platform::FileSystem;
//! use sftpfs_proto::ssh::sftp::SftpFs;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let fs = SftpFs::dial("files.example.com:22", "alice", "secret").await?;
//!
//! let mut file = fs.create("/upload/report.txt").await?;
//! file.write(b"quarterly numbers").await?;
//! file.close().await?;
//!
//! for entry in fs.read_dir("/upload").await? {
//!     println!("{}", entry.name);
//! }
//! fs.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! - [SFTP Draft v3](https://datatracker.ietf.org/doc/html/draft-ietf-secsh-filexfer-02)

pub mod client;
pub mod file;
pub mod handlers;
pub mod loopback;
pub mod remote;
pub mod request_server;
pub mod transport;
pub mod types;

pub use client::SftpFs;
pub use file::SftpFile;
pub use handlers::{
    FileCmder, FileLister, FileReader, FileWriter, Handlers, ListAt, ListerAt, Method,
    OpenHandle, ReaderAt, Request, RequestAttrs, ServerFile, ServerHandler, VecLister, WriterAt,
};
pub use loopback::LoopbackTransport;
pub use remote::RusshTransport;
pub use request_server::RequestServer;
pub use transport::{RemoteFile, SftpTransport};
