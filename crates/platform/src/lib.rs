//! # sftpfs platform
//!
//! Filesystem capability contracts, metadata types, the error taxonomy and
//! two local backing stores for the sftpfs adapter.
//!
//! This crate provides:
//! - Unified error types (`FsError`, `FsResult`, `ErrorKind`)
//! - Capability traits (`FileSystem`, `File`, `SymlinkFileSystem`)
//! - An in-memory filesystem (`MemFs`) and a rooted on-disk one (`OsFs`)
//!
//! # Examples
//!
//! ```
//! use sftpfs_platform::{read_to_end, FileSystem, MemFs};
//!
//! # #[tokio::main]
//! # async fn main() -> sftpfs_platform::FsResult<()> {
//! let fs = MemFs::new();
//! let mut file = fs.create("/hello.txt").await?;
//! file.write_str("hello").await?;
//! file.close().await?;
//!
//! let mut file = fs.open("/hello.txt").await?;
//! assert_eq!(read_to_end(file.as_mut()).await?, b"hello");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;
pub mod memfs;
pub mod osfs;
pub mod traits;
pub mod types;

pub use error::{ErrorKind, FsError, FsResult, ResultExt};
pub use memfs::MemFs;
pub use osfs::OsFs;
pub use traits::{
    mkdir_all, read_to_end, remove_all, write_all, DirCursor, File, FileSystem,
    SymlinkFileSystem,
};
pub use types::{
    base_name, clean, join, parent, DirEntry, FileInfo, FileMode, FileSys, FileType, OpenFlags,
};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
