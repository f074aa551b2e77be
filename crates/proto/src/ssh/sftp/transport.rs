//! The minimal capability set the client adapter consumes from an SFTP
//! session.
//!
//! [`SftpFs`](super::SftpFs) only talks to these traits, so the concrete
//! SSH/SFTP stack plugs in at construction. [`RusshTransport`] is the network
//! implementation; [`LoopbackTransport`] serves any local
//! [`FileSystem`](sftpfs_platform::FileSystem) and keeps tests hermetic.
//!
//! Errors returned here carry a kind but no operation context; the adapter
//! adds `(op, path)` when it propagates them.
//!
//! [`RusshTransport`]: super::RusshTransport
//! [`LoopbackTransport`]: super::LoopbackTransport

use async_trait::async_trait;
use sftpfs_platform::{FileInfo, FileMode, FsError, FsResult, OpenFlags};
use std::time::SystemTime;

/// An open remote file. Positional and stateless: the caller owns the cursor.
#[async_trait]
pub trait RemoteFile: Send + Sync {
    /// Reads at `offset`, filling as much of `buf` as the file allows.
    /// Returns `Ok(0)` at or past end of file.
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> FsResult<usize>;

    /// Writes all of `buf` at `offset`.
    async fn write_at(&self, buf: &[u8], offset: u64) -> FsResult<usize>;

    /// Metadata of the open file.
    async fn stat(&self) -> FsResult<FileInfo>;

    /// Resizes the open file.
    async fn truncate(&self, size: u64) -> FsResult<()>;

    /// Releases the remote handle.
    async fn close(&self) -> FsResult<()>;
}

/// Path-level operations of an SFTP session.
#[async_trait]
pub trait SftpTransport: Send + Sync {
    /// Opens `path` on the remote side.
    async fn open_file(&self, path: &str, flags: OpenFlags) -> FsResult<Box<dyn RemoteFile>>;

    /// Creates one directory. The remote may ignore mode bits.
    async fn mkdir(&self, path: &str) -> FsResult<()>;

    /// Creates a directory and its ancestors, when the transport can do so
    /// natively.
    async fn mkdir_all(&self, path: &str) -> FsResult<()> {
        let _ = path;
        Err(FsError::unsupported("mkdir_all"))
    }

    /// Removes a file or an empty directory.
    async fn remove(&self, path: &str) -> FsResult<()>;

    /// Renames `from` to `to`.
    async fn rename(&self, from: &str, to: &str) -> FsResult<()>;

    /// Metadata, following symbolic links.
    async fn stat(&self, path: &str) -> FsResult<FileInfo>;

    /// Metadata of the link itself.
    async fn lstat(&self, path: &str) -> FsResult<FileInfo>;

    /// Sets permission bits.
    async fn chmod(&self, path: &str, mode: FileMode) -> FsResult<()>;

    /// Sets access and modification times.
    async fn chtimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> FsResult<()>;

    /// Sets ownership.
    async fn chown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()>;

    /// Resizes the named file.
    async fn truncate(&self, path: &str, size: u64) -> FsResult<()>;

    /// Lists a directory in the order the server produced it.
    async fn read_dir(&self, path: &str) -> FsResult<Vec<FileInfo>>;

    /// Target of a symbolic link.
    async fn read_link(&self, path: &str) -> FsResult<String>;

    /// Creates `link` pointing at `target`.
    async fn symlink(&self, target: &str, link: &str) -> FsResult<()>;

    /// Whether symbolic link operations are available.
    fn supports_symlinks(&self) -> bool {
        true
    }

    /// Ends the session and releases the underlying connection.
    async fn close(&self) -> FsResult<()>;
}
