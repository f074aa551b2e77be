//! In-process transport over a local filesystem.

use super::transport::{RemoteFile, SftpTransport};
use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use sftpfs_platform::{
    ErrorKind, File, FileInfo, FileMode, FileSystem, FsError, FsResult, OpenFlags,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex;

/// Transport that serves a [`FileSystem`] without a network hop.
///
/// Behaves like a well-behaved SFTP server: listings come back sorted by name
/// and files are created with mode 0644.
pub struct LoopbackTransport {
    fs: Arc<dyn FileSystem>,
    closed: AtomicBool,
    /// Paths requested through `open_file`, in order.
    opened: SyncMutex<Vec<String>>,
}

impl LoopbackTransport {
    /// Serves `fs`.
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            fs,
            closed: AtomicBool::new(false),
            opened: SyncMutex::new(Vec::new()),
        }
    }

    /// True once [`SftpTransport::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Paths opened so far.
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().clone()
    }

    fn check(&self) -> FsResult<()> {
        if self.is_closed() {
            return Err(FsError::new(ErrorKind::TransportClosed, "session closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl SftpTransport for LoopbackTransport {
    async fn open_file(&self, path: &str, flags: OpenFlags) -> FsResult<Box<dyn RemoteFile>> {
        self.check()?;
        self.opened.lock().push(path.to_string());
        let file = self
            .fs
            .open_file(path, flags, FileMode(FileMode::DEFAULT_FILE))
            .await?;
        Ok(Box::new(LoopbackFile {
            file: Mutex::new(file),
        }))
    }

    async fn mkdir(&self, path: &str) -> FsResult<()> {
        self.check()?;
        self.fs.mkdir(path, FileMode(FileMode::DEFAULT_DIR)).await
    }

    async fn mkdir_all(&self, path: &str) -> FsResult<()> {
        self.check()?;
        self.fs.mkdir_all(path, FileMode(FileMode::DEFAULT_DIR)).await
    }

    async fn remove(&self, path: &str) -> FsResult<()> {
        self.check()?;
        self.fs.remove(path).await
    }

    async fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        self.check()?;
        self.fs.rename(from, to).await
    }

    async fn stat(&self, path: &str) -> FsResult<FileInfo> {
        self.check()?;
        self.fs.stat(path).await
    }

    async fn lstat(&self, path: &str) -> FsResult<FileInfo> {
        self.check()?;
        self.fs.lstat(path).await
    }

    async fn chmod(&self, path: &str, mode: FileMode) -> FsResult<()> {
        self.check()?;
        self.fs.chmod(path, mode).await
    }

    async fn chtimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> FsResult<()> {
        self.check()?;
        self.fs.chtimes(path, atime, mtime).await
    }

    async fn chown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        self.check()?;
        self.fs.chown(path, uid, gid).await
    }

    async fn truncate(&self, path: &str, size: u64) -> FsResult<()> {
        self.check()?;
        self.fs.truncate(path, size).await
    }

    async fn read_dir(&self, path: &str) -> FsResult<Vec<FileInfo>> {
        self.check()?;
        let mut entries = self.fs.read_dir(path).await?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn read_link(&self, path: &str) -> FsResult<String> {
        self.check()?;
        match self.fs.symlinks() {
            Some(links) => links.readlink(path).await,
            None => Err(FsError::unsupported("readlink")),
        }
    }

    async fn symlink(&self, target: &str, link: &str) -> FsResult<()> {
        self.check()?;
        match self.fs.symlinks() {
            Some(links) => links.symlink(target, link).await,
            None => Err(FsError::unsupported("symlink")),
        }
    }

    fn supports_symlinks(&self) -> bool {
        self.fs.symlinks().is_some()
    }

    async fn close(&self) -> FsResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct LoopbackFile {
    file: Mutex<Box<dyn File>>,
}

#[async_trait]
impl RemoteFile for LoopbackFile {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        let mut file = self.file.lock().await;
        let mut total = 0;
        while total < buf.len() {
            let n = file.read_at(&mut buf[total..], offset + total as u64).await?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    async fn write_at(&self, buf: &[u8], offset: u64) -> FsResult<usize> {
        self.file.lock().await.write_at(buf, offset).await
    }

    async fn stat(&self) -> FsResult<FileInfo> {
        self.file.lock().await.stat().await
    }

    async fn truncate(&self, size: u64) -> FsResult<()> {
        self.file.lock().await.truncate(size).await
    }

    async fn close(&self) -> FsResult<()> {
        self.file.lock().await.close().await
    }
}
