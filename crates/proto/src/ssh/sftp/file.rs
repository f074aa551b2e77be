//! File handle over a remote SFTP file or directory.

use super::transport::{RemoteFile, SftpTransport};
use async_trait::async_trait;
use sftpfs_platform::{
    DirCursor, ErrorKind, File, FileInfo, FsError, FsResult, OpenFlags, ResultExt,
};
use std::io::SeekFrom;
use std::sync::Arc;
use tracing::trace;

/// Stateful handle returned by [`SftpFs`](super::SftpFs).
///
/// The remote handle is positional; the sequential cursor lives here and
/// `seek` never touches the network except to learn the size for
/// [`SeekFrom::End`]. Directory handles carry no remote file and list through
/// the transport on the first `read_dir`.
pub struct SftpFile {
    name: String,
    remote: Option<Box<dyn RemoteFile>>,
    transport: Arc<dyn SftpTransport>,
    flags: OpenFlags,
    pos: u64,
    cursor: DirCursor,
    is_dir: Option<bool>,
    /// First close outcome, replayed on later calls.
    closed: Option<Result<(), (ErrorKind, String)>>,
}

impl SftpFile {
    pub(crate) fn new(
        name: &str,
        remote: Box<dyn RemoteFile>,
        transport: Arc<dyn SftpTransport>,
        flags: OpenFlags,
        pos: u64,
    ) -> Self {
        Self {
            name: name.to_string(),
            remote: Some(remote),
            transport,
            flags,
            pos,
            cursor: DirCursor::new(),
            is_dir: None,
            closed: None,
        }
    }

    pub(crate) fn directory(name: &str, transport: Arc<dyn SftpTransport>) -> Self {
        Self {
            name: name.to_string(),
            remote: None,
            transport,
            flags: OpenFlags::READ,
            pos: 0,
            cursor: DirCursor::new(),
            is_dir: Some(true),
            closed: None,
        }
    }

    fn live(&self, op: &'static str) -> FsResult<()> {
        if self.closed.is_some() {
            return Err(FsError::invalid("file already closed").with_path(op, &self.name));
        }
        Ok(())
    }

    fn remote(&self, op: &'static str) -> FsResult<&dyn RemoteFile> {
        self.live(op)?;
        match &self.remote {
            Some(remote) => Ok(remote.as_ref()),
            None => Err(FsError::from(ErrorKind::IsADirectory).with_path(op, &self.name)),
        }
    }

    async fn is_dir(&mut self) -> FsResult<bool> {
        if let Some(is_dir) = self.is_dir {
            return Ok(is_dir);
        }
        let info = self.stat().await?;
        self.is_dir = Some(info.is_dir());
        Ok(info.is_dir())
    }

    /// Write guard: directories refuse with is-a-directory, read-only
    /// handles with permission-denied.
    async fn check_writable(&mut self, op: &'static str) -> FsResult<()> {
        self.live(op)?;
        if self.is_dir().await? {
            return Err(FsError::from(ErrorKind::IsADirectory).with_path(op, &self.name));
        }
        if !self.flags.writable() {
            return Err(FsError::from(ErrorKind::PermissionDenied).with_path(op, &self.name));
        }
        Ok(())
    }

    async fn size(&self, op: &'static str) -> FsResult<u64> {
        let remote = self.remote(op)?;
        Ok(remote.stat().await.with_path(op, &self.name)?.size)
    }
}

#[async_trait]
impl File for SftpFile {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        let remote = self.remote("Read")?;
        let n = remote
            .read_at(buf, self.pos)
            .await
            .with_path("Read", &self.name)?;
        self.pos += n as u64;
        Ok(n)
    }

    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        self.remote("ReadAt")?
            .read_at(buf, offset)
            .await
            .with_path("ReadAt", &self.name)
    }

    async fn write(&mut self, buf: &[u8]) -> FsResult<usize> {
        self.check_writable("Write").await?;
        if self.flags.contains(OpenFlags::APPEND) {
            self.pos = self.size("Write").await?;
        }
        let n = self
            .remote("Write")?
            .write_at(buf, self.pos)
            .await
            .with_path("Write", &self.name)?;
        self.pos += n as u64;
        Ok(n)
    }

    async fn write_at(&mut self, buf: &[u8], offset: u64) -> FsResult<usize> {
        self.check_writable("WriteAt").await?;
        self.remote("WriteAt")?
            .write_at(buf, offset)
            .await
            .with_path("WriteAt", &self.name)
    }

    async fn seek(&mut self, pos: SeekFrom) -> FsResult<u64> {
        self.live("Seek")?;
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => i128::from(self.pos) + i128::from(delta),
            SeekFrom::End(delta) => i128::from(self.size("Seek").await?) + i128::from(delta),
        };
        if target < 0 {
            return Err(FsError::invalid("negative position").with_path("Seek", &self.name));
        }
        self.pos = u64::try_from(target)
            .map_err(|_| FsError::invalid("position overflow").with_path("Seek", &self.name))?;
        trace!(path = %self.name, pos = self.pos, "seek");
        Ok(self.pos)
    }

    async fn close(&mut self) -> FsResult<()> {
        if let Some(first) = &self.closed {
            return match first {
                Ok(()) => Ok(()),
                Err((kind, msg)) => Err(FsError::new(*kind, msg.clone())),
            };
        }

        let result = match self.remote.take() {
            Some(remote) => remote.close().await.with_path("Close", &self.name),
            None => Ok(()),
        };
        self.closed = Some(match &result {
            Ok(()) => Ok(()),
            Err(e) => Err((e.kind(), e.to_string())),
        });
        result
    }

    async fn stat(&mut self) -> FsResult<FileInfo> {
        self.live("Stat")?;
        let info = match &self.remote {
            Some(remote) => remote.stat().await,
            None => self.transport.stat(&self.name).await,
        }
        .with_path("Stat", &self.name)?;
        self.is_dir = Some(info.is_dir());
        Ok(info)
    }

    /// SFTP v3 has no fsync; this only checks the handle is open.
    async fn sync(&mut self) -> FsResult<()> {
        self.live("Sync")
    }

    async fn truncate(&mut self, size: u64) -> FsResult<()> {
        self.check_writable("Truncate").await?;
        self.remote("Truncate")?
            .truncate(size)
            .await
            .with_path("Truncate", &self.name)
    }

    async fn read_dir(&mut self, n: isize) -> FsResult<Vec<FileInfo>> {
        self.live("Readdir")?;
        if !self.cursor.is_loaded() {
            let entries = self
                .transport
                .read_dir(&self.name)
                .await
                .with_path("Readdir", &self.name)?;
            self.cursor.load(entries);
        }
        self.cursor.next_batch(n)
    }
}

impl std::fmt::Debug for SftpFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpFile")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .field("pos", &self.pos)
            .field("closed", &self.closed.is_some())
            .finish()
    }
}
