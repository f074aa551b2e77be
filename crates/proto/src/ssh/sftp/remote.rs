//! Network transport over russh and russh-sftp.

use super::transport::{RemoteFile, SftpTransport};
use super::types::{info_from_attrs, pflags_from_open_flags, sftp_error, unix_secs};
use crate::ssh::client::ClientHandler;
use async_trait::async_trait;
use russh::client::Handle;
use russh::Disconnect;
use russh_sftp::client::fs::File as SftpHandle;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::FileAttributes;
use sftpfs_platform::{base_name, ErrorKind, FileInfo, FileMode, FsError, FsResult, OpenFlags};
use std::io::SeekFrom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// An SFTP session over an authenticated SSH connection.
pub struct RusshTransport {
    sftp: SftpSession,
    session: Mutex<Option<Handle<ClientHandler>>>,
    closed: AtomicBool,
}

impl RusshTransport {
    pub(crate) fn new(sftp: SftpSession, session: Handle<ClientHandler>) -> Self {
        Self {
            sftp,
            session: Mutex::new(Some(session)),
            closed: AtomicBool::new(false),
        }
    }

    fn sftp(&self) -> FsResult<&SftpSession> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FsError::new(ErrorKind::TransportClosed, "sftp session closed"));
        }
        Ok(&self.sftp)
    }

    async fn set_attrs(&self, path: &str, attrs: FileAttributes) -> FsResult<()> {
        self.sftp()?
            .set_metadata(path, attrs)
            .await
            .map_err(sftp_error)
    }
}

#[async_trait]
impl SftpTransport for RusshTransport {
    async fn open_file(&self, path: &str, flags: OpenFlags) -> FsResult<Box<dyn RemoteFile>> {
        let handle = self
            .sftp()?
            .open_with_flags(path, pflags_from_open_flags(flags))
            .await
            .map_err(sftp_error)?;
        Ok(Box::new(RusshFile {
            name: base_name(path).to_string(),
            handle: Mutex::new(handle),
        }))
    }

    async fn mkdir(&self, path: &str) -> FsResult<()> {
        self.sftp()?.create_dir(path).await.map_err(sftp_error)
    }

    async fn remove(&self, path: &str) -> FsResult<()> {
        let attrs = self.sftp()?.symlink_metadata(path).await.map_err(sftp_error)?;
        if attrs.is_dir() {
            self.sftp()?.remove_dir(path).await.map_err(sftp_error)
        } else {
            self.sftp()?.remove_file(path).await.map_err(sftp_error)
        }
    }

    async fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        self.sftp()?.rename(from, to).await.map_err(sftp_error)
    }

    async fn stat(&self, path: &str) -> FsResult<FileInfo> {
        let attrs = self.sftp()?.metadata(path).await.map_err(sftp_error)?;
        Ok(info_from_attrs(base_name(path), &attrs))
    }

    async fn lstat(&self, path: &str) -> FsResult<FileInfo> {
        let attrs = self.sftp()?.symlink_metadata(path).await.map_err(sftp_error)?;
        Ok(info_from_attrs(base_name(path), &attrs))
    }

    async fn chmod(&self, path: &str, mode: FileMode) -> FsResult<()> {
        let mut attrs = FileAttributes::empty();
        attrs.permissions = Some(mode.perm());
        self.set_attrs(path, attrs).await
    }

    async fn chtimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> FsResult<()> {
        let mut attrs = FileAttributes::empty();
        attrs.atime = Some(unix_secs(atime));
        attrs.mtime = Some(unix_secs(mtime));
        self.set_attrs(path, attrs).await
    }

    async fn chown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        let mut attrs = FileAttributes::empty();
        attrs.uid = Some(uid);
        attrs.gid = Some(gid);
        self.set_attrs(path, attrs).await
    }

    async fn truncate(&self, path: &str, size: u64) -> FsResult<()> {
        let mut attrs = FileAttributes::empty();
        attrs.size = Some(size);
        self.set_attrs(path, attrs).await
    }

    async fn read_dir(&self, path: &str) -> FsResult<Vec<FileInfo>> {
        let entries = self.sftp()?.read_dir(path).await.map_err(sftp_error)?;
        Ok(entries
            .filter(|entry| {
                let name = entry.file_name();
                name != "." && name != ".."
            })
            .map(|entry| info_from_attrs(&entry.file_name(), &entry.metadata()))
            .collect())
    }

    async fn read_link(&self, path: &str) -> FsResult<String> {
        self.sftp()?.read_link(path).await.map_err(sftp_error)
    }

    async fn symlink(&self, target: &str, link: &str) -> FsResult<()> {
        self.sftp()?.symlink(link, target).await.map_err(sftp_error)
    }

    async fn close(&self) -> FsResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.sftp.close().await {
            debug!("sftp session close: {}", e);
        }
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };
        session
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .map_err(|e| {
                warn!("ssh disconnect failed: {}", e);
                crate::ssh::client::ssh_error(e)
            })
    }
}

/// Open remote file. The library handle is cursor based, so positional
/// access seeks under the lock first.
struct RusshFile {
    name: String,
    handle: Mutex<SftpHandle>,
}

#[async_trait]
impl RemoteFile for RusshFile {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        let mut handle = self.handle.lock().await;
        handle.seek(SeekFrom::Start(offset)).await?;
        let mut total = 0;
        while total < buf.len() {
            let n = handle.read(&mut buf[total..]).await?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    async fn write_at(&self, buf: &[u8], offset: u64) -> FsResult<usize> {
        let mut handle = self.handle.lock().await;
        handle.seek(SeekFrom::Start(offset)).await?;
        handle.write_all(buf).await?;
        handle.flush().await?;
        Ok(buf.len())
    }

    async fn stat(&self) -> FsResult<FileInfo> {
        let attrs = self
            .handle
            .lock()
            .await
            .metadata()
            .await
            .map_err(sftp_error)?;
        Ok(info_from_attrs(&self.name, &attrs))
    }

    async fn truncate(&self, size: u64) -> FsResult<()> {
        let mut attrs = FileAttributes::empty();
        attrs.size = Some(size);
        self.handle
            .lock()
            .await
            .set_metadata(attrs)
            .await
            .map_err(sftp_error)
    }

    async fn close(&self) -> FsResult<()> {
        self.handle
            .lock()
            .await
            .shutdown()
            .await
            .map_err(FsError::from)
    }
}
