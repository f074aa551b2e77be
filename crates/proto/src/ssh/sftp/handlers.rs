//! Request handlers for the SFTP server.
//!
//! The server dispatches every request to one of four roles:
//!
//! | Role | Trait | Methods |
//! |---|---|---|
//! | Reader | [`FileReader`] | `Get` |
//! | Writer | [`FileWriter`] | `Put` |
//! | Commander | [`FileCmder`] | `Setstat`, `Rename`, `Rmdir`, `Mkdir`, `Link`, `Symlink`, `Remove` |
//! | Lister | [`FileLister`] | `List`, `Stat`, `Lstat`, `Readlink` |
//!
//! [`ServerHandler`] implements all four over a [`FileSystem`].

use async_trait::async_trait;
use sftpfs_platform::{
    ErrorKind, File, FileInfo, FileMode, FileSystem, FsError, FsResult, OpenFlags, ResultExt,
};
use std::fmt;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::types::from_unix_secs;

/// Request method, named after the SFTP operation that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Open for reading
    Get,
    /// Open for writing
    Put,
    /// Generic open; resolved to `Get` or `Put` by its flags
    Open,
    /// Change attributes
    Setstat,
    /// Rename `filepath` to `target`
    Rename,
    /// Remove a directory
    Rmdir,
    /// Create a directory
    Mkdir,
    /// Hard link
    Link,
    /// Create symlink `filepath` pointing at `target`
    Symlink,
    /// Remove a file
    Remove,
    /// List a directory
    List,
    /// Attributes, following links
    Stat,
    /// Attributes of the link itself
    Lstat,
    /// Target of a link
    Readlink,
}

impl Method {
    /// Wire-style name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "Get",
            Method::Put => "Put",
            Method::Open => "Open",
            Method::Setstat => "Setstat",
            Method::Rename => "Rename",
            Method::Rmdir => "Rmdir",
            Method::Mkdir => "Mkdir",
            Method::Link => "Link",
            Method::Symlink => "Symlink",
            Method::Remove => "Remove",
            Method::List => "List",
            Method::Stat => "Stat",
            Method::Lstat => "Lstat",
            Method::Readlink => "Readlink",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attributes carried by a request. Absent fields are left unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestAttrs {
    /// New size
    pub size: Option<u64>,
    /// Owner
    pub uid: Option<u32>,
    /// Group
    pub gid: Option<u32>,
    /// Mode bits
    pub permissions: Option<u32>,
    /// Access time, seconds since the epoch
    pub atime: Option<u32>,
    /// Modification time, seconds since the epoch
    pub mtime: Option<u32>,
}

/// One decoded client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Operation
    pub method: Method,
    /// Primary path
    pub filepath: String,
    /// Second path for `Rename` and `Symlink`
    pub target: Option<String>,
    /// Open flags for `Get`/`Put`
    pub pflags: OpenFlags,
    /// Attributes for `Setstat`/`Mkdir`/`Put`
    pub attrs: RequestAttrs,
}

impl Request {
    /// A request with no target, flags or attributes.
    pub fn new(method: Method, filepath: impl Into<String>) -> Self {
        Self {
            method,
            filepath: filepath.into(),
            target: None,
            pflags: OpenFlags::default(),
            attrs: RequestAttrs::default(),
        }
    }

    /// Sets the second path.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Sets the open flags.
    pub fn with_pflags(mut self, pflags: OpenFlags) -> Self {
        self.pflags = pflags;
        self
    }

    /// Sets the attributes.
    pub fn with_attrs(mut self, attrs: RequestAttrs) -> Self {
        self.attrs = attrs;
        self
    }

    fn target(&self) -> FsResult<&str> {
        self.target.as_deref().ok_or_else(|| {
            FsError::invalid("missing target path").with_path(self.method.as_str(), &self.filepath)
        })
    }
}

/// Server-side open file.
#[async_trait]
pub trait OpenHandle: Send + Sync {
    /// Attributes of the open file.
    async fn stat(&self) -> FsResult<FileInfo>;

    /// Releases the file.
    async fn close(&self) -> FsResult<()>;
}

/// Positional reads. `Ok(0)` means end of file.
#[async_trait]
pub trait ReaderAt: OpenHandle {
    /// Reads into `buf` starting at `offset`.
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> FsResult<usize>;
}

/// Positional writes.
#[async_trait]
pub trait WriterAt: OpenHandle {
    /// Writes `buf` at `offset`.
    async fn write_at(&self, buf: &[u8], offset: u64) -> FsResult<usize>;

    /// Read access, when the file was opened read-write.
    fn as_reader(&self) -> Option<&dyn ReaderAt>;
}

/// Result of [`ListerAt::list_at`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListAt {
    /// Entries copied into the buffer.
    pub count: usize,
    /// The batch came up short; a full batch may still be the last one.
    pub eof: bool,
}

/// Offset-addressed listing.
pub trait ListerAt: Send + Sync {
    /// Copies entries starting at `offset` into `buf`.
    ///
    /// `eof` is set when `buf` could not be filled or `offset` is past the
    /// end; in the latter case `count` is zero.
    fn list_at(&self, buf: &mut [FileInfo], offset: u64) -> FsResult<ListAt>;
}

/// Reader role.
#[async_trait]
pub trait FileReader: Send + Sync {
    /// Opens `req.filepath` for reading.
    async fn file_read(&self, req: &Request) -> FsResult<Box<dyn ReaderAt>>;
}

/// Writer role.
#[async_trait]
pub trait FileWriter: Send + Sync {
    /// Opens `req.filepath` for writing per `req.pflags`.
    async fn file_write(&self, req: &Request) -> FsResult<Box<dyn WriterAt>>;
}

/// Commander role.
#[async_trait]
pub trait FileCmder: Send + Sync {
    /// Performs a mutation.
    async fn file_cmd(&self, req: &Request) -> FsResult<()>;
}

/// Lister role.
#[async_trait]
pub trait FileLister: Send + Sync {
    /// Produces entries for a listing, stat or readlink request.
    async fn file_list(&self, req: &Request) -> FsResult<Box<dyn ListerAt>>;
}

/// The four roles handed to the request server.
#[derive(Clone)]
pub struct Handlers {
    /// Reader
    pub file_get: Arc<dyn FileReader>,
    /// Writer
    pub file_put: Arc<dyn FileWriter>,
    /// Commander
    pub file_cmd: Arc<dyn FileCmder>,
    /// Lister
    pub file_list: Arc<dyn FileLister>,
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers").finish_non_exhaustive()
    }
}

/// Open backing file, serving positional I/O through seek-then-transfer
/// under a per-file lock.
pub struct ServerFile {
    name: String,
    flags: OpenFlags,
    file: Mutex<Box<dyn File>>,
}

impl ServerFile {
    /// Wraps an open file.
    pub fn new(name: impl Into<String>, file: Box<dyn File>, flags: OpenFlags) -> Self {
        Self {
            name: name.into(),
            flags,
            file: Mutex::new(file),
        }
    }

    /// Path the file was opened with.
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl OpenHandle for ServerFile {
    async fn stat(&self) -> FsResult<FileInfo> {
        self.file.lock().await.stat().await
    }

    async fn close(&self) -> FsResult<()> {
        self.file.lock().await.close().await
    }
}

#[async_trait]
impl ReaderAt for ServerFile {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut total = 0;
        while total < buf.len() {
            let n = file.read(&mut buf[total..]).await?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }
}

#[async_trait]
impl WriterAt for ServerFile {
    async fn write_at(&self, buf: &[u8], offset: u64) -> FsResult<usize> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut written = 0;
        while written < buf.len() {
            let n = file.write(&buf[written..]).await?;
            if n == 0 {
                return Err(FsError::new(ErrorKind::Other, "short write"));
            }
            written += n;
        }
        Ok(written)
    }

    fn as_reader(&self) -> Option<&dyn ReaderAt> {
        if self.flags.readable() {
            Some(self)
        } else {
            None
        }
    }
}

/// [`ListerAt`] over a captured listing.
#[derive(Debug, Clone, Default)]
pub struct VecLister {
    entries: Vec<FileInfo>,
}

impl VecLister {
    /// Serves `entries` in the given order.
    pub fn new(entries: Vec<FileInfo>) -> Self {
        Self { entries }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ListerAt for VecLister {
    fn list_at(&self, buf: &mut [FileInfo], offset: u64) -> FsResult<ListAt> {
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        if start >= self.entries.len() {
            return Ok(ListAt {
                count: 0,
                eof: true,
            });
        }

        let rest = &self.entries[start..];
        let count = rest.len().min(buf.len());
        buf[..count].clone_from_slice(&rest[..count]);
        Ok(ListAt {
            count,
            eof: count < buf.len(),
        })
    }
}

/// Handlers backed by a [`FileSystem`].
///
/// One instance serves every role for a session. Reads and listings share a
/// read lock; writes and commands take it exclusively.
pub struct ServerHandler {
    fs: Arc<dyn FileSystem>,
    lock: RwLock<()>,
}

impl ServerHandler {
    /// Handler over `fs`.
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            fs,
            lock: RwLock::new(()),
        }
    }

    /// Builds the four roles over one shared handler.
    pub fn handlers(fs: Arc<dyn FileSystem>) -> Handlers {
        let handler = Arc::new(Self::new(fs));
        Handlers {
            file_get: handler.clone(),
            file_put: handler.clone(),
            file_cmd: handler.clone(),
            file_list: handler,
        }
    }

    /// Flags used to open the backing file for a write request.
    pub fn write_flags(pflags: OpenFlags) -> OpenFlags {
        let mut flags = if pflags.readable() && pflags.writable() {
            OpenFlags::READ_WRITE
        } else {
            OpenFlags::WRITE
        };
        flags |= OpenFlags::CREATE;
        for extra in [OpenFlags::APPEND, OpenFlags::TRUNCATE, OpenFlags::EXCLUSIVE] {
            if pflags.contains(extra) {
                flags |= extra;
            }
        }
        flags
    }

    async fn setstat(&self, path: &str, attrs: &RequestAttrs) -> FsResult<()> {
        if let Some(size) = attrs.size {
            self.fs.truncate(path, size).await?;
        }
        if let Some(perm) = attrs.permissions {
            self.fs
                .chmod(path, FileMode(perm & FileMode::PERM_MASK))
                .await?;
        }

        let times = match (attrs.atime, attrs.mtime) {
            (Some(atime), Some(mtime)) => Some((atime, mtime)),
            (Some(t), None) | (None, Some(t)) => Some((t, t)),
            (None, None) => None,
        };
        if let Some((atime, mtime)) = times {
            self.fs
                .chtimes(path, from_unix_secs(atime), from_unix_secs(mtime))
                .await?;
        }

        match (attrs.uid, attrs.gid) {
            (Some(uid), Some(gid)) => self.fs.chown(path, uid, gid).await?,
            (None, None) => {}
            (uid, gid) => {
                let (cur_uid, cur_gid) = self
                    .fs
                    .stat(path)
                    .await?
                    .sys
                    .map(|s| (s.uid, s.gid))
                    .unwrap_or((0, 0));
                self.fs
                    .chown(path, uid.unwrap_or(cur_uid), gid.unwrap_or(cur_gid))
                    .await?;
            }
        }
        Ok(())
    }

    async fn readlink(&self, path: &str) -> FsResult<FileInfo> {
        let links = self
            .fs
            .symlinks()
            .ok_or_else(|| FsError::unsupported("symbolic links"))?;
        let target = links.readlink(path).await?;
        Ok(FileInfo::new(
            target.clone(),
            target.len() as u64,
            FileMode::symlink(0o777),
            SystemTime::UNIX_EPOCH,
        ))
    }
}

#[async_trait]
impl FileReader for ServerHandler {
    async fn file_read(&self, req: &Request) -> FsResult<Box<dyn ReaderAt>> {
        let _guard = self.lock.read().await;
        debug!(method = %req.method, path = %req.filepath, "file read");
        let file = self
            .fs
            .open_file(&req.filepath, OpenFlags::READ, FileMode(0))
            .await
            .with_path("Get", &req.filepath)?;
        Ok(Box::new(ServerFile::new(
            req.filepath.clone(),
            file,
            OpenFlags::READ,
        )))
    }
}

#[async_trait]
impl FileWriter for ServerHandler {
    async fn file_write(&self, req: &Request) -> FsResult<Box<dyn WriterAt>> {
        let _guard = self.lock.write().await;
        let flags = Self::write_flags(req.pflags);
        debug!(method = %req.method, path = %req.filepath, flags = flags.0, "file write");
        let file = self
            .fs
            .open_file(&req.filepath, flags, FileMode(FileMode::DEFAULT_FILE))
            .await
            .with_path("Put", &req.filepath)?;
        Ok(Box::new(ServerFile::new(req.filepath.clone(), file, flags)))
    }
}

#[async_trait]
impl FileCmder for ServerHandler {
    async fn file_cmd(&self, req: &Request) -> FsResult<()> {
        let _guard = self.lock.write().await;
        debug!(method = %req.method, path = %req.filepath, target = ?req.target, "file cmd");
        let path = req.filepath.as_str();
        match req.method {
            Method::Setstat => self
                .setstat(path, &req.attrs)
                .await
                .with_path("Setstat", path),
            Method::Rename => {
                let target = req.target()?;
                self.fs
                    .rename(path, target)
                    .await
                    .with_paths("Rename", path, target)
            }
            Method::Mkdir => self
                .fs
                .mkdir(path, FileMode(FileMode::DEFAULT_DIR))
                .await
                .with_path("Mkdir", path),
            Method::Rmdir | Method::Remove => self
                .fs
                .remove(path)
                .await
                .with_path(req.method.as_str(), path),
            Method::Symlink => {
                let target = req.target()?;
                match self.fs.symlinks() {
                    Some(links) => links
                        .symlink(target, path)
                        .await
                        .with_paths("Symlink", target, path),
                    None => Err(FsError::unsupported("symbolic links")
                        .with_paths("Symlink", target, path)),
                }
            }
            Method::Link => Err(FsError::unsupported("hard links").with_path("Link", path)),
            other => Err(FsError::unsupported(format!("command {}", other))
                .with_path(other.as_str(), path)),
        }
    }
}

#[async_trait]
impl FileLister for ServerHandler {
    async fn file_list(&self, req: &Request) -> FsResult<Box<dyn ListerAt>> {
        let _guard = self.lock.read().await;
        debug!(method = %req.method, path = %req.filepath, "file list");
        let path = req.filepath.as_str();
        let entries = match req.method {
            Method::List => {
                let mut dir = self
                    .fs
                    .open_file(path, OpenFlags::READ, FileMode(0))
                    .await
                    .with_path("List", path)?;
                let listed = dir.read_dir(0).await.with_path("List", path);
                let closed = dir.close().await.with_path("List", path);
                let mut entries = listed?;
                closed?;
                entries.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
                entries
            }
            Method::Stat => vec![self.fs.stat(path).await.with_path("Stat", path)?],
            Method::Lstat => vec![self.fs.lstat(path).await.with_path("Lstat", path)?],
            Method::Readlink => vec![self.readlink(path).await.with_path("Readlink", path)?],
            other => {
                return Err(FsError::unsupported(format!("list {}", other))
                    .with_path(other.as_str(), path))
            }
        };
        Ok(Box::new(VecLister::new(entries)))
    }
}
