//! On-disk filesystem rooted at a host directory.
//!
//! Wire paths are cleaned and joined under the root, so `..` cannot climb
//! above it. Symbolic links stored on disk are not confined; a link created
//! through [`OsFs`] with an absolute target is rewritten to point inside the
//! root.

use crate::error::{ErrorKind, FsError, FsResult, ResultExt};
use crate::traits::{DirCursor, File, FileSystem, SymlinkFileSystem};
use crate::types::{base_name, clean, FileInfo, FileMode, FileSys, OpenFlags};
use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

/// Filesystem backed by a directory on the host.
#[derive(Debug, Clone)]
pub struct OsFs {
    root: PathBuf,
}

impl OsFs {
    /// Serves the tree below `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Host directory this filesystem is rooted at.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn host_path(&self, path: &str) -> PathBuf {
        let cleaned = clean(path);
        let relative = cleaned.trim_start_matches('/');
        if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }
}

fn info_from_metadata(name: &str, meta: &std::fs::Metadata) -> FileInfo {
    let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);

    #[cfg(unix)]
    let (mode, sys) = {
        use std::os::unix::fs::MetadataExt;
        let atime = meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH);
        (
            FileMode(meta.mode()),
            Some(FileSys {
                uid: meta.uid(),
                gid: meta.gid(),
                atime,
            }),
        )
    };

    #[cfg(not(unix))]
    let (mode, sys) = {
        let perm = if meta.permissions().readonly() { 0o444 } else { 0o644 };
        let mode = if meta.is_dir() {
            FileMode::dir(perm | 0o111)
        } else if meta.file_type().is_symlink() {
            FileMode::symlink(0o777)
        } else {
            FileMode::file(perm)
        };
        (mode, None)
    };

    FileInfo {
        name: name.to_string(),
        size: meta.len(),
        mode,
        mtime,
        sys,
    }
}

async fn blocking<T, F>(f: F) -> FsResult<T>
where
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(FsError::from),
        Err(e) => Err(FsError::Other(Box::new(e))),
    }
}

async fn list_host_dir(dir: &Path) -> std::io::Result<Vec<FileInfo>> {
    let mut entries = Vec::new();
    let mut reader = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = reader.next_entry().await? {
        let meta = tokio::fs::symlink_metadata(entry.path()).await?;
        let name = entry.file_name().to_string_lossy().into_owned();
        entries.push(info_from_metadata(&name, &meta));
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

#[async_trait]
impl FileSystem for OsFs {
    async fn open_file(
        &self,
        path: &str,
        flags: OpenFlags,
        mode: FileMode,
    ) -> FsResult<Box<dyn File>> {
        let host = self.host_path(path);

        if let Ok(meta) = tokio::fs::metadata(&host).await {
            if meta.is_dir() {
                if flags.writable() {
                    return Err(FsError::from(ErrorKind::IsADirectory).with_path("open", path));
                }
                return Ok(Box::new(OsFile {
                    name: path.to_string(),
                    host,
                    file: None,
                    flags,
                    cursor: DirCursor::new(),
                    closed: false,
                }));
            }
        }

        let mut options = tokio::fs::OpenOptions::new();
        options
            .read(flags.readable())
            .write(flags.contains(OpenFlags::WRITE))
            .append(flags.contains(OpenFlags::APPEND))
            .truncate(flags.contains(OpenFlags::TRUNCATE) && flags.writable());
        if flags.contains(OpenFlags::CREATE | OpenFlags::EXCLUSIVE) {
            options.create_new(true);
        } else if flags.contains(OpenFlags::CREATE) {
            options.create(true);
        }
        #[cfg(unix)]
        options.mode(mode.perm());
        #[cfg(not(unix))]
        let _ = mode;

        let file = options
            .open(&host)
            .await
            .map_err(FsError::from)
            .with_path("open", path)?;
        debug!(path, ?flags, "osfs: opened");

        Ok(Box::new(OsFile {
            name: path.to_string(),
            host,
            file: Some(file),
            flags,
            cursor: DirCursor::new(),
            closed: false,
        }))
    }

    async fn mkdir(&self, path: &str, mode: FileMode) -> FsResult<()> {
        let mut builder = tokio::fs::DirBuilder::new();
        #[cfg(unix)]
        builder.mode(mode.perm());
        #[cfg(not(unix))]
        let _ = mode;
        builder
            .create(self.host_path(path))
            .await
            .map_err(FsError::from)
            .with_path("mkdir", path)
    }

    async fn remove(&self, path: &str) -> FsResult<()> {
        let host = self.host_path(path);
        if host == self.root {
            return Err(FsError::from(ErrorKind::PermissionDenied).with_path("remove", path));
        }
        let meta = tokio::fs::symlink_metadata(&host)
            .await
            .map_err(FsError::from)
            .with_path("remove", path)?;
        let result = if meta.is_dir() {
            tokio::fs::remove_dir(&host).await
        } else {
            tokio::fs::remove_file(&host).await
        };
        result.map_err(FsError::from).with_path("remove", path)
    }

    async fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        tokio::fs::rename(self.host_path(from), self.host_path(to))
            .await
            .map_err(FsError::from)
            .with_paths("rename", from, to)
    }

    async fn stat(&self, path: &str) -> FsResult<FileInfo> {
        let meta = tokio::fs::metadata(self.host_path(path))
            .await
            .map_err(FsError::from)
            .with_path("stat", path)?;
        Ok(info_from_metadata(base_name(path), &meta))
    }

    async fn lstat(&self, path: &str) -> FsResult<FileInfo> {
        let meta = tokio::fs::symlink_metadata(self.host_path(path))
            .await
            .map_err(FsError::from)
            .with_path("lstat", path)?;
        Ok(info_from_metadata(base_name(path), &meta))
    }

    async fn chmod(&self, path: &str, mode: FileMode) -> FsResult<()> {
        let host = self.host_path(path);
        #[cfg(unix)]
        let perms = {
            use std::os::unix::fs::PermissionsExt;
            std::fs::Permissions::from_mode(mode.perm())
        };
        #[cfg(not(unix))]
        let perms = {
            let mut perms = tokio::fs::metadata(&host)
                .await
                .map_err(FsError::from)
                .with_path("chmod", path)?
                .permissions();
            perms.set_readonly(mode.perm() & 0o200 == 0);
            perms
        };
        tokio::fs::set_permissions(host, perms)
            .await
            .map_err(FsError::from)
            .with_path("chmod", path)
    }

    async fn chtimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> FsResult<()> {
        let host = self.host_path(path);
        blocking(move || {
            let times = std::fs::FileTimes::new()
                .set_accessed(atime)
                .set_modified(mtime);
            std::fs::File::open(host)?.set_times(times)
        })
        .await
        .with_path("chtimes", path)
    }

    async fn chown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        #[cfg(unix)]
        {
            let host = self.host_path(path);
            blocking(move || std::os::unix::fs::chown(host, Some(uid), Some(gid)))
                .await
                .with_path("chown", path)
        }
        #[cfg(not(unix))]
        {
            let _ = (uid, gid);
            Err(FsError::unsupported("chown").with_path("chown", path))
        }
    }

    async fn truncate(&self, path: &str, size: u64) -> FsResult<()> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(self.host_path(path))
            .await
            .map_err(FsError::from)
            .with_path("truncate", path)?;
        file.set_len(size)
            .await
            .map_err(FsError::from)
            .with_path("truncate", path)
    }

    async fn read_dir(&self, path: &str) -> FsResult<Vec<FileInfo>> {
        list_host_dir(&self.host_path(path))
            .await
            .map_err(FsError::from)
            .with_path("readdir", path)
    }

    fn temp_dir(&self) -> String {
        "/tmp".to_string()
    }

    #[cfg(unix)]
    fn symlinks(&self) -> Option<&dyn SymlinkFileSystem> {
        Some(self)
    }
}

#[cfg(unix)]
#[async_trait]
impl SymlinkFileSystem for OsFs {
    async fn symlink(&self, target: &str, link: &str) -> FsResult<()> {
        let host_target = if target.starts_with('/') {
            self.host_path(target)
        } else {
            PathBuf::from(target)
        };
        tokio::fs::symlink(host_target, self.host_path(link))
            .await
            .map_err(FsError::from)
            .with_paths("symlink", target, link)
    }

    async fn readlink(&self, link: &str) -> FsResult<String> {
        let target = tokio::fs::read_link(self.host_path(link))
            .await
            .map_err(FsError::from)
            .with_path("readlink", link)?;
        match target.strip_prefix(&self.root) {
            Ok(inner) if target.is_absolute() => Ok(format!("/{}", inner.to_string_lossy())),
            _ => Ok(target.to_string_lossy().into_owned()),
        }
    }

    async fn lchown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        let host = self.host_path(path);
        blocking(move || std::os::unix::fs::lchown(host, Some(uid), Some(gid)))
            .await
            .with_path("lchown", path)
    }
}

/// Open file or directory under an [`OsFs`].
#[derive(Debug)]
struct OsFile {
    name: String,
    host: PathBuf,
    /// `None` for directories.
    file: Option<tokio::fs::File>,
    flags: OpenFlags,
    cursor: DirCursor,
    closed: bool,
}

impl OsFile {
    fn handle(&mut self, op: &'static str) -> FsResult<&mut tokio::fs::File> {
        if self.closed {
            return Err(FsError::invalid("file already closed").with_path(op, &self.name));
        }
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(FsError::from(ErrorKind::IsADirectory).with_path(op, &self.name)),
        }
    }
}

#[async_trait]
impl File for OsFile {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        let name = self.name.clone();
        let file = self.handle("read")?;
        file.read(buf).await.map_err(FsError::from).with_path("read", &name)
    }

    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        let name = self.name.clone();
        let file = self.handle("readat")?;
        let result = async {
            let saved = file.stream_position().await?;
            file.seek(SeekFrom::Start(offset)).await?;
            let mut total = 0;
            while total < buf.len() {
                let n = file.read(&mut buf[total..]).await?;
                if n == 0 {
                    break;
                }
                total += n;
            }
            file.seek(SeekFrom::Start(saved)).await?;
            Ok::<_, std::io::Error>(total)
        }
        .await;
        result.map_err(FsError::from).with_path("readat", &name)
    }

    async fn write(&mut self, buf: &[u8]) -> FsResult<usize> {
        let name = self.name.clone();
        let file = self.handle("write")?;
        let result = async {
            file.write_all(buf).await?;
            file.flush().await?;
            Ok::<_, std::io::Error>(buf.len())
        }
        .await;
        result.map_err(FsError::from).with_path("write", &name)
    }

    async fn write_at(&mut self, buf: &[u8], offset: u64) -> FsResult<usize> {
        let name = self.name.clone();
        let file = self.handle("writeat")?;
        let result = async {
            let saved = file.stream_position().await?;
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(buf).await?;
            file.flush().await?;
            file.seek(SeekFrom::Start(saved)).await?;
            Ok::<_, std::io::Error>(buf.len())
        }
        .await;
        result.map_err(FsError::from).with_path("writeat", &name)
    }

    async fn seek(&mut self, pos: SeekFrom) -> FsResult<u64> {
        let name = self.name.clone();
        let file = self.handle("seek")?;
        file.seek(pos).await.map_err(FsError::from).with_path("seek", &name)
    }

    async fn close(&mut self) -> FsResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(mut file) = self.file.take() {
            file.flush()
                .await
                .map_err(FsError::from)
                .with_path("close", &self.name)?;
        }
        Ok(())
    }

    async fn stat(&mut self) -> FsResult<FileInfo> {
        let meta = match &self.file {
            Some(file) if !self.closed => file.metadata().await,
            _ => tokio::fs::metadata(&self.host).await,
        };
        let meta = meta.map_err(FsError::from).with_path("stat", &self.name)?;
        Ok(info_from_metadata(base_name(&self.name), &meta))
    }

    async fn sync(&mut self) -> FsResult<()> {
        let name = self.name.clone();
        let file = self.handle("sync")?;
        file.sync_all().await.map_err(FsError::from).with_path("sync", &name)
    }

    async fn truncate(&mut self, size: u64) -> FsResult<()> {
        if !self.flags.writable() {
            return Err(FsError::from(ErrorKind::PermissionDenied).with_path("truncate", &self.name));
        }
        let name = self.name.clone();
        let file = self.handle("truncate")?;
        file.set_len(size)
            .await
            .map_err(FsError::from)
            .with_path("truncate", &name)
    }

    async fn read_dir(&mut self, n: isize) -> FsResult<Vec<FileInfo>> {
        if self.file.is_some() {
            return Err(FsError::from(ErrorKind::NotADirectory).with_path("readdir", &self.name));
        }
        if !self.cursor.is_loaded() {
            let entries = list_host_dir(&self.host)
                .await
                .map_err(FsError::from)
                .with_path("readdir", &self.name)?;
            self.cursor.load(entries);
        }
        self.cursor.next_batch(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::read_to_end;

    #[tokio::test]
    async fn test_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let fs = OsFs::new(dir.path());

        let mut file = fs.create("/hello.txt").await.unwrap();
        file.write_str("Hello, SFTP World!").await.unwrap();
        file.close().await.unwrap();

        assert!(dir.path().join("hello.txt").exists());
        let mut file = fs.open("/hello.txt").await.unwrap();
        assert_eq!(read_to_end(file.as_mut()).await.unwrap(), b"Hello, SFTP World!");
        assert_eq!(fs.stat("/hello.txt").await.unwrap().size, 18);
    }

    #[tokio::test]
    async fn test_paths_stay_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let fs = OsFs::new(dir.path());

        assert_eq!(fs.host_path("/../../etc/passwd"), dir.path().join("etc/passwd"));
        assert_eq!(fs.host_path("/"), dir.path());
        assert!(fs.remove("/").await.is_err());
    }

    #[tokio::test]
    async fn test_directory_handle() {
        let dir = tempfile::tempdir().unwrap();
        let fs = OsFs::new(dir.path());
        fs.mkdir_all("/a/b", FileMode(0o755)).await.unwrap();
        for name in ["z", "m", "a"] {
            fs.create(&format!("/a/{}", name)).await.unwrap().close().await.unwrap();
        }

        let mut handle = fs.open("/a").await.unwrap();
        assert_eq!(handle.read_dir_names(2).await.unwrap(), ["a", "b"]);
        assert_eq!(handle.read_dir_names(-1).await.unwrap(), ["m", "z"]);
        assert!(handle.read_dir(0).await.unwrap().is_empty());
        assert!(handle.write(b"x").await.is_err());

        let err = fs
            .open_file("/a", OpenFlags::WRITE, FileMode(0))
            .await
            .err().expect("operation must fail");
        assert_eq!(err.kind(), ErrorKind::IsADirectory);
    }

    #[tokio::test]
    async fn test_positional_io_keeps_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let fs = OsFs::new(dir.path());
        let mut file = fs.create("/f").await.unwrap();
        file.write(b"0123456789").await.unwrap();
        file.seek(SeekFrom::Start(2)).await.unwrap();

        file.write_at(b"XXXXX", 5).await.unwrap();
        let mut buf = [0u8; 3];
        file.read(&mut buf).await.unwrap();
        assert_eq!(&buf, b"234");
        file.close().await.unwrap();
        file.close().await.unwrap();

        let mut file = fs.open("/f").await.unwrap();
        assert_eq!(read_to_end(file.as_mut()).await.unwrap(), b"01234XXXXX");
    }

    #[tokio::test]
    async fn test_remove_all_and_errors() {
        let dir = tempfile::tempdir().unwrap();
        let fs = OsFs::new(dir.path());
        fs.mkdir_all("/tmp/a/b/c", FileMode(0o755)).await.unwrap();
        fs.create("/tmp/a/b/c/file.txt").await.unwrap().close().await.unwrap();

        let err = fs.mkdir("/tmp/a", FileMode(0o755)).await.unwrap_err();
        assert!(err.is_exists());

        fs.remove_all("/tmp/a").await.unwrap();
        assert!(fs.stat("/tmp/a").await.unwrap_err().is_not_found());
        fs.remove_all("/tmp/a").await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinks_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let fs = OsFs::new(dir.path());
        fs.create("/target").await.unwrap().close().await.unwrap();

        let links = fs.symlinks().unwrap();
        links.symlink("/target", "/link").await.unwrap();
        assert_eq!(links.readlink("/link").await.unwrap(), "/target");
        assert!(fs.lstat("/link").await.unwrap().is_symlink());
        assert!(!fs.stat("/link").await.unwrap().is_symlink());

        links.symlink("/missing", "/broken").await.unwrap();
        assert!(fs.stat("/broken").await.unwrap_err().is_not_found());
        assert!(fs.lstat("/broken").await.is_ok());
    }
}
