//! Filesystem adapter over an SFTP session.
//!
//! # Example
//!
//! ```rust,no_run
//! use sftpfs_platform::{read_to_end, FileSystem};
//! use sftpfs_proto::ssh::sftp::SftpFs;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let fs = SftpFs::dial("files.example.com:22", "alice", "secret").await?;
//!
//! let mut file = fs.create("/home/alice/hello.txt").await?;
//! file.write_str("Hello, SFTP World!").await?;
//! file.close().await?;
//!
//! let mut file = fs.open("/home/alice/hello.txt").await?;
//! let body = read_to_end(file.as_mut()).await?;
//! assert_eq!(body, b"Hello, SFTP World!");
//!
//! fs.close().await?;
//! # Ok(())
//! # }
//! ```

use super::file::SftpFile;
use super::transport::SftpTransport;
use crate::ssh::client::{connect, ClientConfig};
use async_trait::async_trait;
use parking_lot::RwLock;
use sftpfs_platform::traits::{mkdir_all, remove_all};
use sftpfs_platform::{
    ErrorKind, File, FileInfo, FileMode, FileSystem, FsError, FsResult, OpenFlags, ResultExt,
    SymlinkFileSystem,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info};

/// A [`FileSystem`] whose operations run against a remote SFTP server.
///
/// The adapter is thin: no caching and no per-operation retry. Every failure
/// comes back wrapped with the operation name and path(s).
///
/// Paths are sent to the server as given. The working directory set by
/// [`chdir`](Self::chdir) is bookkeeping for callers and is never prefixed
/// onto remote paths.
pub struct SftpFs {
    transport: Arc<dyn SftpTransport>,
    cwd: RwLock<String>,
    closed: AtomicBool,
}

impl SftpFs {
    /// Wraps an established transport.
    pub fn new(transport: Arc<dyn SftpTransport>) -> Self {
        Self {
            transport,
            cwd: RwLock::new("/".to_string()),
            closed: AtomicBool::new(false),
        }
    }

    /// Connects with retry and opens the SFTP subsystem.
    pub async fn connect(config: &ClientConfig) -> FsResult<Self> {
        let transport = connect(config).await?;
        Ok(Self::new(Arc::new(transport)))
    }

    /// Connects with password authentication and default settings.
    pub async fn dial(host: &str, user: &str, password: &str) -> FsResult<Self> {
        Self::connect(&ClientConfig::password(host, user, password)).await
    }

    /// Connects with a PEM or OpenSSH encoded private key and default
    /// settings.
    pub async fn dial_with_key(host: &str, user: &str, pem: &[u8]) -> FsResult<Self> {
        Self::connect(&ClientConfig::key(host, user, pem)).await
    }

    /// The transport this adapter talks to.
    pub fn transport(&self) -> &Arc<dyn SftpTransport> {
        &self.transport
    }

    /// Current working directory.
    pub fn getwd(&self) -> String {
        self.cwd.read().clone()
    }

    /// Changes the working directory after checking that `path` is a
    /// directory on the server.
    pub async fn chdir(&self, path: &str) -> FsResult<()> {
        let info = self.transport.stat(path).await.with_path("Chdir", path)?;
        if !info.is_dir() {
            return Err(FsError::new(ErrorKind::NotADirectory, "not a directory")
                .with_path("Chdir", path));
        }
        *self.cwd.write() = path.to_string();
        debug!(path, "changed working directory");
        Ok(())
    }

    /// Ends the SFTP session and the SSH connection. Idempotent.
    pub async fn close(&self) -> FsResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("closing sftp filesystem");
        self.transport.close().await
    }

    /// SFTP v3 reports an existing target as a plain failure; reclassify it
    /// as [`ErrorKind::AlreadyExists`] when `path` is present.
    async fn reclassify_exists(&self, err: FsError, path: &str) -> FsError {
        if err.kind() != ErrorKind::Other || self.transport.lstat(path).await.is_err() {
            return err;
        }
        debug!(path, "failure on existing target reported as exists");
        FsError::new(ErrorKind::AlreadyExists, err.to_string())
    }

    fn require_symlinks(&self, op: &'static str, path: &str) -> FsResult<()> {
        if self.transport.supports_symlinks() {
            Ok(())
        } else {
            Err(FsError::unsupported("symbolic links").with_path(op, path))
        }
    }
}

#[async_trait]
impl FileSystem for SftpFs {
    async fn open_file(
        &self,
        path: &str,
        flags: OpenFlags,
        mode: FileMode,
    ) -> FsResult<Box<dyn File>> {
        debug!(path, flags = flags.0, "open");
        let remote = match self.transport.open_file(path, flags).await {
            Ok(remote) => remote,
            Err(err) => {
                // Servers differ on opening directories; fall back to a
                // listing-only handle for read opens.
                if !flags.writable() {
                    if let Ok(info) = self.transport.stat(path).await {
                        if info.is_dir() {
                            return Ok(Box::new(SftpFile::directory(
                                path,
                                Arc::clone(&self.transport),
                            )));
                        }
                    }
                }
                let err = if flags.contains(OpenFlags::CREATE | OpenFlags::EXCLUSIVE) {
                    self.reclassify_exists(err, path).await
                } else {
                    err
                };
                return Err(err.with_path("OpenFile", path));
            }
        };

        if flags.contains(OpenFlags::CREATE) && mode.perm() != 0 {
            if let Err(err) = self
                .transport
                .chmod(path, FileMode(mode.perm()))
                .await
            {
                let _ = remote.close().await;
                return Err(err.with_path("OpenFile.Chmod", path));
            }
        }

        let pos = if flags.contains(OpenFlags::APPEND) {
            match remote.stat().await {
                Ok(info) => info.size,
                Err(err) => {
                    let _ = remote.close().await;
                    return Err(err.with_path("OpenFile", path));
                }
            }
        } else {
            0
        };

        Ok(Box::new(SftpFile::new(
            path,
            remote,
            Arc::clone(&self.transport),
            flags,
            pos,
        )))
    }

    async fn mkdir(&self, path: &str, mode: FileMode) -> FsResult<()> {
        if let Err(err) = self.transport.mkdir(path).await {
            return Err(self.reclassify_exists(err, path).await.with_path("Mkdir", path));
        }
        self.transport
            .chmod(path, FileMode(mode.perm()))
            .await
            .with_path("Mkdir.Chmod", path)
    }

    async fn mkdir_all(&self, path: &str, mode: FileMode) -> FsResult<()> {
        match self.transport.mkdir_all(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_unsupported() => mkdir_all(self, path, mode).await,
            Err(err) => Err(err.with_path("MkdirAll", path)),
        }
    }

    async fn remove_all(&self, path: &str) -> FsResult<()> {
        remove_all(self, path).await
    }

    async fn remove(&self, path: &str) -> FsResult<()> {
        self.transport.remove(path).await.with_path("Remove", path)
    }

    async fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        self.transport
            .rename(from, to)
            .await
            .with_paths("Rename", from, to)
    }

    async fn stat(&self, path: &str) -> FsResult<FileInfo> {
        self.transport.stat(path).await.with_path("Stat", path)
    }

    async fn lstat(&self, path: &str) -> FsResult<FileInfo> {
        self.transport.lstat(path).await.with_path("Lstat", path)
    }

    async fn chmod(&self, path: &str, mode: FileMode) -> FsResult<()> {
        self.transport
            .chmod(path, FileMode(mode.perm()))
            .await
            .with_path("Chmod", path)
    }

    async fn chtimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> FsResult<()> {
        self.transport
            .chtimes(path, atime, mtime)
            .await
            .with_path("Chtimes", path)
    }

    async fn chown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        self.transport
            .chown(path, uid, gid)
            .await
            .with_path("Chown", path)
    }

    async fn truncate(&self, path: &str, size: u64) -> FsResult<()> {
        self.transport
            .truncate(path, size)
            .await
            .with_path("Truncate", path)
    }

    async fn read_dir(&self, path: &str) -> FsResult<Vec<FileInfo>> {
        self.transport.read_dir(path).await.with_path("ReadDir", path)
    }

    fn symlinks(&self) -> Option<&dyn SymlinkFileSystem> {
        if self.transport.supports_symlinks() {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl SymlinkFileSystem for SftpFs {
    async fn symlink(&self, target: &str, link: &str) -> FsResult<()> {
        self.require_symlinks("Symlink", link)?;
        match self.transport.symlink(target, link).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self
                .reclassify_exists(err, link)
                .await
                .with_paths("Symlink", target, link)),
        }
    }

    async fn readlink(&self, link: &str) -> FsResult<String> {
        self.require_symlinks("Readlink", link)?;
        self.transport
            .read_link(link)
            .await
            .with_path("Readlink", link)
    }

    /// SFTP v3 has no no-follow ownership change, so this is `chown`.
    async fn lchown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        self.transport
            .chown(path, uid, gid)
            .await
            .with_path("Lchown", path)
    }
}

impl std::fmt::Debug for SftpFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpFs")
            .field("cwd", &*self.cwd.read())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::sftp::LoopbackTransport;
    use sftpfs_platform::{read_to_end, write_all, MemFs};
    use std::io::SeekFrom;
    use std::time::{Duration, UNIX_EPOCH};

    fn setup() -> (Arc<MemFs>, Arc<LoopbackTransport>, SftpFs) {
        let backing = Arc::new(MemFs::new());
        let transport = Arc::new(LoopbackTransport::new(backing.clone()));
        let fs = SftpFs::new(transport.clone());
        (backing, transport, fs)
    }

    async fn put(fs: &SftpFs, path: &str, body: &[u8]) {
        let mut file = fs.create(path).await.unwrap();
        write_all(file.as_mut(), body).await.unwrap();
        file.close().await.unwrap();
    }

    async fn get(fs: &SftpFs, path: &str) -> Vec<u8> {
        let mut file = fs.open(path).await.unwrap();
        let body = read_to_end(file.as_mut()).await.unwrap();
        file.close().await.unwrap();
        body
    }

    #[tokio::test]
    async fn test_small_file_round_trip() {
        let (_, _, fs) = setup();
        fs.mkdir_all("/home/test", FileMode(0o755)).await.unwrap();

        put(&fs, "/home/test/hello.txt", b"Hello, SFTP World!").await;
        assert_eq!(get(&fs, "/home/test/hello.txt").await, b"Hello, SFTP World!");
        assert_eq!(fs.stat("/home/test/hello.txt").await.unwrap().size, 18);

        fs.remove("/home/test/hello.txt").await.unwrap();
        let err = fs.stat("/home/test/hello.txt").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("Stat"));
        assert!(err.to_string().contains("/home/test/hello.txt"));
    }

    #[tokio::test]
    async fn test_binary_round_trip() {
        let (_, _, fs) = setup();
        let mut body: Vec<u8> = (0..=255u8).collect();
        body.extend((0..1024 * 1024).map(|i| (i % 251) as u8));

        put(&fs, "/blob.bin", &body).await;
        assert_eq!(get(&fs, "/blob.bin").await, body);
        assert_eq!(fs.stat("/blob.bin").await.unwrap().size, body.len() as u64);
    }

    #[tokio::test]
    async fn test_rename() {
        let (_, _, fs) = setup();
        fs.mkdir("/tmp", FileMode(0o755)).await.unwrap();
        put(&fs, "/tmp/old.txt", b"content").await;

        fs.rename("/tmp/old.txt", "/tmp/new.txt").await.unwrap();
        assert!(fs.stat("/tmp/old.txt").await.unwrap_err().is_not_found());
        assert_eq!(fs.stat("/tmp/new.txt").await.unwrap().size, 7);

        let err = fs.rename("/tmp/old.txt", "/tmp/x.txt").await.unwrap_err();
        assert!(err.is_not_found());
        let msg = err.to_string();
        assert!(msg.contains("Rename") && msg.contains("/tmp/old.txt") && msg.contains("/tmp/x.txt"));
    }

    #[tokio::test]
    async fn test_nested_tree() {
        let (_, _, fs) = setup();
        fs.mkdir_all("/tmp/a/b/c", FileMode(0o755)).await.unwrap();
        put(&fs, "/tmp/a/b/c/file.txt", b"nested").await;
        assert!(!fs.stat("/tmp/a/b/c/file.txt").await.unwrap().is_dir());

        fs.remove_all("/tmp/a").await.unwrap();
        assert!(fs.stat("/tmp/a").await.unwrap_err().is_not_found());

        // Absent path.
        fs.remove_all("/tmp/a").await.unwrap();
    }

    #[tokio::test]
    async fn test_mkdir_all_over_file() {
        let (_, _, fs) = setup();
        put(&fs, "/f", b"x").await;
        let err = fs.mkdir_all("/f/g", FileMode(0o755)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotADirectory);
    }

    #[tokio::test]
    async fn test_positional_write() {
        let (_, _, fs) = setup();
        put(&fs, "/digits", b"0123456789").await;

        let mut file = fs
            .open_file("/digits", OpenFlags::READ_WRITE, FileMode(0))
            .await
            .unwrap();
        assert_eq!(file.write_at(b"XXXXX", 5).await.unwrap(), 5);
        file.close().await.unwrap();

        assert_eq!(get(&fs, "/digits").await, b"01234XXXXX");
    }

    #[tokio::test]
    async fn test_positional_io_keeps_other_cursor() {
        let (_, _, fs) = setup();
        put(&fs, "/data", b"abcdefghij").await;

        let mut reader = fs.open("/data").await.unwrap();
        let mut buf = [0u8; 3];
        reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");

        let mut writer = fs
            .open_file("/data", OpenFlags::READ_WRITE, FileMode(0))
            .await
            .unwrap();
        writer.write_at(b"ZZ", 8).await.unwrap();
        let mut other = [0u8; 2];
        writer.read_at(&mut other, 0).await.unwrap();
        assert_eq!(&other, b"ab");
        writer.close().await.unwrap();

        reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf, b"def");
    }

    #[tokio::test]
    async fn test_seek_is_local() {
        let (_, _, fs) = setup();
        put(&fs, "/s", b"0123456789").await;

        let mut file = fs.open("/s").await.unwrap();
        assert_eq!(file.seek(SeekFrom::End(-3)).await.unwrap(), 7);
        let mut buf = [0u8; 8];
        let n = file.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"789");
        assert_eq!(file.read(&mut buf).await.unwrap(), 0);

        assert_eq!(file.seek(SeekFrom::Start(2)).await.unwrap(), 2);
        assert_eq!(file.seek(SeekFrom::Current(1)).await.unwrap(), 3);
        let err = file.seek(SeekFrom::Current(-10)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_append_writes_at_end() {
        let (_, _, fs) = setup();
        put(&fs, "/log", b"one\n").await;

        let mut file = fs
            .open_file("/log", OpenFlags::WRITE | OpenFlags::APPEND, FileMode(0))
            .await
            .unwrap();
        file.write_str("two\n").await.unwrap();
        file.seek(SeekFrom::Start(0)).await.unwrap();
        file.write_str("three\n").await.unwrap();
        file.close().await.unwrap();

        assert_eq!(get(&fs, "/log").await, b"one\ntwo\nthree\n");
    }

    #[tokio::test]
    async fn test_create_applies_mode() {
        let (backing, _, fs) = setup();
        let mut file = fs
            .open_file(
                "/secret",
                OpenFlags::WRITE | OpenFlags::CREATE,
                FileMode(0o600),
            )
            .await
            .unwrap();
        file.close().await.unwrap();
        assert_eq!(backing.stat("/secret").await.unwrap().mode.perm(), 0o600);

        fs.mkdir("/private", FileMode(0o700)).await.unwrap();
        assert_eq!(backing.stat("/private").await.unwrap().mode.perm(), 0o700);
    }

    #[tokio::test]
    async fn test_exclusive_create() {
        let (_, _, fs) = setup();
        put(&fs, "/once", b"").await;
        let err = fs
            .open_file(
                "/once",
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::EXCLUSIVE,
                FileMode(0o644),
            )
            .await
            .err().expect("exclusive create of existing file must fail");
        assert!(err.is_exists());
    }

    #[tokio::test]
    async fn test_truncate() {
        let (_, _, fs) = setup();
        put(&fs, "/t", b"hello world").await;

        fs.truncate("/t", 5).await.unwrap();
        assert_eq!(get(&fs, "/t").await, b"hello");

        let mut file = fs
            .open_file("/t", OpenFlags::READ_WRITE, FileMode(0))
            .await
            .unwrap();
        file.truncate(8).await.unwrap();
        assert_eq!(file.stat().await.unwrap().size, 8);
        file.close().await.unwrap();
        assert_eq!(get(&fs, "/t").await, b"hello\0\0\0");
    }

    #[tokio::test]
    async fn test_read_dir_cursor() {
        let (_, _, fs) = setup();
        fs.mkdir("/d", FileMode(0o755)).await.unwrap();
        for name in ["c.txt", "a.txt", "b.txt"] {
            put(&fs, &format!("/d/{name}"), b"").await;
        }
        fs.mkdir("/d/subdir", FileMode(0o755)).await.unwrap();

        let names: Vec<_> = fs
            .read_dir("/d")
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, ["a.txt", "b.txt", "c.txt", "subdir"]);

        let mut dir = fs.open("/d").await.unwrap();
        assert_eq!(dir.read_dir(3).await.unwrap().len(), 3);
        assert_eq!(dir.read_dir_names(3).await.unwrap(), ["subdir"]);
        assert!(dir.read_dir(1).await.unwrap_err().is_eof());
        assert!(dir.read_dir(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_directory_handle_refuses_writes() {
        let (_, _, fs) = setup();
        fs.mkdir("/d", FileMode(0o755)).await.unwrap();
        let mut dir = fs.open("/d").await.unwrap();
        let err = dir.write(b"x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IsADirectory);
    }

    #[tokio::test]
    async fn test_read_only_handle_refuses_writes() {
        let (_, _, fs) = setup();
        put(&fs, "/ro", b"x").await;
        let mut file = fs.open("/ro").await.unwrap();
        let err = file.write(b"y").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_double_close_replays_result() {
        let (_, _, fs) = setup();
        put(&fs, "/c", b"x").await;
        let mut file = fs.open("/c").await.unwrap();
        file.close().await.unwrap();
        file.close().await.unwrap();
        assert!(file.read(&mut [0u8; 1]).await.is_err());
        file.sync().await.unwrap_err();
    }

    #[tokio::test]
    async fn test_chdir_and_getwd() {
        let (_, transport, fs) = setup();
        assert_eq!(fs.getwd(), "/");

        fs.mkdir("/work", FileMode(0o755)).await.unwrap();
        put(&fs, "/work/file", b"").await;
        fs.chdir("/work").await.unwrap();
        assert_eq!(fs.getwd(), "/work");

        let err = fs.chdir("/work/file").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotADirectory);
        assert!(fs.chdir("/missing").await.unwrap_err().is_not_found());
        assert_eq!(fs.getwd(), "/work");

        // The working directory is not applied to wire paths.
        let _ = fs.stat("file").await;
        let _ = fs.open("file").await;
        assert_eq!(transport.opened().last().map(String::as_str), Some("file"));
    }

    #[tokio::test]
    async fn test_metadata_operations() {
        let (_, _, fs) = setup();
        put(&fs, "/m", b"").await;

        fs.chmod("/m", FileMode(0o640)).await.unwrap();
        let mtime = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        fs.chtimes("/m", mtime, mtime).await.unwrap();
        fs.chown("/m", 1000, 100).await.unwrap();
        fs.symlinks().unwrap().lchown("/m", 1001, 101).await.unwrap();

        let info = fs.stat("/m").await.unwrap();
        assert_eq!(info.mode.perm(), 0o640);
        assert_eq!(info.mtime, mtime);
        assert_eq!(info.sys.map(|s| (s.uid, s.gid)), Some((1001, 101)));
    }

    #[tokio::test]
    async fn test_symlinks() {
        let (_, _, fs) = setup();
        put(&fs, "/target", b"abc").await;

        let links = fs.symlinks().unwrap();
        links.symlink("/target", "/link").await.unwrap();
        assert_eq!(links.readlink("/link").await.unwrap(), "/target");
        assert!(!fs.stat("/link").await.unwrap().is_symlink());
        assert!(fs.lstat("/link").await.unwrap().is_symlink());

        links.symlink("/nowhere", "/broken").await.unwrap();
        assert!(fs.lstat("/broken").await.unwrap().is_symlink());
        assert!(fs.stat("/broken").await.unwrap_err().is_not_found());
        assert_eq!(links.readlink("/broken").await.unwrap(), "/nowhere");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (_, transport, fs) = setup();
        fs.close().await.unwrap();
        fs.close().await.unwrap();
        assert!(transport.is_closed());

        let err = fs.stat("/").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportClosed);
    }

    #[tokio::test]
    async fn test_separators() {
        let (_, _, fs) = setup();
        assert_eq!(fs.separator(), '/');
        assert_eq!(fs.list_separator(), ':');
        assert_eq!(fs.temp_dir(), "/tmp");
    }
}
