//! Filesystem capability contracts.
//!
//! Every backing store (in-memory, on-disk, remote over SFTP) implements
//! [`FileSystem`] and hands out [`File`] handles. Symbolic links are an
//! optional refinement, discovered at runtime through
//! [`FileSystem::symlinks`].

use crate::error::{ErrorKind, FsError, FsResult};
use crate::types::{join, DirEntry, FileInfo, FileMode, OpenFlags, LIST_SEPARATOR, SEPARATOR};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::io::SeekFrom;
use std::time::SystemTime;

/// Chunk size used by [`read_to_end`].
const READ_CHUNK: usize = 32 * 1024;

/// An open file or directory.
///
/// A handle is owned by one task at a time; methods take `&mut self`.
#[async_trait]
pub trait File: Send + Sync {
    /// Path the handle was opened with.
    fn name(&self) -> &str;

    /// Reads at the cursor. Returns `Ok(0)` at end of file.
    async fn read(&mut self, buf: &mut [u8]) -> FsResult<usize>;

    /// Reads at `offset` without moving the cursor. A short count means end
    /// of file was reached.
    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> FsResult<usize>;

    /// Writes at the cursor (or at end of file for append handles).
    async fn write(&mut self, buf: &[u8]) -> FsResult<usize>;

    /// Writes at `offset` without moving the cursor.
    async fn write_at(&mut self, buf: &[u8], offset: u64) -> FsResult<usize>;

    /// Writes a UTF-8 string at the cursor.
    async fn write_str(&mut self, s: &str) -> FsResult<usize> {
        self.write(s.as_bytes()).await
    }

    /// Moves the cursor. A resulting negative position is invalid.
    async fn seek(&mut self, pos: SeekFrom) -> FsResult<u64>;

    /// Releases the handle. Closing twice returns the first result again.
    async fn close(&mut self) -> FsResult<()>;

    /// Metadata of the open file.
    async fn stat(&mut self) -> FsResult<FileInfo>;

    /// Flushes to stable storage where the backing store supports it.
    async fn sync(&mut self) -> FsResult<()>;

    /// Resizes the file; growth is zero-filled.
    async fn truncate(&mut self, size: u64) -> FsResult<()>;

    /// Reads directory entries.
    ///
    /// With `n <= 0` every remaining entry is returned and later calls return
    /// an empty list. With `n > 0` at most `n` entries are returned; once the
    /// listing is exhausted the call fails with [`ErrorKind::Eof`].
    async fn read_dir(&mut self, n: isize) -> FsResult<Vec<FileInfo>>;

    /// Like [`File::read_dir`] but returns only names.
    async fn read_dir_names(&mut self, n: isize) -> FsResult<Vec<String>> {
        let entries = self.read_dir(n).await?.into_iter().map(DirEntry::from);
        Ok(entries.map(|entry| entry.name().to_string()).collect())
    }
}

/// The base filesystem capability.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Opens `path` with the given intent; `mode` applies when creating.
    async fn open_file(
        &self,
        path: &str,
        flags: OpenFlags,
        mode: FileMode,
    ) -> FsResult<Box<dyn File>>;

    /// Creates a directory; the parent must exist.
    async fn mkdir(&self, path: &str, mode: FileMode) -> FsResult<()>;

    /// Removes a file or an empty directory.
    async fn remove(&self, path: &str) -> FsResult<()>;

    /// Renames `from` to `to`.
    async fn rename(&self, from: &str, to: &str) -> FsResult<()>;

    /// Metadata, following symbolic links.
    async fn stat(&self, path: &str) -> FsResult<FileInfo>;

    /// Metadata without following a final symbolic link.
    async fn lstat(&self, path: &str) -> FsResult<FileInfo> {
        self.stat(path).await
    }

    /// Changes permission bits.
    async fn chmod(&self, path: &str, mode: FileMode) -> FsResult<()>;

    /// Changes access and modification times.
    async fn chtimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> FsResult<()>;

    /// Changes ownership.
    async fn chown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()>;

    /// Resizes the named file.
    async fn truncate(&self, path: &str, size: u64) -> FsResult<()>;

    /// Lists a directory.
    async fn read_dir(&self, path: &str) -> FsResult<Vec<FileInfo>>;

    /// Opens for reading.
    async fn open(&self, path: &str) -> FsResult<Box<dyn File>> {
        self.open_file(path, OpenFlags::READ, FileMode(0)).await
    }

    /// Creates or truncates a file for reading and writing, mode 0666.
    async fn create(&self, path: &str) -> FsResult<Box<dyn File>> {
        self.open_file(
            path,
            OpenFlags::READ_WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            FileMode(0o666),
        )
        .await
    }

    /// Creates `path` and every missing ancestor.
    async fn mkdir_all(&self, path: &str, mode: FileMode) -> FsResult<()> {
        mkdir_all(self, path, mode).await
    }

    /// Removes `path` and everything below it. A missing path is not an error.
    async fn remove_all(&self, path: &str) -> FsResult<()> {
        remove_all(self, path).await
    }

    /// Path separator.
    fn separator(&self) -> char {
        SEPARATOR
    }

    /// Path list separator.
    fn list_separator(&self) -> char {
        LIST_SEPARATOR
    }

    /// Directory for temporary files.
    fn temp_dir(&self) -> String {
        "/tmp".to_string()
    }

    /// Symbolic link capability, if this filesystem has one.
    fn symlinks(&self) -> Option<&dyn SymlinkFileSystem> {
        None
    }
}

/// Symbolic link refinement of [`FileSystem`].
#[async_trait]
pub trait SymlinkFileSystem: FileSystem {
    /// Creates `link` pointing at `target`.
    async fn symlink(&self, target: &str, link: &str) -> FsResult<()>;

    /// Returns the recorded target of `link`.
    async fn readlink(&self, link: &str) -> FsResult<String>;

    /// Changes ownership of the link itself.
    async fn lchown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()>;
}

/// Creates every missing directory along `path`.
///
/// An existing directory is fine; an existing non-directory anywhere along
/// the way fails with [`ErrorKind::NotADirectory`].
pub async fn mkdir_all<F>(fs: &F, path: &str, mode: FileMode) -> FsResult<()>
where
    F: FileSystem + ?Sized,
{
    let mut current = String::new();
    for component in path.split(SEPARATOR).filter(|c| !c.is_empty()) {
        current.push(SEPARATOR);
        current.push_str(component);

        match fs.stat(&current).await {
            Ok(info) if info.is_dir() => continue,
            Ok(_) => {
                return Err(FsError::new(ErrorKind::NotADirectory, current));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        if let Err(e) = fs.mkdir(&current, mode).await {
            // Lost a race with another creator.
            let created = e.is_exists()
                && fs
                    .stat(&current)
                    .await
                    .map(|info| info.is_dir())
                    .unwrap_or(false);
            if !created {
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Removes `path` recursively, depth first, children before parents.
pub async fn remove_all<F>(fs: &F, path: &str) -> FsResult<()>
where
    F: FileSystem + ?Sized,
{
    let info = match fs.lstat(path).await {
        Ok(info) => info,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    };

    if !info.is_dir() {
        return fs.remove(path).await;
    }
    remove_tree(fs, path.to_string()).await
}

fn remove_tree<'a, F>(fs: &'a F, dir: String) -> BoxFuture<'a, FsResult<()>>
where
    F: FileSystem + ?Sized,
{
    Box::pin(async move {
        for entry in fs.read_dir(&dir).await?.into_iter().map(DirEntry::from) {
            let child = join(&dir, entry.name());
            if entry.is_dir() {
                remove_tree(fs, child).await?;
            } else {
                fs.remove(&child).await?;
            }
        }
        fs.remove(&dir).await
    })
}

/// Reads from the cursor to end of file.
pub async fn read_to_end(file: &mut dyn File) -> FsResult<Vec<u8>> {
    let mut out = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut chunk).await?;
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&chunk[..n]);
    }
}

/// Writes all of `buf` at the cursor.
pub async fn write_all(file: &mut dyn File, mut buf: &[u8]) -> FsResult<()> {
    while !buf.is_empty() {
        let n = file.write(buf).await?;
        if n == 0 {
            return Err(FsError::new(ErrorKind::Other, "write returned zero bytes"));
        }
        buf = &buf[n..];
    }
    Ok(())
}

/// Returns true if `path` names the root directory.
pub fn is_root(path: &str) -> bool {
    !path.is_empty() && path.trim_matches(SEPARATOR).is_empty()
}

/// Resumable directory iteration over a listing captured once.
#[derive(Debug, Default)]
pub struct DirCursor {
    entries: Option<Vec<FileInfo>>,
    pos: usize,
}

impl DirCursor {
    /// Creates an empty, unloaded cursor.
    pub fn new() -> Self {
        Self::default()
    }

    /// True once a listing has been captured.
    pub fn is_loaded(&self) -> bool {
        self.entries.is_some()
    }

    /// Captures the listing. Later calls are ignored so the cursor never moves
    /// backwards.
    pub fn load(&mut self, entries: Vec<FileInfo>) {
        if self.entries.is_none() {
            self.entries = Some(entries);
            self.pos = 0;
        }
    }

    /// Current position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Takes the next batch. See [`File::read_dir`] for the contract.
    pub fn next_batch(&mut self, n: isize) -> FsResult<Vec<FileInfo>> {
        let entries = self.entries.as_deref().unwrap_or(&[]);
        let remaining = entries.len().saturating_sub(self.pos);

        if n <= 0 {
            let batch = entries[self.pos..].to_vec();
            self.pos = entries.len();
            return Ok(batch);
        }

        if remaining == 0 {
            return Err(FsError::eof());
        }

        let take = (n as usize).min(remaining);
        let batch = entries[self.pos..self.pos + take].to_vec();
        self.pos += take;
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> FileInfo {
        FileInfo::new(name, 0, FileMode::file(0o644), SystemTime::UNIX_EPOCH)
    }

    #[test]
    fn test_cursor_bounded_reads() {
        let mut cursor = DirCursor::new();
        cursor.load(vec![entry("a"), entry("b"), entry("c")]);

        let first = cursor.next_batch(2).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].name, "a");

        let second = cursor.next_batch(2).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].name, "c");

        let err = cursor.next_batch(2).unwrap_err();
        assert!(err.is_eof());
        assert_eq!(cursor.position(), 3);
    }

    #[test]
    fn test_cursor_unbounded_reads() {
        let mut cursor = DirCursor::new();
        cursor.load(vec![entry("a"), entry("b")]);

        assert_eq!(cursor.next_batch(1).unwrap().len(), 1);
        assert_eq!(cursor.next_batch(-1).unwrap().len(), 1);
        assert!(cursor.next_batch(0).unwrap().is_empty());
        assert!(cursor.next_batch(0).unwrap().is_empty());
    }

    #[test]
    fn test_cursor_load_once() {
        let mut cursor = DirCursor::new();
        assert!(!cursor.is_loaded());
        cursor.load(vec![entry("a")]);
        cursor.next_batch(1).unwrap();
        cursor.load(vec![entry("x"), entry("y")]);
        assert!(cursor.next_batch(1).unwrap_err().is_eof());
    }

    #[test]
    fn test_is_root() {
        assert!(is_root("/"));
        assert!(is_root("//"));
        assert!(!is_root("/tmp"));
    }
}
