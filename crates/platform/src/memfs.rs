//! In-memory filesystem.
//!
//! A flat map from cleaned absolute paths to shared nodes. Open handles keep
//! their node alive, so a file removed while open stays readable through the
//! handle, and two handles on the same path see each other's writes.

use crate::error::{ErrorKind, FsError, FsResult};
use crate::traits::{DirCursor, File, FileSystem, SymlinkFileSystem};
use crate::types::{base_name, clean, join, parent, FileInfo, FileMode, FileSys, OpenFlags};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::trace;

/// Symbolic link hops followed before giving up.
const MAX_LINK_HOPS: usize = 40;

/// Largest file a [`MemFs`] holds; writes and truncates beyond it fail.
pub const MAX_FILE_SIZE: u64 = 1 << 32;

/// Checks `len` against [`MAX_FILE_SIZE`].
fn file_len(len: u64) -> FsResult<usize> {
    if len > MAX_FILE_SIZE {
        return Err(FsError::invalid(format!("file size {} exceeds limit", len)));
    }
    usize::try_from(len).map_err(|_| FsError::invalid("size too large"))
}

#[derive(Debug)]
enum Kind {
    File(Vec<u8>),
    Dir,
    Symlink(String),
}

#[derive(Debug)]
struct Node {
    kind: Kind,
    perm: u32,
    uid: u32,
    gid: u32,
    atime: SystemTime,
    mtime: SystemTime,
}

impl Node {
    fn new(kind: Kind, perm: u32) -> Self {
        let now = SystemTime::now();
        Self {
            kind,
            perm: perm & FileMode::PERM_MASK,
            uid: 0,
            gid: 0,
            atime: now,
            mtime: now,
        }
    }

    fn is_dir(&self) -> bool {
        matches!(self.kind, Kind::Dir)
    }

    fn info(&self, name: &str) -> FileInfo {
        let (size, mode) = match &self.kind {
            Kind::File(data) => (data.len() as u64, FileMode::file(self.perm)),
            Kind::Dir => (0, FileMode::dir(self.perm)),
            Kind::Symlink(target) => (target.len() as u64, FileMode::symlink(self.perm)),
        };
        FileInfo {
            name: name.to_string(),
            size,
            mode,
            mtime: self.mtime,
            sys: Some(FileSys {
                uid: self.uid,
                gid: self.gid,
                atime: self.atime,
            }),
        }
    }

    fn resize(&mut self, size: u64) -> FsResult<()> {
        match &mut self.kind {
            Kind::File(data) => {
                data.resize(file_len(size)?, 0);
                self.mtime = SystemTime::now();
                Ok(())
            }
            Kind::Dir => Err(ErrorKind::IsADirectory.into()),
            Kind::Symlink(_) => Err(ErrorKind::InvalidInput.into()),
        }
    }
}

type NodeRef = Arc<RwLock<Node>>;
type Tree = BTreeMap<String, NodeRef>;

fn fail(kind: ErrorKind, op: &'static str, path: &str) -> FsError {
    FsError::from(kind).with_path(op, path)
}

/// Resolves symbolic links along `path`. The final component is followed only
/// when `follow` is set. Missing components end resolution early; callers see
/// the miss on lookup.
fn resolve(tree: &Tree, path: &str, follow: bool) -> FsResult<String> {
    let mut current = clean(path);

    'hops: for _ in 0..MAX_LINK_HOPS {
        let components: Vec<String> = current
            .split('/')
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        let mut prefix = String::new();

        for (i, component) in components.iter().enumerate() {
            prefix.push('/');
            prefix.push_str(component);

            let Some(node) = tree.get(&prefix) else {
                return Ok(current);
            };
            let node = node.read();
            let Kind::Symlink(target) = &node.kind else {
                continue;
            };

            let last = i + 1 == components.len();
            if last && !follow {
                return Ok(current);
            }

            let rest = components[i + 1..].join("/");
            let base = if target.starts_with('/') {
                target.clone()
            } else {
                join(parent(&prefix), target)
            };
            current = clean(&join(&base, &rest));
            continue 'hops;
        }
        return Ok(current);
    }

    Err(FsError::invalid("too many levels of symbolic links"))
}

fn lookup(tree: &Tree, op: &'static str, path: &str, follow: bool) -> FsResult<(String, NodeRef)> {
    let resolved = resolve(tree, path, follow).map_err(|e| e.with_path(op, path))?;
    match tree.get(&resolved) {
        Some(node) => Ok((resolved, Arc::clone(node))),
        None => Err(fail(ErrorKind::NotFound, op, path)),
    }
}

/// Resolves the parent of `path` (following links) and checks it is a
/// directory. Returns the resolved path of the child.
fn child_path(tree: &Tree, op: &'static str, path: &str) -> FsResult<String> {
    let cleaned = clean(path);
    if cleaned == "/" {
        return Err(fail(ErrorKind::AlreadyExists, op, path));
    }
    let dir = resolve(tree, parent(&cleaned), true).map_err(|e| e.with_path(op, path))?;
    match tree.get(&dir) {
        Some(node) if node.read().is_dir() => Ok(join(&dir, base_name(&cleaned))),
        Some(_) => Err(fail(ErrorKind::NotADirectory, op, path)),
        None => Err(fail(ErrorKind::NotFound, op, path)),
    }
}

fn children<'a>(tree: &'a Tree, dir: &'a str) -> impl Iterator<Item = (&'a str, &'a NodeRef)> + 'a {
    let prefix = if dir == "/" {
        "/".to_string()
    } else {
        format!("{}/", dir)
    };
    let start = prefix.clone();
    tree.range(start..)
        .take_while(move |(key, _)| key.starts_with(&prefix))
        .filter_map(move |(key, node)| {
            let name = &key[key.rfind('/').map(|i| i + 1).unwrap_or(0)..];
            let direct = parent(key) == dir && !name.is_empty();
            direct.then_some((name, node))
        })
}

fn list(tree: &Tree, dir: &str) -> Vec<FileInfo> {
    children(tree, dir)
        .map(|(name, node)| node.read().info(name))
        .collect()
}

/// In-memory filesystem with symbolic link support.
///
/// Cloning is cheap and yields a handle onto the same tree.
#[derive(Debug, Clone)]
pub struct MemFs {
    tree: Arc<RwLock<Tree>>,
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFs {
    /// Creates an empty filesystem containing only `/`.
    pub fn new() -> Self {
        let mut tree = Tree::new();
        tree.insert(
            "/".to_string(),
            Arc::new(RwLock::new(Node::new(Kind::Dir, FileMode::DEFAULT_DIR))),
        );
        Self {
            tree: Arc::new(RwLock::new(tree)),
        }
    }

    fn with_node<T>(
        &self,
        op: &'static str,
        path: &str,
        follow: bool,
        f: impl FnOnce(&mut Node) -> FsResult<T>,
    ) -> FsResult<T> {
        let tree = self.tree.read();
        let (_, node) = lookup(&tree, op, path, follow)?;
        let mut node = node.write();
        f(&mut node).map_err(|e| e.with_path(op, path))
    }
}

#[async_trait]
impl FileSystem for MemFs {
    async fn open_file(
        &self,
        path: &str,
        flags: OpenFlags,
        mode: FileMode,
    ) -> FsResult<Box<dyn File>> {
        const OP: &str = "open";
        let mut tree = self.tree.write();
        let resolved = resolve(&tree, path, true).map_err(|e| e.with_path(OP, path))?;

        let node = match tree.get(&resolved) {
            Some(node) => {
                if flags.contains(OpenFlags::CREATE | OpenFlags::EXCLUSIVE) {
                    return Err(fail(ErrorKind::AlreadyExists, OP, path));
                }
                let mut guard = node.write();
                if guard.is_dir() && flags.writable() {
                    return Err(fail(ErrorKind::IsADirectory, OP, path));
                }
                if flags.contains(OpenFlags::TRUNCATE) && flags.writable() {
                    guard.resize(0).map_err(|e| e.with_path(OP, path))?;
                }
                drop(guard);
                Arc::clone(node)
            }
            None => {
                if !flags.contains(OpenFlags::CREATE) {
                    return Err(fail(ErrorKind::NotFound, OP, path));
                }
                let child = child_path(&tree, OP, &resolved)?;
                let node = Arc::new(RwLock::new(Node::new(Kind::File(Vec::new()), mode.perm())));
                tree.insert(child, Arc::clone(&node));
                trace!(path, "memfs: created file");
                node
            }
        };

        let pos = match &node.read().kind {
            Kind::File(data) if flags.contains(OpenFlags::APPEND) => data.len() as u64,
            _ => 0,
        };

        Ok(Box::new(MemFile {
            name: path.to_string(),
            resolved,
            node,
            flags,
            pos,
            cursor: DirCursor::new(),
            tree: Arc::clone(&self.tree),
            closed: false,
        }))
    }

    async fn mkdir(&self, path: &str, mode: FileMode) -> FsResult<()> {
        let mut tree = self.tree.write();
        let resolved = resolve(&tree, path, false).map_err(|e| e.with_path("mkdir", path))?;
        if tree.contains_key(&resolved) {
            return Err(fail(ErrorKind::AlreadyExists, "mkdir", path));
        }
        let child = child_path(&tree, "mkdir", &resolved)?;
        tree.insert(child, Arc::new(RwLock::new(Node::new(Kind::Dir, mode.perm()))));
        Ok(())
    }

    async fn remove(&self, path: &str) -> FsResult<()> {
        let mut tree = self.tree.write();
        let (resolved, node) = lookup(&tree, "remove", path, false)?;
        if resolved == "/" {
            return Err(fail(ErrorKind::PermissionDenied, "remove", path));
        }
        if node.read().is_dir() && children(&tree, &resolved).next().is_some() {
            return Err(fail(ErrorKind::NotEmpty, "remove", path));
        }
        tree.remove(&resolved);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        let mut tree = self.tree.write();
        let err = |kind: ErrorKind| FsError::from(kind).with_paths("rename", from, to);

        let src = resolve(&tree, from, false).map_err(|e| e.with_paths("rename", from, to))?;
        let Some(src_node) = tree.get(&src).cloned() else {
            return Err(err(ErrorKind::NotFound));
        };
        let dst = resolve(&tree, to, false).map_err(|e| e.with_paths("rename", from, to))?;
        if src == dst {
            return Ok(());
        }
        if src == "/" || dst.starts_with(&format!("{}/", src)) {
            return Err(err(ErrorKind::InvalidInput));
        }
        let dst = child_path(&tree, "rename", &dst).map_err(|e| e.with_paths("rename", from, to))?;

        let src_is_dir = src_node.read().is_dir();
        if let Some(existing) = tree.get(&dst) {
            let dst_is_dir = existing.read().is_dir();
            match (src_is_dir, dst_is_dir) {
                (false, true) => return Err(err(ErrorKind::IsADirectory)),
                (true, false) => return Err(err(ErrorKind::NotADirectory)),
                (true, true) if children(&tree, &dst).next().is_some() => {
                    return Err(err(ErrorKind::NotEmpty))
                }
                _ => {}
            }
        }

        let prefix = format!("{}/", src);
        let moved: Vec<String> = tree
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| key.clone())
            .collect();

        tree.remove(&src);
        tree.insert(dst.clone(), src_node);
        for key in moved {
            if let Some(node) = tree.remove(&key) {
                tree.insert(format!("{}{}", dst, &key[src.len()..]), node);
            }
        }
        Ok(())
    }

    async fn stat(&self, path: &str) -> FsResult<FileInfo> {
        let tree = self.tree.read();
        let (_, node) = lookup(&tree, "stat", path, true)?;
        let info = node.read().info(base_name(path));
        Ok(info)
    }

    async fn lstat(&self, path: &str) -> FsResult<FileInfo> {
        let tree = self.tree.read();
        let (_, node) = lookup(&tree, "lstat", path, false)?;
        let info = node.read().info(base_name(path));
        Ok(info)
    }

    async fn chmod(&self, path: &str, mode: FileMode) -> FsResult<()> {
        self.with_node("chmod", path, true, |node| {
            node.perm = mode.perm();
            Ok(())
        })
    }

    async fn chtimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> FsResult<()> {
        self.with_node("chtimes", path, true, |node| {
            node.atime = atime;
            node.mtime = mtime;
            Ok(())
        })
    }

    async fn chown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        self.with_node("chown", path, true, |node| {
            node.uid = uid;
            node.gid = gid;
            Ok(())
        })
    }

    async fn truncate(&self, path: &str, size: u64) -> FsResult<()> {
        self.with_node("truncate", path, true, |node| node.resize(size))
    }

    async fn read_dir(&self, path: &str) -> FsResult<Vec<FileInfo>> {
        let tree = self.tree.read();
        let (resolved, node) = lookup(&tree, "readdir", path, true)?;
        if !node.read().is_dir() {
            return Err(fail(ErrorKind::NotADirectory, "readdir", path));
        }
        Ok(list(&tree, &resolved))
    }

    fn symlinks(&self) -> Option<&dyn SymlinkFileSystem> {
        Some(self)
    }
}

#[async_trait]
impl SymlinkFileSystem for MemFs {
    async fn symlink(&self, target: &str, link: &str) -> FsResult<()> {
        let mut tree = self.tree.write();
        let resolved =
            resolve(&tree, link, false).map_err(|e| e.with_paths("symlink", target, link))?;
        if tree.contains_key(&resolved) {
            return Err(FsError::from(ErrorKind::AlreadyExists).with_paths("symlink", target, link));
        }
        let child = child_path(&tree, "symlink", &resolved)
            .map_err(|e| e.with_paths("symlink", target, link))?;
        tree.insert(
            child,
            Arc::new(RwLock::new(Node::new(Kind::Symlink(target.to_string()), 0o777))),
        );
        Ok(())
    }

    async fn readlink(&self, link: &str) -> FsResult<String> {
        let tree = self.tree.read();
        let (_, node) = lookup(&tree, "readlink", link, false)?;
        let node = node.read();
        match &node.kind {
            Kind::Symlink(target) => Ok(target.clone()),
            _ => Err(FsError::invalid("not a symbolic link").with_path("readlink", link)),
        }
    }

    async fn lchown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        self.with_node("lchown", path, false, |node| {
            node.uid = uid;
            node.gid = gid;
            Ok(())
        })
    }
}

/// Handle onto a [`MemFs`] node.
#[derive(Debug)]
struct MemFile {
    name: String,
    resolved: String,
    node: NodeRef,
    flags: OpenFlags,
    pos: u64,
    cursor: DirCursor,
    tree: Arc<RwLock<Tree>>,
    closed: bool,
}

impl MemFile {
    fn check_open(&self, op: &'static str) -> FsResult<()> {
        if self.closed {
            return Err(FsError::invalid("file already closed").with_path(op, &self.name));
        }
        Ok(())
    }

    fn read_from(&self, op: &'static str, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        self.check_open(op)?;
        if !self.flags.readable() {
            return Err(fail(ErrorKind::PermissionDenied, op, &self.name));
        }
        let node = self.node.read();
        let data = match &node.kind {
            Kind::File(data) => data,
            Kind::Dir => return Err(fail(ErrorKind::IsADirectory, op, &self.name)),
            Kind::Symlink(_) => return Err(fail(ErrorKind::InvalidInput, op, &self.name)),
        };
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write_to(&self, op: &'static str, buf: &[u8], offset: Option<u64>) -> FsResult<(usize, u64)> {
        self.check_open(op)?;
        if !self.flags.writable() {
            return Err(fail(ErrorKind::PermissionDenied, op, &self.name));
        }
        let mut node = self.node.write();
        let data = match &mut node.kind {
            Kind::File(data) => data,
            Kind::Dir => return Err(fail(ErrorKind::IsADirectory, op, &self.name)),
            Kind::Symlink(_) => return Err(fail(ErrorKind::InvalidInput, op, &self.name)),
        };
        let offset = match offset {
            Some(offset) => offset,
            None if self.flags.contains(OpenFlags::APPEND) => data.len() as u64,
            None => self.pos,
        };
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| FsError::invalid("offset overflow").with_path(op, &self.name))?;
        let end = file_len(end).map_err(|e| e.with_path(op, &self.name))?;
        let start = end - buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        node.mtime = SystemTime::now();
        Ok((buf.len(), end as u64))
    }
}

#[async_trait]
impl File for MemFile {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        let n = self.read_from("read", buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }

    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        self.read_from("readat", buf, offset)
    }

    async fn write(&mut self, buf: &[u8]) -> FsResult<usize> {
        let (n, end) = self.write_to("write", buf, None)?;
        self.pos = end;
        Ok(n)
    }

    async fn write_at(&mut self, buf: &[u8], offset: u64) -> FsResult<usize> {
        let (n, _) = self.write_to("writeat", buf, Some(offset))?;
        Ok(n)
    }

    async fn seek(&mut self, pos: SeekFrom) -> FsResult<u64> {
        self.check_open("seek")?;
        let len = match &self.node.read().kind {
            Kind::File(data) => data.len() as i128,
            _ => 0,
        };
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => self.pos as i128 + delta as i128,
            SeekFrom::End(delta) => len + delta as i128,
        };
        if target < 0 {
            return Err(FsError::invalid("negative position").with_path("seek", &self.name));
        }
        self.pos = u64::try_from(target).map_err(|_| FsError::invalid("position overflow"))?;
        Ok(self.pos)
    }

    async fn close(&mut self) -> FsResult<()> {
        self.closed = true;
        Ok(())
    }

    async fn stat(&mut self) -> FsResult<FileInfo> {
        self.check_open("stat")?;
        Ok(self.node.read().info(base_name(&self.name)))
    }

    async fn sync(&mut self) -> FsResult<()> {
        self.check_open("sync")
    }

    async fn truncate(&mut self, size: u64) -> FsResult<()> {
        self.check_open("truncate")?;
        if !self.flags.writable() {
            return Err(fail(ErrorKind::PermissionDenied, "truncate", &self.name));
        }
        self.node
            .write()
            .resize(size)
            .map_err(|e| e.with_path("truncate", &self.name))
    }

    async fn read_dir(&mut self, n: isize) -> FsResult<Vec<FileInfo>> {
        self.check_open("readdir")?;
        if !self.node.read().is_dir() {
            return Err(fail(ErrorKind::NotADirectory, "readdir", &self.name));
        }
        if !self.cursor.is_loaded() {
            let entries = list(&self.tree.read(), &self.resolved);
            self.cursor.load(entries);
        }
        self.cursor.next_batch(n)
    }
}
