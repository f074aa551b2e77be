//! Filesystem data types: open flags, modes, file info and paths.

use std::ops::{BitOr, BitOrAssign};
use std::time::SystemTime;

/// Path separator used on the wire.
pub const SEPARATOR: char = '/';

/// Path list separator.
pub const LIST_SEPARATOR: char = ':';

/// Open intent flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    /// Open for reading
    pub const READ: OpenFlags = OpenFlags(0x0000_0001);
    /// Open for writing
    pub const WRITE: OpenFlags = OpenFlags(0x0000_0002);
    /// Open for reading and writing
    pub const READ_WRITE: OpenFlags = OpenFlags(0x0000_0003);
    /// Sequential writes go to the end of the file
    pub const APPEND: OpenFlags = OpenFlags(0x0000_0004);
    /// Create the file if it does not exist
    pub const CREATE: OpenFlags = OpenFlags(0x0000_0008);
    /// Truncate to zero length
    pub const TRUNCATE: OpenFlags = OpenFlags(0x0000_0010);
    /// With `CREATE`, fail if the file exists
    pub const EXCLUSIVE: OpenFlags = OpenFlags(0x0000_0020);

    /// Returns true if every bit of `other` is set.
    pub fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if the handle may be read. A bare flag set with no access
    /// bits counts as read-only.
    pub fn readable(self) -> bool {
        self.contains(Self::READ) || self.0 & Self::READ_WRITE.0 == 0
    }

    /// Returns true if the handle may be written.
    pub fn writable(self) -> bool {
        self.contains(Self::WRITE) || self.contains(Self::APPEND)
    }
}

impl BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for OpenFlags {
    fn bitor_assign(&mut self, rhs: OpenFlags) {
        self.0 |= rhs.0;
    }
}

/// File type, derived from the mode's type bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Regular file
    Regular,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
    /// Special file
    Special,
    /// Unknown type
    Unknown,
}

/// Unix mode: type bits plus permission bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileMode(pub u32);

impl FileMode {
    /// Type mask
    pub const S_IFMT: u32 = 0o170000;
    /// Directory
    pub const S_IFDIR: u32 = 0o040000;
    /// Regular file
    pub const S_IFREG: u32 = 0o100000;
    /// Symbolic link
    pub const S_IFLNK: u32 = 0o120000;
    /// Permission mask (including setuid/setgid/sticky)
    pub const PERM_MASK: u32 = 0o7777;

    /// Default file permissions (0644 = rw-r--r--)
    pub const DEFAULT_FILE: u32 = 0o644;
    /// Default directory permissions (0755 = rwxr-xr-x)
    pub const DEFAULT_DIR: u32 = 0o755;

    /// Permission bits only.
    pub fn perm(self) -> u32 {
        self.0 & Self::PERM_MASK
    }

    /// Regular file with the given permissions.
    pub fn file(perm: u32) -> Self {
        FileMode(Self::S_IFREG | (perm & Self::PERM_MASK))
    }

    /// Directory with the given permissions.
    pub fn dir(perm: u32) -> Self {
        FileMode(Self::S_IFDIR | (perm & Self::PERM_MASK))
    }

    /// Symbolic link with the given permissions.
    pub fn symlink(perm: u32) -> Self {
        FileMode(Self::S_IFLNK | (perm & Self::PERM_MASK))
    }

    /// Replaces the permission bits, keeping the type bits.
    pub fn with_perm(self, perm: u32) -> Self {
        FileMode((self.0 & Self::S_IFMT) | (perm & Self::PERM_MASK))
    }

    /// Classifies the type bits.
    pub fn file_type(self) -> FileType {
        match self.0 & Self::S_IFMT {
            Self::S_IFDIR => FileType::Directory,
            Self::S_IFREG => FileType::Regular,
            Self::S_IFLNK => FileType::Symlink,
            0 => FileType::Unknown,
            _ => FileType::Special,
        }
    }

    /// True for directories.
    pub fn is_dir(self) -> bool {
        self.file_type() == FileType::Directory
    }

    /// True for symbolic links.
    pub fn is_symlink(self) -> bool {
        self.file_type() == FileType::Symlink
    }

    /// True for regular files.
    pub fn is_regular(self) -> bool {
        self.file_type() == FileType::Regular
    }
}

/// Ownership and access time, when the backing store knows them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSys {
    /// Owner user id
    pub uid: u32,
    /// Owner group id
    pub gid: u32,
    /// Last access time
    pub atime: SystemTime,
}

/// Metadata for one filesystem entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Base name
    pub name: String,
    /// Size in bytes (meaningless for directories)
    pub size: u64,
    /// Type and permission bits
    pub mode: FileMode,
    /// Last modification time
    pub mtime: SystemTime,
    /// Implementation-specific extras
    pub sys: Option<FileSys>,
}

impl Default for FileInfo {
    fn default() -> Self {
        Self {
            name: String::new(),
            size: 0,
            mode: FileMode::default(),
            mtime: SystemTime::UNIX_EPOCH,
            sys: None,
        }
    }
}

impl FileInfo {
    /// Creates info for `name` with the given size and mode.
    pub fn new(name: impl Into<String>, size: u64, mode: FileMode, mtime: SystemTime) -> Self {
        Self {
            name: name.into(),
            size,
            mode,
            mtime,
            sys: None,
        }
    }

    /// True for directories.
    pub fn is_dir(&self) -> bool {
        self.mode.is_dir()
    }

    /// True for symbolic links.
    pub fn is_symlink(&self) -> bool {
        self.mode.is_symlink()
    }
}

/// A directory entry produced by iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    info: FileInfo,
}

impl DirEntry {
    /// Entry name.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// True for directories.
    pub fn is_dir(&self) -> bool {
        self.info.is_dir()
    }

    /// Type bits of the entry.
    pub fn file_type(&self) -> FileType {
        self.info.mode.file_type()
    }

    /// Full metadata.
    pub fn info(&self) -> &FileInfo {
        &self.info
    }
}

impl From<FileInfo> for DirEntry {
    fn from(info: FileInfo) -> Self {
        Self { info }
    }
}

/// Last path component; `/` for the root.
pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches(SEPARATOR);
    if trimmed.is_empty() {
        return if path.is_empty() { "." } else { "/" };
    }
    match trimmed.rfind(SEPARATOR) {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Parent directory of `path`; `/` for top-level entries and the root.
pub fn parent(path: &str) -> &str {
    let trimmed = path.trim_end_matches(SEPARATOR);
    match trimmed.rfind(SEPARATOR) {
        Some(0) | None => "/",
        Some(idx) => &trimmed[..idx],
    }
}

/// Joins a directory and a child name with exactly one separator.
pub fn join(dir: &str, name: &str) -> String {
    if dir.ends_with(SEPARATOR) {
        format!("{}{}", dir, name)
    } else {
        format!("{}{}{}", dir, SEPARATOR, name)
    }
}

/// Lexically normalizes `path` to an absolute path: collapses repeated
/// separators and resolves `.` and `..` without touching any filesystem.
pub fn clean(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split(SEPARATOR) {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_flags() {
        let flags = OpenFlags::READ_WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE;
        assert!(flags.contains(OpenFlags::READ));
        assert!(flags.contains(OpenFlags::WRITE));
        assert!(flags.contains(OpenFlags::CREATE));
        assert!(!flags.contains(OpenFlags::EXCLUSIVE));
        assert!(flags.readable());
        assert!(flags.writable());

        assert!(OpenFlags::default().readable());
        assert!(!OpenFlags::default().writable());
        assert!(!OpenFlags::WRITE.readable());
    }

    #[test]
    fn test_file_mode() {
        let mode = FileMode::dir(0o755);
        assert!(mode.is_dir());
        assert_eq!(mode.perm(), 0o755);
        assert_eq!(mode.with_perm(0o700), FileMode::dir(0o700));

        assert!(FileMode::symlink(0o777).is_symlink());
        assert!(FileMode::file(0o644).is_regular());
        assert_eq!(FileMode(0o644).file_type(), FileType::Unknown);
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(base_name("/home/test/hello.txt"), "hello.txt");
        assert_eq!(base_name("/tmp/a/"), "a");
        assert_eq!(base_name("/"), "/");
        assert_eq!(base_name("file"), "file");

        assert_eq!(parent("/tmp/a/b"), "/tmp/a");
        assert_eq!(parent("/tmp"), "/");
        assert_eq!(parent("/"), "/");

        assert_eq!(join("/tmp", "x"), "/tmp/x");
        assert_eq!(join("/", "x"), "/x");

        assert_eq!(clean("//tmp/./a/../b/"), "/tmp/b");
        assert_eq!(clean("../.."), "/");
        assert_eq!(clean("rel/path"), "/rel/path");
    }

    #[test]
    fn test_dir_entry() {
        let info = FileInfo::new("sub", 0, FileMode::dir(0o755), SystemTime::UNIX_EPOCH);
        let entry = DirEntry::from(info);
        assert_eq!(entry.name(), "sub");
        assert!(entry.is_dir());
        assert_eq!(entry.file_type(), FileType::Directory);
    }
}
