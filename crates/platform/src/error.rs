//! Error types for sftpfs.
//!
//! Errors are classified by [`ErrorKind`]. Wrapping variants add the failing
//! operation and path(s) without hiding the classification, so
//! [`FsError::is_not_found`] and friends keep working through any number of
//! context layers.

use std::fmt;

/// Classification of a filesystem or transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The path does not exist
    NotFound,
    /// The path already exists
    AlreadyExists,
    /// The caller lacks permission
    PermissionDenied,
    /// A path component is not a directory
    NotADirectory,
    /// The operation needs a file but got a directory
    IsADirectory,
    /// The directory still has entries
    NotEmpty,
    /// An argument was rejected (negative seek, bad size, not a symlink...)
    InvalidInput,
    /// The backing implementation does not offer this capability
    Unsupported,
    /// Credentials were rejected
    AuthenticationFailed,
    /// The SSH or SFTP channel went away mid-operation
    TransportClosed,
    /// Connecting did not finish in time
    TimedOut,
    /// No more data or directory entries
    Eof,
    /// Anything else
    Other,
}

impl ErrorKind {
    /// Short human-readable description.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "no such file or directory",
            ErrorKind::AlreadyExists => "file already exists",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::NotADirectory => "not a directory",
            ErrorKind::IsADirectory => "is a directory",
            ErrorKind::NotEmpty => "directory not empty",
            ErrorKind::InvalidInput => "invalid argument",
            ErrorKind::Unsupported => "operation not supported",
            ErrorKind::AuthenticationFailed => "authentication failed",
            ErrorKind::TransportClosed => "connection closed",
            ErrorKind::TimedOut => "timed out",
            ErrorKind::Eof => "end of file",
            ErrorKind::Other => "failure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<std::io::ErrorKind> for ErrorKind {
    fn from(kind: std::io::ErrorKind) -> Self {
        use std::io::ErrorKind as Io;
        match kind {
            Io::NotFound => ErrorKind::NotFound,
            Io::AlreadyExists => ErrorKind::AlreadyExists,
            Io::PermissionDenied => ErrorKind::PermissionDenied,
            Io::NotADirectory => ErrorKind::NotADirectory,
            Io::IsADirectory => ErrorKind::IsADirectory,
            Io::DirectoryNotEmpty => ErrorKind::NotEmpty,
            Io::InvalidInput | Io::InvalidData => ErrorKind::InvalidInput,
            Io::Unsupported => ErrorKind::Unsupported,
            Io::UnexpectedEof => ErrorKind::Eof,
            Io::TimedOut => ErrorKind::TimedOut,
            Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::NotConnected
            | Io::BrokenPipe => ErrorKind::TransportClosed,
            _ => ErrorKind::Other,
        }
    }
}

/// Unified error type for all sftpfs operations
#[derive(Debug)]
pub enum FsError {
    /// A classified failure with a message
    Kind(ErrorKind, String),

    /// I/O error
    Io(std::io::Error),

    /// Failure of a single-path operation
    Path {
        /// Operation name
        op: &'static str,
        /// Offending path
        path: String,
        /// Underlying error
        source: Box<FsError>,
    },

    /// Failure of a two-path operation (rename, symlink)
    Paths {
        /// Operation name
        op: &'static str,
        /// Source path
        from: String,
        /// Destination path
        to: String,
        /// Underlying error
        source: Box<FsError>,
    },

    /// The connection driver gave up
    Connect {
        /// Number of attempts made
        attempts: u32,
        /// Error from the last attempt
        source: Box<FsError>,
    },

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl FsError {
    /// Creates a classified error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        FsError::Kind(kind, message.into())
    }

    /// Not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Already-exists error.
    pub fn exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, message)
    }

    /// Invalid-argument error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    /// Unsupported-operation error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, message)
    }

    /// End-of-file marker.
    pub fn eof() -> Self {
        Self::new(ErrorKind::Eof, ErrorKind::Eof.as_str())
    }

    /// Wraps `self` with a single-path operation context.
    pub fn with_path(self, op: &'static str, path: impl Into<String>) -> Self {
        FsError::Path {
            op,
            path: path.into(),
            source: Box::new(self),
        }
    }

    /// Wraps `self` with a two-path operation context.
    pub fn with_paths(
        self,
        op: &'static str,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        FsError::Paths {
            op,
            from: from.into(),
            to: to.into(),
            source: Box::new(self),
        }
    }

    /// Classification of the innermost cause.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FsError::Kind(kind, _) => *kind,
            FsError::Io(e) => e.kind().into(),
            FsError::Path { source, .. }
            | FsError::Paths { source, .. }
            | FsError::Connect { source, .. } => source.kind(),
            FsError::Other(_) => ErrorKind::Other,
        }
    }

    /// True when the innermost cause is a missing path.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// True when the innermost cause is an existing path.
    pub fn is_exists(&self) -> bool {
        self.kind() == ErrorKind::AlreadyExists
    }

    /// True when the innermost cause is an end-of-file signal.
    pub fn is_eof(&self) -> bool {
        self.kind() == ErrorKind::Eof
    }

    /// True when the innermost cause is a missing capability.
    pub fn is_unsupported(&self) -> bool {
        self.kind() == ErrorKind::Unsupported
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::Kind(kind, msg) if msg.is_empty() || msg == kind.as_str() => {
                write!(f, "{}", kind)
            }
            FsError::Kind(kind, msg) => write!(f, "{}: {}", kind, msg),
            FsError::Io(e) => write!(f, "IO error: {}", e),
            FsError::Path { op, path, source } => write!(f, "sftpfs.{}({}): {}", op, path, source),
            FsError::Paths {
                op,
                from,
                to,
                source,
            } => write!(f, "sftpfs.{}({} -> {}): {}", op, from, to, source),
            FsError::Connect { attempts, source } => write!(
                f,
                "sftpfs: failed to connect after {} attempts: {}",
                attempts, source
            ),
            FsError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for FsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FsError::Io(e) => Some(e),
            FsError::Path { source, .. }
            | FsError::Paths { source, .. }
            | FsError::Connect { source, .. } => Some(source.as_ref()),
            FsError::Other(e) => Some(e.as_ref()),
            FsError::Kind(..) => None,
        }
    }
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        FsError::Io(err)
    }
}

impl From<ErrorKind> for FsError {
    fn from(kind: ErrorKind) -> Self {
        FsError::Kind(kind, String::new())
    }
}

/// Result type for sftpfs operations
pub type FsResult<T> = Result<T, FsError>;

/// Adds `(op, path)` context to the error side of a result.
pub trait ResultExt<T> {
    /// Wraps any error with a single-path context.
    fn with_path(self, op: &'static str, path: &str) -> FsResult<T>;

    /// Wraps any error with a two-path context.
    fn with_paths(self, op: &'static str, from: &str, to: &str) -> FsResult<T>;
}

impl<T> ResultExt<T> for FsResult<T> {
    fn with_path(self, op: &'static str, path: &str) -> FsResult<T> {
        self.map_err(|e| e.with_path(op, path))
    }

    fn with_paths(self, op: &'static str, from: &str, to: &str) -> FsResult<T> {
        self.map_err(|e| e.with_paths(op, from, to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FsError::not_found("missing").with_path("Stat", "/tmp/x");
        assert_eq!(
            err.to_string(),
            "sftpfs.Stat(/tmp/x): no such file or directory: missing"
        );

        let err = FsError::from(ErrorKind::AlreadyExists).with_paths("Rename", "/a", "/b");
        assert_eq!(err.to_string(), "sftpfs.Rename(/a -> /b): file already exists");
    }

    #[test]
    fn test_classification_through_wrapping() {
        let err = FsError::not_found("x")
            .with_path("OpenFile", "/x")
            .with_path("RemoveAll", "/");
        assert!(err.is_not_found());
        assert!(!err.is_exists());

        let err = FsError::Connect {
            attempts: 4,
            source: Box::new(FsError::new(ErrorKind::AuthenticationFailed, "denied")),
        };
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
        assert!(err.to_string().contains("after 4 attempts"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: FsError = io_err.into();
        assert!(matches!(err, FsError::Io(_)));
        assert!(err.is_not_found());

        let io_err = std::io::Error::from(std::io::ErrorKind::BrokenPipe);
        assert_eq!(FsError::from(io_err).kind(), ErrorKind::TransportClosed);
    }

    #[test]
    fn test_source_chain() {
        use std::error::Error;

        let err = FsError::exists("dup").with_path("Mkdir", "/d");
        let source = err.source().map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("file already exists: dup"));
    }
}
