//! Conversions between the filesystem model and SFTP v3 wire types.

use russh_sftp::client::error::Error as ClientError;
use russh_sftp::protocol::{FileAttributes, OpenFlags as PFlags, StatusCode};
use sftpfs_platform::{ErrorKind, FileInfo, FileMode, FileSys, FsError, OpenFlags};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Human-readable text for a status code (SSH_FX_*).
pub fn status_message(code: &StatusCode) -> &'static str {
    match code {
        StatusCode::Ok => "Success",
        StatusCode::Eof => "End of file",
        StatusCode::NoSuchFile => "No such file or directory",
        StatusCode::PermissionDenied => "Permission denied",
        StatusCode::Failure => "Failure",
        StatusCode::BadMessage => "Bad message",
        StatusCode::NoConnection => "No connection",
        StatusCode::ConnectionLost => "Connection lost",
        StatusCode::OpUnsupported => "Operation not supported",
    }
}

/// Classifies a status code received from a server.
pub fn kind_for_status(code: &StatusCode) -> ErrorKind {
    match code {
        StatusCode::NoSuchFile => ErrorKind::NotFound,
        StatusCode::PermissionDenied => ErrorKind::PermissionDenied,
        StatusCode::OpUnsupported => ErrorKind::Unsupported,
        StatusCode::Eof => ErrorKind::Eof,
        StatusCode::NoConnection | StatusCode::ConnectionLost => ErrorKind::TransportClosed,
        StatusCode::BadMessage => ErrorKind::InvalidInput,
        StatusCode::Ok | StatusCode::Failure => ErrorKind::Other,
    }
}

/// Status code reported to a client for a failed operation.
///
/// SFTP v3 has no codes for exists/not-empty/not-a-directory, so those
/// collapse into `Failure`.
pub fn status_for_error(err: &FsError) -> StatusCode {
    match err.kind() {
        ErrorKind::NotFound => StatusCode::NoSuchFile,
        ErrorKind::PermissionDenied | ErrorKind::AuthenticationFailed => {
            StatusCode::PermissionDenied
        }
        ErrorKind::Unsupported => StatusCode::OpUnsupported,
        ErrorKind::Eof => StatusCode::Eof,
        _ => StatusCode::Failure,
    }
}

/// Converts an SFTP client library error into a classified error.
pub fn sftp_error(err: ClientError) -> FsError {
    match err {
        ClientError::Status(status) => {
            let kind = kind_for_status(&status.status_code);
            FsError::new(kind, status.error_message)
        }
        ClientError::IO(msg) => FsError::new(ErrorKind::TransportClosed, msg),
        ClientError::Timeout => FsError::new(ErrorKind::TimedOut, "sftp request timed out"),
        ClientError::Limited(msg) => FsError::new(ErrorKind::Other, msg),
        ClientError::UnexpectedPacket => FsError::new(ErrorKind::Other, "unexpected sftp packet"),
        ClientError::UnexpectedBehavior(msg) => FsError::new(ErrorKind::Other, msg),
    }
}

/// Wire open flags to filesystem open flags.
pub fn open_flags_from_pflags(pflags: PFlags) -> OpenFlags {
    let mut flags = OpenFlags::default();
    if pflags.contains(PFlags::READ) {
        flags |= OpenFlags::READ;
    }
    if pflags.contains(PFlags::WRITE) {
        flags |= OpenFlags::WRITE;
    }
    if pflags.contains(PFlags::APPEND) {
        flags |= OpenFlags::APPEND;
    }
    if pflags.contains(PFlags::CREATE) {
        flags |= OpenFlags::CREATE;
    }
    if pflags.contains(PFlags::TRUNCATE) {
        flags |= OpenFlags::TRUNCATE;
    }
    if pflags.contains(PFlags::EXCLUDE) {
        flags |= OpenFlags::EXCLUSIVE;
    }
    flags
}

/// Filesystem open flags to wire open flags.
pub fn pflags_from_open_flags(flags: OpenFlags) -> PFlags {
    let mut pflags = PFlags::empty();
    if flags.readable() {
        pflags |= PFlags::READ;
    }
    if flags.contains(OpenFlags::WRITE) {
        pflags |= PFlags::WRITE;
    }
    if flags.contains(OpenFlags::APPEND) {
        pflags |= PFlags::WRITE | PFlags::APPEND;
    }
    if flags.contains(OpenFlags::CREATE) {
        pflags |= PFlags::CREATE;
    }
    if flags.contains(OpenFlags::TRUNCATE) {
        pflags |= PFlags::TRUNCATE;
    }
    if flags.contains(OpenFlags::EXCLUSIVE) {
        pflags |= PFlags::EXCLUDE;
    }
    pflags
}

/// Seconds since the epoch, clamped into the v3 32-bit field.
pub fn unix_secs(time: SystemTime) -> u32 {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    u32::try_from(secs).unwrap_or(u32::MAX)
}

/// Inverse of [`unix_secs`].
pub fn from_unix_secs(secs: u32) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(u64::from(secs))
}

/// Builds file info for `name` from wire attributes.
pub fn info_from_attrs(name: &str, attrs: &FileAttributes) -> FileInfo {
    let mtime = attrs.mtime.map(from_unix_secs).unwrap_or(UNIX_EPOCH);
    let sys = match (attrs.uid, attrs.gid) {
        (None, None) => None,
        (uid, gid) => Some(FileSys {
            uid: uid.unwrap_or(0),
            gid: gid.unwrap_or(0),
            atime: attrs.atime.map(from_unix_secs).unwrap_or(mtime),
        }),
    };
    FileInfo {
        name: name.to_string(),
        size: attrs.size.unwrap_or(0),
        mode: FileMode(attrs.permissions.unwrap_or(0)),
        mtime,
        sys,
    }
}

/// Wire attributes describing `info`.
pub fn attrs_from_info(info: &FileInfo) -> FileAttributes {
    let mut attrs = FileAttributes::empty();
    attrs.size = Some(info.size);
    attrs.permissions = Some(info.mode.0);
    attrs.mtime = Some(unix_secs(info.mtime));
    attrs.atime = Some(unix_secs(info.mtime));
    if let Some(sys) = &info.sys {
        attrs.uid = Some(sys.uid);
        attrs.gid = Some(sys.gid);
        attrs.atime = Some(unix_secs(sys.atime));
    }
    attrs
}

/// `ls -l` style line for a directory entry.
pub fn long_name(info: &FileInfo) -> String {
    const RWX: [(u32, char); 9] = [
        (0o400, 'r'),
        (0o200, 'w'),
        (0o100, 'x'),
        (0o040, 'r'),
        (0o020, 'w'),
        (0o010, 'x'),
        (0o004, 'r'),
        (0o002, 'w'),
        (0o001, 'x'),
    ];
    let kind = if info.is_dir() {
        'd'
    } else if info.is_symlink() {
        'l'
    } else {
        '-'
    };
    let perm: String = RWX
        .iter()
        .map(|(bit, c)| if info.mode.0 & bit != 0 { *c } else { '-' })
        .collect();
    let (uid, gid) = info.sys.map(|s| (s.uid, s.gid)).unwrap_or((0, 0));
    format!(
        "{}{} 1 {:<8} {:<8} {:>8} {} {}",
        kind,
        perm,
        uid,
        gid,
        info.size,
        unix_secs(info.mtime),
        info.name
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(kind_for_status(&StatusCode::NoSuchFile), ErrorKind::NotFound);
        assert_eq!(
            kind_for_status(&StatusCode::ConnectionLost),
            ErrorKind::TransportClosed
        );

        let err = FsError::not_found("x").with_path("Stat", "/x");
        assert!(matches!(status_for_error(&err), StatusCode::NoSuchFile));
        let err = FsError::exists("x");
        assert!(matches!(status_for_error(&err), StatusCode::Failure));
        let err = FsError::unsupported("symlink");
        assert!(matches!(status_for_error(&err), StatusCode::OpUnsupported));
        assert_eq!(status_message(&StatusCode::Eof), "End of file");
    }

    #[test]
    fn test_flag_translation() {
        let pflags = PFlags::READ | PFlags::WRITE | PFlags::CREATE | PFlags::TRUNCATE;
        let flags = open_flags_from_pflags(pflags);
        assert!(flags.contains(OpenFlags::READ_WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE));
        assert!(!flags.contains(OpenFlags::APPEND));

        let back = pflags_from_open_flags(OpenFlags::WRITE | OpenFlags::APPEND);
        assert!(back.contains(PFlags::WRITE | PFlags::APPEND));
        assert!(!back.contains(PFlags::READ));

        assert!(pflags_from_open_flags(OpenFlags::default()).contains(PFlags::READ));
    }

    #[test]
    fn test_attrs_round_trip() {
        let mtime = from_unix_secs(1_700_000_000);
        let mut info = FileInfo::new("f.txt", 42, FileMode::file(0o640), mtime);
        info.sys = Some(FileSys {
            uid: 1000,
            gid: 100,
            atime: from_unix_secs(1_600_000_000),
        });

        let attrs = attrs_from_info(&info);
        assert_eq!(attrs.size, Some(42));
        assert_eq!(attrs.atime, Some(1_600_000_000));

        let back = info_from_attrs("f.txt", &attrs);
        assert_eq!(back, info);
    }

    #[test]
    fn test_long_name() {
        let info = FileInfo::new("sub", 0, FileMode::dir(0o755), UNIX_EPOCH);
        assert!(long_name(&info).starts_with("drwxr-xr-x 1"));
        assert!(long_name(&info).ends_with(" sub"));
    }
}
