//! Bridges russh-sftp's per-packet server callbacks onto [`Handlers`].

use super::handlers::{
    Handlers, ListerAt, Method, OpenHandle, ReaderAt, Request, RequestAttrs, WriterAt,
};
use super::types::{
    attrs_from_info, long_name, open_flags_from_pflags, status_for_error, status_message,
};
use russh_sftp::protocol::{
    Attrs, Data, File as NameEntry, FileAttributes, Handle, Name, OpenFlags as PFlags, Status,
    StatusCode, Version,
};
use sftpfs_platform::{clean, FileInfo, FsError, FsResult};
use std::collections::HashMap;
use tracing::{debug, trace};

/// Largest read served in one packet.
const MAX_READ_LEN: u32 = 256 * 1024;

/// Entries returned per `readdir` packet.
const READDIR_BATCH: usize = 128;

enum Slot {
    Read(Box<dyn ReaderAt>),
    Write(Box<dyn WriterAt>),
    Dir {
        path: String,
        lister: Box<dyn ListerAt>,
        offset: u64,
    },
}

/// One SFTP session's request server.
///
/// Keeps the session's handle table and turns each packet into a
/// [`Request`] for the matching role.
pub struct RequestServer {
    handlers: Handlers,
    handles: HashMap<String, (String, Slot)>,
    next_handle: u64,
}

impl RequestServer {
    /// A server with an empty handle table.
    pub fn new(handlers: Handlers) -> Self {
        Self {
            handlers,
            handles: HashMap::new(),
            next_handle: 0,
        }
    }

    /// Number of open handles.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    fn insert(&mut self, path: String, slot: Slot) -> String {
        self.next_handle += 1;
        let handle = format!("h{}", self.next_handle);
        self.handles.insert(handle.clone(), (path, slot));
        handle
    }

    fn slot(&mut self, handle: &str) -> Result<&mut (String, Slot), StatusCode> {
        self.handles.get_mut(handle).ok_or_else(|| {
            debug!(handle, "unknown handle");
            StatusCode::Failure
        })
    }

    async fn stat_one(&self, method: Method, path: &str) -> Result<FileInfo, StatusCode> {
        let lister = self
            .handlers
            .file_list
            .file_list(&Request::new(method, path))
            .await
            .map_err(status)?;
        let mut buf = vec![FileInfo::default()];
        let got = lister.list_at(&mut buf, 0).map_err(status)?;
        if got.count == 0 {
            return Err(StatusCode::NoSuchFile);
        }
        Ok(buf.swap_remove(0))
    }

    async fn command(&self, req: Request) -> Result<(), StatusCode> {
        self.handlers.file_cmd.file_cmd(&req).await.map_err(status)
    }
}

fn ok(id: u32) -> Status {
    Status {
        id,
        error_message: status_message(&StatusCode::Ok).to_string(),
        status_code: StatusCode::Ok,
        language_tag: "en-US".to_string(),
    }
}

fn status(err: FsError) -> StatusCode {
    let code = status_for_error(&err);
    debug!(code = status_message(&code), "request failed: {}", err);
    code
}

fn request_attrs(attrs: &FileAttributes) -> RequestAttrs {
    RequestAttrs {
        size: attrs.size,
        uid: attrs.uid,
        gid: attrs.gid,
        permissions: attrs.permissions,
        atime: attrs.atime,
        mtime: attrs.mtime,
    }
}

fn name_entry(info: &FileInfo) -> NameEntry {
    NameEntry {
        filename: info.name.clone(),
        longname: long_name(info),
        attrs: attrs_from_info(info),
    }
}

/// Absolute, lexically normalised form of a client path.
fn real_path(path: &str) -> String {
    if path.starts_with('/') {
        clean(path)
    } else {
        clean(&format!("/{}", path))
    }
}

impl russh_sftp::server::Handler for RequestServer {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        _extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        debug!(version, "sftp init");
        Ok(Version::new())
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: PFlags,
        attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        let flags = open_flags_from_pflags(pflags);
        let write = flags.writable()
            || pflags.intersects(PFlags::CREATE | PFlags::TRUNCATE | PFlags::APPEND);
        let method = if write { Method::Put } else { Method::Get };
        let req = Request::new(method, filename.as_str())
            .with_pflags(flags)
            .with_attrs(request_attrs(&attrs));
        trace!(id, path = %filename, method = %method, "open");

        let slot = if write {
            Slot::Write(self.handlers.file_put.file_write(&req).await.map_err(status)?)
        } else {
            Slot::Read(self.handlers.file_get.file_read(&req).await.map_err(status)?)
        };
        let handle = self.insert(filename, slot);
        Ok(Handle { id, handle })
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        let (path, slot) = self.handles.remove(&handle).ok_or(StatusCode::Failure)?;
        trace!(id, path = %path, "close");
        let result = match slot {
            Slot::Read(file) => file.close().await,
            Slot::Write(file) => file.close().await,
            Slot::Dir { .. } => Ok(()),
        };
        result.map_err(status)?;
        Ok(ok(id))
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let (_, slot) = self.slot(&handle)?;
        let reader: &dyn ReaderAt = match slot {
            Slot::Read(file) => &**file,
            Slot::Write(file) => file.as_reader().ok_or(StatusCode::PermissionDenied)?,
            Slot::Dir { .. } => return Err(StatusCode::Failure),
        };

        let mut data = vec![0u8; len.min(MAX_READ_LEN) as usize];
        let n = reader.read_at(&mut data, offset).await.map_err(status)?;
        if n == 0 && !data.is_empty() {
            return Err(StatusCode::Eof);
        }
        data.truncate(n);
        Ok(Data { id, data })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let (_, slot) = self.slot(&handle)?;
        let Slot::Write(file) = slot else {
            return Err(StatusCode::PermissionDenied);
        };
        file.write_at(&data, offset).await.map_err(status)?;
        Ok(ok(id))
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let info = self.stat_one(Method::Lstat, &path).await?;
        Ok(Attrs {
            id,
            attrs: attrs_from_info(&info),
        })
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let info = self.stat_one(Method::Stat, &path).await?;
        Ok(Attrs {
            id,
            attrs: attrs_from_info(&info),
        })
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let (path, slot) = self.slot(&handle)?;
        let path = path.clone();
        let info: FsResult<FileInfo> = match slot {
            Slot::Read(file) => file.stat().await,
            Slot::Write(file) => file.stat().await,
            Slot::Dir { .. } => return self.stat(id, path).await,
        };
        let info = info.map_err(|e| status(e.with_path("Fstat", path)))?;
        Ok(Attrs {
            id,
            attrs: attrs_from_info(&info),
        })
    }

    async fn setstat(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let req = Request::new(Method::Setstat, path).with_attrs(request_attrs(&attrs));
        self.command(req).await.map(|_| ok(id))
    }

    async fn fsetstat(
        &mut self,
        id: u32,
        handle: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let path = self.slot(&handle)?.0.clone();
        self.setstat(id, path, attrs).await
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        let lister = self
            .handlers
            .file_list
            .file_list(&Request::new(Method::List, path.as_str()))
            .await
            .map_err(status)?;
        let slot = Slot::Dir {
            path: path.clone(),
            lister,
            offset: 0,
        };
        let handle = self.insert(path, slot);
        Ok(Handle { id, handle })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let (_, slot) = self.slot(&handle)?;
        let Slot::Dir { lister, offset, .. } = slot else {
            return Err(StatusCode::Failure);
        };

        let mut buf = vec![FileInfo::default(); READDIR_BATCH];
        let got = lister.list_at(&mut buf, *offset).map_err(status)?;
        if got.count == 0 {
            return Err(StatusCode::Eof);
        }
        *offset += got.count as u64;
        Ok(Name {
            id,
            files: buf[..got.count].iter().map(name_entry).collect(),
        })
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        self.command(Request::new(Method::Remove, filename))
            .await
            .map(|_| ok(id))
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let req = Request::new(Method::Mkdir, path).with_attrs(request_attrs(&attrs));
        self.command(req).await.map(|_| ok(id))
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        self.command(Request::new(Method::Rmdir, path))
            .await
            .map(|_| ok(id))
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let resolved = real_path(&path);
        Ok(Name {
            id,
            files: vec![NameEntry {
                filename: resolved.clone(),
                longname: resolved,
                attrs: FileAttributes::empty(),
            }],
        })
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        self.command(Request::new(Method::Rename, oldpath).with_target(newpath))
            .await
            .map(|_| ok(id))
    }

    async fn readlink(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let info = self.stat_one(Method::Readlink, &path).await?;
        Ok(Name {
            id,
            files: vec![NameEntry {
                filename: info.name.clone(),
                longname: info.name,
                attrs: FileAttributes::empty(),
            }],
        })
    }

    async fn symlink(
        &mut self,
        id: u32,
        linkpath: String,
        targetpath: String,
    ) -> Result<Status, Self::Error> {
        self.command(Request::new(Method::Symlink, linkpath).with_target(targetpath))
            .await
            .map(|_| ok(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::sftp::ServerHandler;
    use russh_sftp::server::Handler;
    use sftpfs_platform::{FileSystem, MemFs};
    use std::sync::Arc;

    fn server() -> (Arc<MemFs>, RequestServer) {
        let fs = Arc::new(MemFs::new());
        let server = RequestServer::new(ServerHandler::handlers(fs.clone()));
        (fs, server)
    }

    fn write_flags() -> PFlags {
        PFlags::WRITE | PFlags::CREATE | PFlags::TRUNCATE
    }

    #[test]
    fn test_real_path() {
        assert_eq!(real_path("."), "/");
        assert_eq!(real_path("/a/b/../c/"), "/a/c");
        assert_eq!(real_path("x/y"), "/x/y");
    }

    #[tokio::test]
    async fn test_open_write_read_close() {
        let (fs, mut server) = server();
        let handle = server
            .open(1, "/f".into(), write_flags(), FileAttributes::empty())
            .await
            .unwrap()
            .handle;
        server
            .write(2, handle.clone(), 0, b"hello".to_vec())
            .await
            .unwrap();
        let closed = server.close(3, handle).await.unwrap();
        assert!(matches!(closed.status_code, StatusCode::Ok));
        assert_eq!(closed.error_message, "Success");
        assert_eq!(server.open_handles(), 0);
        assert_eq!(fs.stat("/f").await.unwrap().size, 5);

        let handle = server
            .open(4, "/f".into(), PFlags::READ, FileAttributes::empty())
            .await
            .unwrap()
            .handle;
        let data = server.read(5, handle.clone(), 1, 100).await.unwrap();
        assert_eq!(data.data, b"ello");
        let eof = server.read(6, handle.clone(), 5, 100).await.unwrap_err();
        assert!(matches!(eof, StatusCode::Eof));

        // Read-only handles refuse writes.
        let err = server.write(7, handle.clone(), 0, b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, StatusCode::PermissionDenied));

        let attrs = server.fstat(8, handle.clone()).await.unwrap().attrs;
        assert_eq!(attrs.size, Some(5));
        server.close(9, handle.clone()).await.unwrap();
        assert!(matches!(server.close(10, handle).await.unwrap_err(), StatusCode::Failure));
    }

    #[tokio::test]
    async fn test_write_past_size_limit_fails() {
        let (fs, mut server) = server();
        let handle = server
            .open(1, "/f".into(), write_flags(), FileAttributes::empty())
            .await
            .unwrap()
            .handle;
        for offset in [u64::MAX, 1 << 40] {
            let err = server
                .write(2, handle.clone(), offset, b"x".to_vec())
                .await
                .unwrap_err();
            assert!(matches!(err, StatusCode::Failure));
        }
        server.close(3, handle).await.unwrap();
        assert_eq!(fs.stat("/f").await.unwrap().size, 0);
    }

    #[tokio::test]
    async fn test_open_missing_maps_status() {
        let (_, mut server) = server();
        let err = server
            .open(1, "/missing".into(), PFlags::READ, FileAttributes::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, StatusCode::NoSuchFile));

        let err = server.stat(2, "/missing".into()).await.unwrap_err();
        assert!(matches!(err, StatusCode::NoSuchFile));
    }

    #[tokio::test]
    async fn test_readdir_batches_then_eof() {
        let (fs, mut server) = server();
        fs.mkdir("/d", sftpfs_platform::FileMode(0o755)).await.unwrap();
        for i in (0..200).rev() {
            fs.create(&format!("/d/f{:03}", i)).await.unwrap();
        }

        let handle = server.opendir(1, "/d".into()).await.unwrap().handle;
        let first = server.readdir(2, handle.clone()).await.unwrap().files;
        assert_eq!(first.len(), READDIR_BATCH);
        assert_eq!(first[0].filename, "f000");
        assert!(first[0].longname.starts_with('-'));

        let second = server.readdir(3, handle.clone()).await.unwrap().files;
        assert_eq!(second.len(), 200 - READDIR_BATCH);
        assert_eq!(second.last().map(|f| f.filename.as_str()), Some("f199"));

        assert!(matches!(server.readdir(4, handle.clone()).await.unwrap_err(), StatusCode::Eof));
        server.close(5, handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_commands() {
        let (fs, mut server) = server();
        server
            .mkdir(1, "/d".into(), FileAttributes::empty())
            .await
            .unwrap();
        let handle = server
            .open(2, "/d/a".into(), write_flags(), FileAttributes::empty())
            .await
            .unwrap()
            .handle;
        server.write(3, handle.clone(), 0, b"0123456789".to_vec()).await.unwrap();

        let mut attrs = FileAttributes::empty();
        attrs.size = Some(4);
        server.fsetstat(4, handle.clone(), attrs).await.unwrap();
        server.close(5, handle).await.unwrap();
        assert_eq!(fs.stat("/d/a").await.unwrap().size, 4);

        server.rename(6, "/d/a".into(), "/d/b".into()).await.unwrap();
        assert!(fs.stat("/d/a").await.unwrap_err().is_not_found());

        server.symlink(7, "/d/l".into(), "/d/b".into()).await.unwrap();
        let link = server.readlink(8, "/d/l".into()).await.unwrap();
        assert_eq!(link.files[0].filename, "/d/b");
        let lstat = server.lstat(9, "/d/l".into()).await.unwrap().attrs;
        assert_eq!(lstat.permissions.unwrap_or(0) & 0o170000, 0o120000);

        assert!(matches!(server.rmdir(10, "/d".into()).await.unwrap_err(), StatusCode::Failure));
        server.remove(11, "/d/l".into()).await.unwrap();
        server.remove(12, "/d/b".into()).await.unwrap();
        server.rmdir(13, "/d".into()).await.unwrap();
        assert!(fs.stat("/d").await.unwrap_err().is_not_found());
    }
}
