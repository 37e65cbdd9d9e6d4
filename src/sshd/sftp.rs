//! SFTP subsystem handler, wired so every write it serves also drives the
//! session's `WriteNotify` hook - an SFTP-only session still extends the
//! breakpoint, per the resolution of spec.md's SFTP auto-extend question.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use russh_sftp::protocol::{
    Attrs, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use tokio::io::{AsyncRead, AsyncWrite};

use super::writenotify::WriteNotify;

struct OpenFile {
    path: PathBuf,
    file: std::fs::File,
}

/// A filesystem-backed SFTP handler rooted at the session's working
/// directory. Only the handful of operations an interactive shell actually
/// exercises (open/read/write/close/stat/readdir) are implemented; anything
/// else reports `OP_UNSUPPORTED`, matching `pkg/sftp`'s own read-write
/// server which the original leans on directly.
pub struct NotifyingSftp {
    notify: Arc<WriteNotify>,
    next_handle: std::sync::atomic::AtomicU64,
    open_files: tokio::sync::Mutex<HashMap<String, OpenFile>>,
}

impl NotifyingSftp {
    pub fn new(notify: Arc<WriteNotify>) -> Self {
        Self {
            notify,
            next_handle: std::sync::atomic::AtomicU64::new(0),
            open_files: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    fn alloc_handle(&self) -> String {
        let id = self
            .next_handle
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        id.to_string()
    }
}

#[async_trait]
impl russh_sftp::server::Handler for NotifyingSftp {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        _extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        Ok(Version::new_with_version(version))
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        let mut options = OpenOptions::new();
        options
            .read(pflags.contains(OpenFlags::READ))
            .write(pflags.contains(OpenFlags::WRITE))
            .create(pflags.contains(OpenFlags::CREATE))
            .truncate(pflags.contains(OpenFlags::TRUNCATE))
            .append(pflags.contains(OpenFlags::APPEND));

        let path = PathBuf::from(&filename);
        let file = options.open(&path).map_err(|_| StatusCode::Failure)?;

        let handle = self.alloc_handle();
        self.open_files
            .lock()
            .await
            .insert(handle.clone(), OpenFile { path, file });

        Ok(Handle { id, handle })
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<russh_sftp::protocol::Data, Self::Error> {
        let mut files = self.open_files.lock().await;
        let entry = files.get_mut(&handle).ok_or(StatusCode::Failure)?;

        entry
            .file
            .seek(SeekFrom::Start(offset))
            .map_err(|_| StatusCode::Failure)?;

        let mut buf = vec![0u8; len as usize];
        let n = entry.file.read(&mut buf).map_err(|_| StatusCode::Failure)?;
        if n == 0 {
            return Err(StatusCode::Eof);
        }
        buf.truncate(n);

        Ok(russh_sftp::protocol::Data { id, data: buf })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let mut files = self.open_files.lock().await;
        let entry = files.get_mut(&handle).ok_or(StatusCode::Failure)?;

        entry
            .file
            .seek(SeekFrom::Start(offset))
            .map_err(|_| StatusCode::Failure)?;
        entry
            .file
            .write_all(&data)
            .map_err(|_| StatusCode::Failure)?;

        self.notify.signal();

        Ok(Status {
            id,
            status_code: StatusCode::Ok,
            error_message: String::new(),
            language_tag: String::new(),
        })
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        self.open_files.lock().await.remove(&handle);
        Ok(Status {
            id,
            status_code: StatusCode::Ok,
            error_message: String::new(),
            language_tag: String::new(),
        })
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let meta = std::fs::metadata(&path).map_err(|_| StatusCode::NoSuchFile)?;
        Ok(Attrs {
            id,
            attrs: FileAttributes {
                size: Some(meta.len()),
                ..Default::default()
            },
        })
    }

    async fn readdir(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let entries = std::fs::read_dir(&path).map_err(|_| StatusCode::NoSuchFile)?;
        let mut files = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            files.push(File::new(name.clone(), name, FileAttributes::default()));
        }
        Ok(Name { id, files })
    }
}

/// Serves SFTP requests over `stream` until the client disconnects.
pub async fn serve<S>(stream: S, notify: Arc<WriteNotify>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let handler = NotifyingSftp::new(notify);
    if let Err(e) = russh_sftp::server::run(stream, handler).await {
        info!("sftp session ended with error: {e}");
    } else {
        info!("sftp session done");
    }
}
