//! Apple File Conduit client.
//!
//! Requests are numbered per client and every reply must echo the number of
//! the request it answers. One request is in flight at a time; the client
//! serializes callers through an internal mutex.

mod error;
mod file;
mod info;

#[cfg(all(test, unix))]
pub(crate) mod fake;

use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use mobdev_proto::afc::{Request, Response, Whence, decode_pairs, decode_payload};
use tracing::{debug, trace};

pub use self::error::AfcError;
pub use self::file::AfcFile;
pub use self::info::{FileInfo, FileType};
pub use mobdev_proto::afc::{
    AfcStatus, FileMode, LinkType, LockOp, MAX_READ_SIZE, MAX_WRITE_SIZE, Opcode,
};

use crate::session::{DeviceService, ServiceSession};

/// State of a handle opened through this client.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct OpenFile {
    /// Path passed to open.
    pub path: String,
    /// Mode the file was opened with.
    pub mode: FileMode,
    /// Lock currently held through this handle.
    pub lock: Option<LockOp>,
}

/// Mutable client state behind the mutex.
#[derive(Debug)]
struct Inner {
    /// Underlying service session.
    session: ServiceSession,
    /// Sequence number of the next request.
    next_packet: u64,
    /// Handles opened and not yet closed.
    files: HashMap<u64, OpenFile>,
}

impl Inner {
    /// Sends one request and waits for its reply.
    fn exchange(&mut self, request: Request) -> Result<Response, AfcError> {
        if !self.session.is_active() {
            return Err(AfcError::NotConnected);
        }
        let op = request.opcode();
        let num = self.next_packet;
        self.next_packet += 1;

        trace!(?op, num, "afc request");
        let timeout = self.session.options().receive_timeout();
        self.session.send_packet(&request.into_packet(num))?;
        let reply = loop {
            let reply = self.session.receive_packet(timeout)?;
            if reply.packet_num == num {
                break reply;
            }
            if reply.packet_num > num {
                return Err(AfcError::Sequence {
                    expected: num,
                    got: reply.packet_num,
                });
            }
            // Late answer to a request that already timed out.
            trace!(num = reply.packet_num, expected = num, "dropping stale afc reply");
        };

        match Response::from_packet(reply)? {
            Response::Status(AfcStatus::Success) => Ok(Response::Status(AfcStatus::Success)),
            Response::Status(status) => {
                debug!(?op, %status, "afc request failed");
                Err(AfcError::Status { op, status })
            }
            other => Ok(other),
        }
    }

    /// Sends a request whose only reply is a status.
    fn status(&mut self, request: Request) -> Result<(), AfcError> {
        let op = request.opcode();
        match self.exchange(request)? {
            Response::Status(_) => Ok(()),
            _ => Err(AfcError::UnexpectedReply { op }),
        }
    }

    /// Sends a request answered with a data block.
    fn data(&mut self, request: Request) -> Result<Vec<u8>, AfcError> {
        let op = request.opcode();
        match self.exchange(request)? {
            Response::Data(data) => Ok(data),
            _ => Err(AfcError::UnexpectedReply { op }),
        }
    }

    /// Fails unless `handle` is open on this client.
    fn check_handle(&self, handle: u64) -> Result<&OpenFile, AfcError> {
        self.files.get(&handle).ok_or(AfcError::StaleHandle(handle))
    }
}

/// Rejects empty paths before they reach the device.
fn check_path(path: &str) -> Result<String, AfcError> {
    if path.is_empty() {
        return Err(AfcError::InvalidArg("empty path"));
    }
    Ok(path.to_owned())
}

/// AFC client over one service session.
#[derive(Debug)]
pub struct AfcClient {
    /// Serialized client state.
    inner: Mutex<Inner>,
}

impl DeviceService for AfcClient {
    const SERVICE_NAME: &'static str = "com.apple.afc";
    type Error = AfcError;

    fn from_session(session: ServiceSession) -> Result<Self, AfcError> {
        Ok(Self::new(session))
    }
}

impl AfcClient {
    /// Wraps a session already connected to an AFC endpoint.
    ///
    /// This is also how a house_arrest connection is reused after hand-off.
    pub fn new(session: ServiceSession) -> Self {
        Self {
            inner: Mutex::new(Inner {
                session,
                next_packet: 0,
                files: HashMap::new(),
            }),
        }
    }

    /// Locks the client state.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the session is still usable.
    pub fn is_connected(&self) -> bool {
        self.lock().session.is_active()
    }

    /// State of an open handle.
    pub fn open_file(&self, handle: u64) -> Option<OpenFile> {
        self.lock().files.get(&handle).cloned()
    }

    /// Lists the entries of a directory, including `.` and `..`.
    pub fn read_directory(&self, path: &str) -> Result<Vec<String>, AfcError> {
        let path = check_path(path)?;
        let data = self.lock().data(Request::ReadDir { path })?;
        Ok(decode_payload(&data)?)
    }

    /// File-system attributes of the device as key/value pairs.
    pub fn device_info(&self) -> Result<Vec<(String, String)>, AfcError> {
        let data = self.lock().data(Request::GetDeviceInfo)?;
        Ok(decode_pairs(decode_payload(&data)?)?)
    }

    /// A single device attribute such as `FSTotalBytes`.
    pub fn device_info_key(&self, key: &str) -> Result<Option<String>, AfcError> {
        Ok(self
            .device_info()?
            .into_iter()
            .find_map(|(k, v)| (k == key).then_some(v)))
    }

    /// Raw attribute pairs of a path.
    pub fn file_info_raw(&self, path: &str) -> Result<Vec<(String, String)>, AfcError> {
        let path = check_path(path)?;
        let data = self.lock().data(Request::GetFileInfo { path })?;
        Ok(decode_pairs(decode_payload(&data)?)?)
    }

    /// Attributes of a path.
    pub fn file_info(&self, path: &str) -> Result<FileInfo, AfcError> {
        FileInfo::from_pairs(self.file_info_raw(path)?)
    }

    /// Opens a file and returns its handle.
    pub fn file_open(&self, path: &str, mode: FileMode) -> Result<u64, AfcError> {
        let path = check_path(path)?;
        let mut inner = self.lock();
        let reply = inner.exchange(Request::FileOpen {
            path: path.clone(),
            mode,
        })?;
        let Response::FileHandle(handle) = reply else {
            return Err(AfcError::UnexpectedReply {
                op: Opcode::FileOpen,
            });
        };
        debug!(handle, %path, ?mode, "afc file opened");
        inner.files.insert(
            handle,
            OpenFile {
                path,
                mode,
                lock: None,
            },
        );
        Ok(handle)
    }

    /// Opens a file with a numeric mode; values outside 1..=6 never reach the wire.
    pub fn file_open_raw(&self, path: &str, mode: u64) -> Result<u64, AfcError> {
        let mode =
            FileMode::try_from(mode).map_err(|_| AfcError::InvalidArg("file mode out of range"))?;
        self.file_open(path, mode)
    }

    /// Opens a file as a [`std::io`] stream.
    pub fn open(&self, path: &str, mode: FileMode) -> Result<AfcFile<'_>, AfcError> {
        let handle = self.file_open(path, mode)?;
        Ok(AfcFile::new(self, handle))
    }

    /// Closes a handle.
    pub fn file_close(&self, handle: u64) -> Result<(), AfcError> {
        let mut inner = self.lock();
        inner.check_handle(handle)?;
        let result = inner.status(Request::FileClose { handle });
        inner.files.remove(&handle);
        result
    }

    /// Applies a lock operation to an open handle.
    pub fn file_lock(&self, handle: u64, op: LockOp) -> Result<(), AfcError> {
        let mut inner = self.lock();
        inner.check_handle(handle)?;
        inner.status(Request::FileLock { handle, op })?;
        if let Some(file) = inner.files.get_mut(&handle) {
            file.lock = (op != LockOp::Unlock).then_some(op);
        }
        Ok(())
    }

    /// Reads up to `len` bytes, capped at [`MAX_READ_SIZE`]. An empty result means end of file.
    pub fn file_read(&self, handle: u64, len: usize) -> Result<Vec<u8>, AfcError> {
        if len == 0 {
            return Err(AfcError::InvalidArg("zero-length read"));
        }
        let len = len.min(MAX_READ_SIZE) as u64;
        let mut inner = self.lock();
        inner.check_handle(handle)?;
        inner.data(Request::FileRead { handle, len })
    }

    /// Writes up to [`MAX_WRITE_SIZE`] bytes and returns how many were accepted.
    pub fn file_write(&self, handle: u64, data: &[u8]) -> Result<usize, AfcError> {
        if data.is_empty() {
            return Err(AfcError::InvalidArg("empty write"));
        }
        let chunk = &data[..data.len().min(MAX_WRITE_SIZE)];
        let mut inner = self.lock();
        inner.check_handle(handle)?;
        inner.status(Request::FileWrite {
            handle,
            data: chunk.to_vec(),
        })?;
        Ok(chunk.len())
    }

    /// Moves the file position.
    pub fn file_seek(&self, handle: u64, pos: SeekFrom) -> Result<(), AfcError> {
        let (whence, offset) = match pos {
            SeekFrom::Start(n) => (
                Whence::Set,
                i64::try_from(n).map_err(|_| AfcError::InvalidArg("seek offset too large"))?,
            ),
            SeekFrom::Current(n) => (Whence::Current, n),
            SeekFrom::End(n) => (Whence::End, n),
        };
        let mut inner = self.lock();
        inner.check_handle(handle)?;
        inner.status(Request::FileSeek {
            handle,
            whence,
            offset,
        })
    }

    /// Current file position.
    pub fn file_tell(&self, handle: u64) -> Result<u64, AfcError> {
        let mut inner = self.lock();
        inner.check_handle(handle)?;
        match inner.exchange(Request::FileTell { handle })? {
            Response::Position(pos) => Ok(pos),
            _ => Err(AfcError::UnexpectedReply {
                op: Opcode::FileTell,
            }),
        }
    }

    /// Resizes an open file.
    pub fn file_truncate(&self, handle: u64, size: u64) -> Result<(), AfcError> {
        let mut inner = self.lock();
        inner.check_handle(handle)?;
        inner.status(Request::FileSetSize { handle, size })
    }

    /// Removes a file or empty directory.
    pub fn remove_path(&self, path: &str) -> Result<(), AfcError> {
        let path = check_path(path)?;
        self.lock().status(Request::RemovePath { path })
    }

    /// Removes a path and everything below it.
    pub fn remove_path_and_contents(&self, path: &str) -> Result<(), AfcError> {
        let path = check_path(path)?;
        self.lock().status(Request::RemovePathAndContents { path })
    }

    /// Renames a path.
    pub fn rename_path(&self, from: &str, to: &str) -> Result<(), AfcError> {
        let from = check_path(from)?;
        let to = check_path(to)?;
        self.lock().status(Request::RenamePath { from, to })
    }

    /// Creates a directory and any missing parents.
    pub fn make_directory(&self, path: &str) -> Result<(), AfcError> {
        let path = check_path(path)?;
        self.lock().status(Request::MakeDir { path })
    }

    /// Truncates a file by path.
    pub fn truncate(&self, path: &str, size: u64) -> Result<(), AfcError> {
        let path = check_path(path)?;
        self.lock().status(Request::Truncate { path, size })
    }

    /// Creates a hard or symbolic link at `link` pointing to `target`.
    pub fn make_link(&self, kind: LinkType, target: &str, link: &str) -> Result<(), AfcError> {
        let target = check_path(target)?;
        let link = check_path(link)?;
        self.lock().status(Request::MakeLink { kind, target, link })
    }

    /// Sets a file's modification time.
    pub fn set_file_time(&self, path: &str, mtime: SystemTime) -> Result<(), AfcError> {
        let path = check_path(path)?;
        let mtime_ns = mtime
            .duration_since(UNIX_EPOCH)
            .map_err(|_| AfcError::InvalidArg("time before the epoch"))?
            .as_nanos();
        let mtime_ns =
            u64::try_from(mtime_ns).map_err(|_| AfcError::InvalidArg("time out of range"))?;
        self.lock().status(Request::SetFileModTime { path, mtime_ns })
    }

    /// Reads a whole file.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>, AfcError> {
        let file = self.open(path, FileMode::ReadOnly)?;
        let mut out = Vec::new();
        loop {
            let chunk = self.file_read(file.handle(), MAX_READ_SIZE)?;
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        file.close()?;
        Ok(out)
    }

    /// Creates or replaces a file with `data`.
    pub fn write_file(&self, path: &str, data: &[u8]) -> Result<(), AfcError> {
        let file = self.open(path, FileMode::WriteOnly)?;
        let mut rest = data;
        while !rest.is_empty() {
            let n = self.file_write(file.handle(), rest)?;
            rest = &rest[n..];
        }
        file.close()
    }

    /// Forgets all handles and closes the session. Safe to call repeatedly.
    pub fn close(&self) -> Result<(), AfcError> {
        let mut inner = self.lock();
        inner.files.clear();
        Ok(inner.session.close()?)
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::{Read, Seek, Write};
    use std::time::Duration;

    use super::fake::{FakeFs, spawn};
    use super::*;

    #[test]
    fn write_seek_read_roundtrip() {
        let (client, device) = spawn(FakeFs::default());
        let mut file = client.open("/hello.txt", FileMode::WriteRead).unwrap();
        file.write_all(b"hello afc").unwrap();
        assert_eq!(file.seek(SeekFrom::Start(6)).unwrap(), 6);
        let mut tail = String::new();
        file.read_to_string(&mut tail).unwrap();
        assert_eq!(tail, "afc");
        file.close().unwrap();

        assert_eq!(client.read_file("/hello.txt").unwrap(), b"hello afc");
        client.close().unwrap();
        let fs = device.join().unwrap();
        assert_eq!(fs.file("/hello.txt"), Some(&b"hello afc"[..]));
    }

    #[test]
    fn packet_numbers_increase_by_one() {
        let (client, device) = spawn(FakeFs::default());
        client.make_directory("/a").unwrap();
        client.read_directory("/").unwrap();
        client.device_info().unwrap();
        client.close().unwrap();
        assert_eq!(device.join().unwrap().seen, vec![0, 1, 2]);
    }

    #[test]
    fn directory_listing_and_info() {
        let (client, _device) = spawn(FakeFs::default());
        client.make_directory("/DCIM").unwrap();
        client.write_file("/DCIM/a.jpg", &[0u8; 10]).unwrap();

        let mut names = client.read_directory("/DCIM").unwrap();
        names.sort();
        assert_eq!(names, vec![".", "..", "a.jpg"]);

        let info = client.file_info("/DCIM/a.jpg").unwrap();
        assert_eq!(info.size, 10);
        assert_eq!(info.file_type, FileType::Regular);
        assert!(client.file_info("/DCIM").unwrap().is_dir());
        assert_eq!(
            client.device_info_key("Model").unwrap().as_deref(),
            Some("iPhone10,3")
        );
    }

    #[test]
    fn device_status_becomes_error() {
        let (client, _device) = spawn(FakeFs::default());
        let err = client.file_info("/missing").unwrap_err();
        assert!(matches!(
            err,
            AfcError::Status {
                op: Opcode::GetFileInfo,
                status: AfcStatus::ObjectNotFound
            }
        ));
        assert_eq!(err.status(), AfcStatus::ObjectNotFound);
    }

    #[test]
    fn second_exclusive_lock_is_busy() {
        let (client, _device) = spawn(FakeFs::default());
        let a = client.file_open("/lock", FileMode::WriteRead).unwrap();
        let b = client.file_open("/lock", FileMode::ReadOnly).unwrap();
        client.file_lock(a, LockOp::Exclusive).unwrap();
        assert_eq!(client.open_file(a).unwrap().lock, Some(LockOp::Exclusive));

        let err = client.file_lock(b, LockOp::Exclusive).unwrap_err();
        assert_eq!(err.status(), AfcStatus::ObjectBusy);

        client.file_lock(a, LockOp::Unlock).unwrap();
        assert_eq!(client.open_file(a).unwrap().lock, None);
        client.file_lock(b, LockOp::Exclusive).unwrap();
    }

    #[test]
    fn invalid_mode_sends_nothing() {
        let (client, device) = spawn(FakeFs::default());
        let err = client.file_open_raw("/x", 7).unwrap_err();
        assert!(matches!(err, AfcError::InvalidArg(_)));
        assert!(matches!(
            client.file_open_raw("", 1).unwrap_err(),
            AfcError::InvalidArg(_)
        ));
        client.close().unwrap();
        assert!(device.join().unwrap().seen.is_empty());
    }

    #[test]
    fn stale_handle_is_rejected_locally() {
        let (client, device) = spawn(FakeFs::default());
        let h = client.file_open("/f", FileMode::WriteOnly).unwrap();
        client.file_close(h).unwrap();
        let err = client.file_read(h, 16).unwrap_err();
        assert!(matches!(err, AfcError::StaleHandle(_)));
        assert_eq!(err.status(), AfcStatus::ObjectNotFound);
        client.close().unwrap();
        assert_eq!(device.join().unwrap().seen.len(), 2);
    }

    #[test]
    fn closed_client_reports_not_connected() {
        let (client, _device) = spawn(FakeFs::default());
        client.close().unwrap();
        client.close().unwrap();
        assert!(!client.is_connected());
        assert!(matches!(
            client.read_directory("/").unwrap_err(),
            AfcError::NotConnected
        ));
    }

    #[test]
    fn rename_truncate_and_remove() {
        let (client, _device) = spawn(FakeFs::default());
        client.write_file("/a", b"abcdef").unwrap();
        client.rename_path("/a", "/b").unwrap();
        client.truncate("/b", 3).unwrap();
        assert_eq!(client.read_file("/b").unwrap(), b"abc");
        client
            .set_file_time("/b", UNIX_EPOCH + Duration::from_secs(5))
            .unwrap();
        assert_eq!(client.file_info("/b").unwrap().mtime_ns, Some(5_000_000_000));

        client.make_directory("/d/e").unwrap();
        client.write_file("/d/e/f", b"x").unwrap();
        assert_eq!(
            client.remove_path("/d").unwrap_err().status(),
            AfcStatus::DirNotEmpty
        );
        client.remove_path_and_contents("/d").unwrap();
        assert_eq!(
            client.file_info("/d/e/f").unwrap_err().status(),
            AfcStatus::ObjectNotFound
        );
    }

    #[test]
    fn mismatched_reply_number_is_an_error() {
        use mobdev_proto::afc::Packet;

        let (session, mut peer) = crate::session::tests::session_pair("com.apple.afc");
        let client = AfcClient::new(session);
        let device = std::thread::spawn(move || {
            let req = Packet::read_from(&mut peer).unwrap();
            Response::Status(AfcStatus::Success)
                .into_packet(req.packet_num + 7)
                .write_to(&mut peer)
                .unwrap();
        });
        let err = client.make_directory("/x").unwrap_err();
        assert!(matches!(
            err,
            AfcError::Sequence {
                expected: 0,
                got: 7
            }
        ));
        device.join().unwrap();
    }

    #[test]
    fn late_reply_after_timeout_is_skipped() {
        use std::os::unix::net::UnixStream;

        use mobdev_proto::afc::Packet;

        use crate::session::ServiceOptions;
        use crate::transport::Connection;

        let (a, mut peer) = UnixStream::pair().unwrap();
        let conn = Connection::from_socket("udid", 1, Box::new(a));
        let options = ServiceOptions::new().timeout(Some(Duration::from_millis(50)));
        let client = AfcClient::new(ServiceSession::from_connection(
            AfcClient::SERVICE_NAME,
            conn,
            options,
        ));
        let device = std::thread::spawn(move || {
            let mut seen = Vec::new();
            for i in 0..3 {
                let req = Packet::read_from(&mut peer).unwrap();
                if i == 0 {
                    std::thread::sleep(Duration::from_millis(150));
                }
                seen.push(req.packet_num);
                Response::Status(AfcStatus::Success)
                    .into_packet(req.packet_num)
                    .write_to(&mut peer)
                    .unwrap();
            }
            seen
        });

        assert!(matches!(
            client.make_directory("/a"),
            Err(AfcError::Transport(crate::Error::Timeout))
        ));
        std::thread::sleep(Duration::from_millis(200));
        client.make_directory("/b").unwrap();
        client.make_directory("/c").unwrap();
        assert!(client.is_connected());
        assert_eq!(device.join().unwrap(), vec![0, 1, 2]);
    }
}
