//! In-memory AFC device for tests.

#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_sign_loss)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::os::unix::net::UnixStream;
use std::thread::{self, JoinHandle};

use mobdev_proto::afc::{
    AfcStatus, FileMode, LockOp, Packet, Request, Response, Whence, encode_payload,
};

use super::AfcClient;
use crate::session::DeviceService;
use crate::session::tests::session_pair;

/// Open handle on the fake device.
struct Handle {
    path: String,
    pos: u64,
}

/// Tiny file system served over AFC.
pub(crate) struct FakeFs {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    mtimes: HashMap<String, u64>,
    handles: HashMap<u64, Handle>,
    next_handle: u64,
    /// path -> (holder, lock)
    locks: HashMap<String, (u64, LockOp)>,
    /// Packet numbers of every request received.
    pub(crate) seen: Vec<u64>,
}

impl Default for FakeFs {
    fn default() -> Self {
        Self {
            files: BTreeMap::new(),
            dirs: BTreeSet::from(["/".to_owned()]),
            mtimes: HashMap::new(),
            handles: HashMap::new(),
            next_handle: 1,
            locks: HashMap::new(),
            seen: Vec::new(),
        }
    }
}

fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(i) => &path[..i],
        None => "/",
    }
}

fn under(path: &str, dir: &str) -> bool {
    path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}

impl FakeFs {
    pub(crate) fn file(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    fn exists(&self, path: &str) -> bool {
        self.files.contains_key(path) || self.dirs.contains(path)
    }

    fn has_children(&self, dir: &str) -> bool {
        self.files.keys().chain(self.dirs.iter()).any(|p| under(p, dir))
    }

    fn data(pairs: &[&str]) -> Response {
        Response::Data(encode_payload(pairs.iter().copied()))
    }

    fn handle(&mut self, request: Request) -> Response {
        use AfcStatus::{DirNotEmpty, InvalidArg, ObjectBusy, ObjectNotFound, Success};

        let status = match request {
            Request::ReadDir { path } => {
                if !self.dirs.contains(&path) {
                    return Response::Status(ObjectNotFound);
                }
                let mut names = vec![".".to_owned(), "..".to_owned()];
                for p in self.files.keys().chain(self.dirs.iter()) {
                    if p != "/" && parent(p) == path {
                        names.push(p[p.rfind('/').map_or(0, |i| i + 1)..].to_owned());
                    }
                }
                return Response::Data(encode_payload(names.iter().map(String::as_str)));
            }
            Request::GetFileInfo { path } => {
                let mtime = self.mtimes.get(&path).copied().unwrap_or(0).to_string();
                if let Some(data) = self.files.get(&path) {
                    let size = data.len().to_string();
                    return Self::data(&[
                        "st_size", &size, "st_blocks", "8", "st_nlink", "1", "st_ifmt",
                        "S_IFREG", "st_mtime", &mtime,
                    ]);
                }
                if self.dirs.contains(&path) {
                    return Self::data(&[
                        "st_size", "64", "st_nlink", "2", "st_ifmt", "S_IFDIR", "st_mtime",
                        &mtime,
                    ]);
                }
                ObjectNotFound
            }
            Request::GetDeviceInfo => {
                return Self::data(&[
                    "Model", "iPhone10,3", "FSTotalBytes", "64000000000", "FSFreeBytes",
                    "1000", "FSBlockSize", "4096",
                ]);
            }
            Request::FileOpen { path, mode } => {
                let exists = self.files.contains_key(&path);
                match mode {
                    FileMode::ReadOnly if !exists => return Response::Status(ObjectNotFound),
                    FileMode::WriteOnly | FileMode::WriteRead => {
                        self.files.insert(path.clone(), Vec::new());
                    }
                    _ => {
                        self.files.entry(path.clone()).or_default();
                    }
                }
                let pos = match mode {
                    FileMode::Append | FileMode::ReadAppend => self.files[&path].len() as u64,
                    _ => 0,
                };
                let handle = self.next_handle;
                self.next_handle += 1;
                self.handles.insert(handle, Handle { path, pos });
                return Response::FileHandle(handle);
            }
            Request::FileRead { handle, len } => {
                let Some(h) = self.handles.get_mut(&handle) else {
                    return Response::Status(ObjectNotFound);
                };
                let data = &self.files[&h.path];
                let start = (h.pos as usize).min(data.len());
                let end = (start + len as usize).min(data.len());
                h.pos = end as u64;
                return Response::Data(data[start..end].to_vec());
            }
            Request::FileWrite { handle, data } => {
                let Some(h) = self.handles.get_mut(&handle) else {
                    return Response::Status(ObjectNotFound);
                };
                let file = self.files.entry(h.path.clone()).or_default();
                let start = h.pos as usize;
                if file.len() < start + data.len() {
                    file.resize(start + data.len(), 0);
                }
                file[start..start + data.len()].copy_from_slice(&data);
                h.pos += data.len() as u64;
                Success
            }
            Request::FileSeek {
                handle,
                whence,
                offset,
            } => {
                let Some(h) = self.handles.get_mut(&handle) else {
                    return Response::Status(ObjectNotFound);
                };
                let base = match whence {
                    Whence::Set => 0,
                    Whence::Current => h.pos as i64,
                    _ => self.files[&h.path].len() as i64,
                };
                if base + offset < 0 {
                    InvalidArg
                } else {
                    h.pos = (base + offset) as u64;
                    Success
                }
            }
            Request::FileTell { handle } => match self.handles.get(&handle) {
                Some(h) => return Response::Position(h.pos),
                None => ObjectNotFound,
            },
            Request::FileSetSize { handle, size } => match self.handles.get(&handle) {
                Some(h) => {
                    if let Some(f) = self.files.get_mut(&h.path) {
                        f.resize(size as usize, 0);
                    }
                    Success
                }
                None => ObjectNotFound,
            },
            Request::FileLock { handle, op } => {
                let Some(h) = self.handles.get(&handle) else {
                    return Response::Status(ObjectNotFound);
                };
                let path = h.path.clone();
                match (op, self.locks.get(&path)) {
                    (LockOp::Unlock, Some((holder, _))) if *holder == handle => {
                        self.locks.remove(&path);
                        Success
                    }
                    (LockOp::Unlock, _) => Success,
                    (_, Some((_, LockOp::Exclusive))) => ObjectBusy,
                    (LockOp::Exclusive, Some(_)) => ObjectBusy,
                    (op, _) => {
                        self.locks.insert(path, (handle, op));
                        Success
                    }
                }
            }
            Request::FileClose { handle } => match self.handles.remove(&handle) {
                Some(h) => {
                    if self.locks.get(&h.path).is_some_and(|(holder, _)| *holder == handle) {
                        self.locks.remove(&h.path);
                    }
                    Success
                }
                None => ObjectNotFound,
            },
            Request::RemovePath { path } => {
                if self.has_children(&path) {
                    DirNotEmpty
                } else if self.files.remove(&path).is_some() || self.dirs.remove(&path) {
                    Success
                } else {
                    ObjectNotFound
                }
            }
            Request::RemovePathAndContents { path } => {
                if !self.exists(&path) {
                    return Response::Status(ObjectNotFound);
                }
                self.files.retain(|p, _| p != &path && !under(p, &path));
                self.dirs.retain(|p| p != &path && !under(p, &path));
                Success
            }
            Request::RenamePath { from, to } => {
                if let Some(data) = self.files.remove(&from) {
                    self.files.insert(to, data);
                    Success
                } else {
                    ObjectNotFound
                }
            }
            Request::MakeDir { path } => {
                let mut p = path.as_str();
                while p != "/" {
                    self.dirs.insert(p.to_owned());
                    p = parent(p);
                }
                Success
            }
            Request::Truncate { path, size } => match self.files.get_mut(&path) {
                Some(f) => {
                    f.resize(size as usize, 0);
                    Success
                }
                None => ObjectNotFound,
            },
            Request::MakeLink { target, link, .. } => {
                let data = self.files.get(&target).cloned().unwrap_or_default();
                self.files.insert(link, data);
                Success
            }
            Request::SetFileModTime { path, mtime_ns } => {
                if self.exists(&path) {
                    self.mtimes.insert(path, mtime_ns);
                    Success
                } else {
                    ObjectNotFound
                }
            }
            _ => AfcStatus::UnknownPacketType,
        };
        Response::Status(status)
    }

    /// Serves requests until the client hangs up.
    fn serve(mut self, mut peer: UnixStream) -> Self {
        while let Ok(packet) = Packet::read_from(&mut peer) {
            self.seen.push(packet.packet_num);
            let reply = match Request::from_packet(&packet) {
                Ok(request) => self.handle(request),
                Err(_) => Response::Status(AfcStatus::UnknownPacketType),
            };
            if reply.into_packet(packet.packet_num).write_to(&mut peer).is_err() {
                break;
            }
        }
        self
    }
}

/// Starts `fs` on one end of a socket pair and returns a client on the other.
pub(crate) fn spawn(fs: FakeFs) -> (AfcClient, JoinHandle<FakeFs>) {
    let (session, peer) = session_pair(AfcClient::SERVICE_NAME);
    let device = thread::spawn(move || fs.serve(peer));
    (AfcClient::new(session), device)
}
