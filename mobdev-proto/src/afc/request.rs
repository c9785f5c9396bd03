//! Typed AFC requests and replies.

use super::{AfcStatus, Opcode, Packet};
use crate::DecodeError;

/// File open modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(u64)]
pub enum FileMode {
    /// `r`: read only.
    ReadOnly = 1,
    /// `r+`: read/write, create.
    ReadWrite = 2,
    /// `w`: write only, create, truncate.
    WriteOnly = 3,
    /// `w+`: read/write, create, truncate.
    WriteRead = 4,
    /// `a`: append, create.
    Append = 5,
    /// `a+`: read/append, create.
    ReadAppend = 6,
}

/// Lock operations. The wire values are fixed combinations, not bit flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(u64)]
pub enum LockOp {
    /// Shared lock.
    Shared = 1 | 4,
    /// Exclusive lock.
    Exclusive = 2 | 4,
    /// Release a lock.
    Unlock = 8 | 4,
}

/// Link kinds for [`Request::MakeLink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(u64)]
pub enum LinkType {
    /// Hard link.
    Hard = 1,
    /// Symbolic link.
    Symbolic = 2,
}

/// Seek origins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(u64)]
pub enum Whence {
    /// From the start of the file.
    Set = 0,
    /// From the current position.
    Current = 1,
    /// From the end of the file.
    End = 2,
}

/// Implements the numeric conversions shared by the argument enums.
macro_rules! wire_enum {
    ($ty:ident, $field:literal, [$($variant:ident),+]) => {
        impl $ty {
            /// Wire value.
            pub const fn code(self) -> u64 {
                self as u64
            }
        }

        impl TryFrom<u64> for $ty {
            type Error = DecodeError;

            fn try_from(value: u64) -> Result<Self, Self::Error> {
                [$(Self::$variant),+]
                    .into_iter()
                    .find(|v| v.code() == value)
                    .ok_or(DecodeError::InvalidValue { field: $field, value })
            }
        }
    };
}

wire_enum!(
    FileMode,
    "open mode",
    [ReadOnly, ReadWrite, WriteOnly, WriteRead, Append, ReadAppend]
);
wire_enum!(LockOp, "lock operation", [Shared, Exclusive, Unlock]);
wire_enum!(LinkType, "link type", [Hard, Symbolic]);
wire_enum!(Whence, "whence", [Set, Current, End]);

/// A request sent from host to device.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Request {
    /// List a directory.
    ReadDir {
        /// Directory path.
        path: String,
    },
    /// Query file attributes.
    GetFileInfo {
        /// File path.
        path: String,
    },
    /// Query device file-system attributes.
    GetDeviceInfo,
    /// Open a file.
    FileOpen {
        /// File path.
        path: String,
        /// Open mode.
        mode: FileMode,
    },
    /// Read up to `len` bytes.
    FileRead {
        /// Open handle.
        handle: u64,
        /// Maximum number of bytes.
        len: u64,
    },
    /// Write bytes at the current position.
    FileWrite {
        /// Open handle.
        handle: u64,
        /// Bytes to write.
        data: Vec<u8>,
    },
    /// Move the file position.
    FileSeek {
        /// Open handle.
        handle: u64,
        /// Origin.
        whence: Whence,
        /// Signed offset from the origin.
        offset: i64,
    },
    /// Query the file position.
    FileTell {
        /// Open handle.
        handle: u64,
    },
    /// Resize an open file.
    FileSetSize {
        /// Open handle.
        handle: u64,
        /// New size in bytes.
        size: u64,
    },
    /// Lock or unlock an open file.
    FileLock {
        /// Open handle.
        handle: u64,
        /// Lock operation.
        op: LockOp,
    },
    /// Close a handle.
    FileClose {
        /// Open handle.
        handle: u64,
    },
    /// Remove a file or empty directory.
    RemovePath {
        /// Path to remove.
        path: String,
    },
    /// Rename a path.
    RenamePath {
        /// Existing path.
        from: String,
        /// New path.
        to: String,
    },
    /// Create a directory (and missing parents).
    MakeDir {
        /// Directory path.
        path: String,
    },
    /// Truncate a file by path.
    Truncate {
        /// File path.
        path: String,
        /// New size in bytes.
        size: u64,
    },
    /// Create a link.
    MakeLink {
        /// Link kind.
        kind: LinkType,
        /// Link target.
        target: String,
        /// Path of the new link.
        link: String,
    },
    /// Set a file's modification time.
    SetFileModTime {
        /// File path.
        path: String,
        /// Modification time in nanoseconds since the Unix epoch.
        mtime_ns: u64,
    },
    /// Remove a path and everything below it.
    RemovePathAndContents {
        /// Path to remove.
        path: String,
    },
}

/// Little-endian argument block writer.
#[derive(Default)]
struct Args(Vec<u8>);

impl Args {
    fn u64(mut self, v: u64) -> Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn i64(mut self, v: i64) -> Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn path(mut self, s: &str) -> Self {
        self.0.extend_from_slice(s.as_bytes());
        self.0.push(0);
        self
    }
}

/// Argument block reader.
struct ArgReader<'a>(&'a [u8]);

impl ArgReader<'_> {
    fn word(&mut self) -> Result<[u8; 8], DecodeError> {
        let (head, rest) = self
            .0
            .split_first_chunk::<8>()
            .ok_or(DecodeError::NotEnoughData("argument word"))?;
        self.0 = rest;
        Ok(*head)
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        self.word().map(u64::from_le_bytes)
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        self.word().map(i64::from_le_bytes)
    }

    fn path(&mut self) -> Result<String, DecodeError> {
        let nul = self
            .0
            .iter()
            .position(|b| *b == 0)
            .ok_or(DecodeError::NotEnoughData("path terminator"))?;
        let s = String::from_utf8(self.0[..nul].to_vec())?;
        self.0 = &self.0[nul + 1..];
        Ok(s)
    }
}

impl Request {
    /// Operation code of this request.
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::ReadDir { .. } => Opcode::ReadDir,
            Self::GetFileInfo { .. } => Opcode::GetFileInfo,
            Self::GetDeviceInfo => Opcode::GetDeviceInfo,
            Self::FileOpen { .. } => Opcode::FileOpen,
            Self::FileRead { .. } => Opcode::FileRead,
            Self::FileWrite { .. } => Opcode::FileWrite,
            Self::FileSeek { .. } => Opcode::FileSeek,
            Self::FileTell { .. } => Opcode::FileTell,
            Self::FileSetSize { .. } => Opcode::FileSetSize,
            Self::FileLock { .. } => Opcode::FileLock,
            Self::FileClose { .. } => Opcode::FileClose,
            Self::RemovePath { .. } => Opcode::RemovePath,
            Self::RenamePath { .. } => Opcode::RenamePath,
            Self::MakeDir { .. } => Opcode::MakeDir,
            Self::Truncate { .. } => Opcode::Truncate,
            Self::MakeLink { .. } => Opcode::MakeLink,
            Self::SetFileModTime { .. } => Opcode::SetFileModTime,
            Self::RemovePathAndContents { .. } => Opcode::RemovePathAndContents,
        }
    }

    /// Encodes the request as packet number `packet_num`.
    pub fn into_packet(self, packet_num: u64) -> Packet {
        let opcode = self.opcode();
        let mut data = Vec::new();
        let args = match self {
            Self::ReadDir { path }
            | Self::GetFileInfo { path }
            | Self::RemovePath { path }
            | Self::MakeDir { path }
            | Self::RemovePathAndContents { path } => Args::default().path(&path),
            Self::GetDeviceInfo => Args::default(),
            Self::FileOpen { path, mode } => Args::default().u64(mode.code()).path(&path),
            Self::FileRead { handle, len } => Args::default().u64(handle).u64(len),
            Self::FileWrite { handle, data: bytes } => {
                data = bytes;
                Args::default().u64(handle)
            }
            Self::FileSeek {
                handle,
                whence,
                offset,
            } => Args::default().u64(handle).u64(whence.code()).i64(offset),
            Self::FileTell { handle } | Self::FileClose { handle } => Args::default().u64(handle),
            Self::FileSetSize { handle, size } => Args::default().u64(handle).u64(size),
            Self::FileLock { handle, op } => Args::default().u64(handle).u64(op.code()),
            Self::RenamePath { from, to } => Args::default().path(&from).path(&to),
            Self::Truncate { path, size } => Args::default().u64(size).path(&path),
            Self::MakeLink { kind, target, link } => {
                Args::default().u64(kind.code()).path(&target).path(&link)
            }
            Self::SetFileModTime { path, mtime_ns } => Args::default().u64(mtime_ns).path(&path),
        };
        Packet::new(opcode, packet_num, args.0, data)
    }

    /// Decodes a request packet (the device side of the exchange).
    pub fn from_packet(packet: &Packet) -> Result<Self, DecodeError> {
        let mut r = ArgReader(&packet.args);
        Ok(match packet.opcode {
            Opcode::ReadDir => Self::ReadDir { path: r.path()? },
            Opcode::GetFileInfo => Self::GetFileInfo { path: r.path()? },
            Opcode::GetDeviceInfo => Self::GetDeviceInfo,
            Opcode::FileOpen => {
                let mode = FileMode::try_from(r.u64()?)?;
                Self::FileOpen {
                    path: r.path()?,
                    mode,
                }
            }
            Opcode::FileRead => Self::FileRead {
                handle: r.u64()?,
                len: r.u64()?,
            },
            Opcode::FileWrite => Self::FileWrite {
                handle: r.u64()?,
                data: packet.data.clone(),
            },
            Opcode::FileSeek => Self::FileSeek {
                handle: r.u64()?,
                whence: Whence::try_from(r.u64()?)?,
                offset: r.i64()?,
            },
            Opcode::FileTell => Self::FileTell { handle: r.u64()? },
            Opcode::FileSetSize => Self::FileSetSize {
                handle: r.u64()?,
                size: r.u64()?,
            },
            Opcode::FileLock => Self::FileLock {
                handle: r.u64()?,
                op: LockOp::try_from(r.u64()?)?,
            },
            Opcode::FileClose => Self::FileClose { handle: r.u64()? },
            Opcode::RemovePath => Self::RemovePath { path: r.path()? },
            Opcode::RenamePath => Self::RenamePath {
                from: r.path()?,
                to: r.path()?,
            },
            Opcode::MakeDir => Self::MakeDir { path: r.path()? },
            Opcode::Truncate => {
                let size = r.u64()?;
                Self::Truncate {
                    path: r.path()?,
                    size,
                }
            }
            Opcode::MakeLink => Self::MakeLink {
                kind: LinkType::try_from(r.u64()?)?,
                target: r.path()?,
                link: r.path()?,
            },
            Opcode::SetFileModTime => {
                let mtime_ns = r.u64()?;
                Self::SetFileModTime {
                    path: r.path()?,
                    mtime_ns,
                }
            }
            Opcode::RemovePathAndContents => Self::RemovePathAndContents { path: r.path()? },
            other => return Err(DecodeError::UnknownOpcode(other.code())),
        })
    }
}

/// A reply sent from device to host.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Response {
    /// Completion status.
    Status(AfcStatus),
    /// Data block (file contents or a Dictionary Response).
    Data(Vec<u8>),
    /// Handle assigned by an open.
    FileHandle(u64),
    /// File position reported by a tell.
    Position(u64),
}

impl Response {
    /// Encodes the reply as packet number `packet_num`.
    pub fn into_packet(self, packet_num: u64) -> Packet {
        match self {
            Self::Status(status) => Packet::new(
                Opcode::Status,
                packet_num,
                status.code().to_le_bytes().to_vec(),
                Vec::new(),
            ),
            Self::Data(data) => Packet::new(Opcode::Data, packet_num, Vec::new(), data),
            Self::FileHandle(handle) => Packet::new(
                Opcode::FileOpenResult,
                packet_num,
                handle.to_le_bytes().to_vec(),
                Vec::new(),
            ),
            Self::Position(pos) => Packet::new(
                Opcode::FileTellResult,
                packet_num,
                pos.to_le_bytes().to_vec(),
                Vec::new(),
            ),
        }
    }

    /// Decodes a reply packet.
    ///
    /// The device is free to place reply bodies in either block, so both
    /// are read as one contiguous body.
    pub fn from_packet(packet: Packet) -> Result<Self, DecodeError> {
        let mut body = packet.args;
        body.extend_from_slice(&packet.data);
        let word = |body: &[u8]| {
            body.first_chunk::<8>()
                .map(|w| u64::from_le_bytes(*w))
                .ok_or(DecodeError::NotEnoughData("reply word"))
        };
        Ok(match packet.opcode {
            Opcode::Status => Self::Status(AfcStatus::from_code(word(&body)?)),
            Opcode::Data => Self::Data(body),
            Opcode::FileOpenResult => Self::FileHandle(word(&body)?),
            Opcode::FileTellResult => Self::Position(word(&body)?),
            other => {
                return Err(DecodeError::InvalidValue {
                    field: "reply operation",
                    value: other.code(),
                });
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_values_are_fixed() {
        assert_eq!(LockOp::Shared.code(), 5);
        assert_eq!(LockOp::Exclusive.code(), 6);
        assert_eq!(LockOp::Unlock.code(), 12);
        assert!(LockOp::try_from(2).is_err());
    }

    #[test]
    fn open_modes_cover_one_through_six() {
        for code in 1..=6 {
            assert_eq!(FileMode::try_from(code).unwrap().code(), code);
        }
        assert!(FileMode::try_from(0).is_err());
        assert!(FileMode::try_from(7).is_err());
    }

    #[test]
    fn open_packs_mode_before_path() {
        let packet = Request::FileOpen {
            path: "/DCIM".into(),
            mode: FileMode::ReadOnly,
        }
        .into_packet(4);
        assert_eq!(packet.opcode, Opcode::FileOpen);
        assert_eq!(&packet.args[..8], &1u64.to_le_bytes());
        assert_eq!(&packet.args[8..], b"/DCIM\0");
        assert!(packet.data.is_empty());
    }

    #[test]
    fn write_carries_data_block() {
        let packet = Request::FileWrite {
            handle: 2,
            data: b"payload".to_vec(),
        }
        .into_packet(1);
        assert_eq!(packet.args, 2u64.to_le_bytes());
        assert_eq!(packet.data, b"payload");
        assert_eq!(packet.header().this_len, 48);
    }

    #[test]
    fn device_side_decodes_requests() {
        let requests = [
            Request::RenamePath {
                from: "/a".into(),
                to: "/b".into(),
            },
            Request::FileSeek {
                handle: 9,
                whence: Whence::End,
                offset: -4,
            },
            Request::MakeLink {
                kind: LinkType::Symbolic,
                target: "/t".into(),
                link: "/l".into(),
            },
            Request::Truncate {
                path: "/f".into(),
                size: 10,
            },
        ];
        for req in requests {
            let packet = req.clone().into_packet(0);
            assert_eq!(Request::from_packet(&packet).unwrap(), req);
        }
    }

    #[test]
    fn unknown_status_code_still_parses() {
        let mut packet = Response::Status(AfcStatus::Success).into_packet(1);
        packet.args = 99u64.to_le_bytes().to_vec();
        assert_eq!(
            Response::from_packet(packet).unwrap(),
            Response::Status(AfcStatus::UnknownError)
        );
    }

    #[test]
    fn reply_body_may_span_blocks() {
        let packet = Packet::new(Opcode::Data, 1, b"a\0".to_vec(), b"b\0".to_vec());
        assert_eq!(
            Response::from_packet(packet).unwrap(),
            Response::Data(b"a\0b\0".to_vec())
        );
    }

    #[test]
    fn short_status_is_not_enough_data() {
        let packet = Packet::new(Opcode::Status, 1, vec![0; 3], Vec::new());
        assert!(matches!(
            Response::from_packet(packet),
            Err(DecodeError::NotEnoughData(_))
        ));
    }
}
