//! Device-reported AFC status codes.

use std::fmt;

/// Status codes carried by [`Opcode::Status`](super::Opcode::Status) replies.
///
/// Codes the device reports but this table does not know collapse to
/// [`AfcStatus::UnknownError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(u64)]
pub enum AfcStatus {
    /// Operation succeeded.
    Success = 0,
    /// Unknown or unmapped failure.
    UnknownError = 1,
    /// Packet header rejected.
    OpHeaderInvalid = 2,
    /// Out of resources.
    NoResources = 3,
    /// Read failed.
    ReadError = 4,
    /// Write failed.
    WriteError = 5,
    /// Operation code not understood.
    UnknownPacketType = 6,
    /// Invalid argument.
    InvalidArg = 7,
    /// No such file or handle.
    ObjectNotFound = 8,
    /// Path is a directory.
    ObjectIsDir = 9,
    /// Permission denied.
    PermDenied = 10,
    /// No service connection.
    ServiceNotConnected = 11,
    /// Operation timed out.
    OpTimeout = 12,
    /// More data than expected.
    TooMuchData = 13,
    /// End of data.
    EndOfData = 14,
    /// Operation not supported.
    OpNotSupported = 15,
    /// Object already exists.
    ObjectExists = 16,
    /// Object busy (e.g. already locked).
    ObjectBusy = 17,
    /// No space left on device.
    NoSpaceLeft = 18,
    /// Operation would block.
    OpWouldBlock = 19,
    /// I/O error.
    IoError = 20,
    /// Operation interrupted.
    OpInterrupted = 21,
    /// Operation already in progress.
    OpInProgress = 22,
    /// Internal device error.
    InternalError = 23,
    /// Multiplexer failure.
    MuxError = 30,
    /// Out of memory.
    NoMem = 31,
    /// Reply ended early.
    NotEnoughData = 32,
    /// Directory not empty.
    DirNotEmpty = 33,
}

impl AfcStatus {
    /// Every known status, ordered by code.
    const ALL: [Self; 28] = [
        Self::Success,
        Self::UnknownError,
        Self::OpHeaderInvalid,
        Self::NoResources,
        Self::ReadError,
        Self::WriteError,
        Self::UnknownPacketType,
        Self::InvalidArg,
        Self::ObjectNotFound,
        Self::ObjectIsDir,
        Self::PermDenied,
        Self::ServiceNotConnected,
        Self::OpTimeout,
        Self::TooMuchData,
        Self::EndOfData,
        Self::OpNotSupported,
        Self::ObjectExists,
        Self::ObjectBusy,
        Self::NoSpaceLeft,
        Self::OpWouldBlock,
        Self::IoError,
        Self::OpInterrupted,
        Self::OpInProgress,
        Self::InternalError,
        Self::MuxError,
        Self::NoMem,
        Self::NotEnoughData,
        Self::DirNotEmpty,
    ];

    /// Maps a wire code, collapsing unknown codes to [`AfcStatus::UnknownError`].
    pub fn from_code(code: u64) -> Self {
        Self::ALL
            .into_iter()
            .find(|s| s.code() == code)
            .unwrap_or(Self::UnknownError)
    }

    /// Wire value of this status.
    pub const fn code(self) -> u64 {
        self as u64
    }

    /// Human-readable description.
    pub const fn description(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::UnknownError => "unknown error",
            Self::OpHeaderInvalid => "invalid operation header",
            Self::NoResources => "no resources",
            Self::ReadError => "read error",
            Self::WriteError => "write error",
            Self::UnknownPacketType => "unknown packet type",
            Self::InvalidArg => "invalid argument",
            Self::ObjectNotFound => "object not found",
            Self::ObjectIsDir => "object is a directory",
            Self::PermDenied => "permission denied",
            Self::ServiceNotConnected => "service not connected",
            Self::OpTimeout => "operation timed out",
            Self::TooMuchData => "too much data",
            Self::EndOfData => "end of data",
            Self::OpNotSupported => "operation not supported",
            Self::ObjectExists => "object exists",
            Self::ObjectBusy => "object busy",
            Self::NoSpaceLeft => "no space left on device",
            Self::OpWouldBlock => "operation would block",
            Self::IoError => "I/O error",
            Self::OpInterrupted => "operation interrupted",
            Self::OpInProgress => "operation in progress",
            Self::InternalError => "internal error",
            Self::MuxError => "multiplexer error",
            Self::NoMem => "out of memory",
            Self::NotEnoughData => "not enough data",
            Self::DirNotEmpty => "directory not empty",
        }
    }
}

impl fmt::Display for AfcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}
