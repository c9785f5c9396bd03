//! AFC client errors.

use std::io;

use mobdev_proto::DecodeError;
use mobdev_proto::afc::{AfcStatus, Opcode};

use crate::session::StartServiceError;

/// Errors from the AFC client.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AfcError {
    /// A caller-supplied argument was rejected before touching the wire.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    /// The client has no active session.
    #[error("service not connected")]
    NotConnected,

    /// The handle is not open on this client.
    #[error("unknown file handle {0}")]
    StaleHandle(u64),

    /// The device reported a failure status.
    #[error("{op:?} failed: {status}")]
    Status {
        /// Operation that failed.
        op: Opcode,
        /// Status reported by the device.
        status: AfcStatus,
    },

    /// A reply carried the wrong sequence number.
    #[error("reply {got} does not match request {expected}")]
    Sequence {
        /// Sequence number of the request.
        expected: u64,
        /// Sequence number of the reply.
        got: u64,
    },

    /// A reply of the wrong kind arrived.
    #[error("unexpected reply to {op:?}")]
    UnexpectedReply {
        /// Operation that was sent.
        op: Opcode,
    },

    /// A reply could not be decoded.
    #[error("malformed reply")]
    Decode(#[from] DecodeError),

    /// The connection failed.
    #[error(transparent)]
    Transport(crate::Error),

    /// The service could not be started.
    #[error(transparent)]
    Start(#[from] StartServiceError),
}

impl AfcError {
    /// Nearest status in the AFC taxonomy.
    pub const fn status(&self) -> AfcStatus {
        match self {
            Self::InvalidArg(_) => AfcStatus::InvalidArg,
            Self::NotConnected => AfcStatus::ServiceNotConnected,
            Self::StaleHandle(_) => AfcStatus::ObjectNotFound,
            Self::Status { status, .. } => *status,
            Self::Sequence { .. } => AfcStatus::OpHeaderInvalid,
            Self::UnexpectedReply { .. } => AfcStatus::UnknownPacketType,
            Self::Decode(_) => AfcStatus::NotEnoughData,
            Self::Transport(crate::Error::Timeout) => AfcStatus::OpTimeout,
            Self::Transport(_) | Self::Start(_) => AfcStatus::MuxError,
        }
    }
}

impl From<crate::Error> for AfcError {
    fn from(err: crate::Error) -> Self {
        match err {
            crate::Error::Closed | crate::Error::HandedOff => Self::NotConnected,
            other => Self::Transport(other),
        }
    }
}

impl From<AfcError> for io::Error {
    fn from(err: AfcError) -> Self {
        let kind = match err.status() {
            AfcStatus::ObjectNotFound => io::ErrorKind::NotFound,
            AfcStatus::PermDenied => io::ErrorKind::PermissionDenied,
            AfcStatus::ObjectExists => io::ErrorKind::AlreadyExists,
            AfcStatus::InvalidArg => io::ErrorKind::InvalidInput,
            AfcStatus::OpTimeout => io::ErrorKind::TimedOut,
            AfcStatus::OpWouldBlock | AfcStatus::ObjectBusy => io::ErrorKind::WouldBlock,
            AfcStatus::OpInterrupted => io::ErrorKind::Interrupted,
            AfcStatus::ServiceNotConnected => io::ErrorKind::NotConnected,
            _ => io::ErrorKind::Other,
        };
        Self::new(kind, err)
    }
}
