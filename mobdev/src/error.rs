//! Transport-level errors shared by every service client.

use std::io;

/// Alias for `Result<T, mobdev::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by device connections and the multiplexer.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A caller-supplied argument was rejected before touching the wire.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    /// No device with the requested identity is attached.
    #[error("no such device: {0}")]
    NoDevice(String),

    /// The multiplexer rejected or failed a request.
    #[error("multiplexer: {0}")]
    Mux(String),

    /// TLS setup or record processing failed.
    #[error("TLS: {0}")]
    Ssl(String),

    /// No data arrived before the receive timeout elapsed.
    #[error("receive timed out")]
    Timeout,

    /// The peer closed the stream.
    #[error("connection closed by peer")]
    EndOfStream,

    /// The connection was already disconnected.
    #[error("connection is closed")]
    Closed,

    /// The session handed its connection to a derived client.
    #[error("session is restricted after handing off its connection")]
    HandedOff,

    /// A received message could not be decoded.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// An I/O error from the underlying socket.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Numeric code in the transport taxonomy.
    pub const fn code(&self) -> i32 {
        match self {
            Self::InvalidArg(_) | Self::Closed | Self::HandedOff => -1,
            Self::NoDevice(_) => -3,
            Self::EndOfStream => -4,
            Self::Ssl(_) => -6,
            Self::Timeout => -7,
            Self::Mux(_) | Self::Malformed(_) | Self::Io(_) => -2,
        }
    }

    /// Whether the error came from the peer going away.
    pub const fn is_disconnect(&self) -> bool {
        matches!(self, Self::EndOfStream | Self::Closed)
    }
}

impl From<mobdev_proto::DecodeError> for Error {
    fn from(err: mobdev_proto::DecodeError) -> Self {
        match err {
            mobdev_proto::DecodeError::Io(io) => Self::Io(io),
            other => Self::Malformed(other.to_string()),
        }
    }
}

/// Maps a socket error, separating timeouts from hard failures.
pub(crate) fn from_io(err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::Timeout,
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => Error::EndOfStream,
        io::ErrorKind::InvalidData => Error::Malformed(err.to_string()),
        _ => Error::Io(err),
    }
}
