//! Decode errors for the binary wire formats.

use std::io;

/// Errors raised while decoding AFC or multiplexer packets.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// The packet did not start with the expected magic.
    #[error("bad packet magic")]
    BadMagic,

    /// Header lengths are inconsistent with each other.
    #[error("inconsistent packet lengths: entire {entire}, header {this}")]
    BadLength {
        /// Declared length of the whole packet.
        entire: u64,
        /// Declared length of header plus argument block.
        this: u64,
    },

    /// The declared packet size exceeds the accepted maximum.
    #[error("packet of {0} bytes exceeds limit")]
    TooLarge(u64),

    /// The operation code is not one this crate knows.
    #[error("unknown operation code {0:#x}")]
    UnknownOpcode(u64),

    /// A numeric argument is outside its enumerated range.
    #[error("invalid {field} value {value}")]
    InvalidValue {
        /// Name of the offending argument.
        field: &'static str,
        /// The raw value received.
        value: u64,
    },

    /// The buffer ended before the structure was complete.
    #[error("not enough data: {0}")]
    NotEnoughData(&'static str),

    /// A string field was not valid UTF-8.
    #[error("string is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// Reading from the underlying stream failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}
