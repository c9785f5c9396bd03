//! The AFC (Apple File Conduit) binary packet protocol.
//!
//! Every packet is a 40-byte little-endian [`Header`] followed by an
//! argument block (handles, modes, NUL-terminated paths) and an optional
//! data block (file contents). The header's `this_len` covers header plus
//! argument block; `entire_len` additionally covers the data block.
//!
//! [`Request`] and [`Response`] give the typed view of both directions and
//! encode to / decode from [`Packet`]s, so the same code drives the client
//! and test doubles of the device.

mod packet;
mod request;
mod status;
mod strings;

pub use packet::{Header, Opcode, Packet};
pub use request::{FileMode, LinkType, LockOp, Request, Response, Whence};
pub use status::AfcStatus;
pub use strings::{decode_pairs, decode_payload, decode_strings, encode_payload};

/// Packet magic, `CFA6LPAA`.
pub const MAGIC: [u8; 8] = *b"CFA6LPAA";

/// Length of the fixed packet header.
pub const HEADER_LEN: usize = 40;

/// Largest read requested in a single packet.
pub const MAX_READ_SIZE: usize = 64 * 1024;

/// Largest data block sent in a single write packet.
pub const MAX_WRITE_SIZE: usize = 1024 * 1024;

/// Largest packet accepted from the peer.
pub const MAX_PACKET_SIZE: u64 = 16 * 1024 * 1024;
