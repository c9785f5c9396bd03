//! Wire formats for host↔device service communication.
//!
//! Three framings are used by device services:
//!
//! - **Property-list frames** ([`codec`]): a 4-byte big-endian length prefix
//!   followed by an XML or binary plist. Used by lockdown and most services.
//! - **AFC packets** ([`afc`]): the binary file-access protocol with a fixed
//!   40-byte little-endian header, an argument block and a data block.
//! - **Multiplexer packets** ([`mux`]): the 16-byte usbmuxd header wrapping
//!   a plist payload.
//!
//! Nothing in this crate touches a socket; every encoder and decoder works
//! over [`std::io::Read`] / [`std::io::Write`] or plain byte slices.

pub mod afc;
pub mod codec;
mod error;
pub mod message;
pub mod mux;

pub use codec::{Format, decode, decode_dict, encode};
pub use error::DecodeError;
pub use message::{DictExt, Request};
