//! Length-prefixed property-list frame codec over any `Read`/`Write` stream.
//!
//! Each frame is: `[u32 big-endian length][plist payload]`. Requests are
//! written as XML unless the service expects binary; either encoding is
//! accepted on read.

use std::io::{self, Read, Write};

use plist::{Dictionary, Value};

/// Maximum allowed frame payload (16 MiB).
pub const MAX_FRAME: u32 = 16 * 1024 * 1024;

/// Size of the big-endian length prefix.
pub const PREFIX_LEN: usize = 4;

/// Property-list encoding used for outgoing frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum Format {
    /// XML property list (lockdown and most services).
    #[default]
    Xml,
    /// Binary property list (DeviceLink services).
    Binary,
}

/// Serializes `value` into a complete frame: prefix followed by payload.
pub fn to_frame(value: &Value, format: Format) -> io::Result<Vec<u8>> {
    let mut payload = Vec::new();
    match format {
        Format::Xml => value.to_writer_xml(&mut payload),
        Format::Binary => value.to_writer_binary(&mut payload),
    }
    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "frame exceeds 16 MiB limit"))?;

    let mut frame = Vec::with_capacity(PREFIX_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Parses a length prefix, rejecting frames above [`MAX_FRAME`].
pub fn payload_len(prefix: [u8; PREFIX_LEN]) -> io::Result<usize> {
    let len = u32::from_be_bytes(prefix);
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds 16 MiB limit",
        ));
    }
    Ok(len as usize)
}

/// Parses a frame payload (without prefix) in either plist encoding.
pub fn from_payload(payload: &[u8]) -> io::Result<Value> {
    Value::from_reader(io::Cursor::new(payload))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Encodes `value` as a length-prefixed frame and writes it to `w`.
pub fn encode<W: Write>(w: &mut W, value: &Value, format: Format) -> io::Result<()> {
    w.write_all(&to_frame(value, format)?)?;
    w.flush()
}

/// Reads one length-prefixed frame from `r` and parses its payload.
pub fn decode(r: &mut impl Read) -> io::Result<Value> {
    let mut prefix = [0u8; PREFIX_LEN];
    r.read_exact(&mut prefix)?;
    let mut payload = vec![0u8; payload_len(prefix)?];
    r.read_exact(&mut payload)?;
    from_payload(&payload)
}

/// Like [`decode`], but requires the top-level value to be a dictionary.
pub fn decode_dict(r: &mut impl Read) -> io::Result<Dictionary> {
    decode(r)?
        .into_dictionary()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "expected a dictionary"))
}
