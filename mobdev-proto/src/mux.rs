//! usbmuxd packets: a 16-byte little-endian header wrapping an XML plist.
//!
//! Header fields are `length` (including the header), `version` (always 1
//! for plist messages), `message` (8 = plist) and a caller-chosen `tag`
//! echoed back in the reply.

use std::io::{self, Read, Write};

use plist::{Dictionary, Value};
use serde::Deserialize;

use crate::codec;

/// Length of the multiplexer header.
pub const HEADER_LEN: usize = 16;

/// Protocol version for plist messages.
pub const PROTOCOL_VERSION: u32 = 1;

/// Message type for plist payloads.
pub const MESSAGE_PLIST: u32 = 8;

/// Largest reply accepted from the daemon.
pub const MAX_PACKET: u32 = 4 * 1024 * 1024;

/// Port of the multiplexer TCP endpoint on platforms without Unix sockets.
pub const DEFAULT_TCP_PORT: u16 = 27015;

/// Result codes reported in `Result` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum MuxResult {
    /// Request accepted.
    Ok,
    /// Request not understood.
    BadCommand,
    /// No such device.
    BadDevice,
    /// The device refused the connection.
    ConnectionRefused,
    /// Protocol version not supported.
    BadVersion,
    /// Any other code.
    Other(u64),
}

impl MuxResult {
    /// Maps a raw result number.
    pub const fn from_code(code: u64) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::BadCommand,
            2 => Self::BadDevice,
            3 => Self::ConnectionRefused,
            6 => Self::BadVersion,
            other => Self::Other(other),
        }
    }
}

/// Parsed multiplexer header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct Header {
    /// Total packet length including the header.
    pub length: u32,
    /// Protocol version.
    pub version: u32,
    /// Message type.
    pub message: u32,
    /// Correlation tag.
    pub tag: u32,
}

impl Header {
    /// Parses a header, rejecting impossible lengths.
    pub fn from_bytes(buf: [u8; HEADER_LEN]) -> io::Result<Self> {
        let field = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let header = Self {
            length: field(0),
            version: field(4),
            message: field(8),
            tag: field(12),
        };
        if (header.length as usize) < HEADER_LEN || header.length > MAX_PACKET {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad multiplexer packet length {}", header.length),
            ));
        }
        Ok(header)
    }

    /// Length of the payload following the header.
    pub const fn payload_len(&self) -> usize {
        self.length as usize - HEADER_LEN
    }
}

/// Serializes `message` into a complete multiplexer packet.
pub fn to_packet(tag: u32, message: &Value) -> io::Result<Vec<u8>> {
    let mut payload = Vec::new();
    message
        .to_writer_xml(&mut payload)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let length = u32::try_from(HEADER_LEN + payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "packet exceeds u32::MAX"))?;

    let mut buf = Vec::with_capacity(length as usize);
    for field in [length, PROTOCOL_VERSION, MESSAGE_PLIST, tag] {
        buf.extend_from_slice(&field.to_le_bytes());
    }
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Writes one packet to `w`.
pub fn encode<W: Write>(w: &mut W, tag: u32, message: &Value) -> io::Result<()> {
    w.write_all(&to_packet(tag, message)?)?;
    w.flush()
}

/// Parses a payload that must hold a plist dictionary.
pub fn payload_dict(header: &Header, payload: &[u8]) -> io::Result<Dictionary> {
    if header.message != MESSAGE_PLIST {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected multiplexer message type {}", header.message),
        ));
    }
    codec::from_payload(payload)?
        .into_dictionary()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "expected a dictionary"))
}

/// Reads one packet from `r`, returning its tag and dictionary.
pub fn decode(r: &mut impl Read) -> io::Result<(u32, Dictionary)> {
    let mut head = [0u8; HEADER_LEN];
    r.read_exact(&mut head)?;
    let header = Header::from_bytes(head)?;
    let mut payload = vec![0u8; header.payload_len()];
    r.read_exact(&mut payload)?;
    Ok((header.tag, payload_dict(&header, &payload)?))
}

/// The `Properties` dictionary of an attached device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
#[non_exhaustive]
pub struct DeviceProperties {
    /// Device UDID.
    pub serial_number: String,
    /// `USB` or `Network`.
    pub connection_type: String,
    /// Multiplexer-assigned device id.
    #[serde(rename = "DeviceID")]
    pub device_id: u32,
    /// Encoded `sockaddr` for network devices.
    #[serde(default)]
    pub network_address: Option<plist::Data>,
}

impl DeviceProperties {
    /// Reads properties out of a plist value.
    pub fn from_value(value: &Value) -> Result<Self, plist::Error> {
        plist::from_value(value)
    }
}

/// Decodes the `sockaddr` blob a network device is reported with.
///
/// Byte 1 is the address family: `AF_INET` (2) carries the address at
/// bytes 4..8, `AF_INET6` (30 on Darwin, 10 on Linux) at bytes 8..24.
pub fn parse_network_address(raw: &[u8]) -> Option<std::net::IpAddr> {
    match *raw.get(1)? {
        0x02 => {
            let octets: [u8; 4] = raw.get(4..8)?.try_into().ok()?;
            Some(std::net::Ipv4Addr::from(octets).into())
        }
        0x0A | 0x1E => {
            let octets: [u8; 16] = raw.get(8..24)?.try_into().ok()?;
            Some(std::net::Ipv6Addr::from(octets).into())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listen() -> Value {
        let mut dict = Dictionary::new();
        dict.insert("MessageType".into(), "Listen".into());
        Value::Dictionary(dict)
    }

    #[test]
    fn header_fields_little_endian() {
        let bytes = to_packet(42, &listen()).unwrap();
        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize, bytes.len());
        assert_eq!(&bytes[4..8], &1u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &8u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &42u32.to_le_bytes());
    }

    #[test]
    fn decode_returns_tag_and_dict() {
        let bytes = to_packet(7, &listen()).unwrap();
        let (tag, dict) = decode(&mut io::Cursor::new(bytes)).unwrap();
        assert_eq!(tag, 7);
        assert_eq!(
            dict.get("MessageType").and_then(Value::as_string),
            Some("Listen")
        );
    }

    #[test]
    fn short_length_is_rejected() {
        let mut bytes = to_packet(1, &listen()).unwrap();
        bytes[..4].copy_from_slice(&3u32.to_le_bytes());
        assert!(decode(&mut io::Cursor::new(bytes)).is_err());
    }

    #[test]
    fn result_codes() {
        assert_eq!(MuxResult::from_code(0), MuxResult::Ok);
        assert_eq!(MuxResult::from_code(3), MuxResult::ConnectionRefused);
        assert_eq!(MuxResult::from_code(5), MuxResult::Other(5));
    }

    #[test]
    fn device_properties_from_plist() {
        let mut props = Dictionary::new();
        props.insert("SerialNumber".into(), "00008030-0011".into());
        props.insert("ConnectionType".into(), "USB".into());
        props.insert("DeviceID".into(), 3u64.into());
        props.insert("ProductID".into(), 4776u64.into());
        let parsed = DeviceProperties::from_value(&Value::Dictionary(props)).unwrap();
        assert_eq!(parsed.serial_number, "00008030-0011");
        assert_eq!(parsed.device_id, 3);
        assert!(parsed.network_address.is_none());
    }

    #[test]
    fn network_addresses() {
        let mut v4 = [0u8; 16];
        v4[1] = 0x02;
        v4[4..8].copy_from_slice(&[192, 168, 1, 20]);
        assert_eq!(
            parse_network_address(&v4),
            Some("192.168.1.20".parse().unwrap())
        );

        let mut v6 = [0u8; 28];
        v6[1] = 0x1E;
        v6[8] = 0xfe;
        v6[9] = 0x80;
        v6[23] = 1;
        assert_eq!(parse_network_address(&v6), Some("fe80::1".parse().unwrap()));
        assert_eq!(parse_network_address(&[0, 0x07]), None);
    }
}
