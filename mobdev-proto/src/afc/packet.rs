//! Packet header and raw packet framing.

use std::io::{Read, Write};

use super::{HEADER_LEN, MAGIC, MAX_PACKET_SIZE};
use crate::DecodeError;

/// AFC operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(u64)]
pub enum Opcode {
    /// Status reply carrying an [`AfcStatus`](super::AfcStatus) code.
    Status = 0x01,
    /// Data reply.
    Data = 0x02,
    /// List a directory.
    ReadDir = 0x03,
    /// Truncate a file by path.
    Truncate = 0x07,
    /// Remove a file or empty directory.
    RemovePath = 0x08,
    /// Create a directory.
    MakeDir = 0x09,
    /// Query file attributes.
    GetFileInfo = 0x0A,
    /// Query device file-system attributes.
    GetDeviceInfo = 0x0B,
    /// Open a file.
    FileOpen = 0x0D,
    /// Reply to [`Opcode::FileOpen`] carrying the handle.
    FileOpenResult = 0x0E,
    /// Read from a handle.
    FileRead = 0x0F,
    /// Write to a handle.
    FileWrite = 0x10,
    /// Move a handle's position.
    FileSeek = 0x11,
    /// Query a handle's position.
    FileTell = 0x12,
    /// Reply to [`Opcode::FileTell`] carrying the position.
    FileTellResult = 0x13,
    /// Close a handle.
    FileClose = 0x14,
    /// Resize an open file.
    FileSetSize = 0x15,
    /// Rename a path.
    RenamePath = 0x18,
    /// Lock or unlock a handle.
    FileLock = 0x1B,
    /// Create a hard or symbolic link.
    MakeLink = 0x1C,
    /// Set a file's modification time.
    SetFileModTime = 0x1E,
    /// Remove a path recursively.
    RemovePathAndContents = 0x22,
}

impl Opcode {
    /// Every known operation, in wire order.
    const ALL: [Self; 22] = [
        Self::Status,
        Self::Data,
        Self::ReadDir,
        Self::Truncate,
        Self::RemovePath,
        Self::MakeDir,
        Self::GetFileInfo,
        Self::GetDeviceInfo,
        Self::FileOpen,
        Self::FileOpenResult,
        Self::FileRead,
        Self::FileWrite,
        Self::FileSeek,
        Self::FileTell,
        Self::FileTellResult,
        Self::FileClose,
        Self::FileSetSize,
        Self::RenamePath,
        Self::FileLock,
        Self::MakeLink,
        Self::SetFileModTime,
        Self::RemovePathAndContents,
    ];

    /// Wire value of this operation.
    pub const fn code(self) -> u64 {
        self as u64
    }
}

impl TryFrom<u64> for Opcode {
    type Error = DecodeError;

    fn try_from(code: u64) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|op| op.code() == code)
            .ok_or(DecodeError::UnknownOpcode(code))
    }
}

/// The fixed 40-byte packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct Header {
    /// Length of the whole packet.
    pub entire_len: u64,
    /// Length of the header plus argument block.
    pub this_len: u64,
    /// Sequence number correlating a reply with its request.
    pub packet_num: u64,
    /// Raw operation code.
    pub operation: u64,
}

impl Header {
    /// Serializes the header in wire order.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[..8].copy_from_slice(&MAGIC);
        buf[8..16].copy_from_slice(&self.entire_len.to_le_bytes());
        buf[16..24].copy_from_slice(&self.this_len.to_le_bytes());
        buf[24..32].copy_from_slice(&self.packet_num.to_le_bytes());
        buf[32..40].copy_from_slice(&self.operation.to_le_bytes());
        buf
    }

    /// Parses and validates a header.
    pub fn from_bytes(buf: &[u8; HEADER_LEN]) -> Result<Self, DecodeError> {
        if buf[..8] != MAGIC {
            return Err(DecodeError::BadMagic);
        }
        let word = |at: usize| {
            let mut le = [0u8; 8];
            le.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(le)
        };
        let header = Self {
            entire_len: word(8),
            this_len: word(16),
            packet_num: word(24),
            operation: word(32),
        };
        if header.this_len < HEADER_LEN as u64 || header.entire_len < header.this_len {
            return Err(DecodeError::BadLength {
                entire: header.entire_len,
                this: header.this_len,
            });
        }
        if header.entire_len > MAX_PACKET_SIZE {
            return Err(DecodeError::TooLarge(header.entire_len));
        }
        Ok(header)
    }

    /// Total packet length as a buffer size.
    pub fn packet_len(&self) -> usize {
        usize::try_from(self.entire_len).unwrap_or(usize::MAX)
    }
}

/// One AFC packet: operation, sequence number, argument and data blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Packet {
    /// Operation carried by the packet.
    pub opcode: Opcode,
    /// Sequence number.
    pub packet_num: u64,
    /// Argument block (counted in `this_len`).
    pub args: Vec<u8>,
    /// Data block.
    pub data: Vec<u8>,
}

impl Packet {
    /// Creates a packet.
    pub const fn new(opcode: Opcode, packet_num: u64, args: Vec<u8>, data: Vec<u8>) -> Self {
        Self {
            opcode,
            packet_num,
            args,
            data,
        }
    }

    /// Header describing this packet.
    pub fn header(&self) -> Header {
        let this_len = (HEADER_LEN + self.args.len()) as u64;
        Header {
            entire_len: this_len + self.data.len() as u64,
            this_len,
            packet_num: self.packet_num,
            operation: self.opcode.code(),
        }
    }

    /// Serializes the whole packet.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.args.len() + self.data.len());
        buf.extend_from_slice(&self.header().to_bytes());
        buf.extend_from_slice(&self.args);
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Parses a complete packet held in `buf`.
    ///
    /// `buf` must contain exactly the number of bytes the header declares.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, DecodeError> {
        let head: &[u8; HEADER_LEN] = buf
            .get(..HEADER_LEN)
            .and_then(|h| h.try_into().ok())
            .ok_or(DecodeError::NotEnoughData("packet header"))?;
        let header = Header::from_bytes(head)?;
        if buf.len() as u64 != header.entire_len {
            return Err(DecodeError::BadLength {
                entire: buf.len() as u64,
                this: header.this_len,
            });
        }
        let split = usize::try_from(header.this_len).unwrap_or(usize::MAX);
        Ok(Self {
            opcode: Opcode::try_from(header.operation)?,
            packet_num: header.packet_num,
            args: buf[HEADER_LEN..split].to_vec(),
            data: buf[split..].to_vec(),
        })
    }

    /// Writes the packet to `w`.
    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(&self.to_bytes())?;
        w.flush()
    }

    /// Reads exactly one packet from `r`.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        let mut head = [0u8; HEADER_LEN];
        r.read_exact(&mut head)?;
        let header = Header::from_bytes(&head)?;
        let mut buf = vec![0u8; header.packet_len()];
        buf[..HEADER_LEN].copy_from_slice(&head);
        r.read_exact(&mut buf[HEADER_LEN..])?;
        Self::from_bytes(&buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_little_endian() {
        let packet = Packet::new(Opcode::FileRead, 7, vec![0xAA; 16], vec![1, 2, 3]);
        let bytes = packet.to_bytes();
        assert_eq!(&bytes[..8], b"CFA6LPAA");
        assert_eq!(bytes[8], 40 + 16 + 3);
        assert_eq!(bytes[16], 40 + 16);
        assert_eq!(bytes[24], 7);
        assert_eq!(bytes[32], 0x0F);
        assert_eq!(bytes.len(), 59);
    }

    #[test]
    fn read_from_stream_splits_blocks() {
        let packet = Packet::new(Opcode::FileWrite, 3, 9u64.to_le_bytes().to_vec(), b"hi".to_vec());
        let mut cursor = std::io::Cursor::new(packet.to_bytes());
        let back = Packet::read_from(&mut cursor).unwrap();
        assert_eq!(back.args, 9u64.to_le_bytes());
        assert_eq!(back.data, b"hi");
        assert_eq!(back.packet_num, 3);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = Packet::new(Opcode::Status, 0, vec![], vec![]).to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            Packet::from_bytes(&bytes),
            Err(DecodeError::BadMagic)
        ));
    }

    #[test]
    fn rejects_inconsistent_lengths() {
        let mut header = Packet::new(Opcode::Data, 1, vec![], vec![]).header();
        header.this_len = 60;
        header.entire_len = 50;
        assert!(matches!(
            Header::from_bytes(&header.to_bytes()),
            Err(DecodeError::BadLength { .. })
        ));
    }

    #[test]
    fn rejects_unknown_opcode() {
        let mut bytes = Packet::new(Opcode::Status, 0, vec![], vec![]).to_bytes();
        bytes[32] = 0x7F;
        assert!(matches!(
            Packet::from_bytes(&bytes),
            Err(DecodeError::UnknownOpcode(0x7F))
        ));
    }

    #[test]
    fn truncated_stream_is_io_error() {
        let bytes = Packet::new(Opcode::Data, 1, vec![], vec![0; 10]).to_bytes();
        let mut cursor = std::io::Cursor::new(&bytes[..45]);
        assert!(matches!(
            Packet::read_from(&mut cursor),
            Err(DecodeError::Io(_))
        ));
    }
}
