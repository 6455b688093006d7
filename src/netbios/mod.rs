//! NetBIOS over TCP (NBT) session framing
//!
//! Every message on an SMB connection is preceded by a 4-byte header: a type
//! byte followed by a 24-bit big-endian payload length. RFC 1002 only uses 17
//! bits of it, direct-hosted SMB uses all 24.

use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use std::convert::TryFrom;

pub mod frame;

pub use frame::{
    read_frame_recv, read_frame_send, write_frame_send, write_keepalive_send, Frame,
    ReadFrameState,
};

/// NetBIOS session message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NetBiosMessageType {
    SessionMessage = 0x00,
    SessionRequest = 0x81,
    PositiveResponse = 0x82,
    NegativeResponse = 0x83,
    RetargetResponse = 0x84,
    Keepalive = 0x85,
}

impl TryFrom<u8> for NetBiosMessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(NetBiosMessageType::SessionMessage),
            0x81 => Ok(NetBiosMessageType::SessionRequest),
            0x82 => Ok(NetBiosMessageType::PositiveResponse),
            0x83 => Ok(NetBiosMessageType::NegativeResponse),
            0x84 => Ok(NetBiosMessageType::RetargetResponse),
            0x85 => Ok(NetBiosMessageType::Keepalive),
            _ => Err(Error::Protocol(format!(
                "Invalid NetBIOS message type: 0x{:02x}",
                value
            ))),
        }
    }
}

/// NetBIOS Session Service header (4 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetBiosHeader {
    pub message_type: NetBiosMessageType,
    /// Payload length, 24 bits
    pub length: u32,
}

impl NetBiosHeader {
    pub const MAX_LENGTH: u32 = 0xFF_FFFF;

    pub const SIZE: usize = 4;

    pub fn new(message_type: NetBiosMessageType, length: u32) -> Result<Self> {
        if length > Self::MAX_LENGTH {
            return Err(Error::InvalidParameter(format!(
                "NetBIOS length {} exceeds maximum {}",
                length,
                Self::MAX_LENGTH
            )));
        }
        Ok(Self {
            message_type,
            length,
        })
    }

    /// Payload length announced by a raw header, whatever its type byte
    pub fn peek_length(buf: &[u8]) -> Result<u32> {
        if buf.len() < Self::SIZE {
            return Err(Error::BufferTooSmall {
                need: Self::SIZE,
                have: buf.len(),
            });
        }
        Ok(BigEndian::read_u24(&buf[1..Self::SIZE]))
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        let length = Self::peek_length(buf)?;
        Ok(Self {
            message_type: NetBiosMessageType::try_from(buf[0])?,
            length,
        })
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        let mut bytes = [0u8; 4];
        bytes[0] = self.message_type as u8;
        BigEndian::write_u24(&mut bytes[1..], self.length);
        bytes
    }

    pub fn write_to<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        if buf.remaining_mut() < Self::SIZE {
            return Err(Error::BufferTooSmall {
                need: Self::SIZE,
                have: buf.remaining_mut(),
            });
        }
        buf.put_slice(&self.to_bytes());
        Ok(())
    }
}

/// A complete NetBIOS message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetBiosMessage {
    pub header: NetBiosHeader,
    pub payload: Bytes,
}

impl NetBiosMessage {
    pub fn new(message_type: NetBiosMessageType, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        let length = u32::try_from(payload.len()).map_err(|_| {
            Error::InvalidParameter(format!("NetBIOS payload of {} bytes", payload.len()))
        })?;
        let header = NetBiosHeader::new(message_type, length)?;
        Ok(Self { header, payload })
    }

    pub fn session_message(payload: impl Into<Bytes>) -> Result<Self> {
        Self::new(NetBiosMessageType::SessionMessage, payload)
    }

    /// The 4-byte keepalive, type 0x85 with no payload
    pub fn keepalive() -> Self {
        Self {
            header: NetBiosHeader {
                message_type: NetBiosMessageType::Keepalive,
                length: 0,
            },
            payload: Bytes::new(),
        }
    }

    pub fn is_keepalive(&self) -> bool {
        self.header.message_type == NetBiosMessageType::Keepalive
    }

    /// Header and payload, ready to send
    pub fn to_bytes(&self) -> Bytes {
        let mut bytes = BytesMut::with_capacity(NetBiosHeader::SIZE + self.payload.len());
        bytes.put_slice(&self.header.to_bytes());
        bytes.put_slice(&self.payload);
        bytes.freeze()
    }

    /// Parse one message from the front of `buf`
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let header = NetBiosHeader::parse(buf)?;

        let total_len = NetBiosHeader::SIZE + header.length as usize;
        if buf.len() < total_len {
            return Err(Error::BufferTooSmall {
                need: total_len,
                have: buf.len(),
            });
        }

        let payload = Bytes::copy_from_slice(&buf[NetBiosHeader::SIZE..total_len]);
        Ok(Self { header, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_netbios_header_parse() {
        let bytes = [0x00, 0x00, 0x12, 0x34];
        let header = NetBiosHeader::parse(&bytes).unwrap();
        assert_eq!(header.message_type, NetBiosMessageType::SessionMessage);
        assert_eq!(header.length, 0x1234);
    }

    #[test]
    fn test_netbios_header_uses_all_24_bits() {
        let bytes = [0x00, 0x0A, 0xBC, 0xDE];
        assert_eq!(NetBiosHeader::parse(&bytes).unwrap().length, 0x0A_BCDE);

        let header = NetBiosHeader::new(NetBiosMessageType::SessionMessage, 0xFF_FFFF).unwrap();
        assert_eq!(header.to_bytes(), [0x00, 0xFF, 0xFF, 0xFF]);
        assert!(NetBiosHeader::new(NetBiosMessageType::SessionMessage, 0x100_0000).is_err());
    }

    #[test]
    fn test_netbios_message_types() {
        let bytes = [0x81, 0x00, 0x00, 0x10];
        let header = NetBiosHeader::parse(&bytes).unwrap();
        assert_eq!(header.message_type, NetBiosMessageType::SessionRequest);

        let bytes = [0x85, 0x00, 0x00, 0x00];
        let header = NetBiosHeader::parse(&bytes).unwrap();
        assert_eq!(header.message_type, NetBiosMessageType::Keepalive);

        assert!(matches!(
            NetBiosHeader::parse(&[0x42, 0, 0, 0]),
            Err(Error::Protocol(_))
        ));
        assert_eq!(NetBiosHeader::peek_length(&[0x42, 0, 0, 7]).unwrap(), 7);
    }

    #[test]
    fn test_netbios_header_short_buffer() {
        assert!(matches!(
            NetBiosHeader::parse(&[0x00, 0x00]),
            Err(Error::BufferTooSmall { need: 4, have: 2 })
        ));
        let mut small = [0u8; 3];
        let header = NetBiosHeader::new(NetBiosMessageType::SessionMessage, 1).unwrap();
        assert!(header.write_to(&mut &mut small[..]).is_err());
    }

    #[test]
    fn test_netbios_message_parse_truncated() {
        let msg = NetBiosMessage::session_message(&b"hello"[..]).unwrap();
        let bytes = msg.to_bytes();
        assert_eq!(NetBiosMessage::parse(&bytes).unwrap(), msg);
        assert!(matches!(
            NetBiosMessage::parse(&bytes[..6]),
            Err(Error::BufferTooSmall { need: 9, have: 6 })
        ));
    }

    #[test]
    fn test_keepalive_message() {
        let msg = NetBiosMessage::keepalive();
        assert!(msg.is_keepalive());
        assert_eq!(&msg.to_bytes()[..], [0x85, 0x00, 0x00, 0x00]);
    }
}
