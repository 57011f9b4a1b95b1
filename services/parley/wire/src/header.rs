//! Fast header processing for the wire protocol.
//!
//! This module defines the 32-byte fast header that lets the overlay node
//! route and acknowledge frames without decoding metadata or payload.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Fast header size in bytes
pub const FAST_HEADER_SIZE: usize = 32;

/// Default TTL for new frames
pub const DEFAULT_TTL: u8 = 16;

/// Frame types as defined in the wire protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameType {
    /// Session payload
    Data = 0x00,
    /// Acknowledgment of a request, `corr_id` carries the acked `msg_id`
    Ack = 0x01,
    /// Ping frame
    Ping = 0x02,
    /// Pong frame
    Pong = 0x03,
    /// Hello frame for connection authorisation
    Hello = 0x04,
    /// Register a name as reachable on this connection
    Subscribe = 0x05,
    /// Ask a remote name to join a session
    SessionRequest = 0x06,
    /// Remote accepted a session
    SessionAccept = 0x07,
    /// Session teardown
    SessionClose = 0x08,
}

impl FrameType {
    /// Whether the overlay forwards this frame type by destination name
    pub fn is_routed(self) -> bool {
        matches!(
            self,
            FrameType::Data
                | FrameType::SessionRequest
                | FrameType::SessionAccept
                | FrameType::SessionClose
        )
    }
}

impl TryFrom<u8> for FrameType {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(FrameType::Data),
            0x01 => Ok(FrameType::Ack),
            0x02 => Ok(FrameType::Ping),
            0x03 => Ok(FrameType::Pong),
            0x04 => Ok(FrameType::Hello),
            0x05 => Ok(FrameType::Subscribe),
            0x06 => Ok(FrameType::SessionRequest),
            0x07 => Ok(FrameType::SessionAccept),
            0x08 => Ok(FrameType::SessionClose),
            _ => Err(crate::WireError::Type(value)),
        }
    }
}

bitflags! {
    /// Frame flags bitmask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Flags: u16 {
        /// Payload is E2E encrypted (meta carries the nonce)
        const E2E_ENC = 1 << 0;
        /// Meta has "hdr_csum" u32; wire readers may validate
        const HDR_CHECKSUM = 1 << 1;
    }
}

/// Status codes for control frames and NACK semantics
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    /// Success
    Ok = 0,
    /// Retryable error
    Retryable = 1,
    /// Fatal error
    Fatal = 2,
    /// Service busy
    Busy = 3,
    /// Unsupported operation
    Unsupported = 4,
}

impl TryFrom<u8> for StatusCode {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StatusCode::Ok),
            1 => Ok(StatusCode::Retryable),
            2 => Ok(StatusCode::Fatal),
            3 => Ok(StatusCode::Busy),
            4 => Ok(StatusCode::Unsupported),
            _ => Err(crate::WireError::Code(value)),
        }
    }
}

/// Fast header structure (32 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastHeader {
    /// Protocol version (must be 1)
    pub ver: u8,
    /// Frame type
    pub typ: FrameType,
    /// Frame flags
    pub flags: Flags,
    /// Status code for control frames
    pub code: StatusCode,
    /// TTL decremented at each forward
    pub ttl: u8,
    /// Reserved field (must be zero)
    pub reserved0: u16,
    /// Monotonically increasing per connection, 0 when no ack is wanted
    pub msg_id: u64,
    /// Correlation ID (0 if none)
    pub corr_id: u64,
    /// Session the frame belongs to (0 for connection-level frames)
    pub session_id: u64,
}

impl FastHeader {
    /// Create a new fast header with default values
    pub fn new(typ: FrameType, session_id: u64, msg_id: u64) -> Self {
        Self {
            ver: WIRE_VERSION,
            typ,
            flags: Flags::empty(),
            code: StatusCode::Ok,
            ttl: DEFAULT_TTL,
            reserved0: 0,
            msg_id,
            corr_id: 0,
            session_id,
        }
    }

    /// Create an ACK answering `acked_msg_id`
    pub fn ack(acked_msg_id: u64, session_id: u64, code: StatusCode) -> Self {
        let mut header = Self::new(FrameType::Ack, session_id, 0);
        header.corr_id = acked_msg_id;
        header.code = code;
        header
    }

    /// Encode the fast header to bytes (big-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.ver);
        buf.put_u8(self.typ as u8);
        buf.put_u16(self.flags.bits());
        buf.put_u8(self.code as u8);
        buf.put_u8(self.ttl);
        buf.put_u16(self.reserved0);
        buf.put_u64(self.msg_id);
        buf.put_u64(self.corr_id);
        buf.put_u64(self.session_id);
    }

    /// Decode the fast header from bytes (big-endian)
    pub fn decode(buf: &mut Bytes) -> Result<Self, crate::WireError> {
        if buf.len() < FAST_HEADER_SIZE {
            return Err(crate::WireError::Incomplete);
        }

        let ver = buf.get_u8();
        if ver != WIRE_VERSION {
            return Err(crate::WireError::Version(ver));
        }

        let typ = FrameType::try_from(buf.get_u8())?;
        let flags = Flags::from_bits(buf.get_u16()).ok_or(crate::WireError::Reserved)?;
        let code = StatusCode::try_from(buf.get_u8())?;
        let ttl = buf.get_u8();
        let reserved0 = buf.get_u16();

        if reserved0 != 0 {
            return Err(crate::WireError::Reserved);
        }

        if ttl == 0 {
            return Err(crate::WireError::Ttl);
        }

        let msg_id = buf.get_u64();
        let corr_id = buf.get_u64();
        let session_id = buf.get_u64();

        Ok(Self {
            ver,
            typ,
            flags,
            code,
            ttl,
            reserved0,
            msg_id,
            corr_id,
            session_id,
        })
    }

    /// Validate the fast header
    pub fn validate(&self) -> Result<(), crate::WireError> {
        if self.ver != WIRE_VERSION {
            return Err(crate::WireError::Version(self.ver));
        }

        if self.reserved0 != 0 {
            return Err(crate::WireError::Reserved);
        }

        if self.ttl == 0 {
            return Err(crate::WireError::Ttl);
        }

        Ok(())
    }

    /// Decrement TTL for forwarding
    pub fn decrement_ttl(&mut self) -> Result<(), crate::WireError> {
        if self.ttl <= 1 {
            return Err(crate::WireError::Ttl);
        }
        self.ttl -= 1;
        Ok(())
    }
}

/// CRC32 checksum over the encoded fast header
pub fn crc32_fast_header(fast: &FastHeader) -> u32 {
    let mut hasher = crc32fast::Hasher::new();

    let mut buf = BytesMut::with_capacity(FAST_HEADER_SIZE);
    fast.encode(&mut buf);
    hasher.update(&buf);

    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::try_from(0x00).unwrap(), FrameType::Data);
        assert_eq!(FrameType::try_from(0x08).unwrap(), FrameType::SessionClose);
        assert!(FrameType::try_from(0x09).is_err());
        assert!(FrameType::try_from(0xFF).is_err());
    }

    #[test]
    fn test_routed_frame_types() {
        assert!(FrameType::Data.is_routed());
        assert!(FrameType::SessionRequest.is_routed());
        assert!(!FrameType::Subscribe.is_routed());
        assert!(!FrameType::Ack.is_routed());
    }

    #[test]
    fn test_fast_header_encode_decode() {
        let mut header = FastHeader::new(FrameType::Data, 0xFEDCBA0987654321, 42);
        header.flags = Flags::E2E_ENC;
        header.corr_id = 123;

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), FAST_HEADER_SIZE);

        let mut bytes = buf.freeze();
        let decoded = FastHeader::decode(&mut bytes).unwrap();

        assert_eq!(header, decoded);
    }

    #[test]
    fn test_ack_header() {
        let header = FastHeader::ack(7, 99, StatusCode::Fatal);
        assert_eq!(header.typ, FrameType::Ack);
        assert_eq!(header.corr_id, 7);
        assert_eq!(header.msg_id, 0);
        assert_eq!(header.session_id, 99);
        assert_eq!(header.code, StatusCode::Fatal);
    }

    #[test]
    fn test_ttl_decrement() {
        let mut header = FastHeader::new(FrameType::Data, 1, 3);
        header.ttl = 2;

        assert!(header.decrement_ttl().is_ok());
        assert_eq!(header.ttl, 1);

        assert!(header.decrement_ttl().is_err()); // TTL would become 0
        assert_eq!(header.ttl, 1);
    }

    #[test]
    fn test_header_validation() {
        let header = FastHeader::new(FrameType::Data, 1, 3);
        assert!(header.validate().is_ok());

        let mut bad_header = header;
        bad_header.ver = 2;
        assert!(bad_header.validate().is_err());

        let mut bad_header = header;
        bad_header.reserved0 = 1;
        assert!(bad_header.validate().is_err());

        let mut bad_header = header;
        bad_header.ttl = 0;
        assert!(bad_header.validate().is_err());
    }

    #[test]
    fn test_checksum_covers_header_fields() {
        let a = FastHeader::new(FrameType::Data, 1, 3);
        let mut b = a;
        b.session_id = 2;
        assert_ne!(crc32_fast_header(&a), crc32_fast_header(&b));
        assert_eq!(crc32_fast_header(&a), crc32_fast_header(&a));
    }
}
