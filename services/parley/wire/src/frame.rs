//! Message framing for the wire protocol.
//!
//! This module provides the complete frame structure including fast header,
//! metadata, and payload handling.

use crate::codec::{get_meta_u32, parse_meta};
use crate::header::{crc32_fast_header, FastHeader, Flags, FAST_HEADER_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Maximum frame size (1 MiB default, 16 MiB hard limit)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;
/// Hard maximum frame size limit (16 MiB)
pub const HARD_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Maximum metadata size (64 KiB)
pub const MAX_META_SIZE: usize = 64 * 1024;

/// Complete wire frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Fast header (32 bytes)
    pub fast: FastHeader,
    /// Metadata as raw CBOR bytes
    pub meta_raw: Bytes,
    /// Payload or ciphertext
    pub payload_or_cipher: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(fast: FastHeader, meta_raw: Bytes, payload_or_cipher: Bytes) -> Self {
        Self {
            fast,
            meta_raw,
            payload_or_cipher,
        }
    }

    /// Get the total frame size when encoded
    pub fn encoded_size(&self) -> usize {
        let mut size = 4; // frame_len u32
        size += FAST_HEADER_SIZE;
        size += 4; // meta_len u32
        size += self.meta_raw.len();
        size += self.payload_or_cipher.len();

        size
    }

    /// Encode frame to a contiguous buffer
    pub fn encode(&self, max_frame_size: usize) -> Result<Bytes, crate::WireError> {
        let total_size = self.encoded_size();
        if total_size > max_frame_size {
            return Err(crate::WireError::Size(total_size));
        }

        let mut buf = BytesMut::with_capacity(total_size);

        // Frame length (everything after this u32)
        let frame_len = total_size - 4;
        buf.put_u32(frame_len as u32);

        self.fast.encode(&mut buf);

        buf.put_u32(self.meta_raw.len() as u32);
        buf.put_slice(&self.meta_raw);

        buf.put_slice(&self.payload_or_cipher);

        Ok(buf.freeze())
    }

    /// Check the `hdr_csum` metadata entry when the header asks for it
    pub fn verify_checksum(&self) -> Result<(), crate::WireError> {
        if !self.fast.flags.contains(Flags::HDR_CHECKSUM) {
            return Ok(());
        }

        let meta = parse_meta(&self.meta_raw).map_err(|_| crate::WireError::Meta)?;
        match get_meta_u32(&meta, "hdr_csum") {
            Some(expected) if expected == crc32_fast_header(&self.fast) => Ok(()),
            _ => Err(crate::WireError::HdrCsum),
        }
    }
}

/// Frame decoder for parsing incoming frames
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a decoder with a custom size limit (capped at the hard limit)
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(HARD_MAX_FRAME_SIZE),
        }
    }

    /// Decode one frame from a buffer
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, crate::WireError> {
        // Need at least 4 bytes for frame length
        if buf.len() < 4 {
            return Ok(None);
        }

        // Peek at frame length
        let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

        if frame_len > self.max_frame_size {
            return Err(crate::WireError::Size(frame_len));
        }

        // Check if we have the complete frame
        if buf.len() < 4 + frame_len {
            return Ok(None);
        }

        buf.advance(4);

        let mut frame_buf = buf.split_to(frame_len).freeze();
        let fast = FastHeader::decode(&mut frame_buf)?;

        if frame_buf.len() < 4 {
            return Err(crate::WireError::Malformed);
        }

        let meta_len = frame_buf.get_u32() as usize;
        if meta_len > MAX_META_SIZE || frame_buf.len() < meta_len {
            return Err(crate::WireError::Meta);
        }

        let meta_raw = frame_buf.split_to(meta_len);

        // Remaining bytes are payload
        let payload_or_cipher = frame_buf;

        Ok(Some(Frame {
            fast,
            meta_raw,
            payload_or_cipher,
        }))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameBuilder;
    use crate::header::FrameType;

    #[test]
    fn test_decode_waits_for_complete_frame() {
        let bytes = FrameBuilder::new(FastHeader::new(FrameType::Data, 5, 1))
            .meta_insert_str("dst", "org/alice/v1")
            .payload(Bytes::from_static(b"42"))
            .build(DEFAULT_MAX_FRAME_SIZE)
            .unwrap();

        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(&bytes[..bytes.len() - 1]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&bytes[bytes.len() - 1..]);
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.fast.session_id, 5);
        assert_eq!(frame.payload_or_cipher, Bytes::from_static(b"42"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_two_frames_back_to_back() {
        let first = FrameBuilder::new(FastHeader::new(FrameType::Ping, 0, 1))
            .build(DEFAULT_MAX_FRAME_SIZE)
            .unwrap();
        let second = FrameBuilder::new(FastHeader::new(FrameType::Pong, 0, 2))
            .build(DEFAULT_MAX_FRAME_SIZE)
            .unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&first);
        buf.extend_from_slice(&second);

        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap().fast.typ, FrameType::Ping);
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap().fast.typ, FrameType::Pong);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut decoder = FrameDecoder::with_max_frame_size(64);
        let mut buf = BytesMut::new();
        buf.put_u32(65);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(crate::WireError::Size(65))
        ));

        let frame = Frame::new(
            FastHeader::new(FrameType::Data, 0, 0),
            Bytes::new(),
            Bytes::from(vec![0u8; 128]),
        );
        assert!(frame.encode(64).is_err());
    }

    #[test]
    fn test_checksum_verification() {
        let mut fast = FastHeader::new(FrameType::Hello, 0, 1);
        fast.flags |= Flags::HDR_CHECKSUM;

        let bytes = FrameBuilder::new(fast)
            .meta_insert_str("name", "org/bob/v1")
            .build(DEFAULT_MAX_FRAME_SIZE)
            .unwrap();

        let mut decoder = FrameDecoder::new();
        let mut frame = decoder
            .decode(&mut BytesMut::from(bytes.as_ref()))
            .unwrap()
            .unwrap();
        assert!(frame.verify_checksum().is_ok());

        frame.fast.msg_id = 2;
        assert!(matches!(
            frame.verify_checksum(),
            Err(crate::WireError::HdrCsum)
        ));
    }
}
