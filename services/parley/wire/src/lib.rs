//! Wire protocol framing, encoding/decoding and payload sealing for parley.
//!
//! This crate provides the frame format spoken between parley clients and
//! the overlay node: a fixed fast header for routing and acknowledgement,
//! CBOR metadata for names and options, and an optionally sealed payload.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 frame_len        | length of bytes that follow|
//! +----------------------+----------------------------+
//! | Fast Header (32B)    | type, ids, status, ttl     |
//! +----------------------+----------------------------+
//! | u32 meta_len         | canonical CBOR map length  |
//! +----------------------+----------------------------+
//! | meta_bytes           | metadata (CBOR)            |
//! +----------------------+----------------------------+
//! | payload_or_cipher    | variable (0..N)            |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;
pub mod header;

// Re-export main types
pub use codec::{
    get_meta_bool, get_meta_bytes, get_meta_str, get_meta_u32, get_user_meta, parse_meta,
    CodecError, EncAlg, FrameBuilder, MetaBuilder, KEY_LEN, NONCE_LEN, USER_META_PREFIX,
};
pub use error::WireError;
pub use frame::{Frame, FrameDecoder, DEFAULT_MAX_FRAME_SIZE, HARD_MAX_FRAME_SIZE, MAX_META_SIZE};
pub use header::{
    crc32_fast_header, FastHeader, Flags, FrameType, StatusCode, DEFAULT_TTL, FAST_HEADER_SIZE,
    WIRE_VERSION,
};

#[cfg(feature = "crypto")]
pub use codec::{open_aead, seal_aead, CryptoParams};
