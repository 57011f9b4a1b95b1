//! Encoding and decoding for the wire protocol.
//!
//! This module provides frame builders, CBOR metadata helpers, and optional
//! AEAD crypto operations for end-to-end encryption.

use crate::frame::Frame;
use crate::header::{crc32_fast_header, FastHeader, Flags};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Prefix for application metadata keys carried alongside a payload
pub const USER_META_PREFIX: &str = "x-";

/// AEAD nonce length in bytes
pub const NONCE_LEN: usize = 12;

/// AEAD key length in bytes
pub const KEY_LEN: usize = 32;

/// Encryption algorithms
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncAlg {
    /// No encryption
    None = 0,
    /// ChaCha20-Poly1305
    Chacha20Poly1305 = 1,
}

/// Crypto parameters for frame building
#[cfg(feature = "crypto")]
#[derive(Clone)]
pub struct CryptoParams {
    /// Encryption algorithm
    pub enc_alg: EncAlg,
    /// Symmetric key
    pub key: [u8; KEY_LEN],
    /// Nonce for AEAD
    pub nonce: [u8; NONCE_LEN],
    /// Additional authenticated data
    pub aad: Bytes,
}

#[cfg(feature = "crypto")]
impl std::fmt::Debug for CryptoParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoParams")
            .field("enc_alg", &self.enc_alg)
            .field("key", &"<redacted>")
            .field("nonce", &self.nonce)
            .finish()
    }
}

/// CBOR metadata builder helper
#[derive(Debug, Clone)]
pub struct MetaBuilder {
    map: BTreeMap<String, ciborium::Value>,
}

impl MetaBuilder {
    /// Create a new metadata builder
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    /// Insert a string value
    pub fn insert_str(mut self, key: &str, value: &str) -> Self {
        self.map
            .insert(key.to_string(), ciborium::Value::Text(value.to_string()));
        self
    }

    /// Insert a u32 value
    pub fn insert_u32(mut self, key: &str, value: u32) -> Self {
        self.map
            .insert(key.to_string(), ciborium::Value::Integer(value.into()));
        self
    }

    /// Insert binary data
    pub fn insert_bytes(mut self, key: &str, value: &[u8]) -> Self {
        self.map
            .insert(key.to_string(), ciborium::Value::Bytes(value.to_vec()));
        self
    }

    /// Insert a boolean value
    pub fn insert_bool(mut self, key: &str, value: bool) -> Self {
        self.map.insert(key.to_string(), ciborium::Value::Bool(value));
        self
    }

    /// Build the metadata as CBOR bytes
    pub fn build(self) -> Result<Bytes, CodecError> {
        let value = ciborium::Value::Map(
            self.map
                .into_iter()
                .map(|(k, v)| (ciborium::Value::Text(k), v))
                .collect(),
        );

        let mut buf = Vec::new();
        ciborium::into_writer(&value, &mut buf).map_err(|_| CodecError::MetaEncode)?;

        Ok(Bytes::from(buf))
    }
}

impl Default for MetaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame builder for constructing wire frames
#[derive(Debug)]
pub struct FrameBuilder {
    fast: FastHeader,
    #[cfg(feature = "crypto")]
    crypto: Option<CryptoParams>,
    meta: MetaBuilder,
    payload: Bytes,
}

impl FrameBuilder {
    /// Create a new frame builder
    pub fn new(fast: FastHeader) -> Self {
        Self {
            fast,
            #[cfg(feature = "crypto")]
            crypto: None,
            meta: MetaBuilder::new(),
            payload: Bytes::new(),
        }
    }

    /// Seal the payload with the given parameters
    #[cfg(feature = "crypto")]
    pub fn with_crypto(mut self, crypto: CryptoParams) -> Self {
        self.fast.flags |= Flags::E2E_ENC;
        self.crypto = Some(crypto);
        self
    }

    /// Insert string metadata
    pub fn meta_insert_str(mut self, key: &str, value: &str) -> Self {
        self.meta = self.meta.insert_str(key, value);
        self
    }

    /// Insert u32 metadata
    pub fn meta_insert_u32(mut self, key: &str, value: u32) -> Self {
        self.meta = self.meta.insert_u32(key, value);
        self
    }

    /// Insert binary metadata
    pub fn meta_insert_bytes(mut self, key: &str, value: &[u8]) -> Self {
        self.meta = self.meta.insert_bytes(key, value);
        self
    }

    /// Insert boolean metadata
    pub fn meta_insert_bool(mut self, key: &str, value: bool) -> Self {
        self.meta = self.meta.insert_bool(key, value);
        self
    }

    /// Insert application metadata under the `x-` prefix
    pub fn user_meta<'a, I>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (key, value) in entries {
            self.meta = self
                .meta
                .insert_str(&format!("{}{}", USER_META_PREFIX, key), value);
        }
        self
    }

    /// Set payload
    pub fn payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    /// Build the frame
    pub fn build(mut self, max_frame: usize) -> Result<Bytes, CodecError> {
        if self.fast.flags.contains(Flags::HDR_CHECKSUM) {
            let checksum = crc32_fast_header(&self.fast);
            self.meta = self.meta.insert_u32("hdr_csum", checksum);
        }

        #[cfg(feature = "crypto")]
        let payload_or_cipher = if let Some(crypto) = self.crypto.take() {
            self.meta = self
                .meta
                .insert_bytes("nonce", &crypto.nonce)
                .insert_u32("enc", crypto.enc_alg as u32);
            seal_aead(
                crypto.enc_alg,
                &crypto.key,
                &crypto.nonce,
                &crypto.aad,
                &self.payload,
            )?
        } else {
            self.payload
        };

        #[cfg(not(feature = "crypto"))]
        let payload_or_cipher = self.payload;

        let meta_raw = self.meta.build()?;

        let frame = Frame::new(self.fast, meta_raw, payload_or_cipher);
        frame.encode(max_frame).map_err(CodecError::Wire)
    }
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    /// Wire protocol error
    #[error("wire error: {0}")]
    Wire(#[from] crate::WireError),
    /// Metadata encoding error
    #[error("metadata encoding failed")]
    MetaEncode,
    /// Metadata decoding error
    #[error("metadata decoding failed")]
    MetaDecode,
    /// Crypto error
    #[error("crypto error")]
    Crypto,
}

/// AEAD seal operation
#[cfg(feature = "crypto")]
pub fn seal_aead(
    enc_alg: EncAlg,
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Bytes, CodecError> {
    use chacha20poly1305::aead::{Aead, KeyInit, Payload};
    use chacha20poly1305::{ChaCha20Poly1305, Nonce};

    match enc_alg {
        EncAlg::None => Ok(Bytes::copy_from_slice(plaintext)),
        EncAlg::Chacha20Poly1305 => {
            if nonce.len() != NONCE_LEN {
                return Err(CodecError::Crypto);
            }
            let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CodecError::Crypto)?;
            let sealed = cipher
                .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
                .map_err(|_| CodecError::Crypto)?;
            Ok(Bytes::from(sealed))
        }
    }
}

/// AEAD open operation
#[cfg(feature = "crypto")]
pub fn open_aead(
    enc_alg: EncAlg,
    key: &[u8],
    nonce: &[u8],
    aad: &[u8],
    cipher_and_tag: &[u8],
) -> Result<Bytes, CodecError> {
    use chacha20poly1305::aead::{Aead, KeyInit, Payload};
    use chacha20poly1305::{ChaCha20Poly1305, Nonce};

    match enc_alg {
        EncAlg::None => Ok(Bytes::copy_from_slice(cipher_and_tag)),
        EncAlg::Chacha20Poly1305 => {
            if nonce.len() != NONCE_LEN {
                return Err(CodecError::Crypto);
            }
            let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CodecError::Crypto)?;
            let opened = cipher
                .decrypt(
                    Nonce::from_slice(nonce),
                    Payload {
                        msg: cipher_and_tag,
                        aad,
                    },
                )
                .map_err(|_| CodecError::Crypto)?;
            Ok(Bytes::from(opened))
        }
    }
}

/// Parse CBOR metadata into a map
pub fn parse_meta(meta_raw: &[u8]) -> Result<BTreeMap<String, ciborium::Value>, CodecError> {
    if meta_raw.is_empty() {
        return Ok(BTreeMap::new());
    }

    let value: ciborium::Value =
        ciborium::from_reader(meta_raw).map_err(|_| CodecError::MetaDecode)?;

    if let ciborium::Value::Map(map) = value {
        let mut result = BTreeMap::new();
        for (key, value) in map {
            if let ciborium::Value::Text(key_str) = key {
                result.insert(key_str, value);
            }
        }
        Ok(result)
    } else {
        Err(CodecError::MetaDecode)
    }
}

/// Get string value from metadata
pub fn get_meta_str(meta: &BTreeMap<String, ciborium::Value>, key: &str) -> Option<String> {
    meta.get(key).and_then(|v| {
        if let ciborium::Value::Text(s) = v {
            Some(s.clone())
        } else {
            None
        }
    })
}

/// Get u32 value from metadata
pub fn get_meta_u32(meta: &BTreeMap<String, ciborium::Value>, key: &str) -> Option<u32> {
    meta.get(key).and_then(|v| {
        if let ciborium::Value::Integer(i) = v {
            (*i).try_into().ok()
        } else {
            None
        }
    })
}

/// Get binary value from metadata
pub fn get_meta_bytes(meta: &BTreeMap<String, ciborium::Value>, key: &str) -> Option<Vec<u8>> {
    meta.get(key).and_then(|v| {
        if let ciborium::Value::Bytes(b) = v {
            Some(b.clone())
        } else {
            None
        }
    })
}

/// Get boolean value from metadata
pub fn get_meta_bool(meta: &BTreeMap<String, ciborium::Value>, key: &str) -> Option<bool> {
    meta.get(key).and_then(|v| {
        if let ciborium::Value::Bool(b) = v {
            Some(*b)
        } else {
            None
        }
    })
}

/// Collect `x-` prefixed entries with the prefix stripped
pub fn get_user_meta(meta: &BTreeMap<String, ciborium::Value>) -> BTreeMap<String, String> {
    meta.iter()
        .filter_map(|(key, value)| {
            let stripped = key.strip_prefix(USER_META_PREFIX)?;
            match value {
                ciborium::Value::Text(text) => Some((stripped.to_string(), text.clone())),
                _ => None,
            }
        })
        .collect()
}
