//! Frame builders and metadata keys shared by clients and the overlay node.

use bytes::Bytes;
use parley_naming::Name;
use parley_wire::{
    get_meta_bool, get_meta_str, parse_meta, CodecError, FastHeader, Frame, FrameBuilder,
    FrameType, StatusCode,
};

/// Metadata key: sender name
pub const META_SRC: &str = "src";
/// Metadata key: destination name
pub const META_DST: &str = "dst";
/// Metadata key: identity being authorised or subscribed
pub const META_NAME: &str = "name";
/// Metadata key: challenge or AEAD nonce
pub const META_NONCE: &str = "nonce";
/// Metadata key: HELLO proof
pub const META_PROOF: &str = "proof";
/// Metadata key: human readable reason on ACK and SESSION_CLOSE
pub const META_REASON: &str = "reason";
/// Metadata key: whether a session seals its payloads
pub const META_ENC: &str = "enc";
/// Metadata key: application payload type
pub const META_PAYLOAD_TYPE: &str = "payload-type";

/// Outcome carried by an ACK frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckOutcome {
    /// Status code
    pub code: StatusCode,
    /// Reason attached by the node, if any
    pub reason: Option<String>,
}

impl AckOutcome {
    /// Read the outcome from an ACK frame
    pub fn from_frame(frame: &Frame) -> Self {
        let reason = parse_meta(&frame.meta_raw)
            .ok()
            .and_then(|meta| get_meta_str(&meta, META_REASON));
        Self {
            code: frame.fast.code,
            reason,
        }
    }

    /// Whether the request was accepted
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    /// Reason or the status code when none was given
    pub fn describe(&self) -> String {
        self.reason
            .clone()
            .unwrap_or_else(|| format!("{:?}", self.code).to_lowercase())
    }
}

/// Build an ACK answering `acked_msg_id`
pub fn build_ack(
    acked_msg_id: u64,
    session_id: u64,
    code: StatusCode,
    reason: Option<&str>,
    max_frame: usize,
) -> Result<Bytes, CodecError> {
    let mut builder = FrameBuilder::new(FastHeader::ack(acked_msg_id, session_id, code));
    if let Some(reason) = reason {
        builder = builder.meta_insert_str(META_REASON, reason);
    }
    builder.build(max_frame)
}

/// Build a SUBSCRIBE for `name`
pub fn build_subscribe(name: &Name, msg_id: u64, max_frame: usize) -> Result<Bytes, CodecError> {
    FrameBuilder::new(FastHeader::new(FrameType::Subscribe, 0, msg_id))
        .meta_insert_str(META_NAME, &name.to_string())
        .build(max_frame)
}

/// Start a frame the node routes from `src` to `dst`
pub fn routed(typ: FrameType, session_id: u64, msg_id: u64, src: &Name, dst: &Name) -> FrameBuilder {
    FrameBuilder::new(FastHeader::new(typ, session_id, msg_id))
        .meta_insert_str(META_SRC, &src.to_string())
        .meta_insert_str(META_DST, &dst.to_string())
}

/// Build a SESSION_REQUEST announcing the session's encryption mode
pub fn build_session_request(
    session_id: u64,
    msg_id: u64,
    src: &Name,
    dst: &Name,
    encryption: bool,
    max_frame: usize,
) -> Result<Bytes, CodecError> {
    routed(FrameType::SessionRequest, session_id, msg_id, src, dst)
        .meta_insert_bool(META_ENC, encryption)
        .build(max_frame)
}

/// Build a SESSION_ACCEPT
pub fn build_session_accept(
    session_id: u64,
    msg_id: u64,
    src: &Name,
    dst: &Name,
    max_frame: usize,
) -> Result<Bytes, CodecError> {
    routed(FrameType::SessionAccept, session_id, msg_id, src, dst).build(max_frame)
}

/// Build a SESSION_CLOSE, `msg_id` 0 asks for no ACK
pub fn build_session_close(
    session_id: u64,
    msg_id: u64,
    src: &Name,
    dst: &Name,
    max_frame: usize,
) -> Result<Bytes, CodecError> {
    routed(FrameType::SessionClose, session_id, msg_id, src, dst)
        .meta_insert_str(META_REASON, "closed by peer")
        .build(max_frame)
}

/// Names and flags carried by a routed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedMeta {
    /// Sender
    pub src: Name,
    /// Destination
    pub dst: Name,
    /// Encryption mode announced by SESSION_REQUEST
    pub encryption: bool,
}

impl RoutedMeta {
    /// Read `src`, `dst` and `enc` from a routed frame
    pub fn from_frame(frame: &Frame) -> Result<Self, String> {
        let meta = parse_meta(&frame.meta_raw).map_err(|e| e.to_string())?;
        let src = get_meta_str(&meta, META_SRC)
            .ok_or_else(|| "missing src".to_string())
            .and_then(|s| Name::parse(&s).map_err(|e| e.to_string()))?;
        let dst = get_meta_str(&meta, META_DST)
            .ok_or_else(|| "missing dst".to_string())
            .and_then(|s| Name::parse(&s).map_err(|e| e.to_string()))?;
        Ok(Self {
            src,
            dst,
            encryption: get_meta_bool(&meta, META_ENC).unwrap_or(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use parley_wire::{FrameDecoder, DEFAULT_MAX_FRAME_SIZE};

    fn decode(bytes: Bytes) -> Frame {
        FrameDecoder::new()
            .decode(&mut BytesMut::from(bytes.as_ref()))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_ack_outcome() {
        let frame = decode(
            build_ack(9, 3, StatusCode::Fatal, Some("no route"), DEFAULT_MAX_FRAME_SIZE).unwrap(),
        );
        assert_eq!(frame.fast.corr_id, 9);
        let outcome = AckOutcome::from_frame(&frame);
        assert!(!outcome.is_ok());
        assert_eq!(outcome.describe(), "no route");

        let frame = decode(build_ack(9, 3, StatusCode::Ok, None, DEFAULT_MAX_FRAME_SIZE).unwrap());
        let outcome = AckOutcome::from_frame(&frame);
        assert!(outcome.is_ok());
        assert_eq!(outcome.describe(), "ok");
    }

    #[test]
    fn test_session_request_meta() {
        let bob = Name::parse("org/bob/v1").unwrap();
        let alice = Name::parse("org/alice/v1").unwrap();
        let frame = decode(
            build_session_request(77, 4, &bob, &alice, true, DEFAULT_MAX_FRAME_SIZE).unwrap(),
        );

        assert_eq!(frame.fast.typ, FrameType::SessionRequest);
        assert_eq!(frame.fast.session_id, 77);
        let meta = RoutedMeta::from_frame(&frame).unwrap();
        assert_eq!(meta.src, bob);
        assert_eq!(meta.dst, alice);
        assert!(meta.encryption);
    }

    #[test]
    fn test_routed_meta_requires_names() {
        let frame = decode(
            FrameBuilder::new(FastHeader::new(FrameType::Data, 1, 1))
                .meta_insert_str(META_SRC, "org/bob/v1")
                .build(DEFAULT_MAX_FRAME_SIZE)
                .unwrap(),
        );
        assert_eq!(RoutedMeta::from_frame(&frame).unwrap_err(), "missing dst");
    }
}
