//! HELLO challenge/response handshake.
//!
//! Immediately after the TCP connection is up the node sends a HELLO carrying
//! a random nonce. The client answers with its own HELLO naming the identity
//! it authorises as and a proof derived from the shared secret, and the node
//! answers that with an ACK.

use anyhow::{bail, Context};
use bytes::{Bytes, BytesMut};
use parley_naming::Name;
use parley_wire::{
    get_meta_bytes, get_meta_str, parse_meta, FastHeader, Flags, Frame, FrameBuilder,
    FrameDecoder, FrameType, StatusCode,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

use crate::crypto::{challenge_nonce, hello_proof, SharedSecret};
use crate::frames::{build_ack, AckOutcome, META_NAME, META_NONCE, META_PROOF};

/// `msg_id` of the client HELLO; connection requests continue after it
pub const HELLO_MSG_ID: u64 = 1;

/// Client HELLO contents
#[derive(Debug, Clone)]
pub struct Hello {
    /// Identity the client authorises as
    pub name: Name,
    /// Proof over the node's nonce
    pub proof: Vec<u8>,
}

/// Send the node's HELLO challenge
pub async fn send_challenge<W: AsyncWrite + Unpin>(
    mut writer: W,
    nonce: &[u8],
    max_frame: usize,
) -> Result<(), anyhow::Error> {
    let frame_bytes = FrameBuilder::new(FastHeader::new(FrameType::Hello, 0, 0))
        .meta_insert_bytes(META_NONCE, nonce)
        .payload(Bytes::new())
        .build(max_frame)?;

    writer.write_all(&frame_bytes).await?;
    trace!("Sent HELLO challenge");
    Ok(())
}

/// Send the client's HELLO answering a challenge
pub async fn send_hello<W: AsyncWrite + Unpin>(
    mut writer: W,
    name: &Name,
    proof: &[u8],
    max_frame: usize,
) -> Result<(), anyhow::Error> {
    let mut fast_header = FastHeader::new(FrameType::Hello, 0, HELLO_MSG_ID);
    fast_header.flags |= Flags::HDR_CHECKSUM;

    let frame_bytes = FrameBuilder::new(fast_header)
        .meta_insert_str(META_NAME, &name.to_string())
        .meta_insert_bytes(META_PROOF, proof)
        .payload(Bytes::new())
        .build(max_frame)?;

    writer.write_all(&frame_bytes).await?;
    debug!("Sent HELLO as {}", name);
    Ok(())
}

/// Read the next frame, draining already buffered bytes first
pub async fn recv_any_frame<R: AsyncRead + Unpin>(
    mut reader: R,
    decoder: &mut FrameDecoder,
    buffer: &mut BytesMut,
) -> Result<Frame, anyhow::Error> {
    loop {
        if let Some(frame) = decoder.decode(buffer)? {
            return Ok(frame);
        }

        let bytes_read = reader.read_buf(buffer).await?;
        if bytes_read == 0 {
            bail!("EOF while reading frame");
        }

        trace!(
            "Read {} bytes, buffer now has {} bytes",
            bytes_read,
            buffer.len()
        );
    }
}

/// Extract the nonce from the node's HELLO
pub fn parse_challenge(frame: &Frame) -> Result<Vec<u8>, anyhow::Error> {
    if frame.fast.typ != FrameType::Hello {
        bail!("expected HELLO challenge, got {:?}", frame.fast.typ);
    }
    let meta = parse_meta(&frame.meta_raw)?;
    get_meta_bytes(&meta, META_NONCE).context("HELLO challenge without nonce")
}

/// Parse a client HELLO, checking its header checksum
pub fn parse_hello(frame: &Frame) -> Result<Hello, anyhow::Error> {
    if frame.fast.typ != FrameType::Hello {
        bail!("expected HELLO, got {:?}", frame.fast.typ);
    }
    frame.verify_checksum()?;

    let meta = parse_meta(&frame.meta_raw)?;
    let name = get_meta_str(&meta, META_NAME).context("HELLO without name")?;
    let proof = get_meta_bytes(&meta, META_PROOF).context("HELLO without proof")?;

    Ok(Hello {
        name: Name::parse(&name)?,
        proof,
    })
}

/// Client side: answer the challenge and wait for the node's verdict
pub async fn client_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    decoder: &mut FrameDecoder,
    buffer: &mut BytesMut,
    name: &Name,
    secret: &SharedSecret,
    max_frame: usize,
) -> Result<(), anyhow::Error> {
    let challenge = recv_any_frame(&mut *stream, decoder, buffer).await?;
    let nonce = parse_challenge(&challenge)?;

    let proof = hello_proof(secret, &nonce, name);
    send_hello(&mut *stream, name, &proof, max_frame).await?;

    let reply = recv_any_frame(&mut *stream, decoder, buffer).await?;
    if reply.fast.typ != FrameType::Ack || reply.fast.corr_id != HELLO_MSG_ID {
        bail!("expected HELLO ack, got {:?}", reply.fast.typ);
    }

    let outcome = AckOutcome::from_frame(&reply);
    if !outcome.is_ok() {
        bail!("HELLO rejected: {}", outcome.describe());
    }
    Ok(())
}

/// Node side: challenge the client and verify its proof
pub async fn accept_hello<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    decoder: &mut FrameDecoder,
    buffer: &mut BytesMut,
    secret: &SharedSecret,
    max_frame: usize,
) -> Result<Name, anyhow::Error> {
    let nonce = challenge_nonce();
    send_challenge(&mut *stream, &nonce, max_frame).await?;

    let frame = recv_any_frame(&mut *stream, decoder, buffer).await?;
    let hello = parse_hello(&frame)?;

    let expected = hello_proof(secret, &nonce, &hello.name);
    if hello.proof.as_slice() != expected.as_slice() {
        warn!("HELLO proof mismatch for {}", hello.name);
        let nack = build_ack(
            frame.fast.msg_id,
            0,
            StatusCode::Fatal,
            Some("unauthorised"),
            max_frame,
        )?;
        stream.write_all(&nack).await?;
        bail!("HELLO proof mismatch for {}", hello.name);
    }

    let ack = build_ack(frame.fast.msg_id, 0, StatusCode::Ok, None, max_frame)?;
    stream.write_all(&ack).await?;
    debug!("Authorised {}", hello.name);
    Ok(hello.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_wire::DEFAULT_MAX_FRAME_SIZE;

    fn secret(s: &str) -> SharedSecret {
        SharedSecret::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_handshake_accepts_matching_secret() {
        let (mut client, mut node) = tokio::io::duplex(64 * 1024);
        let bob = Name::parse("org/bob/v1").unwrap();

        let node_task = tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            let mut buffer = BytesMut::new();
            accept_hello(
                &mut node,
                &mut decoder,
                &mut buffer,
                &secret("demo-shared-secret-min-32-chars!!"),
                DEFAULT_MAX_FRAME_SIZE,
            )
            .await
        });

        let mut decoder = FrameDecoder::new();
        let mut buffer = BytesMut::new();
        client_handshake(
            &mut client,
            &mut decoder,
            &mut buffer,
            &bob,
            &secret("demo-shared-secret-min-32-chars!!"),
            DEFAULT_MAX_FRAME_SIZE,
        )
        .await
        .unwrap();

        assert_eq!(node_task.await.unwrap().unwrap(), bob);
    }

    #[tokio::test]
    async fn test_handshake_rejects_wrong_secret() {
        let (mut client, mut node) = tokio::io::duplex(64 * 1024);
        let bob = Name::parse("org/bob/v1").unwrap();

        let node_task = tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            let mut buffer = BytesMut::new();
            accept_hello(
                &mut node,
                &mut decoder,
                &mut buffer,
                &secret("demo-shared-secret-min-32-chars!!"),
                DEFAULT_MAX_FRAME_SIZE,
            )
            .await
        });

        let mut decoder = FrameDecoder::new();
        let mut buffer = BytesMut::new();
        let err = client_handshake(
            &mut client,
            &mut decoder,
            &mut buffer,
            &bob,
            &secret("a-different-secret-that-is-32-chars"),
            DEFAULT_MAX_FRAME_SIZE,
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("unauthorised"));
        assert!(node_task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_buffered_frames_are_read_before_socket() {
        let first = FrameBuilder::new(FastHeader::new(FrameType::Ping, 0, 0))
            .build(DEFAULT_MAX_FRAME_SIZE)
            .unwrap();
        let second = FrameBuilder::new(FastHeader::new(FrameType::Pong, 0, 0))
            .build(DEFAULT_MAX_FRAME_SIZE)
            .unwrap();

        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&first);
        buffer.extend_from_slice(&second);

        let mut decoder = FrameDecoder::new();
        let empty = std::io::Cursor::new(Vec::<u8>::new());
        let mut reader = tokio::io::BufReader::new(empty);

        let a = recv_any_frame(&mut reader, &mut decoder, &mut buffer).await.unwrap();
        let b = recv_any_frame(&mut reader, &mut decoder, &mut buffer).await.unwrap();
        assert_eq!(a.fast.typ, FrameType::Ping);
        assert_eq!(b.fast.typ, FrameType::Pong);
        assert!(recv_any_frame(&mut reader, &mut decoder, &mut buffer).await.is_err());
    }
}
