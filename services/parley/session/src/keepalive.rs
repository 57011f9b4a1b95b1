//! Keepalive protocol with PING/PONG and RTT measurement.
//!
//! This module provides functions to build PING/PONG frames and track
//! round-trip times using correlation IDs.

use bytes::Bytes;
use parley_wire::{CodecError, FastHeader, FrameBuilder, FrameType};
use std::collections::HashMap;
use std::time::{Duration, Instant};

static START: once_cell::sync::Lazy<Instant> = once_cell::sync::Lazy::new(Instant::now);

/// Build a PING frame with correlation ID for RTT measurement
pub fn build_ping(corr_id: u64, max_frame: usize) -> Result<Bytes, CodecError> {
    let mut fast_header = FastHeader::new(FrameType::Ping, 0, 0);
    fast_header.corr_id = corr_id;

    FrameBuilder::new(fast_header)
        .payload(Bytes::new())
        .build(max_frame)
}

/// Build a PONG frame in response to a PING
pub fn build_pong(corr_id: u64, max_frame: usize) -> Result<Bytes, CodecError> {
    let mut fast_header = FastHeader::new(FrameType::Pong, 0, 0);
    fast_header.corr_id = corr_id;

    FrameBuilder::new(fast_header)
        .payload(Bytes::new())
        .build(max_frame)
}

/// Generate a correlation ID based on monotonic time
pub fn now_corr_id() -> u64 {
    START.elapsed().as_nanos() as u64
}

/// Outstanding PINGs awaiting their PONG
#[derive(Debug, Default)]
pub struct KeepaliveState {
    outstanding: HashMap<u64, Instant>,
    last_rtt: Option<Duration>,
}

impl KeepaliveState {
    /// Record a PING being sent
    pub fn record_ping(&mut self, corr_id: u64) {
        let now = Instant::now();
        self.outstanding.insert(corr_id, now);

        // Unanswered pings older than a minute are forgotten
        if let Some(cutoff) = now.checked_sub(Duration::from_secs(60)) {
            self.outstanding.retain(|_, &mut sent| sent > cutoff);
        }
    }

    /// Process a PONG and return RTT if correlation ID was found
    pub fn process_pong(&mut self, corr_id: u64) -> Option<Duration> {
        let rtt = self.outstanding.remove(&corr_id)?.elapsed();
        self.last_rtt = Some(rtt);
        Some(rtt)
    }

    /// Most recent RTT measurement
    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use parley_wire::{FrameDecoder, DEFAULT_MAX_FRAME_SIZE};

    #[test]
    fn test_ping_pong_frames() {
        let corr_id = 0x9876543210FEDCBA;

        let ping_bytes = build_ping(corr_id, DEFAULT_MAX_FRAME_SIZE).unwrap();
        let pong_bytes = build_pong(corr_id, DEFAULT_MAX_FRAME_SIZE).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(ping_bytes.as_ref());
        buf.extend_from_slice(&pong_bytes);

        let ping_frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(ping_frame.fast.typ, FrameType::Ping);
        assert_eq!(ping_frame.fast.corr_id, corr_id);
        assert_eq!(ping_frame.fast.msg_id, 0);

        let pong_frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(pong_frame.fast.typ, FrameType::Pong);
        assert_eq!(pong_frame.fast.corr_id, corr_id);
    }

    #[test]
    fn test_corr_id_generation() {
        let id1 = now_corr_id();
        std::thread::sleep(Duration::from_millis(1));
        let id2 = now_corr_id();

        assert!(id2 > id1, "Correlation IDs should be monotonically increasing");
    }

    #[test]
    fn test_keepalive_state() {
        let mut state = KeepaliveState::default();

        let corr_id = 12345;
        state.record_ping(corr_id);

        let rtt = state.process_pong(corr_id);
        assert!(rtt.is_some());
        assert_eq!(state.last_rtt(), rtt);

        // Processing the same pong again should return None
        assert!(state.process_pong(corr_id).is_none());
    }
}
