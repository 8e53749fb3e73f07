//! Gateway wire protocol: heartbeat, request cycle, response decoding.
//!
//! A gateway announces itself with the ASCII heartbeat `GWCCCL0001`. The
//! server answers with the next packet of a process-wide three-request
//! cycle (phase current, phase power, energy counters) and expects a
//! Modbus-style reply whose uppercased hex contains `0103`, a 2-hex-digit
//! length, then fixed-width big-endian values.

use std::sync::Mutex;

use thiserror::Error;

/// Exact heartbeat bytes sent by every gateway.
pub const HEARTBEAT_PACKET: &[u8] = b"GWCCCL0001";

/// The canonical request packets, dispatched round-robin across all clients.
pub const RESPONSE_PACKETS: [&[u8]; 3] = [
    &[0x01, 0x26, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x0B, 0xB7, 0x00, 0x0A],
    &[0x01, 0x6E, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x0B, 0xED, 0x00, 0x06],
    &[0x01, 0xB6, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x0C, 0x83, 0x00, 0x08],
];

/// Shared request cursor; every heartbeat in the process advances it, so
/// clients collectively rotate through indices 0, 1, 2 in order.
pub struct ResponseCycle {
    index: Mutex<usize>,
}

impl ResponseCycle {
    pub fn new() -> Self {
        Self {
            index: Mutex::new(0),
        }
    }

    /// Take the next `(index, packet)` from the cycle.
    pub fn next(&self) -> (usize, &'static [u8]) {
        let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        let current = *index;
        *index = (current + 1) % RESPONSE_PACKETS.len();
        (current, RESPONSE_PACKETS[current])
    }
}

impl Default for ResponseCycle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The reply does not contain the `0103` function marker.
    #[error("missing 0103 marker")]
    NoMarker,

    /// The value section is not a whole number of chunks.
    #[error("misaligned payload of {0} hex chars")]
    Misaligned(usize),

    /// A chunk holds non-hex characters.
    #[error("unparseable chunk: {0}")]
    BadChunk(String),
}

/// Decode one uppercased-hex reply for the given cycle index.
///
/// Indices 0 and 1 decode 8-hex-char chunks as big-endian IEEE-754 float32;
/// index 2 decodes 16-hex-char chunks as big-endian int64. The `0103`
/// marker and the following 2-hex-digit length prefix are stripped first.
pub fn decode_response(index: usize, hex_response: &str) -> Result<Vec<f64>, DecodeError> {
    let marker = match hex_response.find("0103") {
        Some(pos) => pos,
        None => return Err(DecodeError::NoMarker),
    };
    let after_marker = &hex_response[marker + 4..];
    if after_marker.len() < 2 {
        return Err(DecodeError::Misaligned(after_marker.len()));
    }
    let payload = &after_marker[2..];

    let chunk_size = if index == 2 { 16 } else { 8 };
    if payload.len() % chunk_size != 0 {
        return Err(DecodeError::Misaligned(payload.len()));
    }

    let mut values = Vec::with_capacity(payload.len() / chunk_size);
    for chunk_start in (0..payload.len()).step_by(chunk_size) {
        let chunk = &payload[chunk_start..chunk_start + chunk_size];
        let value = if chunk_size == 8 {
            let bits = u32::from_str_radix(chunk, 16)
                .map_err(|_| DecodeError::BadChunk(chunk.to_string()))?;
            f32::from_bits(bits) as f64
        } else {
            let bits = u64::from_str_radix(chunk, 16)
                .map_err(|_| DecodeError::BadChunk(chunk.to_string()))?;
            bits as i64 as f64
        };
        values.push(value);
    }
    Ok(values)
}
