// src/framer.rs
//
// ASCII line framing for the fdcanusb bridge protocol.
//
// Outbound format:
//   can send <ADDR:4hex> <PAYLOAD:2hex*len> <FLAGS>\n
//
// ADDR is the target address with the reserved high bit ORed in (the
// adapter's convention for "send" framing), PAYLOAD is uppercase hex with no
// separators, FLAGS is a short adapter-defined token (e.g. "BF").
//
// Inbound bytes are split into lines by `LineSplitter`, which carries an
// unterminated tail across reads so fragmented arrivals reassemble correctly.

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// High bit ORed into the target address when framing a send command.
pub const RESERVED_BIT: u16 = 0x8000;

/// Maximum payload the adapter forwards in one CAN FD frame.
pub const MAX_PAYLOAD_LEN: usize = 64;

/// Default flags token used by the adapter for ordinary data frames.
pub const DEFAULT_FLAGS: &str = "BF";

// ============================================================================
// Send Requests
// ============================================================================

/// One outbound CAN frame request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanSendRequest {
    /// Logical target address. Must fit in 15 bits; the reserved bit is
    /// applied during encoding.
    pub target_address: u16,
    /// Frame payload, 0-64 bytes.
    pub payload: Vec<u8>,
    /// Adapter flags token appended after the payload field.
    pub flags: String,
}

impl CanSendRequest {
    pub fn new(target_address: u16, payload: Vec<u8>) -> Self {
        Self {
            target_address,
            payload,
            flags: DEFAULT_FLAGS.to_string(),
        }
    }

    pub fn with_flags(mut self, flags: impl Into<String>) -> Self {
        self.flags = flags.into();
        self
    }
}

/// Encode a send request as the exact wire line, including the trailing `\n`.
pub fn encode_send_line(request: &CanSendRequest) -> Result<String, BridgeError> {
    if request.payload.len() > MAX_PAYLOAD_LEN {
        return Err(BridgeError::Encoding(format!(
            "payload too long: {} bytes (max {})",
            request.payload.len(),
            MAX_PAYLOAD_LEN
        )));
    }
    if request.target_address & RESERVED_BIT != 0 {
        return Err(BridgeError::Encoding(format!(
            "target address {:#06X} collides with the reserved send bit",
            request.target_address
        )));
    }

    let mut line = String::with_capacity(16 + request.payload.len() * 2);
    line.push_str("can send ");
    line.push_str(&format!("{:04X}", request.target_address | RESERVED_BIT));
    line.push(' ');
    line.push_str(&hex::encode_upper(&request.payload));
    if !request.flags.is_empty() {
        line.push(' ');
        line.push_str(&request.flags);
    }
    line.push('\n');
    Ok(line)
}

/// Decode a send line back into a request, masking the reserved bit off.
///
/// Inverse of `encode_send_line`; used for loopback diagnostics and to keep
/// the encoding honest under round-trip tests. Fields are split on single
/// spaces so an empty payload field stays distinguishable from the flags
/// token that follows it.
pub fn decode_send_line(line: &str) -> Result<CanSendRequest, BridgeError> {
    let trimmed = line.trim_end_matches(['\n', '\r']);
    let rest = trimmed
        .strip_prefix("can send ")
        .ok_or_else(|| BridgeError::Encoding(format!("not a send line: {:?}", trimmed)))?;
    let mut fields = rest.split(' ');

    let addr_field = fields
        .next()
        .ok_or_else(|| BridgeError::Encoding("send line missing address field".to_string()))?;
    let raw_address = u16::from_str_radix(addr_field, 16)
        .map_err(|_| BridgeError::Encoding(format!("invalid hex address: {:?}", addr_field)))?;

    let payload_field = fields.next().unwrap_or("");
    let payload = hex::decode(payload_field)
        .map_err(|_| BridgeError::Encoding(format!("invalid hex payload: {:?}", payload_field)))?;

    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(BridgeError::Encoding(format!(
            "payload too long: {} bytes (max {})",
            payload.len(),
            MAX_PAYLOAD_LEN
        )));
    }

    Ok(CanSendRequest {
        target_address: raw_address & !RESERVED_BIT,
        payload,
        flags: fields.collect::<Vec<_>>().join(" "),
    })
}

// ============================================================================
// Line Splitting
// ============================================================================

/// Stateful splitter turning raw reads into discrete ASCII lines.
///
/// Splits strictly on `\n`, strips one trailing `\r`, and drops empty lines.
/// Bytes after the last terminator are retained as the residual and complete
/// on a later `feed`, so the output is independent of how the byte stream was
/// fragmented across reads.
#[derive(Debug, Default)]
pub struct LineSplitter {
    residual: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self {
            residual: Vec::with_capacity(128),
        }
    }

    /// Feed raw bytes, returning every line completed by this chunk.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\n' {
                let mut raw = std::mem::take(&mut self.residual);
                if raw.last() == Some(&b'\r') {
                    raw.pop();
                }
                if !raw.is_empty() {
                    lines.push(String::from_utf8_lossy(&raw).into_owned());
                }
            } else {
                self.residual.push(b);
            }
        }
        lines
    }

    /// Bytes of the pending, unterminated line.
    pub fn residual(&self) -> &[u8] {
        &self.residual
    }

    /// Discard any pending partial line.
    pub fn reset(&mut self) {
        self.residual.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_exact_wire_line() {
        // The canonical query frame for node 1.
        let request = CanSendRequest::new(1, vec![0x11, 0x00, 0x1F, 0x01, 0x13, 0x0D]);
        assert_eq!(
            encode_send_line(&request).unwrap(),
            "can send 8001 11001F01130D BF\n"
        );
    }

    #[test]
    fn test_encode_sets_reserved_bit() {
        let request = CanSendRequest::new(0x7FFF, vec![0xAA]);
        assert_eq!(encode_send_line(&request).unwrap(), "can send FFFF AA BF\n");
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let request = CanSendRequest::new(1, vec![0; MAX_PAYLOAD_LEN + 1]);
        assert!(matches!(
            encode_send_line(&request),
            Err(BridgeError::Encoding(_))
        ));
    }

    #[test]
    fn test_encode_rejects_reserved_bit_collision() {
        let request = CanSendRequest::new(0x8001, vec![]);
        assert!(matches!(
            encode_send_line(&request),
            Err(BridgeError::Encoding(_))
        ));
    }

    #[test]
    fn test_encode_max_payload_ok() {
        let request = CanSendRequest::new(2, vec![0x5A; MAX_PAYLOAD_LEN]);
        let line = encode_send_line(&request).unwrap();
        assert!(line.starts_with("can send 8002 "));
        assert!(line.contains(&"5A".repeat(MAX_PAYLOAD_LEN)));
    }

    #[test]
    fn test_decode_recovers_request() {
        let original = CanSendRequest::new(5, vec![0x01, 0x02, 0xFE]);
        let line = encode_send_line(&original).unwrap();
        let decoded = decode_send_line(&line).unwrap();
        assert_eq!(decoded.target_address, original.target_address);
        assert_eq!(decoded.payload, original.payload);
        assert_eq!(decoded.flags, original.flags);
    }

    #[test]
    fn test_decode_empty_payload_round_trip() {
        let original = CanSendRequest::new(3, vec![]);
        let decoded = decode_send_line(&encode_send_line(&original).unwrap()).unwrap();
        assert_eq!(decoded.target_address, 3);
        assert!(decoded.payload.is_empty());
        assert_eq!(decoded.flags, DEFAULT_FLAGS);
    }

    #[test]
    fn test_decode_rejects_other_lines() {
        assert!(decode_send_line("OK").is_err());
        assert!(decode_send_line("can status").is_err());
        assert!(decode_send_line("can send ZZZZ AA").is_err());
    }

    #[test]
    fn test_splitter_whole_lines() {
        let mut splitter = LineSplitter::new();
        let lines = splitter.feed(b"OK\nrcv 8001 1F0102\n");
        assert_eq!(lines, vec!["OK".to_string(), "rcv 8001 1F0102".to_string()]);
        assert!(splitter.residual().is_empty());
    }

    #[test]
    fn test_splitter_fragmentation_invariance() {
        let stream = b"OK\r\nrcv 8001 1F0102\nmoteus diagnostic\n";

        let mut whole = LineSplitter::new();
        let expected = whole.feed(stream);

        // Byte-at-a-time arrival must yield the same line sequence.
        let mut fragmented = LineSplitter::new();
        let mut got = Vec::new();
        for b in stream {
            got.extend(fragmented.feed(std::slice::from_ref(b)));
        }
        assert_eq!(got, expected);

        // And an arbitrary mid-line split as well.
        let mut split = LineSplitter::new();
        let mut got = split.feed(&stream[..7]);
        got.extend(split.feed(&stream[7..]));
        assert_eq!(got, expected);
    }

    #[test]
    fn test_splitter_mixed_terminators_and_residual() {
        let mut splitter = LineSplitter::new();
        let lines = splitter.feed(b"OK\r\nrcv 8001 AA\nparti");
        assert_eq!(lines, vec!["OK".to_string(), "rcv 8001 AA".to_string()]);
        assert_eq!(splitter.residual(), b"parti");

        // The fragment completes once the rest of the line arrives.
        let lines = splitter.feed(b"al line\n");
        assert_eq!(lines, vec!["partial line".to_string()]);
        assert!(splitter.residual().is_empty());
    }

    #[test]
    fn test_splitter_drops_empty_lines() {
        let mut splitter = LineSplitter::new();
        let lines = splitter.feed(b"\n\r\nOK\n\n");
        assert_eq!(lines, vec!["OK".to_string()]);
    }

    #[test]
    fn test_splitter_reset_discards_residual() {
        let mut splitter = LineSplitter::new();
        splitter.feed(b"dangling");
        splitter.reset();
        assert!(splitter.residual().is_empty());
        assert!(splitter.feed(b"\n").is_empty());
    }
}
