// src/classify.rs
//
// Response classification for inbound adapter lines.
//
// The adapter answers a send command with up to two lines, in any order and
// grouping: an acknowledgement ("OK") confirming the frame went out on the
// bus, and a received-frame report ("rcv <addr> <payload> [flags...]") when a
// node replied. Anything else is diagnostic chatter and must never abort an
// exchange.

use serde::Serialize;
use tracing::warn;

use crate::framer::RESERVED_BIT;

/// Tag assigned to one inbound line. Classification is a pure function of
/// line content; arrival order never matters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClassifiedResponse {
    /// Adapter accepted and transmitted the outbound frame.
    Acknowledge,
    /// A CAN frame captured from the bus.
    ReceivedFrame(ReceivedFrame),
    /// Adapter rejected the command (`ERR ...`).
    ErrorLine(String),
    /// Adapter chatter, passed through untouched.
    Unrecognized(String),
}

/// A received-frame report parsed from an `rcv` line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReceivedFrame {
    /// Address field as reported on the wire, reserved bit included.
    pub address: u16,
    /// Payload bytes; empty when the line was malformed.
    pub payload: Vec<u8>,
    /// Trailing flag tokens, if any.
    pub flags: Vec<String>,
    /// Set when the fields after the marker did not parse. The line still
    /// classifies as a received frame so callers can treat it as a soft
    /// error instead of losing it.
    pub malformed: bool,
}

impl ReceivedFrame {
    /// Address with the bridge's reserved framing bit masked off.
    pub fn node_address(&self) -> u16 {
        self.address & !RESERVED_BIT
    }

    /// Explicit request/response correlation contract: compares logical node
    /// addresses, ignoring the reserved bit on both sides.
    pub fn matches_target(&self, target_address: u16) -> bool {
        self.node_address() == target_address & !RESERVED_BIT
    }
}

/// Marker for received-frame lines.
const RCV_MARKER: &str = "rcv";

/// Classify one inbound line. Callers feed only non-empty lines; the splitter
/// drops empty ones before they reach here.
pub fn classify(line: &str) -> ClassifiedResponse {
    if line.starts_with("OK") {
        return ClassifiedResponse::Acknowledge;
    }
    if line.starts_with("ERR") {
        return ClassifiedResponse::ErrorLine(line.to_string());
    }
    if let Some(pos) = line.find(RCV_MARKER) {
        return parse_received(line, &line[pos + RCV_MARKER.len()..]);
    }
    ClassifiedResponse::Unrecognized(line.to_string())
}

/// Parse the whitespace-separated fields after the `rcv` marker.
fn parse_received(line: &str, rest: &str) -> ClassifiedResponse {
    let mut fields = rest.split_whitespace();

    let address = fields.next().and_then(|f| u16::from_str_radix(f, 16).ok());
    let payload = fields.next().and_then(|f| hex::decode(f).ok());
    let flags: Vec<String> = fields.map(str::to_string).collect();

    match (address, payload) {
        (Some(address), Some(payload)) => ClassifiedResponse::ReceivedFrame(ReceivedFrame {
            address,
            payload,
            flags,
            malformed: false,
        }),
        _ => {
            warn!("[classify] malformed rcv line: {:?}", line);
            ClassifiedResponse::ReceivedFrame(ReceivedFrame {
                address: address.unwrap_or(0),
                payload: Vec::new(),
                flags,
                malformed: true,
            })
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acknowledge_exact_and_prefixed() {
        assert_eq!(classify("OK"), ClassifiedResponse::Acknowledge);
        assert_eq!(classify("OK can send"), ClassifiedResponse::Acknowledge);
    }

    #[test]
    fn test_acknowledge_is_case_sensitive() {
        assert!(matches!(
            classify("ok"),
            ClassifiedResponse::Unrecognized(_)
        ));
    }

    #[test]
    fn test_received_frame_parses_fields() {
        let response = classify("rcv 8001 1F0102");
        let ClassifiedResponse::ReceivedFrame(frame) = response else {
            panic!("expected ReceivedFrame, got {:?}", response);
        };
        assert_eq!(frame.address, 0x8001);
        assert_eq!(frame.payload, vec![0x1F, 0x01, 0x02]);
        assert!(frame.flags.is_empty());
        assert!(!frame.malformed);
    }

    #[test]
    fn test_received_frame_with_flags_and_prefix() {
        let response = classify("can rcv 0001 2141001013 E B");
        let ClassifiedResponse::ReceivedFrame(frame) = response else {
            panic!("expected ReceivedFrame");
        };
        assert_eq!(frame.address, 0x0001);
        assert_eq!(frame.payload, vec![0x21, 0x41, 0x00, 0x10, 0x13]);
        assert_eq!(frame.flags, vec!["E".to_string(), "B".to_string()]);
    }

    #[test]
    fn test_malformed_rcv_is_soft_error_not_dropped() {
        let ClassifiedResponse::ReceivedFrame(frame) = classify("rcv zzzz q") else {
            panic!("malformed rcv must still classify as ReceivedFrame");
        };
        assert!(frame.malformed);
        assert!(frame.payload.is_empty());

        // Marker with no fields at all.
        let ClassifiedResponse::ReceivedFrame(frame) = classify("rcv") else {
            panic!("bare rcv must still classify as ReceivedFrame");
        };
        assert!(frame.malformed);
    }

    #[test]
    fn test_error_line() {
        assert_eq!(
            classify("ERR unknown command"),
            ClassifiedResponse::ErrorLine("ERR unknown command".to_string())
        );
    }

    #[test]
    fn test_error_line_wins_over_rcv_marker() {
        assert!(matches!(
            classify("ERR rcv queue overflow"),
            ClassifiedResponse::ErrorLine(_)
        ));
    }

    #[test]
    fn test_chatter_is_unrecognized() {
        assert_eq!(
            classify("moteus fdcanusb build 1.2.3"),
            ClassifiedResponse::Unrecognized("moteus fdcanusb build 1.2.3".to_string())
        );
    }

    #[test]
    fn test_classification_is_idempotent_and_order_independent() {
        let batch = ["OK", "rcv 8001 AA", "ERR nope", "hello"];
        let forward: Vec<_> = batch.iter().map(|l| classify(l)).collect();
        let reversed: Vec<_> = batch.iter().rev().map(|l| classify(l)).collect();

        for (i, line) in batch.iter().enumerate() {
            // Same line classified twice yields the same tag.
            assert_eq!(classify(line), classify(line));
            // Shuffling the batch does not change individual tags.
            assert_eq!(forward[i], reversed[batch.len() - 1 - i]);
        }
    }

    #[test]
    fn test_address_correlation_masks_reserved_bit() {
        let ClassifiedResponse::ReceivedFrame(frame) = classify("rcv 8001 AA") else {
            panic!("expected ReceivedFrame");
        };
        assert_eq!(frame.node_address(), 0x0001);
        assert!(frame.matches_target(1));
        assert!(frame.matches_target(0x8001));
        assert!(!frame.matches_target(2));
    }
}
