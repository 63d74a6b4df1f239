// src/exchange.rs
//
// Exchange coordinator: drives one request/response cycle against a session.
//
// State machine per exchange:
//   Idle -> Sent -> AwaitingBoth -> { Complete | PartialTimeout | HardTimeout }
//
// The adapter acknowledges a send with an "OK" line and, when a node answers
// on the bus, a separate "rcv" line. Either may arrive first and they may
// share or split physical reads; the coordinator accumulates classified
// lines until both are seen or the wall-clock deadline elapses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::classify::{classify, ClassifiedResponse, ReceivedFrame};
use crate::error::BridgeError;
use crate::framer::{encode_send_line, CanSendRequest};
use crate::session::SerialSession;

/// Default per-attempt deadline. Far above one round trip at 460800 baud
/// (a full 64-byte exchange is ~3 ms of wire time).
pub const DEFAULT_DEADLINE: Duration = Duration::from_millis(200);

/// Upper bound on one blocking read inside the exchange loop, so deadlines
/// and cancellation are honored promptly.
const CANCEL_SLICE: Duration = Duration::from_millis(20);

// ============================================================================
// Policy and Outcome
// ============================================================================

/// Deadline and retry policy for one exchange.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExchangePolicy {
    /// Per-attempt deadline in milliseconds.
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,
    /// Resends after a hard timeout. Defaults to 0: retries belong to the
    /// caller/controller layer, not here.
    #[serde(default)]
    pub retries: u32,
}

fn default_deadline_ms() -> u64 {
    DEFAULT_DEADLINE.as_millis() as u64
}

impl Default for ExchangePolicy {
    fn default() -> Self {
        Self {
            deadline_ms: default_deadline_ms(),
            retries: 0,
        }
    }
}

impl ExchangePolicy {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = deadline.as_millis() as u64;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

/// Terminal state of one exchange. Timeouts are outcomes, not errors:
/// absence of a reply is an expected, common case in this protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeStatus {
    /// Both the acknowledgement and a received frame arrived.
    Complete,
    /// Acknowledged, but no data frame before the deadline. Some commands
    /// legitimately produce no reply, so this is distinguishable from failure.
    PartialTimeout,
    /// Not even the acknowledgement arrived before the deadline.
    HardTimeout,
}

/// Result of one exchange, created fresh per request.
#[derive(Clone, Debug, Serialize)]
pub struct ExchangeOutcome {
    pub status: ExchangeStatus,
    /// Whether an "OK" acknowledgement was seen.
    pub ok_seen: bool,
    /// First received frame; later duplicates stay in `raw_lines` only.
    pub received_frame: Option<ReceivedFrame>,
    /// Every inbound line observed during the exchange, in arrival order.
    pub raw_lines: Vec<String>,
    /// Wall-clock time from first write to the terminal state, across all
    /// attempts.
    pub elapsed: Duration,
    /// Number of times the request line was written (1 = no retry).
    pub attempts: u32,
}

impl ExchangeOutcome {
    pub fn is_complete(&self) -> bool {
        self.status == ExchangeStatus::Complete
    }

    /// Multi-line diagnostic dump for non-Complete outcomes, so a human can
    /// tell a silent device from one that replied oddly.
    pub fn describe(&self) -> String {
        let mut out = format!(
            "{:?} after {} attempt(s) in {:.1} ms (ok_seen: {})",
            self.status,
            self.attempts,
            self.elapsed.as_secs_f64() * 1000.0,
            self.ok_seen,
        );
        if self.raw_lines.is_empty() {
            out.push_str("\n  (no lines received)");
        }
        for line in &self.raw_lines {
            out.push_str("\n  << ");
            out.push_str(line);
        }
        out
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Run one exchange to completion. Blocks the calling thread; one exchange
/// at a time per session (callers hold the session lock for the duration).
pub fn run_exchange(
    session: &mut SerialSession,
    request: &CanSendRequest,
    policy: &ExchangePolicy,
) -> Result<ExchangeOutcome, BridgeError> {
    let never = AtomicBool::new(false);
    run_exchange_with_cancel(session, request, policy, &never)
}

/// Like `run_exchange`, but unblocks within one read slice when `cancel` is
/// set, returning the timeout-classified outcome reached so far. The session
/// stays consistent and reusable: nothing is torn and the residual buffer is
/// kept.
pub fn run_exchange_with_cancel(
    session: &mut SerialSession,
    request: &CanSendRequest,
    policy: &ExchangePolicy,
    cancel: &AtomicBool,
) -> Result<ExchangeOutcome, BridgeError> {
    // Encoding errors are caller bugs, rejected before any I/O.
    let line = encode_send_line(request)?;

    let started = Instant::now();
    let mut raw_lines = Vec::new();
    let mut ok_seen = false;
    let mut received_frame: Option<ReceivedFrame> = None;
    let mut attempts = 0u32;

    loop {
        // Idle -> Sent
        attempts += 1;
        session.write_line(&line)?;
        debug!(
            "[exchange] {} attempt {} sent to {:04X}",
            session.path(),
            attempts,
            request.target_address,
        );

        // Sent -> AwaitingBoth
        let deadline = Instant::now() + policy.deadline();
        let mut cancelled = false;

        while Instant::now() < deadline {
            if cancel.load(Ordering::Relaxed) {
                cancelled = true;
                break;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let lines = session.read_lines(remaining.min(CANCEL_SLICE))?;

            for text in lines {
                raw_lines.push(text.clone());
                match classify(&text) {
                    ClassifiedResponse::Acknowledge => ok_seen = true,
                    ClassifiedResponse::ReceivedFrame(frame) => {
                        // First one wins; duplicates are already recorded in
                        // raw_lines.
                        if received_frame.is_none() {
                            received_frame = Some(frame);
                        }
                    }
                    ClassifiedResponse::ErrorLine(text) => {
                        warn!("[exchange] {} adapter error: {}", session.path(), text);
                    }
                    ClassifiedResponse::Unrecognized(_) => {}
                }
            }

            // AwaitingBoth -> Complete
            if ok_seen && received_frame.is_some() {
                return Ok(ExchangeOutcome {
                    status: ExchangeStatus::Complete,
                    ok_seen,
                    received_frame,
                    raw_lines,
                    elapsed: started.elapsed(),
                    attempts,
                });
            }
        }

        // Deadline elapsed (or cancelled) without both replies.
        if ok_seen {
            // AwaitingBoth -> PartialTimeout
            return Ok(ExchangeOutcome {
                status: ExchangeStatus::PartialTimeout,
                ok_seen,
                received_frame,
                raw_lines,
                elapsed: started.elapsed(),
                attempts,
            });
        }

        // AwaitingBoth -> HardTimeout, unless the policy allows a resend.
        if cancelled || attempts > policy.retries {
            return Ok(ExchangeOutcome {
                status: ExchangeStatus::HardTimeout,
                ok_seen,
                received_frame,
                raw_lines,
                elapsed: started.elapsed(),
                attempts,
            });
        }
        debug!(
            "[exchange] {} hard timeout, retrying ({}/{})",
            session.path(),
            attempts,
            policy.retries,
        );
    }
}

// ============================================================================
// Tests
// ============================================================================
