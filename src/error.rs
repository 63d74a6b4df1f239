// src/error.rs
//
// Error taxonomy for the UART bridge.
//
// Timeouts are deliberately absent: a missing reply is an expected outcome of
// the protocol and is reported through `ExchangeStatus`, not through this type.

use thiserror::Error;

/// Errors surfaced by the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The serial device could not be opened (permission, not-found, busy).
    /// Fatal to that device path.
    #[error("failed to open {path}: {reason}")]
    DeviceOpen { path: String, reason: String },

    /// An I/O fault while writing. The session handle is closed afterwards so
    /// a torn write cannot silently corrupt later exchanges.
    #[error("write to {path} failed: {reason}")]
    Write { path: String, reason: String },

    /// An I/O fault while reading. Closes the handle like a write fault.
    #[error("read from {path} failed: {reason}")]
    Read { path: String, reason: String },

    /// Caller bug: the request cannot be rendered as a protocol line.
    /// Rejected before any I/O happens.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The device path is already open with incompatible line parameters,
    /// or the requested transport selector does not match this bridge.
    #[error("config conflict for {path}: {reason}")]
    ConfigConflict { path: String, reason: String },

    /// The session was closed, either explicitly or by an earlier I/O fault.
    #[error("session for {path} is closed")]
    SessionClosed { path: String },
}

impl BridgeError {
    /// True when the error indicates the device handle is no longer usable.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            BridgeError::DeviceOpen { .. }
                | BridgeError::Write { .. }
                | BridgeError::Read { .. }
                | BridgeError::SessionClosed { .. }
        )
    }
}
