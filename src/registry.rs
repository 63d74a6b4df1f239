// src/registry.rs
//
// Device registry: the set of open serial sessions, keyed by device path.
//
// Explicitly constructed and explicitly owned - callers create one registry,
// pass it by reference, and tear it down with `close_all`. Handles are
// `Arc<Mutex<SerialSession>>` so exchanges on one device path serialize
// naturally while distinct paths run independently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::session::{SerialSession, SerialSettings, DEFAULT_BAUD};

/// Transport selector this bridge answers to.
pub const TRANSPORT_NAME: &str = "fdcanusb";

/// Shared handle to one open session.
pub type SessionHandle = Arc<Mutex<SerialSession>>;

// ============================================================================
// Factory Options
// ============================================================================

/// Factory-shaped configuration consumed from the transport-selection layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BridgeOptions {
    /// Serial device path.
    pub device_path: String,
    /// Baud rate - defaults to 460800.
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Forced transport selector, if the caller pinned one.
    #[serde(default)]
    pub force_transport: Option<String>,
}

fn default_baud() -> u32 {
    DEFAULT_BAUD
}

impl BridgeOptions {
    pub fn new(device_path: impl Into<String>) -> Self {
        Self {
            device_path: device_path.into(),
            baud: DEFAULT_BAUD,
            force_transport: None,
        }
    }

    pub fn with_baud(mut self, baud: u32) -> Self {
        self.baud = baud;
        self
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Process-wide set of open sessions. Entries are created lazily by
/// `get_or_create` and removed only by `close_all`.
#[derive(Default)]
pub struct DeviceRegistry {
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the existing handle for `settings.path` when the line
    /// parameters agree, open a new session otherwise. Incompatible
    /// parameters for an already-open path fail with `ConfigConflict` -
    /// a serial line cannot serve two baud rates at once.
    pub fn get_or_create(&self, settings: &SerialSettings) -> Result<SessionHandle, BridgeError> {
        let mut sessions = self.sessions.lock().expect("device registry lock poisoned");

        if let Some(existing) = sessions.get(&settings.path) {
            let session = existing.lock().expect("session lock poisoned");
            if !session.settings().compatible_with(settings) {
                return Err(BridgeError::ConfigConflict {
                    path: settings.path.clone(),
                    reason: format!(
                        "already open at {} baud {}{}{}, requested {} baud {}{}{}",
                        session.settings().baud_rate,
                        session.settings().data_bits,
                        parity_letter(&session.settings().parity),
                        session.settings().stop_bits,
                        settings.baud_rate,
                        settings.data_bits,
                        parity_letter(&settings.parity),
                        settings.stop_bits,
                    ),
                });
            }
            drop(session);
            debug!("[registry] reusing session for {}", settings.path);
            return Ok(existing.clone());
        }

        let session = SerialSession::open(settings.clone())?;
        let handle = Arc::new(Mutex::new(session));
        sessions.insert(settings.path.clone(), handle.clone());
        Ok(handle)
    }

    /// Resolve factory-shaped options into a session handle. A forced
    /// selector other than "fdcanusb" cannot be satisfied by this bridge.
    pub fn get_or_create_from(&self, options: &BridgeOptions) -> Result<SessionHandle, BridgeError> {
        if let Some(forced) = &options.force_transport {
            if forced != TRANSPORT_NAME {
                return Err(BridgeError::ConfigConflict {
                    path: options.device_path.clone(),
                    reason: format!(
                        "forced transport {:?} is not provided by this bridge (only {:?})",
                        forced, TRANSPORT_NAME
                    ),
                });
            }
        }
        let settings = SerialSettings::new(&options.device_path).with_baud(options.baud);
        self.get_or_create(&settings)
    }

    /// Register a pre-built session (custom ports, tests). Fails with
    /// `ConfigConflict` when the path is already registered.
    pub fn adopt(&self, session: SerialSession) -> Result<SessionHandle, BridgeError> {
        let mut sessions = self.sessions.lock().expect("device registry lock poisoned");
        let path = session.path().to_string();
        if sessions.contains_key(&path) {
            return Err(BridgeError::ConfigConflict {
                path,
                reason: "a session for this path is already registered".to_string(),
            });
        }
        let handle = Arc::new(Mutex::new(session));
        sessions.insert(path, handle.clone());
        Ok(handle)
    }

    /// Close every owned session. Individual close failures are recorded and
    /// returned, never propagated, so one bad device cannot block shutdown
    /// of the others.
    pub fn close_all(&self) -> Vec<(String, BridgeError)> {
        let mut sessions = self.sessions.lock().expect("device registry lock poisoned");
        let mut failures = Vec::new();

        for (path, handle) in sessions.drain() {
            // A poisoned session must not block shutdown of the rest.
            let mut session = match handle.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Err(e) = session.close() {
                warn!("[registry] close failed for {}: {}", path, e);
                failures.push((path, e));
            }
        }
        failures
    }

    /// Number of open sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().expect("device registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a session exists for the given device path.
    pub fn contains(&self, path: &str) -> bool {
        self.sessions
            .lock()
            .expect("device registry lock poisoned")
            .contains_key(path)
    }
}

/// Short parity letter for conflict messages ("N", "O", "E").
fn parity_letter(parity: &str) -> &'static str {
    match parity.to_lowercase().as_str() {
        "odd" => "O",
        "even" => "E",
        _ => "N",
    }
}

// ============================================================================
// Tests
// ============================================================================
