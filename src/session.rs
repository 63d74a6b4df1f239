// src/session.rs
//
// Serial session: the only component touching the physical line.
//
// Owns one open device handle plus the residual line buffer, and exposes the
// two read strategies the bridge supports - a blocking read with a wall-clock
// deadline and a non-blocking polling drain. Both feed the same splitter, so
// they are interchangeable call-to-call.

use std::io::Read;
use std::io::Write;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, StopBits};
use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::framer::LineSplitter;

/// Default adapter baud rate.
pub const DEFAULT_BAUD: u32 = 460_800;

/// Granularity of one blocking read slice. Deadline reads and cancellation
/// are honored within this interval.
const READ_SLICE: Duration = Duration::from_millis(5);

/// Settle delay after opening before the stale-byte drain, in milliseconds.
const DEFAULT_SETTLE_MS: u64 = 100;

// ============================================================================
// Settings
// ============================================================================

/// Serial line parameters for one device path.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Serial device path (e.g. "/dev/ttyUSB0", "COM5").
    pub path: String,
    /// Baud rate - defaults to 460800.
    #[serde(default = "default_baud")]
    pub baud_rate: u32,
    /// Data bits (5-8) - defaults to 8.
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// Stop bits (1, 2) - defaults to 1.
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Parity ("none", "odd", "even") - defaults to "none".
    #[serde(default = "default_parity")]
    pub parity: String,
    /// Settle delay after open, before the stale-byte drain.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

fn default_baud() -> u32 {
    DEFAULT_BAUD
}
fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> u8 {
    1
}
fn default_parity() -> String {
    "none".to_string()
}
fn default_settle_ms() -> u64 {
    DEFAULT_SETTLE_MS
}

impl SerialSettings {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud_rate: DEFAULT_BAUD,
            data_bits: 8,
            stop_bits: 1,
            parity: default_parity(),
            settle_ms: DEFAULT_SETTLE_MS,
        }
    }

    pub fn with_baud(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Whether two opens of the same path agree on line parameters.
    /// The settle delay is an open-time detail, not a line parameter.
    pub(crate) fn compatible_with(&self, other: &SerialSettings) -> bool {
        self.baud_rate == other.baud_rate
            && self.data_bits == other.data_bits
            && self.stop_bits == other.stop_bits
            && self.parity.eq_ignore_ascii_case(&other.parity)
    }
}

/// Convert data bits count to the serialport crate's type.
fn to_serialport_data_bits(bits: u8) -> DataBits {
    match bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    }
}

/// Convert stop bits count to the serialport crate's type.
fn to_serialport_stop_bits(bits: u8) -> StopBits {
    match bits {
        2 => StopBits::Two,
        _ => StopBits::One,
    }
}

/// Convert a parity string ("none", "odd", "even") to the serialport type.
fn parity_str_to_serialport(s: &str) -> Parity {
    match s.to_lowercase().as_str() {
        "odd" => Parity::Odd,
        "even" => Parity::Even,
        _ => Parity::None,
    }
}

// ============================================================================
// Port Seam
// ============================================================================

/// Byte-level access to the line. Implemented by real serial handles and by
/// scripted ports in tests.
pub trait BridgePort: Send {
    /// Wait at most `wait` for bytes, returning the count read. Zero means
    /// nothing arrived within `wait`.
    fn read_available(&mut self, buf: &mut [u8], wait: Duration) -> std::io::Result<usize>;

    /// Write all bytes.
    fn write_all_bytes(&mut self, bytes: &[u8]) -> std::io::Result<()>;

    /// Flush the output path.
    fn flush_out(&mut self) -> std::io::Result<()>;

    /// Discard already-buffered bytes in both directions.
    fn clear_buffers(&mut self) -> std::io::Result<()>;
}

/// A physical serial port behind the seam.
struct NativePort {
    inner: Box<dyn serialport::SerialPort>,
}

impl BridgePort for NativePort {
    fn read_available(&mut self, buf: &mut [u8], wait: Duration) -> std::io::Result<usize> {
        self.inner.set_timeout(wait).map_err(std::io::Error::from)?;
        match self.inner.read(buf) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write_all_bytes(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(bytes)
    }

    fn flush_out(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }

    fn clear_buffers(&mut self) -> std::io::Result<()> {
        self.inner
            .clear(ClearBuffer::All)
            .map_err(std::io::Error::from)
    }
}

// ============================================================================
// Serial Session
// ============================================================================

/// One open serial link to an adapter.
///
/// Not designed for concurrent exchanges: callers serialize access to a
/// session (the registry hands out `Arc<Mutex<SerialSession>>` for exactly
/// this reason). An I/O fault closes the handle so later calls fail fast
/// with `SessionClosed` instead of writing over a torn stream.
pub struct SerialSession {
    settings: SerialSettings,
    port: Option<Box<dyn BridgePort>>,
    splitter: LineSplitter,
}

impl SerialSession {
    /// Open the device with explicit line parameters, wait out the settle
    /// delay, then drain stale bytes left over from any previous session.
    pub fn open(settings: SerialSettings) -> Result<Self, BridgeError> {
        let port = serialport::new(&settings.path, settings.baud_rate)
            .data_bits(to_serialport_data_bits(settings.data_bits))
            .stop_bits(to_serialport_stop_bits(settings.stop_bits))
            .parity(parity_str_to_serialport(&settings.parity))
            .flow_control(FlowControl::None)
            .timeout(READ_SLICE)
            .open()
            .map_err(|e| BridgeError::DeviceOpen {
                path: settings.path.clone(),
                reason: e.to_string(),
            })?;

        debug!(
            "[session] opened {} at {} baud",
            settings.path, settings.baud_rate
        );

        std::thread::sleep(Duration::from_millis(settings.settle_ms));

        let mut session = Self::from_port(Box::new(NativePort { inner: port }), settings);
        session.drain_stale()?;
        Ok(session)
    }

    /// Build a session over an already-open port. Test seam and escape hatch
    /// for callers bringing their own transport.
    pub fn from_port(port: Box<dyn BridgePort>, settings: SerialSettings) -> Self {
        Self {
            settings,
            port: Some(port),
            splitter: LineSplitter::new(),
        }
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    pub fn path(&self) -> &str {
        &self.settings.path
    }

    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    /// Discard bytes buffered in both directions plus any residual partial
    /// line. Called once after open, before the first write.
    fn drain_stale(&mut self) -> Result<(), BridgeError> {
        let path = self.settings.path.clone();
        let port = self.port.as_mut().ok_or(BridgeError::SessionClosed {
            path: path.clone(),
        })?;
        port.clear_buffers().map_err(|e| BridgeError::DeviceOpen {
            path,
            reason: format!("failed to drain stale buffers: {}", e),
        })?;
        self.splitter.reset();
        Ok(())
    }

    /// Write one protocol line and flush it out. The line is written whole;
    /// an I/O fault closes the handle.
    pub fn write_line(&mut self, line: &str) -> Result<(), BridgeError> {
        let path = self.settings.path.clone();
        let port = self.port.as_mut().ok_or(BridgeError::SessionClosed {
            path: path.clone(),
        })?;

        debug!("[session] {} <- {:?}", path, line.trim_end());
        let result = port
            .write_all_bytes(line.as_bytes())
            .and_then(|_| port.flush_out());

        if let Err(e) = result {
            self.port = None;
            return Err(BridgeError::Write {
                path,
                reason: e.to_string(),
            });
        }
        Ok(())
    }

    /// Deadline read: block until at least one complete line is available or
    /// `max_wait` elapses, returning whatever complete lines were assembled.
    /// Never blocks past the deadline; a partial line stays buffered for the
    /// next call.
    pub fn read_lines(&mut self, max_wait: Duration) -> Result<Vec<String>, BridgeError> {
        let deadline = Instant::now() + max_wait;
        let mut lines = Vec::new();
        let mut buf = [0u8; 256];

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = READ_SLICE.min(deadline - now);
            let n = self.read_chunk(&mut buf, wait)?;
            if n > 0 {
                lines.extend(self.splitter.feed(&buf[..n]));
                if !lines.is_empty() {
                    break;
                }
            }
        }

        for line in &lines {
            debug!("[session] {} -> {:?}", self.settings.path, line);
        }
        Ok(lines)
    }

    /// Polling drain: non-blocking read of whatever bytes are currently
    /// available. Safe to call on a cooperative scheduler's tick; shares the
    /// residual buffer with `read_lines`.
    pub fn poll_lines(&mut self) -> Result<Vec<String>, BridgeError> {
        let mut lines = Vec::new();
        let mut buf = [0u8; 256];

        loop {
            let n = self.read_chunk(&mut buf, Duration::ZERO)?;
            if n == 0 {
                break;
            }
            lines.extend(self.splitter.feed(&buf[..n]));
            if n < buf.len() {
                break;
            }
        }
        Ok(lines)
    }

    /// One read against the port. An I/O fault closes the handle.
    fn read_chunk(&mut self, buf: &mut [u8], wait: Duration) -> Result<usize, BridgeError> {
        let path = self.settings.path.clone();
        let port = self.port.as_mut().ok_or(BridgeError::SessionClosed {
            path: path.clone(),
        })?;
        match port.read_available(buf, wait) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.port = None;
                Err(BridgeError::Read {
                    path,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Release the device. Idempotent; safe to call multiple times. A failed
    /// final flush is reported but the handle is dropped regardless.
    pub fn close(&mut self) -> Result<(), BridgeError> {
        if let Some(mut port) = self.port.take() {
            debug!("[session] closing {}", self.settings.path);
            if let Err(e) = port.flush_out() {
                warn!("[session] close flush failed on {}: {}", self.settings.path, e);
                return Err(BridgeError::Write {
                    path: self.settings.path.clone(),
                    reason: format!("close flush failed: {}", e),
                });
            }
        }
        Ok(())
    }
}

impl Drop for SerialSession {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

// ============================================================================
// Test Support
// ============================================================================


// ============================================================================
// Tests
// ============================================================================
