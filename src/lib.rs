// src/lib.rs
//
// fdcan-bridge: UART bridge for fdcanusb-style CAN adapters.
//
// The adapter speaks a line-oriented ASCII protocol over a serial link:
//
//   host    -> can send 8001 11001F01130D BF\n
//   adapter -> OK\n                              (frame went out on the bus)
//   adapter -> rcv 8001 2141001013 E\n           (a node replied)
//
// This crate owns the framing, classification, session lifecycle, the
// exchange state machine, and the per-path device registry. The typed
// controller API that interprets payload bytes sits above it; CLI parsing
// and transport selection sit outside it.

mod classify;
mod error;
mod exchange;
mod framer;
mod registry;
mod session;

pub use classify::{classify, ClassifiedResponse, ReceivedFrame};
pub use error::BridgeError;
pub use exchange::{
    run_exchange, run_exchange_with_cancel, ExchangeOutcome, ExchangePolicy, ExchangeStatus,
    DEFAULT_DEADLINE,
};
pub use framer::{
    decode_send_line, encode_send_line, CanSendRequest, LineSplitter, DEFAULT_FLAGS,
    MAX_PAYLOAD_LEN, RESERVED_BIT,
};
pub use registry::{BridgeOptions, DeviceRegistry, SessionHandle, TRANSPORT_NAME};
pub use session::{BridgePort, SerialSession, SerialSettings, DEFAULT_BAUD};
