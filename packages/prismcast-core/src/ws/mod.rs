//! WebSocket transport: opening handshake, frame codec, and per-connection
//! protocol state.
//!
//! The server speaks plaintext RFC 6455; TLS terminates in front of it.

pub mod connection;
pub mod frame;
pub mod handshake;

pub use connection::{CloseAction, ConnState, SendBuffer, WsConnection, WsError, WsMessage};
pub use frame::{Frame, FrameError, OpCode};
pub use handshake::{accept_key, parse_upgrade, HandshakeError, UpgradeRequest};
