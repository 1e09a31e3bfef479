//! Prism Cast Core - shared library for the Prism Cast media server.
//!
//! This crate implements a live adaptive-bitrate media server: it indexes
//! encoded video/audio chunks produced by an external encoder pipeline,
//! speaks a length-prefixed JSON protocol over WebSocket to browser
//! players, and picks each client's next video quality with a pluggable
//! ABR algorithm.
//!
//! # Architecture
//!
//! - [`config`]: YAML server/channel configuration
//! - [`channel`]: per-channel chunk stores fed by filesystem watches
//! - [`ws`]: WebSocket handshake, frame codec, connection state
//! - [`protocol`]: client/server control messages
//! - [`session`]: per-client playback state and dispatch
//! - [`abr`]: video quality selection algorithms
//! - [`server`]: accept loop and per-connection tasks
//!
//! The binary runs the whole server on a current-thread tokio runtime:
//! one cooperative event loop owns the listener, every client socket, the
//! filesystem watches, and the dispatch timers.

#![warn(clippy::all)]

pub mod abr;
pub mod channel;
pub mod config;
pub mod constants;
pub mod media;
pub mod net;
pub mod protocol;
pub mod server;
pub mod session;
pub mod ws;

// Re-export commonly used types at the crate root
pub use abr::{Abr, AbrError, AbrOptions};
pub use channel::{Channel, ChannelRegistry, ChunkStore};
pub use config::{ChannelConfig, ConfigError, ServerConfig};
pub use media::{AudioFormat, VideoFormat};
pub use net::TcpInfo;
pub use protocol::{ClientMessage, ServerMessage};
pub use server::{MediaServer, ServerError};
pub use session::Session;
