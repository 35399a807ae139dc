//! Network Module Implementation
//!
//! This module provides the wire-level functionality of the transport:
//! length-delimited packet framing and per-connection socket I/O.
//!
//! # Components
//!
//! - `PacketFrame`: encodes and incrementally decodes length-prefixed frames
//! - `Connection`: the shared handle to one live connection
//! - `ConnectionReader` / `ConnectionWriter`: the two halves of a
//!   connection's socket, driven by the service layer
//!
//! Payloads are opaque to this layer. Interpreting game state carried inside
//! a packet is the business of the layer above.

pub use connection::Connection;
pub(crate) use connection::{next_connection_id, ConnectionReader, ConnectionWriter};
pub use frame::{PacketFrame, FRAME_HEADER_SIZE};

mod connection;
mod frame;
