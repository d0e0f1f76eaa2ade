//! Transport layer for the chat core.
//!
//! This module provides the wire envelope, the connector seam with its
//! WebSocket and in-memory implementations, and the session manager that
//! keeps one logical connection alive.

pub mod backoff;
pub mod connector;
pub mod memory;
pub mod protocol;
pub mod session;

pub use connector::{Connection, Connector, WebSocketConnector};
pub use memory::{MemoryConnector, MemoryHub};
pub use protocol::*;
pub use session::{Outbound, SessionEvent, TransportSession};
