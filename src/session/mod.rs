//! Secure channel negotiation.

pub mod negotiator;

pub use negotiator::{ChannelState, Negotiator};
