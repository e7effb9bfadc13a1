//! Connection management for remote peers.
//!
//! This module tracks every attached connection through its lifecycle states,
//! from attach through handshake and unit initialization to teardown.

mod client;
mod manager;

pub use client::{ConnectionInfo, ConnectionState};
pub use manager::ConnectionManager;

pub(crate) use client::{completed, CompletedUnits};
pub(crate) use manager::{ChainStart, HandshakeOutcome, Teardown};
