//! Duet Relay Server Library
//!
//! Core functionality for the Duet relay:
//! - Presence registry with process-wide username exclusivity
//! - Per-connection handler speaking the line protocol
//! - Fan-out dispatcher decoupled from connection read loops
//! - Heartbeat checker that evicts silent connections

pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod heartbeat;
pub mod registry;
pub mod server;

pub use error::RelayError;
pub use registry::ConnectionRegistry;
pub use server::RelayServer;
