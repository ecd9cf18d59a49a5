//! Peer connections and the registry of live peers
//!
//! A [`Connection`] owns the write side of one socket and the liveness
//! clock for that peer. The [`PeerRegistry`] is the only shared mutable
//! state in the node; every operation on it is atomic with respect to
//! every other.

pub mod connection;
pub mod registry;

pub use connection::*;
pub use registry::*;
