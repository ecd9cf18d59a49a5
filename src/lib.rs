//! Messenger node library
//!
//! A small peer-to-peer messenger. Every node is both server and client:
//! it listens for newline-delimited text commands over TCP, keeps a
//! registry of live peers refreshed by `POKE` heartbeats, evicts silent
//! peers, and delivers chat text to the user's shell.

pub mod config;
pub mod error;
pub mod logging;
pub mod node;
pub mod peer;
pub mod protocol;
pub mod shell;
pub mod version;

pub use error::{Error, Result};
pub use node::{EventSink, Node, NodeEvent, NodeOptions};
pub use protocol::{Message, PeerIdentity};
