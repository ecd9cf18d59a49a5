//! Wire protocol between messenger nodes
//!
//! Line-oriented text protocol, one message per newline-terminated line:
//!
//! ```text
//! POKE <host> <port> <name>
//! DISCONNECT <host> <port> <name>
//! MESSAGE <host> <port> <name> <free-text body...>
//! ```

mod identity;
mod messages;

pub use identity::*;
pub use messages::*;
