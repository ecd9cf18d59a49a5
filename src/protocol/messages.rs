//! Protocol message definitions
//!
//! Encodes and decodes the three wire commands. Fields are separated by
//! single spaces; the body of a `MESSAGE` absorbs everything after the
//! name, so embedded spaces survive unchanged.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use super::PeerIdentity;

/// Errors produced while decoding a wire line
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Blank line
    #[error("empty message")]
    Empty,

    /// Fewer than the four mandatory fields
    #[error("expected at least 4 fields, found {found}")]
    TooFewFields { found: usize },

    /// Port field is not an unsigned 16-bit integer
    #[error("invalid port '{value}'")]
    InvalidPort { value: String },

    /// First token is not a known command
    #[error("unknown command '{command}'")]
    UnknownCommand { command: String },

    /// A field holds a value the wire format cannot carry
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// Line bytes are not valid UTF-8
    #[error("line is not valid UTF-8")]
    InvalidEncoding,

    /// No newline within the maximum line length
    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
}

// ─────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────

/// Wire command token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Poke,
    Disconnect,
    Message,
}

impl Command {
    pub const ALL: [Command; 3] = [Command::Poke, Command::Disconnect, Command::Message];

    /// Get the wire token
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Poke => "POKE",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
        }
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(token))
            .ok_or_else(|| ProtocolError::UnknownCommand {
                command: token.to_string(),
            })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────
// Messages
// ─────────────────────────────────────────────────────────────────

/// A decoded protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Presence heartbeat
    Poke { sender: PeerIdentity },

    /// Sender is leaving the network
    Disconnect { sender: PeerIdentity },

    /// Chat text; the body is always present, possibly empty
    Text { sender: PeerIdentity, body: String },
}

impl Message {
    pub fn poke(sender: PeerIdentity) -> Self {
        Message::Poke { sender }
    }

    pub fn disconnect(sender: PeerIdentity) -> Self {
        Message::Disconnect { sender }
    }

    /// Create a text message; a body spanning several lines is rejected
    pub fn text(sender: PeerIdentity, body: impl Into<String>) -> Result<Self, ProtocolError> {
        let message = Message::Text {
            sender,
            body: body.into(),
        };
        message.validate()?;
        Ok(message)
    }

    /// Check that the message fits on one wire line
    ///
    /// `Text` can be built directly, so the writer checks again before
    /// anything reaches a socket.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Message::Text { body, .. } if body.contains(['\n', '\r']) => {
                Err(ProtocolError::InvalidField {
                    field: "body",
                    reason: "must not contain line breaks".to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Get the wire command
    pub fn command(&self) -> Command {
        match self {
            Message::Poke { .. } => Command::Poke,
            Message::Disconnect { .. } => Command::Disconnect,
            Message::Text { .. } => Command::Message,
        }
    }

    /// Get the peer that sent this message
    pub fn sender(&self) -> &PeerIdentity {
        match self {
            Message::Poke { sender }
            | Message::Disconnect { sender }
            | Message::Text { sender, .. } => sender,
        }
    }

    /// Encode as a single line without the trailing newline
    pub fn encode(&self) -> String {
        let sender = self.sender();
        let mut line = format!(
            "{} {} {} {}",
            self.command(),
            sender.host(),
            sender.port(),
            sender.name()
        );
        if let Message::Text { body, .. } = self {
            if !body.is_empty() {
                line.push(' ');
                line.push_str(body);
            }
        }
        line
    }

    /// Decode one line of the wire protocol
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Err(ProtocolError::Empty);
        }

        let fields: Vec<&str> = line.splitn(5, ' ').collect();
        let command: Command = fields[0].parse()?;
        if fields.len() < 4 {
            return Err(ProtocolError::TooFewFields { found: fields.len() });
        }

        let port = fields[2].parse::<u16>().map_err(|_| ProtocolError::InvalidPort {
            value: fields[2].to_string(),
        })?;
        let sender = PeerIdentity::new(fields[1], port, fields[3])?;

        Ok(match command {
            Command::Poke => Message::Poke { sender },
            Command::Disconnect => Message::Disconnect { sender },
            Command::Message => Message::Text {
                sender,
                body: fields.get(4).copied().unwrap_or_default().to_string(),
            },
        })
    }
}

impl FromStr for Message {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Message::decode(s)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
