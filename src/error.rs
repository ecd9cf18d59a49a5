//! Error types for the messenger node
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - Peer context on every network failure
//! - User-facing hints for the shell
//! - Exit codes for the CLI

use std::fmt;
use std::net::SocketAddr;

use thiserror::Error;

use crate::protocol::{PeerIdentity, ProtocolError};

/// Result type alias for node operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoNotFound = 203,
    BindFailed = 210,

    // Connection errors (3xx)
    ConnectionFailed = 300,
    ConnectionTimeout = 301,
    SendFailed = 310,

    // Protocol errors (4xx)
    ProtocolMalformed = 401,
    ProtocolUnknownCommand = 402,

    // Peer errors (5xx)
    PeerNotFound = 500,
    UseAfterClose = 510,

    // Internal errors (9xx)
    InternalError = 900,
}

impl ErrorCode {
    /// Get the string code (e.g., "E500")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10,
            200..=299 => 20,
            300..=399 => 30,
            400..=499 => 40,
            500..=599 => 50,
            900..=999 => 90,
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for the node
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    /// Generic configuration error (unreadable file, bad TOML)
    #[error("Configuration error: {0}")]
    Config(String),

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// Listening socket could not be opened
    #[error("Failed to bind listener on {addr}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    // ─────────────────────────────────────────────────────────────
    // Connection Errors
    // ─────────────────────────────────────────────────────────────

    /// Outbound connect refused or unreachable
    #[error("Failed to connect to {peer}: {message}")]
    ConnectFailed { peer: String, message: String },

    /// Outbound connect did not complete in time
    #[error("Connection to {peer} timed out after {timeout_ms}ms")]
    ConnectTimeout { peer: String, timeout_ms: u64 },

    /// Write to a peer failed (broken pipe, reset)
    #[error("Failed to send to {peer}: {message}")]
    SendFailed { peer: PeerIdentity, message: String },

    // ─────────────────────────────────────────────────────────────
    // Protocol Errors
    // ─────────────────────────────────────────────────────────────

    /// Malformed or unknown wire message
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // ─────────────────────────────────────────────────────────────
    // Peer Errors
    // ─────────────────────────────────────────────────────────────

    /// Identity is not in the registry
    #[error("Peer not found: {peer}")]
    PeerNotFound { peer: PeerIdentity },

    /// A closed connection was used
    #[error("Connection to {peer} used after close")]
    UseAfterClose { peer: PeerIdentity },

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigValidation { .. } | Error::Config(_) => ErrorCode::ConfigValidation,
            Error::Toml(_) => ErrorCode::ConfigParseError,

            Error::Bind { .. } => ErrorCode::BindFailed,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                _ => ErrorCode::IoRead,
            },

            Error::ConnectFailed { .. } => ErrorCode::ConnectionFailed,
            Error::ConnectTimeout { .. } => ErrorCode::ConnectionTimeout,
            Error::SendFailed { .. } => ErrorCode::SendFailed,

            Error::Protocol(ProtocolError::UnknownCommand { .. }) => {
                ErrorCode::ProtocolUnknownCommand
            }
            Error::Protocol(_) => ErrorCode::ProtocolMalformed,

            Error::PeerNotFound { .. } => ErrorCode::PeerNotFound,
            Error::UseAfterClose { .. } => ErrorCode::UseAfterClose,

            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Check if the error must terminate the process
    ///
    /// Only the listening socket and configuration are process-fatal;
    /// `UseAfterClose` marks a lifecycle bug in the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Bind { .. }
                | Error::Config(_)
                | Error::ConfigValidation { .. }
                | Error::UseAfterClose { .. }
                | Error::Internal(_)
        )
    }

    /// Check if the error is contained to a single wire line
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigValidation { .. } | Error::Config(_) => Some(
                "Run 'messenger-node config validate' to see details, or 'config init' for a fresh file."
            ),
            Error::Bind { .. } => Some(
                "Another process may be using this port. Pass a different port: messenger-node run <name> <port>."
            ),
            Error::ConnectFailed { .. } | Error::ConnectTimeout { .. } => Some(
                "Check that the peer is running and that host and port are correct."
            ),
            Error::SendFailed { .. } => Some(
                "The peer closed its connection. It will be dropped on the next liveness sweep."
            ),
            Error::PeerNotFound { .. } => Some(
                "The peer may have gone offline. Run 'peers' to list connected peers."
            ),
            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let mut output = format!(
            "\x1b[31mError [{}]\x1b[0m: {}\n",
            self.code().as_str(),
            self
        );

        if let Some(hint) = self.suggestion() {
            output.push_str(&format!("\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        format!("[{}] {}", self.code().as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a bind error for the listening address
    pub fn bind(addr: SocketAddr, source: std::io::Error) -> Self {
        Error::Bind {
            addr: addr.to_string(),
            source,
        }
    }

    /// Create a connect failure for a peer address
    pub fn connect_failed(peer: impl fmt::Display, message: impl fmt::Display) -> Self {
        Error::ConnectFailed {
            peer: peer.to_string(),
            message: message.to_string(),
        }
    }

    /// Create a send failure for a peer
    pub fn send_failed(peer: &PeerIdentity, message: impl fmt::Display) -> Self {
        Error::SendFailed {
            peer: peer.clone(),
            message: message.to_string(),
        }
    }

    /// Create a peer-not-found error
    pub fn peer_not_found(peer: &PeerIdentity) -> Self {
        Error::PeerNotFound { peer: peer.clone() }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
