//! Peer identity, the registry key for a remote node

use std::fmt;
use std::hash::{Hash, Hasher};

use super::ProtocolError;

/// Address and display name of a peer
///
/// Two identities are equal when host and port match; the name is
/// descriptive only and may be empty. Host and name never contain
/// whitespace, so every identity survives a trip through the wire format.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    host: String,
    port: u16,
    name: String,
}

impl PeerIdentity {
    /// Create an identity, rejecting values the wire format cannot carry
    pub fn new(
        host: impl Into<String>,
        port: u16,
        name: impl Into<String>,
    ) -> Result<Self, ProtocolError> {
        let host = host.into();
        let name = name.into();

        if host.is_empty() {
            return Err(ProtocolError::InvalidField {
                field: "host",
                reason: "must not be empty".to_string(),
            });
        }
        if host.chars().any(char::is_whitespace) {
            return Err(ProtocolError::InvalidField {
                field: "host",
                reason: format!("'{}' contains whitespace", host),
            });
        }
        if name.chars().any(char::is_whitespace) {
            return Err(ProtocolError::InvalidField {
                field: "name",
                reason: format!("'{}' contains whitespace", name),
            });
        }

        Ok(Self { host, port, name })
    }

    /// Create an identity when only the address is known
    pub fn unnamed(host: impl Into<String>, port: u16) -> Result<Self, ProtocolError> {
        Self::new(host, port, String::new())
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `host:port`, suitable for `TcpStream::connect`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl PartialEq for PeerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for PeerIdentity {}

impl Hash for PeerIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}:{}", self.host, self.port)
        } else {
            write!(f, "{}@{}:{}", self.name, self.host, self.port)
        }
    }
}
