//! Notifications from the node core to the interactive shell
//!
//! Events travel over a bounded channel. The core never waits on the
//! shell: when the channel is full the event is dropped and logged.

use std::fmt;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace};

use crate::protocol::PeerIdentity;

/// Why a peer left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineReason {
    /// The peer sent DISCONNECT
    Disconnected,
    /// Silent for longer than the expiry window
    Expired,
    /// Its socket reached end of stream or failed
    ConnectionLost,
}

impl fmt::Display for OfflineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OfflineReason::Disconnected => "disconnected",
            OfflineReason::Expired => "timed out",
            OfflineReason::ConnectionLost => "connection lost",
        })
    }
}

/// Something the user should hear about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    PeerOnline {
        peer: PeerIdentity,
    },
    PeerOffline {
        peer: PeerIdentity,
        reason: OfflineReason,
    },
    MessageReceived {
        from: PeerIdentity,
        body: String,
    },
    Error {
        context: String,
        message: String,
    },
}

/// Sending side of the event channel
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<mpsc::Sender<NodeEvent>>,
}

impl EventSink {
    /// Create a sink and the receiver the shell drains
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<NodeEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards everything
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Deliver `event` without waiting
    pub fn emit(&self, event: NodeEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                debug!(?event, "Event channel full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {
                trace!("Event receiver gone");
            }
        }
    }

    pub fn error(&self, context: impl Into<String>, message: impl fmt::Display) {
        self.emit(NodeEvent::Error {
            context: context.into(),
            message: message.to_string(),
        });
    }
}
