//! A single live relationship to a peer
//!
//! Owns the write path of the peer's socket and the timestamp of the last
//! traffic received from it. Methods take `&self` so the receive loop and
//! the sweeper can use the same connection concurrently.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::{Message, PeerIdentity};

/// Boxed write half of a peer socket
pub type LineWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Upper bound on a single line write before the peer counts as broken
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

// ─────────────────────────────────────────────────────────────────
// Liveness
// ─────────────────────────────────────────────────────────────────

/// Liveness state of a peer, derived from time since its last traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Just added, nothing received since
    Fresh,
    /// Traffic seen within the probe window
    Alive,
    /// Quiet for at least `probe_after`; worth probing
    Stale,
    /// Quiet for at least `expire_after`; terminal
    Expired,
}

/// Timeout policy used to classify connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessPolicy {
    pub probe_after: Duration,
    pub expire_after: Duration,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self {
            probe_after: Duration::from_secs(30),
            expire_after: Duration::from_secs(60),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Connection
// ─────────────────────────────────────────────────────────────────

/// Write side and liveness state of one peer
pub struct Connection {
    identity: PeerIdentity,
    writer: tokio::sync::Mutex<Option<LineWriter>>,
    last_heartbeat: Mutex<Instant>,
    touches: AtomicU64,
    alive: AtomicBool,
    writable: AtomicBool,
    closed: watch::Sender<bool>,
}

impl Connection {
    /// Wrap an already-open write half
    pub fn new<W>(identity: PeerIdentity, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::from_boxed(identity, Box::new(writer))
    }

    /// Wrap a boxed write half without boxing it again
    pub fn from_boxed(identity: PeerIdentity, writer: LineWriter) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            identity,
            writer: tokio::sync::Mutex::new(Some(writer)),
            last_heartbeat: Mutex::new(Instant::now()),
            touches: AtomicU64::new(0),
            alive: AtomicBool::new(true),
            writable: AtomicBool::new(true),
            closed,
        }
    }

    /// Open an outbound socket to `identity`
    ///
    /// Returns the connection together with the read half, which the
    /// caller hands to a receive loop. No retry is attempted.
    pub async fn connect(
        identity: PeerIdentity,
        timeout: Duration,
    ) -> Result<(Self, OwnedReadHalf)> {
        let stream = dial(&identity.address(), timeout).await?;
        let (reader, writer) = stream.into_split();
        debug!(peer = %identity, "Outbound connection established");
        Ok((Self::new(identity, writer), reader))
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// Serialize `message` and write it as one line
    ///
    /// A failed write marks the connection not writable; closing it is
    /// left to the registry.
    pub async fn send(&self, message: &Message) -> Result<()> {
        if self.is_closed() {
            return Err(Error::UseAfterClose {
                peer: self.identity.clone(),
            });
        }
        if !self.is_writable() {
            return Err(Error::send_failed(&self.identity, "connection is not writable"));
        }
        message.validate()?;

        let mut line = message.encode();
        line.push('\n');

        let mut guard = self.writer.lock().await;
        let writer = match guard.as_mut() {
            Some(writer) => writer,
            None => {
                return Err(Error::UseAfterClose {
                    peer: self.identity.clone(),
                })
            }
        };

        let write = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        };
        let outcome = match tokio::time::timeout(SEND_TIMEOUT, write).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err(format!("write timed out after {}s", SEND_TIMEOUT.as_secs())),
        };

        match outcome {
            Ok(()) => {
                trace!(peer = %self.identity, line = %line.trim_end(), "Sent");
                Ok(())
            }
            Err(reason) => {
                self.writable.store(false, Ordering::Release);
                warn!(peer = %self.identity, error = %reason, "Write failed, connection marked not writable");
                Err(Error::send_failed(&self.identity, reason))
            }
        }
    }

    /// Record traffic from the peer now
    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    /// Record traffic at `at`; the timestamp never moves backwards
    pub fn touch_at(&self, at: Instant) {
        let mut last = self.last_heartbeat.lock();
        if at > *last {
            *last = at;
        }
        self.touches.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of times traffic has been recorded
    pub fn touch_count(&self) -> u64 {
        self.touches.load(Ordering::Acquire)
    }

    pub fn last_heartbeat(&self) -> Instant {
        *self.last_heartbeat.lock()
    }

    /// Whether the peer has been silent for at least `timeout`
    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_heartbeat()) >= timeout
    }

    /// Classify the connection under `policy`
    pub fn liveness(&self, now: Instant, policy: &LivenessPolicy) -> Liveness {
        if self.is_expired(now, policy.expire_after) {
            Liveness::Expired
        } else if self.is_expired(now, policy.probe_after) {
            Liveness::Stale
        } else if self.touch_count() > 0 {
            Liveness::Alive
        } else {
            Liveness::Fresh
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Only the registry marks a connection dead, in the same step that removes it
    pub(crate) fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }

    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the connection has been closed
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Release the socket; later calls are no-ops
    pub async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        self.alive.store(false, Ordering::Release);
        self.writable.store(false, Ordering::Release);

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!(peer = %self.identity, error = %e, "Socket shutdown failed");
            }
        }
        debug!(peer = %self.identity, "Connection closed");
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("identity", &self.identity)
            .field("alive", &self.is_alive())
            .field("writable", &self.is_writable())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Open a TCP stream to `address` within `timeout`
pub(crate) async fn dial(address: &str, timeout: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(Error::connect_failed(address, e)),
        Err(_) => Err(Error::ConnectTimeout {
            peer: address.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
