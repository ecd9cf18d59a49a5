//! Periodic liveness sweep
//!
//! Every tick the sweeper probes each live peer with a POKE so quiet
//! peers have a reason to answer, then evicts those that have been
//! silent past the expiry window or whose write path has failed.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::events::{EventSink, NodeEvent, OfflineReason};
use crate::error::Error;
use crate::peer::{Connection, Liveness, LivenessPolicy, PeerRegistry};
use crate::protocol::{Message, PeerIdentity};

/// What one sweep did
#[derive(Debug, Default, Clone)]
pub struct SweepReport {
    pub probed: Vec<PeerIdentity>,
    pub evicted: Vec<PeerIdentity>,
}

pub struct Sweeper {
    local: PeerIdentity,
    registry: Arc<PeerRegistry>,
    events: EventSink,
    interval: Duration,
    policy: LivenessPolicy,
}

impl Sweeper {
    pub fn new(
        local: PeerIdentity,
        registry: Arc<PeerRegistry>,
        events: EventSink,
        interval: Duration,
        policy: LivenessPolicy,
    ) -> Self {
        Self {
            local,
            registry,
            events,
            interval,
            policy,
        }
    }

    /// Run one sweep as of `now`
    pub async fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let mut probes = Vec::new();

        for connection in self.registry.snapshot_all() {
            // A broken write path never recovers, even if the peer keeps talking
            if !connection.is_writable() {
                self.evict(&connection, OfflineReason::ConnectionLost, &mut report).await;
                continue;
            }

            match connection.liveness(now, &self.policy) {
                Liveness::Expired => {
                    self.evict(&connection, OfflineReason::Expired, &mut report).await;
                }
                Liveness::Stale => {
                    debug!(peer = %connection.identity(), "Peer quiet, probing");
                    probes.push(connection);
                }
                Liveness::Fresh | Liveness::Alive => probes.push(connection),
            }
        }

        let poke = Message::poke(self.local.clone());
        let results = join_all(probes.iter().map(|c| c.send(&poke))).await;
        for (connection, result) in probes.iter().zip(results) {
            match result {
                Ok(()) => report.probed.push(connection.identity().clone()),
                Err(Error::UseAfterClose { .. }) => {}
                Err(e) => warn!(peer = %connection.identity(), error = %e, "Probe failed"),
            }
        }

        report
    }

    /// Remove `connection` if it is still registered and report it
    async fn evict(
        &self,
        connection: &Arc<Connection>,
        reason: OfflineReason,
        report: &mut SweepReport,
    ) {
        if self.registry.remove_if_current(connection).await {
            let peer = connection.identity().clone();
            info!(peer = %peer, %reason, "Evicting peer");
            self.events.emit(NodeEvent::PeerOffline {
                peer: peer.clone(),
                reason,
            });
            report.evicted.push(peer);
        }
    }

    /// Sweep every interval until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let report = self.sweep(Instant::now()).await;
                    debug!(
                        probed = report.probed.len(),
                        evicted = report.evicted.len(),
                        remaining = self.registry.len(),
                        "Liveness sweep complete"
                    );
                }
            }
        }

        debug!("Sweeper stopped");
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
