//! Peer registry: the set of live connections keyed by identity
//!
//! Readers take a snapshot and iterate it after the lock is released, so
//! no socket I/O ever happens under the lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::Connection;
use crate::error::Error;
use crate::protocol::{Message, PeerIdentity};

// ─────────────────────────────────────────────────────────────────
// Upsert Outcome
// ─────────────────────────────────────────────────────────────────

/// Result of an atomic check-and-insert
///
/// When the identity was already present the seed handed to
/// [`PeerRegistry::upsert_with`] comes back unused.
#[derive(Debug)]
pub enum Upserted<T = ()> {
    /// A connection was already registered and has been touched
    Existing {
        connection: Arc<Connection>,
        unused: T,
    },
    /// The factory ran and its connection is now registered
    Inserted(Arc<Connection>),
    /// The registry is sealed for shutdown; nothing was registered
    Refused { unused: T },
}

impl<T> Upserted<T> {
    pub fn connection(&self) -> Option<&Arc<Connection>> {
        match self {
            Upserted::Existing { connection, .. } | Upserted::Inserted(connection) => {
                Some(connection)
            }
            Upserted::Refused { .. } => None,
        }
    }

    pub fn is_inserted(&self) -> bool {
        matches!(self, Upserted::Inserted(_))
    }
}

/// Outcome of a broadcast
#[derive(Debug, Default, Clone)]
pub struct BroadcastReport {
    pub delivered: Vec<PeerIdentity>,
    pub failed: Vec<PeerIdentity>,
}

// ─────────────────────────────────────────────────────────────────
// Peer Registry
// ─────────────────────────────────────────────────────────────────

/// Thread-safe map from identity to live connection
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerIdentity, Arc<Connection>>>,
    sealed: AtomicBool,
}

impl PeerRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            sealed: AtomicBool::new(false),
        }
    }

    /// Register a connection for `identity` unless one already exists
    ///
    /// The lookup and insert happen under one write lock, so two racing
    /// callers for the same identity produce exactly one entry.
    pub fn upsert<F>(&self, identity: &PeerIdentity, factory: F) -> Upserted
    where
        F: FnOnce() -> Connection,
    {
        self.upsert_with(identity, (), |()| factory())
    }

    /// Like [`upsert`](Self::upsert), but the factory consumes `seed`,
    /// which is returned untouched if the identity is already present
    pub fn upsert_with<T, F>(&self, identity: &PeerIdentity, seed: T, factory: F) -> Upserted<T>
    where
        F: FnOnce(T) -> Connection,
    {
        let mut peers = self.peers.write();
        if self.sealed.load(Ordering::Acquire) {
            return Upserted::Refused { unused: seed };
        }
        if let Some(existing) = peers.get(identity) {
            existing.touch();
            return Upserted::Existing {
                connection: existing.clone(),
                unused: seed,
            };
        }

        let connection = Arc::new(factory(seed));
        debug_assert_eq!(connection.identity(), identity);
        peers.insert(identity.clone(), connection.clone());
        Upserted::Inserted(connection)
    }

    /// Remove and close the connection for `identity`
    pub async fn remove(&self, identity: &PeerIdentity) -> Option<Arc<Connection>> {
        let removed = self.peers.write().remove(identity);
        if let Some(connection) = &removed {
            connection.mark_dead();
            connection.close().await;
        }
        removed
    }

    /// Remove `connection` only if it is still the registered entry
    ///
    /// Returns false when it was already removed or replaced.
    pub async fn remove_if_current(&self, connection: &Arc<Connection>) -> bool {
        let removed = {
            let mut peers = self.peers.write();
            match peers.get(connection.identity()) {
                Some(current) if Arc::ptr_eq(current, connection) => {
                    peers.remove(connection.identity());
                    connection.mark_dead();
                    true
                }
                _ => false,
            }
        };
        connection.close().await;
        removed
    }

    /// Refuse every later upsert
    ///
    /// Taken under the write lock, so no upsert can land after this returns.
    pub fn seal(&self) {
        let _peers = self.peers.write();
        self.sealed.store(true, Ordering::Release);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Remove every entry, returning the connections so the caller can close them
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        let drained: Vec<_> = self.peers.write().drain().map(|(_, c)| c).collect();
        for connection in &drained {
            connection.mark_dead();
        }
        drained
    }

    /// Snapshot of all live connections, ordered by address
    pub fn snapshot_all(&self) -> Vec<Arc<Connection>> {
        let mut snapshot: Vec<_> = self.peers.read().values().cloned().collect();
        snapshot.sort_by(|a, b| {
            let (a, b) = (a.identity(), b.identity());
            (a.host(), a.port()).cmp(&(b.host(), b.port()))
        });
        snapshot
    }

    /// Look up a connection by identity
    pub fn find_by_identity(&self, identity: &PeerIdentity) -> Option<Arc<Connection>> {
        self.peers.read().get(identity).cloned()
    }

    /// All connections whose identity carries `name`
    pub fn find_all_by_name(&self, name: &str) -> Vec<Arc<Connection>> {
        self.snapshot_all()
            .into_iter()
            .filter(|c| c.identity().name() == name)
            .collect()
    }

    pub fn identities(&self) -> Vec<PeerIdentity> {
        self.snapshot_all()
            .iter()
            .map(|c| c.identity().clone())
            .collect()
    }

    pub fn contains(&self, identity: &PeerIdentity) -> bool {
        self.peers.read().contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Send `message` to every peer except `exclude`
    ///
    /// One peer failing does not stop delivery to the others.
    pub async fn broadcast(
        &self,
        message: &Message,
        exclude: Option<&PeerIdentity>,
    ) -> BroadcastReport {
        let targets: Vec<_> = self
            .snapshot_all()
            .into_iter()
            .filter(|c| exclude != Some(c.identity()))
            .collect();

        deliver(&targets, message).await
    }
}

/// Send `message` to each of `targets` concurrently
///
/// Works on connections already drained from the registry as long as
/// they have not been closed.
pub async fn deliver(targets: &[Arc<Connection>], message: &Message) -> BroadcastReport {
    let results = join_all(targets.iter().map(|c| c.send(message))).await;

    let mut report = BroadcastReport::default();
    for (connection, result) in targets.iter().zip(results) {
        let peer = connection.identity().clone();
        match result {
            Ok(()) => report.delivered.push(peer),
            // Removed between snapshot and send
            Err(Error::UseAfterClose { .. }) => {
                debug!(peer = %peer, command = %message.command(), "Skipped closed connection");
                report.failed.push(peer);
            }
            Err(e) => {
                warn!(peer = %peer, command = %message.command(), error = %e, "Broadcast delivery failed");
                report.failed.push(peer);
            }
        }
    }
    report
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn peer(port: u16, name: &str) -> PeerIdentity {
        PeerIdentity::new("127.0.0.1", port, name).unwrap()
    }

    fn sink_connection(identity: &PeerIdentity) -> Connection {
        Connection::new(identity.clone(), tokio::io::sink())
    }

    #[tokio::test]
    async fn test_upsert_and_find() {
        let registry = PeerRegistry::new();
        let bob = peer(5001, "bob");

        let first = registry.upsert(&bob, || sink_connection(&bob));
        assert!(first.is_inserted());

        let second = registry.upsert(&bob, || panic!("factory must not run for a known peer"));
        assert!(!second.is_inserted());
        assert!(Arc::ptr_eq(
            first.connection().unwrap(),
            second.connection().unwrap()
        ));

        assert_eq!(registry.len(), 1);
        assert!(registry.find_by_identity(&peer(5001, "")).is_some());
    }

    #[tokio::test]
    async fn test_upsert_with_returns_unused_seed() {
        let registry = PeerRegistry::new();
        let bob = peer(5001, "bob");
        registry.upsert(&bob, || sink_connection(&bob));

        match registry.upsert_with(&bob, 42u32, |_| sink_connection(&bob)) {
            Upserted::Existing { unused, .. } => assert_eq!(unused, 42),
            other => panic!("expected existing entry, got {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_upsert_creates_one_entry() {
        let registry = Arc::new(PeerRegistry::new());
        let built = Arc::new(AtomicUsize::new(0));
        let bob = peer(5001, "bob");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let built = built.clone();
            let bob = bob.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .upsert(&bob, || {
                        built.fetch_add(1, Ordering::SeqCst);
                        sink_connection(&bob)
                    })
                    .is_inserted()
            }));
        }

        let mut inserted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                inserted += 1;
            }
        }

        assert_eq!(inserted, 1);
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);

        // Every losing upsert touched the surviving connection
        let survivor = registry.find_by_identity(&bob).unwrap();
        assert_eq!(survivor.touch_count(), 15);
    }

    #[tokio::test]
    async fn test_sealed_registry_refuses_upsert() {
        let registry = PeerRegistry::new();
        let bob = peer(5001, "bob");
        let carol = peer(5002, "carol");
        registry.upsert(&bob, || sink_connection(&bob));

        registry.seal();
        assert!(registry.is_sealed());

        match registry.upsert_with(&carol, 7u8, |_| panic!("factory must not run once sealed")) {
            Upserted::Refused { unused } => assert_eq!(unused, 7),
            other => panic!("expected refusal, got {:?}", other),
        }
        assert!(!registry.contains(&carol));
        // Existing entries are left for the caller to drain
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_deliver_reaches_drained_connections() {
        let registry = PeerRegistry::new();
        let bob = peer(5001, "bob");
        let (client, server) = tokio::io::duplex(256);
        registry.upsert(&bob, || Connection::new(bob.clone(), client));

        let drained = registry.drain();
        assert!(registry.is_empty());

        let report = deliver(&drained, &Message::disconnect(peer(5000, "alice"))).await;
        assert_eq!(report.delivered, vec![bob]);

        let mut lines = BufReader::new(server).lines();
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            "DISCONNECT 127.0.0.1 5000 alice"
        );
    }

    #[tokio::test]
    async fn test_remove_closes_connection() {
        let registry = PeerRegistry::new();
        let bob = peer(5001, "bob");
        registry.upsert(&bob, || sink_connection(&bob));

        let removed = registry.remove(&bob).await.unwrap();
        assert!(removed.is_closed());
        assert!(!removed.is_alive());
        assert!(registry.is_empty());
        assert!(registry.remove(&bob).await.is_none());
    }

    #[tokio::test]
    async fn test_remove_if_current_ignores_replaced_entry() {
        let registry = PeerRegistry::new();
        let bob = peer(5001, "bob");

        let stale = registry
            .upsert(&bob, || sink_connection(&bob))
            .connection()
            .unwrap()
            .clone();
        registry.remove(&bob).await;
        registry.upsert(&bob, || sink_connection(&bob));

        assert!(!registry.remove_if_current(&stale).await);
        assert!(registry.contains(&bob));
    }

    #[tokio::test]
    async fn test_find_all_by_name() {
        let registry = PeerRegistry::new();
        for (port, name) in [(5001, "bob"), (5002, "bob"), (5003, "carol")] {
            let id = peer(port, name);
            registry.upsert(&id, || sink_connection(&id));
        }

        assert_eq!(registry.find_all_by_name("bob").len(), 2);
        assert_eq!(registry.find_all_by_name("carol").len(), 1);
        assert!(registry.find_all_by_name("dave").is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_survives_mutation() {
        let registry = PeerRegistry::new();
        for port in [5003, 5001, 5002] {
            let id = peer(port, "p");
            registry.upsert(&id, || sink_connection(&id));
        }

        let snapshot = registry.snapshot_all();
        for connection in registry.drain() {
            connection.close().await;
        }

        assert!(registry.is_empty());
        let ports: Vec<_> = snapshot.iter().map(|c| c.identity().port()).collect();
        assert_eq!(ports, vec![5001, 5002, 5003]);
    }

    #[tokio::test]
    async fn test_broadcast_isolates_failures() {
        let registry = PeerRegistry::new();
        let alice = peer(5000, "alice");
        let bob = peer(5001, "bob");
        let carol = peer(5002, "carol");

        let broken = tokio_test::io::Builder::new()
            .write_error(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"))
            .build();
        registry.upsert(&bob, || Connection::new(bob.clone(), broken));

        let (client, server) = tokio::io::duplex(1024);
        registry.upsert(&carol, || Connection::new(carol.clone(), client));

        let report = registry.broadcast(&Message::poke(alice.clone()), None).await;
        assert_eq!(report.delivered, vec![carol.clone()]);
        assert_eq!(report.failed, vec![bob.clone()]);

        let mut lines = BufReader::new(server).lines();
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            "POKE 127.0.0.1 5000 alice"
        );

        // The failed peer stays registered until the sweeper or a close removes it
        assert!(registry.contains(&bob));
    }

    #[tokio::test]
    async fn test_broadcast_excludes_origin() {
        let registry = PeerRegistry::new();
        let bob = peer(5001, "bob");
        let carol = peer(5002, "carol");
        registry.upsert(&bob, || sink_connection(&bob));
        registry.upsert(&carol, || sink_connection(&carol));

        let report = registry
            .broadcast(&Message::disconnect(bob.clone()), Some(&bob))
            .await;
        assert_eq!(report.delivered, vec![carol]);
        assert!(report.failed.is_empty());
    }
}
