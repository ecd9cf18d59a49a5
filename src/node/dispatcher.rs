//! Routes decoded messages to registry changes and user notifications

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, BufReader};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::events::{EventSink, NodeEvent, OfflineReason};
use super::listener;
use crate::error::{Error, Result};
use crate::peer::{Connection, LineWriter, PeerRegistry, Upserted};
use crate::protocol::{Message, PeerIdentity};

/// Socket state owned by one receive loop
///
/// An accepted socket starts with its write half unclaimed. The first
/// POKE from an unknown peer claims it and the loop then tracks the
/// registered connection so it can stop when that connection closes.
pub struct InboundSource {
    writer: Option<LineWriter>,
    established: Option<Arc<Connection>>,
}

impl InboundSource {
    /// A socket whose write half is still available
    pub fn accepted(writer: LineWriter) -> Self {
        Self {
            writer: Some(writer),
            established: None,
        }
    }

    /// A socket already registered as `connection`
    pub fn established(connection: Arc<Connection>) -> Self {
        Self {
            writer: None,
            established: Some(connection),
        }
    }

    /// The connection this socket is registered as, if any
    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.established.as_ref()
    }

    pub(crate) fn take_connection(&mut self) -> Option<Arc<Connection>> {
        self.established.take()
    }
}

/// Message router shared by every receive loop
pub struct Dispatcher {
    local: PeerIdentity,
    registry: Arc<PeerRegistry>,
    events: EventSink,
    connect_timeout: Duration,
    closing: watch::Sender<bool>,
}

impl Dispatcher {
    pub fn new(
        local: PeerIdentity,
        registry: Arc<PeerRegistry>,
        events: EventSink,
        connect_timeout: Duration,
    ) -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            local,
            registry,
            events,
            connect_timeout,
            closing,
        }
    }

    pub fn local_identity(&self) -> &PeerIdentity {
        &self.local
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Stop every receive loop and refuse new registrations
    pub fn begin_shutdown(&self) {
        self.closing.send_replace(true);
        self.registry.seal();
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.closing.borrow()
    }

    /// Resolves once shutdown has begun
    pub async fn shutting_down(&self) {
        let mut rx = self.closing.subscribe();
        let _ = rx.wait_for(|closing| *closing).await;
    }

    /// Handle one inbound message
    ///
    /// `source` is the socket the message arrived on, when there is one.
    pub async fn on_message(
        self: &Arc<Self>,
        message: Message,
        source: Option<&mut InboundSource>,
    ) -> Result<()> {
        if let Some(connection) = self.registry.find_by_identity(message.sender()) {
            connection.touch();
        }

        match message {
            Message::Poke { sender } => self.on_poke(sender, source).await,
            Message::Disconnect { sender } => {
                self.on_disconnect(sender, source).await;
                Ok(())
            }
            Message::Text { sender, body } => {
                info!(from = %sender, "Message received");
                self.events.emit(NodeEvent::MessageReceived { from: sender, body });
                Ok(())
            }
        }
    }

    async fn on_poke(
        self: &Arc<Self>,
        sender: PeerIdentity,
        source: Option<&mut InboundSource>,
    ) -> Result<()> {
        if sender == self.local {
            debug!("Ignoring poke carrying our own identity");
            return Ok(());
        }

        // Reuse the socket the poke came in on when it is still unclaimed
        if let Some(source) = source {
            if let Some(writer) = source.writer.take() {
                return match self.registry.upsert_with(&sender, writer, |writer| {
                    Connection::from_boxed(sender.clone(), writer)
                }) {
                    Upserted::Existing { unused, .. } => {
                        source.writer = Some(unused);
                        Ok(())
                    }
                    Upserted::Inserted(connection) => {
                        source.established = Some(connection.clone());
                        self.greet(&connection).await;
                        Ok(())
                    }
                    Upserted::Refused { .. } => {
                        debug!(peer = %sender, "Shutting down, not registering peer");
                        Ok(())
                    }
                };
            }
        }

        if self.registry.contains(&sender) || self.is_shutting_down() {
            return Ok(());
        }

        let (connection, reader) = Connection::connect(sender.clone(), self.connect_timeout).await?;
        match self.registry.upsert_with(&sender, connection, |c| c) {
            Upserted::Existing { unused, .. } | Upserted::Refused { unused } => {
                debug!(peer = %sender, "Not registering outbound connection, dropping it");
                unused.close().await;
                Ok(())
            }
            Upserted::Inserted(connection) => {
                self.spawn_reader(connection.clone(), reader);
                self.greet(&connection).await;
                Ok(())
            }
        }
    }

    /// Answer a newly registered peer and announce it
    async fn greet(&self, connection: &Arc<Connection>) {
        let peer = connection.identity().clone();
        if let Err(e) = connection.send(&Message::poke(self.local.clone())).await {
            warn!(peer = %peer, error = %e, "Failed to answer poke");
        }
        info!(peer = %peer, "Peer online");
        self.events.emit(NodeEvent::PeerOnline { peer });
    }

    async fn on_disconnect(&self, sender: PeerIdentity, source: Option<&mut InboundSource>) {
        let Some(removed) = self.registry.remove(&sender).await else {
            debug!(peer = %sender, "Disconnect from unknown peer ignored");
            return;
        };

        if let Some(source) = source {
            if source
                .established
                .as_ref()
                .is_some_and(|c| Arc::ptr_eq(c, &removed))
            {
                source.established = None;
            }
        }

        info!(peer = %sender, "Peer disconnected");
        self.events.emit(NodeEvent::PeerOffline {
            peer: sender.clone(),
            reason: OfflineReason::Disconnected,
        });

        let report = self
            .registry
            .broadcast(&Message::disconnect(sender.clone()), Some(&sender))
            .await;
        debug!(
            peer = %sender,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Relayed disconnect"
        );
    }

    /// Send to one registered peer
    pub async fn send_to(&self, identity: &PeerIdentity, message: &Message) -> Result<()> {
        let connection = self
            .registry
            .find_by_identity(identity)
            .ok_or_else(|| Error::peer_not_found(identity))?;
        connection.send(message).await
    }

    /// Send to every registered peer called `name`; returns the number reached
    pub async fn send_to_name(&self, name: &str, message: &Message) -> usize {
        let mut delivered = 0;
        for connection in self.registry.find_all_by_name(name) {
            match connection.send(message).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(peer = %connection.identity(), error = %e, "Send failed"),
            }
        }
        delivered
    }

    /// Run a receive loop for an outbound connection
    pub(crate) fn spawn_reader<R>(self: &Arc<Self>, connection: Arc<Connection>, reader: R)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let remote = connection.identity().address();
        tokio::spawn(listener::receive_loop(
            self.clone(),
            BufReader::new(reader),
            InboundSource::established(connection),
            remote,
        ));
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, DuplexStream};
    use tokio::sync::mpsc;

    fn peer(port: u16, name: &str) -> PeerIdentity {
        PeerIdentity::new("127.0.0.1", port, name).unwrap()
    }

    fn dispatcher() -> (Arc<Dispatcher>, mpsc::Receiver<NodeEvent>) {
        let (events, rx) = EventSink::channel(16);
        let dispatcher = Dispatcher::new(
            peer(5000, "alice"),
            Arc::new(PeerRegistry::new()),
            events,
            Duration::from_secs(1),
        );
        (Arc::new(dispatcher), rx)
    }

    fn accepted() -> (InboundSource, tokio::io::Lines<BufReader<DuplexStream>>) {
        let (client, server) = tokio::io::duplex(1024);
        (
            InboundSource::accepted(Box::new(client)),
            BufReader::new(server).lines(),
        )
    }

    #[tokio::test]
    async fn test_poke_registers_and_replies() {
        let (dispatcher, mut events) = dispatcher();
        let (mut source, mut remote) = accepted();
        let bob = peer(5001, "bob");

        dispatcher
            .on_message(Message::poke(bob.clone()), Some(&mut source))
            .await
            .unwrap();

        assert!(dispatcher.registry().contains(&bob));
        assert!(source.connection().is_some());
        assert_eq!(
            remote.next_line().await.unwrap().unwrap(),
            "POKE 127.0.0.1 5000 alice"
        );
        assert_eq!(events.recv().await, Some(NodeEvent::PeerOnline { peer: bob }));
    }

    #[tokio::test]
    async fn test_repeat_poke_keeps_single_entry() {
        let (dispatcher, mut events) = dispatcher();
        let bob = peer(5001, "bob");

        let (mut first, _remote1) = accepted();
        dispatcher
            .on_message(Message::poke(bob.clone()), Some(&mut first))
            .await
            .unwrap();

        let (mut second, _remote2) = accepted();
        dispatcher
            .on_message(Message::poke(bob.clone()), Some(&mut second))
            .await
            .unwrap();

        assert_eq!(dispatcher.registry().len(), 1);
        // The second socket keeps its unclaimed writer
        assert!(second.writer.is_some());
        assert!(second.connection().is_none());

        assert!(matches!(events.recv().await, Some(NodeEvent::PeerOnline { .. })));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_removes_and_relays() {
        let (dispatcher, mut events) = dispatcher();
        let bob = peer(5001, "bob");
        let carol = peer(5002, "carol");

        let (mut bob_source, _bob_remote) = accepted();
        dispatcher
            .on_message(Message::poke(bob.clone()), Some(&mut bob_source))
            .await
            .unwrap();
        let (mut carol_source, mut carol_remote) = accepted();
        dispatcher
            .on_message(Message::poke(carol.clone()), Some(&mut carol_source))
            .await
            .unwrap();
        // Drain the poke replies
        carol_remote.next_line().await.unwrap();

        dispatcher
            .on_message(Message::disconnect(bob.clone()), Some(&mut bob_source))
            .await
            .unwrap();

        assert!(!dispatcher.registry().contains(&bob));
        assert!(bob_source.connection().is_none());
        assert_eq!(
            carol_remote.next_line().await.unwrap().unwrap(),
            "DISCONNECT 127.0.0.1 5001 bob"
        );

        let mut saw_offline = false;
        while let Ok(event) = events.try_recv() {
            if event
                == (NodeEvent::PeerOffline {
                    peer: bob.clone(),
                    reason: OfflineReason::Disconnected,
                })
            {
                saw_offline = true;
            }
        }
        assert!(saw_offline);
    }

    #[tokio::test]
    async fn test_poke_after_shutdown_is_not_registered() {
        let (dispatcher, mut events) = dispatcher();
        dispatcher.begin_shutdown();
        assert!(dispatcher.is_shutting_down());

        let (mut source, _remote) = accepted();
        dispatcher
            .on_message(Message::poke(peer(5001, "bob")), Some(&mut source))
            .await
            .unwrap();

        assert!(dispatcher.registry().is_empty());
        assert!(source.connection().is_none());
        assert!(events.try_recv().is_err());

        // Resolves immediately once shutdown has begun
        tokio::time::timeout(Duration::from_secs(1), dispatcher.shutting_down())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_from_unknown_is_noop() {
        let (dispatcher, mut events) = dispatcher();
        dispatcher
            .on_message(Message::disconnect(peer(5009, "ghost")), None)
            .await
            .unwrap();

        assert!(dispatcher.registry().is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_text_reaches_shell_without_registering() {
        let (dispatcher, mut events) = dispatcher();
        let bob = peer(5001, "bob");

        dispatcher
            .on_message(Message::text(bob.clone(), "hi  there").unwrap(), None)
            .await
            .unwrap();

        assert!(dispatcher.registry().is_empty());
        assert_eq!(
            events.recv().await,
            Some(NodeEvent::MessageReceived {
                from: bob,
                body: "hi  there".into()
            })
        );
    }

    #[tokio::test]
    async fn test_poke_without_socket_to_unreachable_peer_fails() {
        let (dispatcher, _events) = dispatcher();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = dispatcher.on_message(Message::poke(peer(port, "ghost")), None).await;
        assert!(result.is_err());
        assert!(dispatcher.registry().is_empty());
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let (dispatcher, _events) = dispatcher();
        let err = dispatcher
            .send_to(&peer(5001, "bob"), &Message::poke(peer(5000, "alice")))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::PeerNotFound { .. }));
    }

    #[tokio::test]
    async fn test_send_to_name_without_match_is_noop() {
        let (dispatcher, _events) = dispatcher();
        let sent = dispatcher
            .send_to_name("nobody", &Message::poke(peer(5000, "alice")))
            .await;

        assert_eq!(sent, 0);
    }
}
