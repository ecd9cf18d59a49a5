//! The running node: listener, sweeper, dispatcher and registry
//!
//! [`Node`] is the surface the shell talks to. Starting it binds the
//! listening socket and spawns two background tasks:
//!
//! ```text
//!   accept loop ──▶ receive loop (one per socket) ──▶ Dispatcher ──▶ PeerRegistry
//!   sweeper ─────────────────────────────────────────────────────────▲
//! ```

pub mod dispatcher;
pub mod events;
pub mod listener;
pub mod sweeper;

pub use dispatcher::{Dispatcher, InboundSource};
pub use events::{EventSink, NodeEvent, OfflineReason};
pub use sweeper::{SweepReport, Sweeper};

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::peer::{connection, registry, BroadcastReport, LivenessPolicy, PeerRegistry};
use crate::protocol::{Message, PeerIdentity};

/// Everything needed to start a node
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub name: String,
    pub advertise_host: String,
    pub bind_host: String,
    pub listen_port: u16,
    pub sweep_interval: Duration,
    pub liveness: LivenessPolicy,
    pub connect_timeout: Duration,
}

impl NodeOptions {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            name: config.node.name.clone(),
            advertise_host: config.node.advertise_host.clone(),
            bind_host: config.node.bind_host.clone(),
            listen_port: config.node.listen_port,
            sweep_interval: config.liveness.sweep_interval(),
            liveness: LivenessPolicy {
                probe_after: config.liveness.probe_after(),
                expire_after: config.liveness.expire_after(),
            },
            connect_timeout: config.liveness.connect_timeout(),
        }
    }
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self::from_config(&NodeConfig::default())
    }
}

struct BackgroundTasks {
    listener: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

/// A running messenger node
pub struct Node {
    local: PeerIdentity,
    local_addr: SocketAddr,
    registry: Arc<PeerRegistry>,
    dispatcher: Arc<Dispatcher>,
    connect_timeout: Duration,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Option<BackgroundTasks>>,
}

impl Node {
    /// Bind the listener and start the background tasks
    ///
    /// A bind failure is returned as [`Error::Bind`], which is fatal.
    pub async fn start(options: NodeOptions, events: EventSink) -> Result<Self> {
        let bind_ip: IpAddr = options.bind_host.parse().map_err(|_| {
            Error::config_field_invalid(
                "node.bind_host",
                format!("'{}' is not an IP address", options.bind_host),
            )
        })?;
        let listener = listener::bind(SocketAddr::new(bind_ip, options.listen_port)).await?;
        let local_addr = listener.local_addr()?;

        let local = PeerIdentity::new(&options.advertise_host, local_addr.port(), &options.name)
            .map_err(|e| Error::config_field_invalid("node", e.to_string()))?;

        let registry = Arc::new(PeerRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            local.clone(),
            registry.clone(),
            events.clone(),
            options.connect_timeout,
        ));
        let sweeper = Sweeper::new(
            local.clone(),
            registry.clone(),
            events,
            options.sweep_interval,
            options.liveness,
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let tasks = BackgroundTasks {
            listener: tokio::spawn(listener::accept_loop(
                listener,
                dispatcher.clone(),
                shutdown_rx.clone(),
            )),
            sweeper: tokio::spawn(sweeper.run(shutdown_rx)),
        };

        info!(identity = %local, addr = %local_addr, "Node listening");

        Ok(Self {
            local,
            local_addr,
            registry,
            dispatcher,
            connect_timeout: options.connect_timeout,
            shutdown,
            tasks: Mutex::new(Some(tasks)),
        })
    }

    pub fn local_identity(&self) -> &PeerIdentity {
        &self.local
    }

    /// The address the listener actually bound
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Open a socket to `host:port` and introduce ourselves
    ///
    /// The peer is registered once its answering POKE arrives, under the
    /// name it announces.
    pub async fn connect_to(&self, host: &str, port: u16) -> Result<()> {
        let target = PeerIdentity::unnamed(host, port)?;
        if target == self.local {
            return Err(Error::connect_failed(&target, "refusing to connect to ourselves"));
        }
        if self.dispatcher.is_shutting_down() {
            return Err(Error::connect_failed(&target, "node is shutting down"));
        }

        let stream = connection::dial(&target.address(), self.connect_timeout).await?;
        let (reader, mut writer) = stream.into_split();

        let mut line = Message::poke(self.local.clone()).encode();
        line.push('\n');
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::connect_failed(&target, e))?;

        debug!(peer = %target, "Sent introduction");
        tokio::spawn(listener::receive_loop(
            self.dispatcher.clone(),
            BufReader::new(reader),
            InboundSource::accepted(Box::new(writer)),
            target.address(),
        ));
        Ok(())
    }

    /// Tell every peer we are leaving and drop them all; keeps listening
    ///
    /// The registry is drained first, so exactly the peers that are
    /// dropped receive the DISCONNECT.
    pub async fn disconnect_all(&self) -> BroadcastReport {
        let drained = self.registry.drain();
        let report = registry::deliver(&drained, &Message::disconnect(self.local.clone())).await;
        join_all(drained.iter().map(|c| c.close())).await;

        info!(
            notified = report.delivered.len(),
            failed = report.failed.len(),
            "Disconnected from all peers"
        );
        report
    }

    /// Send a chat line to one peer
    pub async fn send_message(&self, identity: &PeerIdentity, text: &str) -> Result<()> {
        let message = Message::text(self.local.clone(), text)?;
        self.dispatcher.send_to(identity, &message).await
    }

    /// Send a chat line to every peer called `name`; returns how many were reached
    pub async fn send_message_by_name(&self, name: &str, text: &str) -> Result<usize> {
        let message = Message::text(self.local.clone(), text)?;
        Ok(self.dispatcher.send_to_name(name, &message).await)
    }

    pub fn list_peers(&self) -> Vec<PeerIdentity> {
        self.registry.identities()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stop the node
    ///
    /// Stops accepting, stops the sweeper, tells every peer we are leaving,
    /// then closes every connection. Receive loops stop and the registry
    /// refuses new peers before any of that. Later calls return immediately.
    pub async fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!("Shutting down node");
        self.dispatcher.begin_shutdown();

        let tasks = self.tasks.lock().take();
        if let Some(tasks) = tasks {
            if let Err(e) = tasks.listener.await {
                warn!(error = %e, "Listener task ended abnormally");
            }
            if let Err(e) = tasks.sweeper.await {
                warn!(error = %e, "Sweeper task ended abnormally");
            }
        }

        self.disconnect_all().await;
        info!("Node stopped");
    }
}
