//! Common test utilities and fixtures

#![allow(dead_code)]

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use messenger_node::node::{EventSink, Node, NodeEvent, NodeOptions};
use tokio::sync::mpsc;

/// Get the path to the test fixtures directory
pub fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
}

/// Get a path to a specific fixture file
pub fn fixture_path(name: &str) -> PathBuf {
    fixtures_dir().join(name)
}

pub fn valid_config_fixture() -> PathBuf {
    fixture_path("valid_config.toml")
}

pub fn invalid_config_fixture() -> PathBuf {
    fixture_path("invalid_config.toml")
}

/// Options for a loopback node on an ephemeral port
pub fn loopback_options(name: &str) -> NodeOptions {
    NodeOptions {
        name: name.to_string(),
        advertise_host: "127.0.0.1".to_string(),
        bind_host: "127.0.0.1".to_string(),
        listen_port: 0,
        connect_timeout: Duration::from_secs(2),
        ..NodeOptions::default()
    }
}

/// Start a loopback node and return it with its event stream
pub async fn start_node(name: &str) -> (Node, mpsc::Receiver<NodeEvent>) {
    let (events, rx) = EventSink::channel(64);
    let node = Node::start(loopback_options(name), events)
        .await
        .expect("node should start");
    (node, rx)
}

/// Poll `condition` until it holds or five seconds pass
pub async fn eventually<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Wait for the first event matching `predicate`, skipping others
pub async fn wait_for_event<F>(rx: &mut mpsc::Receiver<NodeEvent>, mut predicate: F) -> NodeEvent
where
    F: FnMut(&NodeEvent) -> bool,
{
    within(async {
        loop {
            match rx.recv().await {
                Some(event) if predicate(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
}

/// Fail the test if `future` takes longer than five seconds
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("operation timed out")
}
