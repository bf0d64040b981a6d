// tests/common/mod.rs

#![allow(dead_code)]

use rbasp::broker::{event_channel, BrokerEvent, EventReceiver};
use rbasp::transport::loopback::LoopbackNetwork;
use rbasp::{
  mailbox, ActorRegistry, BaspBroker, BaspConfig, BrokerHandle, Delivery, MailboxSender, NodeId,
};

use std::collections::BTreeSet;
use std::time::Duration;

pub const SHORT_TIMEOUT: Duration = Duration::from_millis(250);
pub const LONG_TIMEOUT: Duration = Duration::from_secs(2);

/// One broker node wired to a loopback network.
pub struct TestNode {
  pub broker: BrokerHandle,
  pub registry: ActorRegistry,
  pub events: EventReceiver,
  tx: MailboxSender,
}

impl TestNode {
  pub fn node_id(&self) -> NodeId {
    self.broker.this_node()
  }

  /// The mailbox sender the loopback network addresses this node by.
  pub fn sender(&self) -> &MailboxSender {
    &self.tx
  }
}

/// Installs the fmt subscriber once, honoring `RUST_LOG`.
pub fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .try_init();
}

/// Spawns a broker with a fresh registry on `net`.
pub fn spawn_node(net: &LoopbackNetwork) -> TestNode {
  init_tracing();
  let config = BaspConfig::default();
  let registry = ActorRegistry::new();
  let (tx, rx) = mailbox(config.mailbox_capacity);
  let (event_tx, event_rx) = event_channel(100);
  let broker = BaspBroker::spawn(
    config,
    Box::new(net.backend()),
    registry.clone(),
    (tx.clone(), rx),
    Some(event_tx),
  );
  TestNode {
    broker,
    registry,
    events: event_rx,
    tx,
  }
}

pub fn sigs(entries: &[&str]) -> BTreeSet<String> {
  entries.iter().map(|s| s.to_string()).collect()
}

/// Receives one delivery from an actor mailbox, failing the test on
/// timeout.
pub async fn recv_timeout(
  rx: &async_channel::Receiver<Delivery>,
  timeout: Duration,
) -> Delivery {
  tokio::time::timeout(timeout, rx.recv())
    .await
    .expect("timed out waiting for a delivery")
    .expect("actor mailbox closed")
}

/// Waits until `pred` matches an emitted broker event, failing the test on
/// timeout. Unmatched events are discarded.
pub async fn wait_for_event<F>(events: &EventReceiver, timeout: Duration, pred: F) -> BrokerEvent
where
  F: Fn(&BrokerEvent) -> bool,
{
  let deadline = tokio::time::Instant::now() + timeout;
  loop {
    let remaining = deadline
      .checked_duration_since(tokio::time::Instant::now())
      .expect("timed out waiting for a broker event");
    let event = tokio::time::timeout(remaining, events.recv())
      .await
      .expect("timed out waiting for a broker event")
      .expect("event channel closed");
    if pred(&event) {
      return event;
    }
  }
}

/// Asserts that no delivery arrives within `timeout`.
pub async fn assert_silent(rx: &async_channel::Receiver<Delivery>, timeout: Duration) {
  let result = tokio::time::timeout(timeout, rx.recv()).await;
  assert!(result.is_err(), "unexpected delivery: {:?}", result);
}
