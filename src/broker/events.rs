// src/broker/events.rs

//! Observable broker lifecycle events.
//!
//! Host applications subscribe by handing an [`EventSender`] to
//! [`BaspBroker::spawn`](crate::broker::BaspBroker::spawn). Emission never
//! blocks; when the channel is full the event is dropped.

use crate::node::{ActorAddr, NodeId};

/// Events emitted by a broker as it observes the overlay.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum BrokerEvent {
  /// An actor became reachable under a local port.
  ActorPublished { addr: ActorAddr, port: u16 },
  /// A proxy for a freshly learned remote actor was created.
  NewRemoteActor { addr: ActorAddr },
  /// A peer node became unreachable and its proxies were killed.
  NodeDown { node: NodeId },
}

/// Sending end of the event channel.
pub type EventSender = async_channel::Sender<BrokerEvent>;
/// Receiving end of the event channel.
pub type EventReceiver = async_channel::Receiver<BrokerEvent>;

/// Creates a bounded event channel pair.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
  async_channel::bounded(capacity.max(1))
}
