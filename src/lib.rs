// src/lib.rs

//! rbasp - A pure-Rust asynchronous BASP transport core using Tokio.
//!
//! BASP (Binary Actor System Protocol) turns stream-oriented connections
//! into bidirectional actor-messaging channels: remote actors appear as
//! local proxies, messages are framed into fixed-size headers plus opaque
//! payloads, and node failures propagate as exit notifications to every
//! proxy of the lost node.
//!
//! The crate is built around a single broker actor per node. Transport
//! drivers (TCP, or the in-process loopback network) feed backend events
//! into the broker's mailbox; the broker runs the protocol state machine
//! and talks back to the wire through the [`backend::Backend`] seam.

/// The backend seam consumed by the broker.
pub mod backend;
/// The broker actor, its context store, and observable events.
pub mod broker;
/// Static broker configuration.
pub mod config;
/// Defines custom error types used throughout the library.
pub mod error;
/// The protocol state machine and its hook seam.
pub mod instance;
/// The opaque message container.
pub mod message;
/// Identity types: node ids, actor ids, addresses, message ids.
pub mod node;
/// Wire codec: headers and payload bodies.
pub mod protocol;
/// Remote-actor proxies and the proxy namespace.
pub mod proxy;
/// The actor registry seam and the mailbox-backed local actor.
pub mod registry;
/// The routing table.
pub mod routing;
/// Broker command vocabulary and mailbox aliases.
pub mod runtime;
/// Transport drivers (loopback, TCP).
pub mod transport;

// Re-export the types almost every user touches.
pub use backend::{AcceptHandle, Backend, ConnectionHandle};
pub use broker::{event_channel, BaspBroker, BrokerEvent, BrokerHandle, EventReceiver, EventSender};
pub use config::BaspConfig;
pub use error::{BaspError, BaspResult};
pub use message::Msg;
pub use node::{ActorAddr, ActorId, ExitReason, MessageId, NodeId, INVALID_ACTOR_ID};
pub use registry::{AbstractActor, ActorRegistry, Delivery, LocalActor};
pub use runtime::{mailbox, Command, MailboxReceiver, MailboxSender};
