// src/runtime/command.rs

//! The broker's single command vocabulary.
//!
//! Everything that happens to a broker arrives here: transport events
//! injected by the backend driver, control operations from API handles
//! (carrying a oneshot reply), and internal re-entries from termination
//! hooks. Exhaustive handling in the broker loop replaces the dynamic
//! message matching of classic actor frameworks.

use crate::backend::{AcceptHandle, ConnectionHandle};
use crate::error::BaspError;
use crate::message::Msg;
use crate::node::{ActorAddr, ActorId, ExitReason, MessageId, NodeId};
use crate::registry::AbstractActor;

use bytes::Bytes;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Commands processed by the broker task, one at a time.
pub enum Command {
  // --- Backend events (injected by the transport driver) ---
  /// A doorman accepted a new connection.
  NewConnection {
    handle: ConnectionHandle,
    source: AcceptHandle,
  },
  /// One armed read completed; `data` is exactly the requested size.
  NewData {
    handle: ConnectionHandle,
    data: Bytes,
  },
  /// The transport lost the connection.
  ConnectionClosed { handle: ConnectionHandle },
  /// A listening acceptor went away.
  AcceptorClosed { handle: AcceptHandle },

  // --- Control operations (from API handles) ---
  /// Bind a doorman and make `actor` reachable under `port`.
  Publish {
    source: AcceptHandle,
    port: u16,
    actor: Arc<dyn AbstractActor>,
    sigs: BTreeSet<String>,
    reply_tx: oneshot::Sender<Result<(), BaspError>>,
  },
  /// Adopt an established connection and await the peer's handshake.
  Connect {
    handle: ConnectionHandle,
    port: u16,
    expected_sigs: BTreeSet<String>,
    reply_tx: oneshot::Sender<Result<ActorAddr, BaspError>>,
  },
  /// Withdraw a publication. Port 0 removes the actor from every port.
  Unpublish {
    addr: ActorAddr,
    port: u16,
    reply_tx: oneshot::Sender<Result<(), BaspError>>,
  },

  // --- Dispatch (from proxies and forwarding callers) ---
  /// Route a message to a remote actor.
  Forward {
    sender: ActorAddr,
    receiver: ActorAddr,
    mid: MessageId,
    msg: Msg,
  },

  // --- Administration / internal re-entries ---
  /// Drop one proxy from the namespace.
  EraseProxy { node: NodeId, aid: ActorId },
  /// A local actor announced to `node` has terminated; emit the kill.
  LocalActorDown {
    node: NodeId,
    aid: ActorId,
    reason: ExitReason,
  },
  /// Shut the broker down.
  Stop,
}

impl Command {
  /// Returns a string representation of the command variant's name. Useful
  /// for logging.
  pub fn variant_name(&self) -> &'static str {
    match self {
      Command::NewConnection { .. } => "NewConnection",
      Command::NewData { .. } => "NewData",
      Command::ConnectionClosed { .. } => "ConnectionClosed",
      Command::AcceptorClosed { .. } => "AcceptorClosed",
      Command::Publish { .. } => "Publish",
      Command::Connect { .. } => "Connect",
      Command::Unpublish { .. } => "Unpublish",
      Command::Forward { .. } => "Forward",
      Command::EraseProxy { .. } => "EraseProxy",
      Command::LocalActorDown { .. } => "LocalActorDown",
      Command::Stop => "Stop",
    }
  }
}

impl fmt::Debug for Command {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Command::NewConnection { handle, source } => f
        .debug_struct("NewConnection")
        .field("handle", handle)
        .field("source", source)
        .finish(),
      Command::NewData { handle, data } => f
        .debug_struct("NewData")
        .field("handle", handle)
        .field("len", &data.len())
        .finish(),
      Command::ConnectionClosed { handle } => f
        .debug_struct("ConnectionClosed")
        .field("handle", handle)
        .finish(),
      Command::AcceptorClosed { handle } => f
        .debug_struct("AcceptorClosed")
        .field("handle", handle)
        .finish(),
      Command::Publish { source, port, sigs, .. } => f
        .debug_struct("Publish")
        .field("source", source)
        .field("port", port)
        .field("sigs", sigs)
        .finish_non_exhaustive(),
      Command::Connect { handle, port, expected_sigs, .. } => f
        .debug_struct("Connect")
        .field("handle", handle)
        .field("port", port)
        .field("expected_sigs", expected_sigs)
        .finish_non_exhaustive(),
      Command::Unpublish { addr, port, .. } => f
        .debug_struct("Unpublish")
        .field("addr", addr)
        .field("port", port)
        .finish_non_exhaustive(),
      Command::Forward { sender, receiver, mid, msg } => f
        .debug_struct("Forward")
        .field("sender", sender)
        .field("receiver", receiver)
        .field("mid", mid)
        .field("msg", msg)
        .finish(),
      Command::EraseProxy { node, aid } => f
        .debug_struct("EraseProxy")
        .field("node", node)
        .field("aid", aid)
        .finish(),
      Command::LocalActorDown { node, aid, reason } => f
        .debug_struct("LocalActorDown")
        .field("node", node)
        .field("aid", aid)
        .field("reason", reason)
        .finish(),
      Command::Stop => write!(f, "Stop"),
    }
  }
}
