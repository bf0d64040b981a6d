// src/broker/mod.rs

//! The BASP broker actor: binds the protocol state machine to a backend and
//! processes one command at a time.
//!
//! The broker owns all mutable transport state (routing table, proxy
//! namespace, connection contexts). Nothing else ever touches it; proxies,
//! transport drivers, and API handles communicate exclusively through the
//! command mailbox.

pub mod context;
pub(crate) mod core;
pub mod events;

pub use events::{event_channel, BrokerEvent, EventReceiver, EventSender};

use crate::backend::{AcceptHandle, Backend, ConnectionHandle};
use crate::config::BaspConfig;
use crate::error::{BaspError, BaspResult};
use crate::instance::{BaspInstance, ConnState};
use crate::message::Msg;
use crate::node::{ActorAddr, ActorId, ExitReason, MessageId, NodeId};
use crate::registry::{bounce_request, AbstractActor, ActorRegistry};
use crate::runtime::{Command, MailboxReceiver, MailboxSender};

use self::context::ContextStore;
use self::core::BrokerCore;

use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

/// The broker actor. Constructed and spawned via [`BaspBroker::spawn`];
/// afterwards only reachable through its [`BrokerHandle`].
pub struct BaspBroker {
  instance: BaspInstance,
  core: BrokerCore,
  ctxs: ContextStore,
  backend: Box<dyn Backend>,
  mailbox: MailboxReceiver,
  /// port -> doorman bound for it.
  doormen: HashMap<u16, AcceptHandle>,
}

impl BaspBroker {
  /// Spawns the broker task and returns its control handle.
  ///
  /// The `channel` pair must be the one the transport driver was attached
  /// with, so backend events reach this broker.
  pub fn spawn(
    config: BaspConfig,
    backend: Box<dyn Backend>,
    registry: ActorRegistry,
    channel: (MailboxSender, MailboxReceiver),
    events: Option<EventSender>,
  ) -> BrokerHandle {
    let (tx, rx) = channel;
    let this_node = config.this_node;
    let broker = BaspBroker {
      instance: BaspInstance::new(&config),
      core: BrokerCore::new(this_node, registry, tx.clone(), events),
      ctxs: ContextStore::new(),
      backend,
      mailbox: rx,
      doormen: HashMap::new(),
    };
    tokio::spawn(broker.run());
    BrokerHandle { tx, this_node }
  }

  async fn run(mut self) {
    debug!(node = %self.instance.this_node(), "BASP broker up");
    while let Ok(cmd) = self.mailbox.recv().await {
      trace!(cmd = cmd.variant_name(), "processing command");
      if !self.process(cmd) {
        break;
      }
    }
    self.shutdown();
  }

  /// Handles one command to completion. Returns `false` on `Stop`.
  fn process(&mut self, cmd: Command) -> bool {
    match cmd {
      Command::NewConnection { handle, source } => self.on_new_connection(handle, source),
      Command::NewData { handle, data } => self.on_new_data(handle, data),
      Command::ConnectionClosed { handle } => self.on_connection_closed(handle),
      Command::AcceptorClosed { handle } => self.on_acceptor_closed(handle),
      Command::Publish {
        source,
        port,
        actor,
        sigs,
        reply_tx,
      } => {
        let result = self.on_publish(source, port, actor, sigs);
        let _ = reply_tx.send(result);
      }
      Command::Connect {
        handle,
        port,
        expected_sigs,
        reply_tx,
      } => self.on_connect(handle, port, expected_sigs, reply_tx),
      Command::Unpublish {
        addr,
        port,
        reply_tx,
      } => {
        let result = self.on_unpublish(addr, port);
        let _ = reply_tx.send(result);
      }
      Command::Forward {
        sender,
        receiver,
        mid,
        msg,
      } => self.on_forward(sender, receiver, mid, msg),
      Command::EraseProxy { node, aid } => {
        self.core.namespace.erase_one(node, aid, ExitReason::KILLED);
      }
      Command::LocalActorDown { node, aid, reason } => {
        self
          .instance
          .write_kill_proxy(&mut *self.backend, node, aid, reason);
      }
      Command::Stop => return false,
    }
    true
  }

  fn on_new_connection(&mut self, handle: ConnectionHandle, source: AcceptHandle) {
    let port = self.backend.local_port(source);
    self
      .instance
      .write_server_handshake(&mut *self.backend, handle, port);
    self.backend.flush(handle);
    let read_size = self.ctxs.get_or_create(handle).next_read_size();
    self.backend.configure_read(handle, read_size);
  }

  fn on_new_data(&mut self, handle: ConnectionHandle, data: Bytes) {
    let ctx = self.ctxs.get_or_create(handle);
    let next = self
      .instance
      .handle(&mut self.core, &mut *self.backend, ctx, data);
    match next {
      ConnState::Close => self.drop_connection(handle),
      _ => {
        let read_size = ctx.next_read_size();
        self.backend.configure_read(handle, read_size);
      }
    }
  }

  /// Tears down a connection we decided to close (protocol error). The
  /// backend sends no local echo for our own close, so the route purge
  /// runs here.
  fn drop_connection(&mut self, handle: ConnectionHandle) {
    self.backend.close(handle);
    self.ctxs.erase(handle);
    if let Some(nid) = self.instance.tbl().node_of(handle) {
      self
        .instance
        .handle_node_shutdown(&mut self.core, nid);
    }
  }

  fn on_connection_closed(&mut self, handle: ConnectionHandle) {
    self.ctxs.erase(handle);
    // A lost connection means the node is gone; no attempt is made to
    // reach it through other interfaces.
    if let Some(nid) = self.instance.tbl().node_of(handle) {
      self
        .instance
        .handle_node_shutdown(&mut self.core, nid);
      debug_assert!(!self.instance.tbl().reachable(nid));
    }
  }

  fn on_acceptor_closed(&mut self, handle: AcceptHandle) {
    let port = self
      .doormen
      .iter()
      .find(|(_, doorman)| **doorman == handle)
      .map(|(port, _)| *port);
    if let Some(port) = port {
      self.doormen.remove(&port);
      self.instance.remove_published_port(port);
      debug!(port, "acceptor closed, publication removed");
    }
  }

  fn on_publish(
    &mut self,
    source: AcceptHandle,
    port: u16,
    actor: Arc<dyn AbstractActor>,
    sigs: BTreeSet<String>,
  ) -> BaspResult<()> {
    let addr = actor.addr();
    if addr.is_invalid() {
      return Err(BaspError::InvalidArgument("cannot publish invalid actor".into()));
    }
    if port == 0 {
      return Err(BaspError::InvalidArgument("cannot publish on port 0".into()));
    }
    // A failing doorman assignment must leave the broker untouched.
    self.backend.assign_doorman(source)?;
    self.core.registry.put(actor);
    self.instance.add_published_actor(port, addr, sigs);
    self.doormen.insert(port, source);
    self.core.emit(BrokerEvent::ActorPublished { addr, port });
    Ok(())
  }

  fn on_connect(
    &mut self,
    handle: ConnectionHandle,
    port: u16,
    expected_sigs: BTreeSet<String>,
    reply_tx: oneshot::Sender<Result<ActorAddr, BaspError>>,
  ) {
    if let Err(e) = self.backend.assign_scribe(handle) {
      let _ = reply_tx.send(Err(e));
      return;
    }
    // A fresh context; connect never adopts leftover protocol state.
    let ctx = self.ctxs.get_or_create(handle);
    ctx.peer = NodeId::INVALID;
    ctx.pending = None;
    ctx.remote_port = port;
    ctx.cstate = ConnState::AwaitHeader;
    ctx.callback = Some(reply_tx);
    ctx.expected_sigs = expected_sigs;
    // Await the peer's server handshake.
    let read_size = ctx.next_read_size();
    self.backend.configure_read(handle, read_size);
  }

  fn on_unpublish(&mut self, addr: ActorAddr, port: u16) -> BaspResult<()> {
    if addr.is_invalid() {
      return Err(BaspError::InvalidArgument("invalid actor address".into()));
    }
    let removed = self.instance.remove_published_actor(addr, port);
    if removed.is_empty() {
      return Err(BaspError::NoSuchPublication);
    }
    // Each removed port loses its doorman; it carried only this mapping.
    for port in removed {
      if let Some(doorman) = self.doormen.remove(&port) {
        self.backend.close_acceptor(doorman);
      }
    }
    Ok(())
  }

  fn on_forward(&mut self, sender: ActorAddr, receiver: ActorAddr, mid: MessageId, msg: Msg) {
    if receiver.is_invalid() || !receiver.is_remote(&self.core.this_node) {
      warn!(receiver = %receiver, "cannot forward to invalid or local actor");
      return;
    }
    if !sender.is_invalid()
      && !sender.is_remote(&self.core.this_node)
      && self.core.registry.get(sender.id).is_none()
    {
      debug!(sender = %sender, "local sender is not registered, replies cannot be routed back");
    }
    if let Err(e) = self
      .instance
      .dispatch(&mut *self.backend, sender, receiver, mid, msg)
    {
      debug!(receiver = %receiver, error = %e, "dispatch failed");
      if mid.is_request() && !sender.is_invalid() {
        if let Some(src) = self.core.registry.get(sender.id) {
          bounce_request(&src, mid, ExitReason::REMOTE_LINK_UNREACHABLE);
        }
      }
    }
  }

  fn shutdown(&mut self) {
    debug!(node = %self.instance.this_node(), "BASP broker shutting down");
    for handle in self.ctxs.drain() {
      self.backend.close(handle);
    }
    for (_, doorman) in self.doormen.drain() {
      self.backend.close_acceptor(doorman);
    }
  }
}

/// Cloneable control handle of a spawned broker.
#[derive(Clone)]
pub struct BrokerHandle {
  tx: MailboxSender,
  this_node: NodeId,
}

impl BrokerHandle {
  /// Identity of the broker's node.
  pub fn this_node(&self) -> NodeId {
    self.this_node
  }

  /// The broker's mailbox sender, as needed to attach transport drivers.
  pub fn sender(&self) -> &MailboxSender {
    &self.tx
  }

  /// Binds `source` and makes `actor` reachable under `port`, advertising
  /// `sigs` to connecting peers.
  pub async fn publish(
    &self,
    source: AcceptHandle,
    port: u16,
    actor: Arc<dyn AbstractActor>,
    sigs: BTreeSet<String>,
  ) -> BaspResult<()> {
    let (reply_tx, reply_rx) = oneshot::channel();
    self
      .send(Command::Publish {
        source,
        port,
        actor,
        sigs,
        reply_tx,
      })
      .await?;
    recv_reply(reply_rx).await?
  }

  /// Adopts the established connection `handle` and waits for the peer's
  /// handshake. Resolves to the address of the actor published on the
  /// contacted port (or the invalid address when the port has none).
  pub async fn connect(
    &self,
    handle: ConnectionHandle,
    port: u16,
    expected_sigs: BTreeSet<String>,
  ) -> BaspResult<ActorAddr> {
    let (reply_tx, reply_rx) = oneshot::channel();
    self
      .send(Command::Connect {
        handle,
        port,
        expected_sigs,
        reply_tx,
      })
      .await?;
    recv_reply(reply_rx).await?
  }

  /// Withdraws a publication. Port 0 removes the actor from every port it
  /// is published on.
  pub async fn unpublish(&self, addr: ActorAddr, port: u16) -> BaspResult<()> {
    let (reply_tx, reply_rx) = oneshot::channel();
    self
      .send(Command::Unpublish {
        addr,
        port,
        reply_tx,
      })
      .await?;
    recv_reply(reply_rx).await?
  }

  /// Routes a message to a remote actor. Fire-and-forget: a failed
  /// dispatch of a request bounces an error response into the sender's
  /// mailbox instead of replying here.
  pub async fn forward(
    &self,
    sender: ActorAddr,
    receiver: ActorAddr,
    mid: MessageId,
    msg: Msg,
  ) -> BaspResult<()> {
    self
      .send(Command::Forward {
        sender,
        receiver,
        mid,
        msg,
      })
      .await
  }

  /// Administrative removal of one proxy.
  pub async fn erase_proxy(&self, node: NodeId, aid: ActorId) -> BaspResult<()> {
    self.send(Command::EraseProxy { node, aid }).await
  }

  /// Asks the broker to shut down. Pending handshakes are answered with an
  /// error, all connections and acceptors are closed.
  pub async fn stop(&self) -> BaspResult<()> {
    self.send(Command::Stop).await
  }

  async fn send(&self, cmd: Command) -> BaspResult<()> {
    self
      .tx
      .send(cmd)
      .await
      .map_err(|_| BaspError::Internal("broker mailbox closed".into()))
  }
}

async fn recv_reply<T>(reply_rx: oneshot::Receiver<T>) -> BaspResult<T> {
  reply_rx
    .await
    .map_err(|_| BaspError::Internal("broker dropped the reply channel".into()))
}
