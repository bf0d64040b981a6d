// src/broker/core.rs

//! The broker's implementation of the protocol state machine's hooks.
//!
//! `BrokerCore` owns everything the [`Callee`] operations touch that is not
//! part of the [`BaspInstance`] itself: the proxy namespace, the injected
//! actor registry, known-remote bookkeeping, and the event channel. Keeping
//! it separate from the instance lets the state machine borrow both sides
//! at once.

use crate::backend::Backend;
use crate::broker::events::{BrokerEvent, EventSender};
use crate::instance::{BaspInstance, Callee, ConnectionContext};
use crate::message::Msg;
use crate::node::{ActorAddr, ActorId, ExitReason, MessageId, NodeId, INVALID_ACTOR_ID};
use crate::protocol::{Header, ServerHandshake};
use crate::proxy::{ProxyNamespace, RemoteProxy};
use crate::registry::{bounce_request, AbstractActor, ActorRegistry};
use crate::runtime::{Command, MailboxSender};

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

pub(crate) struct BrokerCore {
  pub this_node: NodeId,
  pub registry: ActorRegistry,
  pub namespace: ProxyNamespace,
  /// Last observed address per node we connected to: node -> (remote
  /// port, published actor).
  pub known_remotes: HashMap<NodeId, (u16, ActorAddr)>,
  /// Re-entry point for proxies and termination hooks.
  pub broker_tx: MailboxSender,
  pub events: Option<EventSender>,
}

impl BrokerCore {
  pub fn new(
    this_node: NodeId,
    registry: ActorRegistry,
    broker_tx: MailboxSender,
    events: Option<EventSender>,
  ) -> Self {
    Self {
      this_node,
      registry,
      namespace: ProxyNamespace::new(),
      known_remotes: HashMap::new(),
      broker_tx,
      events,
    }
  }

  pub fn emit(&self, event: BrokerEvent) {
    if let Some(tx) = &self.events {
      let _ = tx.try_send(event);
    }
  }

  /// Resolves `(nid, aid)` to a proxy, creating one when absent.
  ///
  /// `origin` is the node the reference arrived from; a reference to a
  /// third node teaches the table an indirect route through `origin`.
  /// Creation requires a live route: announcing a proxy nobody can route
  /// back to would leak it forever. Returns `None` when the reference is
  /// unusable.
  pub fn make_proxy(
    &mut self,
    instance: &mut BaspInstance,
    backend: &mut dyn Backend,
    origin: NodeId,
    nid: NodeId,
    aid: ActorId,
  ) -> Option<Arc<RemoteProxy>> {
    if nid.is_invalid() || aid == INVALID_ACTOR_ID || nid == self.this_node {
      return None;
    }
    if let Some(existing) = self.namespace.get(nid, aid) {
      return Some(existing);
    }
    if !origin.is_invalid() && origin != nid {
      instance.tbl_mut().add_indirect(origin, nid);
    }
    if instance.tbl().lookup(nid).is_none() {
      info!(
        node = %nid,
        "cannot create a proxy instance for an actor running on a node we don't have a route to"
      );
      return None;
    }
    let proxy = RemoteProxy::new(nid, aid, self.broker_tx.clone());
    // Whoever kills the proxy, the namespace entry must not outlive it.
    let tx = self.broker_tx.clone();
    proxy.attach_exit_hook(Box::new(move |_| {
      let _ = tx.try_send(Command::EraseProxy { node: nid, aid });
    }));
    self
      .namespace
      .get_or_put(nid, aid, || Some(proxy.clone()));
    // Tell the remote side we are watching this actor now.
    instance.write_announce_proxy(backend, nid, aid);
    self.emit(BrokerEvent::NewRemoteActor { addr: proxy.addr() });
    Some(proxy)
  }
}

impl Callee for BrokerCore {
  fn finalize_handshake(
    &mut self,
    instance: &mut BaspInstance,
    backend: &mut dyn Backend,
    ctx: &mut ConnectionContext,
    hs: &ServerHandshake,
  ) -> bool {
    ctx.peer = hs.node;
    let Some(callback) = ctx.callback.take() else {
      // Server handshake on a connection nobody is waiting for
      // (a repeated handshake); route learning already happened.
      return true;
    };
    let expected = std::mem::take(&mut ctx.expected_sigs);
    if !expected.is_subset(&hs.sigs) {
      debug!(node = %hs.node, "handshake signature mismatch");
      let _ = callback.send(Err(crate::error::BaspError::SignatureMismatch));
      return false;
    }
    if hs.published_actor == INVALID_ACTOR_ID {
      // Can occur when connecting to the default port of a node.
      let _ = callback.send(Ok(ActorAddr::invalid()));
      return true;
    }
    let addr = if hs.node == self.this_node {
      // Connected to ourselves.
      let addr = self.registry.get_addr(hs.published_actor);
      if addr.is_invalid() {
        info!(aid = hs.published_actor, "published actor not found in registry");
      }
      addr
    } else {
      match self.make_proxy(instance, backend, hs.node, hs.node, hs.published_actor) {
        Some(proxy) => proxy.addr(),
        None => ActorAddr::invalid(),
      }
    };
    if addr.is_remote(&self.this_node) {
      self.known_remotes.insert(hs.node, (ctx.remote_port, addr));
    }
    let _ = callback.send(Ok(addr));
    true
  }

  fn deliver(
    &mut self,
    instance: &mut BaspInstance,
    backend: &mut dyn Backend,
    ctx: &mut ConnectionContext,
    hdr: &Header,
    mid: MessageId,
    msg: Msg,
  ) {
    // Resolve the source to something that can receive a bounce.
    let src: Option<Arc<dyn AbstractActor>> = if hdr.from_node == self.this_node {
      self.registry.get(hdr.from_actor)
    } else {
      self
        .make_proxy(instance, backend, ctx.peer, hdr.from_node, hdr.from_actor)
        .map(|proxy| proxy as Arc<dyn AbstractActor>)
    };
    let src_addr = src
      .as_ref()
      .map(|actor| actor.addr())
      .unwrap_or_else(ActorAddr::invalid);

    let mut bounce_reason = ExitReason::REMOTE_LINK_UNREACHABLE;
    let dest: Option<Arc<dyn AbstractActor>> = if hdr.to_node == self.this_node {
      let (actor, reason) = self.registry.get_entry(hdr.to_actor);
      match actor {
        Some(actor) if !reason.is_exited() => Some(actor),
        Some(_) => {
          // A known-dead actor bounces with its recorded reason.
          bounce_reason = reason;
          None
        }
        None => None,
      }
    } else {
      self
        .make_proxy(instance, backend, ctx.peer, hdr.to_node, hdr.to_actor)
        .map(|proxy| proxy as Arc<dyn AbstractActor>)
    };

    match dest {
      Some(dest) => dest.enqueue(src_addr, mid, msg),
      None => {
        info!(to = hdr.to_actor, node = %hdr.to_node, "cannot deliver message, destination not found");
        if mid.is_request() && !src_addr.is_invalid() {
          if let Some(src) = src {
            bounce_request(&src, mid, bounce_reason);
          }
        }
      }
    }
  }

  fn proxy_announced(
    &mut self,
    instance: &mut BaspInstance,
    backend: &mut dyn Backend,
    nid: NodeId,
    aid: ActorId,
  ) {
    let (actor, reason) = self.registry.get_entry(aid);
    match actor {
      Some(actor) if !reason.is_exited() => {
        // Fire-once hook; re-enters the broker mailbox so the kill is
        // written on the broker's own execution context. A closed
        // mailbox (broker gone) makes this a no-op.
        let tx = self.broker_tx.clone();
        actor.attach_exit_hook(Box::new(move |exit_reason| {
          let _ = tx.try_send(Command::LocalActorDown {
            node: nid,
            aid,
            reason: exit_reason,
          });
        }));
      }
      _ => {
        debug!(aid, "kill proxy immediately");
        instance.write_kill_proxy(backend, nid, aid, reason);
      }
    }
  }

  fn kill_proxy(&mut self, nid: NodeId, aid: ActorId, reason: ExitReason) {
    self.namespace.erase_one(nid, aid, reason);
  }

  fn purge_proxies(&mut self, nid: NodeId) {
    let dropped = self.namespace.erase(nid);
    if dropped > 0 {
      debug!(node = %nid, dropped, "purged proxies of unreachable node");
    }
  }

  fn forget_node(&mut self, nid: NodeId) {
    if self.known_remotes.remove(&nid).is_some() {
      debug!(node = %nid, "forgot known remote");
    }
    self.emit(BrokerEvent::NodeDown { node: nid });
  }
}
