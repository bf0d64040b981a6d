// src/proxy.rs

//! Remote-actor proxies and the per-node proxy namespace.
//!
//! A [`RemoteProxy`] is the local stand-in for an actor on another node.
//! Sending to it re-enters the broker mailbox as a `Forward` command; the
//! broker serializes the message onto a routing path. Proxies die at most
//! once: the first kill wins, later kills are no-ops.

use crate::message::Msg;
use crate::node::{ActorAddr, ActorId, ExitReason, MessageId, NodeId};
use crate::registry::{AbstractActor, ExitHook};
use crate::runtime::{Command, MailboxSender};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

struct ProxyState {
  killed: Option<ExitReason>,
  hooks: Vec<ExitHook>,
}

/// Local representative of the remote actor `(node, id)`.
pub struct RemoteProxy {
  node: NodeId,
  id: ActorId,
  broker: MailboxSender,
  state: Mutex<ProxyState>,
}

impl RemoteProxy {
  pub(crate) fn new(node: NodeId, id: ActorId, broker: MailboxSender) -> Arc<Self> {
    Arc::new(Self {
      node,
      id,
      broker,
      state: Mutex::new(ProxyState {
        killed: None,
        hooks: Vec::new(),
      }),
    })
  }

  pub fn node(&self) -> NodeId {
    self.node
  }

  /// Terminates the proxy with `reason`. The first call fires the attached
  /// exit hooks; every later call is a no-op.
  pub fn kill(&self, reason: ExitReason) {
    let hooks = {
      let mut state = self.state.lock();
      if state.killed.is_some() {
        trace!(proxy = %self.addr(), "ignoring duplicate kill");
        return;
      }
      state.killed = Some(reason);
      std::mem::take(&mut state.hooks)
    };
    debug!(proxy = %self.addr(), reason = %reason, "killing proxy");
    for hook in hooks {
      hook(reason);
    }
  }
}

impl AbstractActor for RemoteProxy {
  fn id(&self) -> ActorId {
    self.id
  }

  fn addr(&self) -> ActorAddr {
    ActorAddr::new(self.node, self.id)
  }

  fn enqueue(&self, sender: ActorAddr, mid: MessageId, msg: Msg) {
    let cmd = Command::Forward {
      sender,
      receiver: self.addr(),
      mid,
      msg,
    };
    // A closed mailbox means the broker is gone; the message has nowhere
    // to go.
    if self.broker.try_send(cmd).is_err() {
      warn!(proxy = %self.addr(), "dropping message, broker unavailable");
    }
  }

  fn attach_exit_hook(&self, hook: ExitHook) {
    let fire_now = {
      let mut state = self.state.lock();
      match state.killed {
        Some(reason) => Some(reason),
        None => {
          state.hooks.push(hook);
          return;
        }
      }
    };
    if let Some(reason) = fire_now {
      hook(reason);
    }
  }

  fn exit_reason(&self) -> ExitReason {
    self.state.lock().killed.unwrap_or(ExitReason::NOT_EXITED)
  }
}

/// All proxies held for remote nodes, grouped by node.
#[derive(Default)]
pub struct ProxyNamespace {
  proxies: HashMap<NodeId, HashMap<ActorId, Arc<RemoteProxy>>>,
}

impl ProxyNamespace {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, node: NodeId, aid: ActorId) -> Option<Arc<RemoteProxy>> {
    self.proxies.get(&node)?.get(&aid).cloned()
  }

  /// Returns the proxy for `(node, aid)`, creating it through `make` when
  /// absent. `make` may refuse (no route), in which case nothing is
  /// stored.
  pub fn get_or_put<F>(&mut self, node: NodeId, aid: ActorId, make: F) -> Option<Arc<RemoteProxy>>
  where
    F: FnOnce() -> Option<Arc<RemoteProxy>>,
  {
    if let Some(existing) = self.get(node, aid) {
      return Some(existing);
    }
    let proxy = make()?;
    self
      .proxies
      .entry(node)
      .or_default()
      .insert(aid, proxy.clone());
    Some(proxy)
  }

  /// Snapshot of every proxy currently held for `node`. The namespace may
  /// change behind the snapshot.
  pub fn get_all(&self, node: NodeId) -> Vec<Arc<RemoteProxy>> {
    self
      .proxies
      .get(&node)
      .map(|entries| entries.values().cloned().collect())
      .unwrap_or_default()
  }

  /// Removes and kills one proxy. Returns `false` when it was not present
  /// (a duplicate kill).
  pub fn erase_one(&mut self, node: NodeId, aid: ActorId, reason: ExitReason) -> bool {
    let removed = match self.proxies.get_mut(&node) {
      Some(entries) => entries.remove(&aid),
      None => None,
    };
    let node_empty = self.proxies.get(&node).is_some_and(|entries| entries.is_empty());
    if node_empty {
      self.proxies.remove(&node);
    }
    match removed {
      Some(proxy) => {
        proxy.kill(reason);
        true
      }
      None => {
        debug!(node = %node, aid, "received kill proxy for unknown proxy");
        false
      }
    }
  }

  /// Removes every proxy under `node`, killing each with
  /// `remote_link_unreachable`. Returns how many were dropped.
  pub fn erase(&mut self, node: NodeId) -> usize {
    let entries = match self.proxies.remove(&node) {
      Some(entries) => entries,
      None => return 0,
    };
    let count = entries.len();
    for (_, proxy) in entries {
      proxy.kill(ExitReason::REMOTE_LINK_UNREACHABLE);
    }
    count
  }

  pub fn count(&self, node: NodeId) -> usize {
    self.proxies.get(&node).map_or(0, |entries| entries.len())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::runtime::mailbox;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn node(seed: u8) -> NodeId {
    let mut bytes = [0u8; crate::node::NODE_ID_LENGTH];
    bytes[0] = seed;
    NodeId::from_bytes(bytes)
  }

  #[test]
  fn get_or_put_creates_once() {
    let (tx, _rx) = mailbox(8);
    let mut ns = ProxyNamespace::new();
    let n = node(1);

    let first = ns.get_or_put(n, 7, || Some(RemoteProxy::new(n, 7, tx.clone())));
    assert!(first.is_some());
    let again = ns.get_or_put(n, 7, || panic!("must reuse the existing proxy"));
    assert!(Arc::ptr_eq(&first.unwrap(), &again.unwrap()));
    assert_eq!(ns.count(n), 1);
  }

  #[test]
  fn refused_creation_stores_nothing() {
    let mut ns = ProxyNamespace::new();
    assert!(ns.get_or_put(node(1), 7, || None).is_none());
    assert_eq!(ns.count(node(1)), 0);
  }

  #[test]
  fn duplicate_kill_is_idempotent() {
    let (tx, _rx) = mailbox(8);
    let mut ns = ProxyNamespace::new();
    let n = node(1);
    let proxy = ns
      .get_or_put(n, 7, || Some(RemoteProxy::new(n, 7, tx)))
      .unwrap();

    let fired = Arc::new(AtomicU32::new(0));
    let fired_clone = fired.clone();
    proxy.attach_exit_hook(Box::new(move |reason| {
      assert_eq!(reason, ExitReason::KILLED);
      fired_clone.fetch_add(1, Ordering::SeqCst);
    }));

    assert!(ns.erase_one(n, 7, ExitReason::KILLED));
    assert!(!ns.erase_one(n, 7, ExitReason::KILLED));
    proxy.kill(ExitReason::NORMAL); // already dead, no effect
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(proxy.exit_reason(), ExitReason::KILLED);
  }

  #[test]
  fn erase_marks_every_proxy_unreachable() {
    let (tx, _rx) = mailbox(8);
    let mut ns = ProxyNamespace::new();
    let n = node(1);
    for aid in 1..=3 {
      ns.get_or_put(n, aid, || Some(RemoteProxy::new(n, aid, tx.clone())));
    }
    let proxies = ns.get_all(n);
    assert_eq!(ns.erase(n), 3);
    assert_eq!(ns.count(n), 0);
    for proxy in proxies {
      assert_eq!(proxy.exit_reason(), ExitReason::REMOTE_LINK_UNREACHABLE);
    }
  }

  #[test]
  fn enqueue_forwards_through_the_broker_mailbox() {
    let (tx, rx) = mailbox(8);
    let n = node(1);
    let proxy = RemoteProxy::new(n, 7, tx);
    proxy.enqueue(ActorAddr::invalid(), MessageId::ASYNC, Msg::from_static(b"x"));
    match rx.try_recv().unwrap() {
      Command::Forward { receiver, .. } => assert_eq!(receiver, ActorAddr::new(n, 7)),
      other => panic!("unexpected command: {:?}", other),
    }
  }
}
