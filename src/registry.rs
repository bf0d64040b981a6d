// src/registry.rs

//! The process-wide actor registry and the abstract-actor seam.
//!
//! The transport core never touches a scheduler. It resolves actor ids
//! through an injected [`ActorRegistry`] and delivers through the
//! [`AbstractActor`] trait; [`LocalActor`] is a minimal mailbox-backed
//! implementation sufficient for hosting published actors.

use crate::message::Msg;
use crate::node::{ActorAddr, ActorId, ExitReason, MessageId, NodeId};

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Callback invoked (at most once) with the actor's exit reason.
pub type ExitHook = Box<dyn FnOnce(ExitReason) + Send>;

/// Anything the transport can deliver messages to: a local actor or a
/// remote proxy.
///
/// Implementations must tolerate concurrent `enqueue` and
/// `attach_exit_hook` calls; the broker shares them freely.
pub trait AbstractActor: Send + Sync {
  fn id(&self) -> ActorId;

  fn addr(&self) -> ActorAddr;

  /// Places a message in the actor's mailbox. Must not block.
  fn enqueue(&self, sender: ActorAddr, mid: MessageId, msg: Msg);

  /// Registers a termination hook. Hooks attached after termination fire
  /// immediately with the recorded reason.
  fn attach_exit_hook(&self, hook: ExitHook);

  /// `ExitReason::NOT_EXITED` while the actor lives.
  fn exit_reason(&self) -> ExitReason;
}

/// Shared registry resolving node-local actor ids.
///
/// Cloning is cheap; all clones observe the same map. External code may
/// mutate it from any thread.
#[derive(Clone)]
pub struct ActorRegistry {
  inner: Arc<RwLock<HashMap<ActorId, Arc<dyn AbstractActor>>>>,
}

impl ActorRegistry {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(RwLock::new(HashMap::new())),
    }
  }

  pub fn put(&self, actor: Arc<dyn AbstractActor>) {
    let id = actor.id();
    self.inner.write().insert(id, actor);
  }

  pub fn get(&self, id: ActorId) -> Option<Arc<dyn AbstractActor>> {
    self.inner.read().get(&id).cloned()
  }

  /// Address of `id`, or the invalid address when unknown.
  pub fn get_addr(&self, id: ActorId) -> ActorAddr {
    self
      .get(id)
      .map(|actor| actor.addr())
      .unwrap_or_else(ActorAddr::invalid)
  }

  /// The actor plus its exit reason. Unknown ids report
  /// `ExitReason::UNKNOWN`, dead-but-registered ids their recorded reason.
  pub fn get_entry(&self, id: ActorId) -> (Option<Arc<dyn AbstractActor>>, ExitReason) {
    match self.get(id) {
      Some(actor) => {
        let reason = actor.exit_reason();
        (Some(actor), reason)
      }
      None => (None, ExitReason::UNKNOWN),
    }
  }

  pub fn erase(&self, id: ActorId) {
    self.inner.write().remove(&id);
  }
}

impl Default for ActorRegistry {
  fn default() -> Self {
    Self::new()
  }
}

/// Synthesizes the error response for a request whose destination vanished,
/// so the sender's pending future completes instead of hanging.
pub(crate) fn bounce_request(src: &Arc<dyn AbstractActor>, mid: MessageId, reason: ExitReason) {
  debug_assert!(mid.is_request());
  debug!(src = %src.addr(), reason = %reason, "bouncing request");
  src.enqueue(ActorAddr::invalid(), mid.response_id(), Msg::exit_notice(reason));
}

/// One delivery taken from a [`LocalActor`] mailbox.
#[derive(Debug, Clone)]
pub struct Delivery {
  pub sender: ActorAddr,
  pub mid: MessageId,
  pub msg: Msg,
}

struct LocalActorState {
  exited: Option<ExitReason>,
  hooks: Vec<ExitHook>,
}

/// Mailbox-backed local actor.
///
/// `new` returns the actor handle plus the receiving end of its mailbox;
/// whoever processes the actor's messages owns the receiver. `terminate`
/// records the exit reason, fires attached hooks exactly once, and closes
/// the mailbox.
pub struct LocalActor {
  id: ActorId,
  node: NodeId,
  mailbox: async_channel::Sender<Delivery>,
  state: Mutex<LocalActorState>,
}

impl LocalActor {
  pub fn new(
    node: NodeId,
    id: ActorId,
    capacity: usize,
  ) -> (Arc<Self>, async_channel::Receiver<Delivery>) {
    let (tx, rx) = async_channel::bounded(capacity.max(1));
    let actor = Arc::new(Self {
      id,
      node,
      mailbox: tx,
      state: Mutex::new(LocalActorState {
        exited: None,
        hooks: Vec::new(),
      }),
    });
    (actor, rx)
  }

  /// Marks the actor terminated. Idempotent; only the first reason sticks.
  pub fn terminate(&self, reason: ExitReason) {
    let hooks = {
      let mut state = self.state.lock();
      if state.exited.is_some() {
        return;
      }
      state.exited = Some(reason);
      std::mem::take(&mut state.hooks)
    };
    self.mailbox.close();
    for hook in hooks {
      hook(reason);
    }
  }
}

impl AbstractActor for LocalActor {
  fn id(&self) -> ActorId {
    self.id
  }

  fn addr(&self) -> ActorAddr {
    ActorAddr::new(self.node, self.id)
  }

  fn enqueue(&self, sender: ActorAddr, mid: MessageId, msg: Msg) {
    let delivery = Delivery { sender, mid, msg };
    if let Err(e) = self.mailbox.try_send(delivery) {
      warn!(actor = self.id, error = %e, "dropping delivery, mailbox unavailable");
    }
  }

  fn attach_exit_hook(&self, hook: ExitHook) {
    let fire_now = {
      let mut state = self.state.lock();
      match state.exited {
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
    self.state.lock().exited.unwrap_or(ExitReason::NOT_EXITED)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};

  #[test]
  fn registry_resolves_and_forgets() {
    let node = NodeId::random();
    let registry = ActorRegistry::new();
    let (actor, _rx) = LocalActor::new(node, 7, 8);
    registry.put(actor.clone());

    assert_eq!(registry.get_addr(7), ActorAddr::new(node, 7));
    let (found, reason) = registry.get_entry(7);
    assert!(found.is_some());
    assert_eq!(reason, ExitReason::NOT_EXITED);

    registry.erase(7);
    assert!(registry.get(7).is_none());
    assert_eq!(registry.get_entry(7).1, ExitReason::UNKNOWN);
    assert!(registry.get_addr(7).is_invalid());
  }

  #[test]
  fn exit_hooks_fire_exactly_once() {
    let (actor, _rx) = LocalActor::new(NodeId::random(), 1, 8);
    let fired = Arc::new(AtomicU32::new(0));

    let fired_clone = fired.clone();
    actor.attach_exit_hook(Box::new(move |reason| {
      assert_eq!(reason, ExitReason::NORMAL);
      fired_clone.fetch_add(1, Ordering::SeqCst);
    }));

    actor.terminate(ExitReason::NORMAL);
    actor.terminate(ExitReason::KILLED); // ignored
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(actor.exit_reason(), ExitReason::NORMAL);

    // Late attachment observes the recorded reason immediately.
    let fired_clone = fired.clone();
    actor.attach_exit_hook(Box::new(move |reason| {
      assert_eq!(reason, ExitReason::NORMAL);
      fired_clone.fetch_add(1, Ordering::SeqCst);
    }));
    assert_eq!(fired.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn enqueue_reaches_the_mailbox() {
    let (actor, rx) = LocalActor::new(NodeId::random(), 1, 8);
    actor.enqueue(ActorAddr::invalid(), MessageId::ASYNC, Msg::from_static(b"hi"));
    let delivery = rx.try_recv().unwrap();
    assert_eq!(delivery.msg.data(), Some(&b"hi"[..]));
  }
}
