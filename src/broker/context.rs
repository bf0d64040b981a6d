// src/broker/context.rs

//! Per-connection context storage.

use crate::backend::ConnectionHandle;
use crate::error::BaspError;
use crate::instance::ConnectionContext;

use std::collections::HashMap;
use tracing::{debug, info};

/// Owns every live [`ConnectionContext`], keyed by connection handle.
#[derive(Default)]
pub struct ContextStore {
  entries: HashMap<ConnectionHandle, ConnectionContext>,
}

impl ContextStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// The context for `hdl`, created on first use.
  pub fn get_or_create(&mut self, hdl: ConnectionHandle) -> &mut ConnectionContext {
    self.entries.entry(hdl).or_insert_with(|| {
      info!(handle = %hdl, "creating new BASP context");
      ConnectionContext::new(hdl)
    })
  }

  pub fn get_mut(&mut self, hdl: ConnectionHandle) -> Option<&mut ConnectionContext> {
    self.entries.get_mut(&hdl)
  }

  /// Destroys the context of `hdl`. A pending handshake callback is
  /// answered with a disconnect error so the initiator's future completes.
  /// Returns `false` when no context existed.
  pub fn erase(&mut self, hdl: ConnectionHandle) -> bool {
    let Some(ctx) = self.entries.remove(&hdl) else {
      return false;
    };
    if let Some(callback) = ctx.callback {
      debug!(handle = %hdl, "connection closed during handshake");
      let _ = callback.send(Err(BaspError::DisconnectDuringHandshake));
    }
    true
  }

  /// Destroys every context, answering all pending callbacks. Used on
  /// broker shutdown.
  pub fn drain(&mut self) -> Vec<ConnectionHandle> {
    let handles: Vec<_> = self.entries.keys().copied().collect();
    for hdl in &handles {
      self.erase(*hdl);
    }
    handles
  }

  pub fn handles(&self) -> impl Iterator<Item = ConnectionHandle> + '_ {
    self.entries.keys().copied()
  }
}
