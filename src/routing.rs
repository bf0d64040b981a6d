// src/routing.rs

//! The routing table: direct peers (one connection each) plus learned
//! indirect next-hops for nodes reachable through a peer.

use crate::backend::{Backend, ConnectionHandle};
use crate::node::NodeId;

use std::collections::HashMap;
use tracing::{debug, trace};

/// Result of a route lookup: where to write for `dest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Path {
  /// Connection carrying the next hop.
  pub hdl: ConnectionHandle,
  /// The peer node owning `hdl`. Equals `dest` for direct routes.
  pub next_hop: NodeId,
  /// Final destination.
  pub dest: NodeId,
}

/// Bidirectional map of direct peers plus a next-hop table for indirect
/// ones.
///
/// Invariant: `direct` is a bijection. A node has at most one connection and
/// a connection belongs to at most one node.
#[derive(Debug)]
pub struct RoutingTable {
  direct: HashMap<NodeId, ConnectionHandle>,
  direct_by_hdl: HashMap<ConnectionHandle, NodeId>,
  /// target node -> node to route through.
  indirect: HashMap<NodeId, NodeId>,
  max_hops: usize,
}

impl RoutingTable {
  pub fn new(max_hops: usize) -> Self {
    Self {
      direct: HashMap::new(),
      direct_by_hdl: HashMap::new(),
      indirect: HashMap::new(),
      max_hops: max_hops.max(1),
    }
  }

  /// Registers a direct route. Returns `false` (and changes nothing) when
  /// either the node or the handle is already present.
  pub fn add_direct(&mut self, node: NodeId, hdl: ConnectionHandle) -> bool {
    if node.is_invalid() || self.direct.contains_key(&node) || self.direct_by_hdl.contains_key(&hdl)
    {
      return false;
    }
    trace!(node = %node, handle = %hdl, "adding direct route");
    self.direct.insert(node, hdl);
    self.direct_by_hdl.insert(hdl, node);
    // A direct route supersedes anything learned indirectly.
    self.indirect.remove(&node);
    true
  }

  /// Records that `target` is reachable through the direct peer `via`.
  ///
  /// No-op when a direct route to `target` already exists. Rejected when
  /// `via` is not itself a direct peer, when target and hop coincide, or
  /// when the entry would close a cycle.
  pub fn add_indirect(&mut self, via: NodeId, target: NodeId) -> bool {
    if target.is_invalid() || via == target || self.direct.contains_key(&target) {
      return false;
    }
    if !self.direct.contains_key(&via) {
      return false;
    }
    if self.closes_cycle(via, target) {
      debug!(via = %via, target = %target, "rejecting indirect route, would form a cycle");
      return false;
    }
    trace!(via = %via, target = %target, "adding indirect route");
    self.indirect.insert(target, via);
    true
  }

  // Walking from `via` must not lead back to `target`.
  fn closes_cycle(&self, via: NodeId, target: NodeId) -> bool {
    let mut cursor = via;
    for _ in 0..=self.indirect.len() {
      if cursor == target {
        return true;
      }
      match self.indirect.get(&cursor) {
        Some(next) => cursor = *next,
        None => return false,
      }
    }
    true
  }

  /// Resolves `node` to a writable path, preferring a direct route over an
  /// indirect one. Indirect resolution follows at most `max_hops` links.
  pub fn lookup(&self, node: NodeId) -> Option<Path> {
    if let Some(hdl) = self.direct.get(&node) {
      return Some(Path {
        hdl: *hdl,
        next_hop: node,
        dest: node,
      });
    }
    let mut cursor = node;
    for _ in 0..self.max_hops {
      let hop = *self.indirect.get(&cursor)?;
      if let Some(hdl) = self.direct.get(&hop) {
        return Some(Path {
          hdl: *hdl,
          next_hop: hop,
          dest: node,
        });
      }
      cursor = hop;
    }
    None
  }

  /// Handle of the direct route to `node`, if one exists.
  pub fn lookup_direct(&self, node: NodeId) -> Option<ConnectionHandle> {
    self.direct.get(&node).copied()
  }

  /// Node owning the direct connection `hdl`, if any.
  pub fn node_of(&self, hdl: ConnectionHandle) -> Option<NodeId> {
    self.direct_by_hdl.get(&hdl).copied()
  }

  /// Removes the direct entry for `hdl` and, in the same pass, every
  /// indirect entry whose next-hop was the removed node. Entries whose
  /// chains become orphaned further out simply stop resolving.
  pub fn erase_direct(&mut self, hdl: ConnectionHandle) -> Option<NodeId> {
    let node = self.direct_by_hdl.remove(&hdl)?;
    self.direct.remove(&node);
    self.indirect.retain(|_, via| *via != node);
    debug!(node = %node, handle = %hdl, "erased direct route");
    Some(node)
  }

  /// Forgets any indirect entry targeting `node`.
  pub fn erase_indirect(&mut self, node: NodeId) {
    self.indirect.remove(&node);
  }

  /// Whether any route (direct, or indirect with a live next-hop chain)
  /// leads to `node`.
  pub fn reachable(&self, node: NodeId) -> bool {
    self.lookup(node).is_some()
  }

  /// Drives the write buffer of `path` to the wire. A no-op when the
  /// path's connection has meanwhile been closed.
  pub fn flush(&self, backend: &mut dyn Backend, path: &Path) {
    if self.direct_by_hdl.contains_key(&path.hdl) {
      backend.flush(path.hdl);
    } else {
      trace!(handle = %path.hdl, "dropping flush for closed path");
    }
  }
}
