// src/config.rs

//! Static configuration of a broker instance.

use crate::node::NodeId;

/// Default cap on the payload length announced by a header (16 MiB).
pub const DEFAULT_MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

/// Default capacity of the broker's command mailbox.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 1024;

/// Default capacity of the monitor event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 100;

/// Configuration for a [`BaspBroker`](crate::broker::BaspBroker).
///
/// All fields have sensible defaults; `BaspConfig::new(node)` is the usual
/// entry point.
#[derive(Debug, Clone)]
pub struct BaspConfig {
  /// Identity of the local node.
  pub this_node: NodeId,
  /// Headers announcing a larger payload are treated as malformed.
  pub max_payload_len: u32,
  /// How many indirect links a route lookup may follow. The observed
  /// protocol only ever resolves one hop; raise this for k-hop overlays.
  pub max_indirect_hops: usize,
  /// Capacity of the broker command mailbox.
  pub mailbox_capacity: usize,
}

impl BaspConfig {
  pub fn new(this_node: NodeId) -> Self {
    Self {
      this_node,
      max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
      max_indirect_hops: 1,
      mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
    }
  }
}

impl Default for BaspConfig {
  /// A default config with a freshly generated random node id.
  fn default() -> Self {
    Self::new(NodeId::random())
  }
}
