// src/node.rs

//! Identity types shared by every layer of the transport: node ids, actor
//! ids, addresses, message ids, and exit reasons.

use std::fmt;

/// Width of a `NodeId` in bytes (160 bits).
pub const NODE_ID_LENGTH: usize = 20;

/// Opaque identifier of a node participating in the BASP overlay.
///
/// The all-zero value is reserved as [`NodeId::INVALID`]; it never appears as
/// a live peer and is used on the wire to mean "no node".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId([u8; NODE_ID_LENGTH]);

impl NodeId {
  /// The distinguished invalid node id (all zeroes).
  pub const INVALID: NodeId = NodeId([0u8; NODE_ID_LENGTH]);

  /// Creates a node id from raw bytes.
  pub const fn from_bytes(bytes: [u8; NODE_ID_LENGTH]) -> Self {
    NodeId(bytes)
  }

  /// Generates a fresh random node id. Retries on the (astronomically
  /// unlikely) all-zero draw so the result is always valid.
  pub fn random() -> Self {
    loop {
      let mut bytes = [0u8; NODE_ID_LENGTH];
      rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);
      let id = NodeId(bytes);
      if !id.is_invalid() {
        return id;
      }
    }
  }

  pub fn is_invalid(&self) -> bool {
    *self == Self::INVALID
  }

  pub fn as_bytes(&self) -> &[u8; NODE_ID_LENGTH] {
    &self.0
  }
}

impl fmt::Display for NodeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for byte in self.0.iter() {
      write!(f, "{:02x}", byte)?;
    }
    Ok(())
  }
}

impl fmt::Debug for NodeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_invalid() {
      return write!(f, "NodeId(invalid)");
    }
    // Eight hex chars are enough to tell nodes apart in logs.
    write!(
      f,
      "NodeId({:02x}{:02x}{:02x}{:02x}..)",
      self.0[0], self.0[1], self.0[2], self.0[3]
    )
  }
}

/// Identifier of an actor within its node.
pub type ActorId = u64;

/// The distinguished invalid actor id.
pub const INVALID_ACTOR_ID: ActorId = 0;

/// Address of an actor anywhere in the overlay: the node it runs on plus its
/// node-local actor id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct ActorAddr {
  pub node: NodeId,
  pub id: ActorId,
}

impl ActorAddr {
  pub const fn new(node: NodeId, id: ActorId) -> Self {
    ActorAddr { node, id }
  }

  /// The invalid address: invalid node, invalid actor id.
  pub const fn invalid() -> Self {
    ActorAddr {
      node: NodeId::INVALID,
      id: INVALID_ACTOR_ID,
    }
  }

  pub fn is_invalid(&self) -> bool {
    self.node.is_invalid() || self.id == INVALID_ACTOR_ID
  }

  /// Whether this address points to an actor on a node other than
  /// `this_node`.
  pub fn is_remote(&self, this_node: &NodeId) -> bool {
    !self.is_invalid() && self.node != *this_node
  }
}

impl fmt::Display for ActorAddr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_invalid() {
      write!(f, "<invalid-actor>")
    } else {
      write!(f, "{}@{}", self.id, self.node)
    }
  }
}

// Kind tag in the two most significant bits of a message id.
const MID_KIND_SHIFT: u32 = 62;
const MID_KIND_MASK: u64 = 0b11 << MID_KIND_SHIFT;
const MID_KIND_REQUEST: u64 = 0b01 << MID_KIND_SHIFT;
const MID_KIND_RESPONSE: u64 = 0b10 << MID_KIND_SHIFT;
const MID_SEQ_MASK: u64 = !MID_KIND_MASK;

/// Tagged 64-bit message identifier.
///
/// Plain asynchronous sends use [`MessageId::ASYNC`] (zero). Request/response
/// pairs share a sequence number; the kind tag distinguishes the two
/// directions so a bounced or answered request can be matched by the caller.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MessageId(u64);

impl MessageId {
  /// Id of a plain asynchronous message.
  pub const ASYNC: MessageId = MessageId(0);

  /// Creates the id of a new request with the given sequence number.
  pub fn make_request(seq: u64) -> Self {
    MessageId(MID_KIND_REQUEST | (seq & MID_SEQ_MASK))
  }

  /// Non-zero ids belong to a request/response exchange.
  pub fn valid(&self) -> bool {
    self.0 != 0
  }

  pub fn is_request(&self) -> bool {
    self.0 & MID_KIND_MASK == MID_KIND_REQUEST
  }

  pub fn is_response(&self) -> bool {
    self.0 & MID_KIND_MASK == MID_KIND_RESPONSE
  }

  /// The id a response to this request must carry.
  pub fn response_id(&self) -> MessageId {
    MessageId(MID_KIND_RESPONSE | (self.0 & MID_SEQ_MASK))
  }

  pub fn seq(&self) -> u64 {
    self.0 & MID_SEQ_MASK
  }

  /// Raw wire value.
  pub fn raw(&self) -> u64 {
    self.0
  }

  pub fn from_raw(raw: u64) -> Self {
    MessageId(raw)
  }
}

impl fmt::Debug for MessageId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if !self.valid() {
      write!(f, "MessageId(async)")
    } else if self.is_request() {
      write!(f, "MessageId(request {})", self.seq())
    } else if self.is_response() {
      write!(f, "MessageId(response {})", self.seq())
    } else {
      write!(f, "MessageId({:#x})", self.0)
    }
  }
}

/// Reason an actor (or its proxy) terminated, as carried in the
/// `operation_data` field of `kill_proxy_instance`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExitReason(u32);

impl ExitReason {
  /// The actor is still alive.
  pub const NOT_EXITED: ExitReason = ExitReason(0);
  /// Regular termination.
  pub const NORMAL: ExitReason = ExitReason(1);
  /// Forcefully terminated.
  pub const KILLED: ExitReason = ExitReason(2);
  /// The route to the actor's host node was lost.
  pub const REMOTE_LINK_UNREACHABLE: ExitReason = ExitReason(3);
  /// Termination reason could not be determined (e.g. unknown actor id).
  pub const UNKNOWN: ExitReason = ExitReason(4);

  pub const fn from_raw(raw: u32) -> Self {
    ExitReason(raw)
  }

  pub const fn raw(&self) -> u32 {
    self.0
  }

  pub fn is_exited(&self) -> bool {
    *self != Self::NOT_EXITED
  }
}

impl fmt::Display for ExitReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match *self {
      ExitReason::NOT_EXITED => write!(f, "not_exited"),
      ExitReason::NORMAL => write!(f, "normal"),
      ExitReason::KILLED => write!(f, "killed"),
      ExitReason::REMOTE_LINK_UNREACHABLE => write!(f, "remote_link_unreachable"),
      ExitReason::UNKNOWN => write!(f, "unknown"),
      ExitReason(other) => write!(f, "exit_reason({})", other),
    }
  }
}

impl fmt::Debug for ExitReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(self, f)
  }
}
