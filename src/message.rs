// src/message.rs

//! The opaque message container carried by `dispatch_message` frames.
//!
//! The transport never interprets user payloads; it moves byte blobs between
//! mailboxes. `Bytes` keeps clones cheap (reference counted) along the
//! enqueue/forward path.

use crate::node::ExitReason;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

// Marker prefix for exit notices synthesized by the request bouncer, so they
// cannot be confused with ordinary user payloads by accident.
const EXIT_NOTICE_TAG: &[u8; 4] = b"\0XIT";

/// A single user-level message payload.
#[derive(Clone, Default)]
pub struct Msg {
  data: Option<Bytes>,
}

impl Msg {
  /// Creates an empty message with no data.
  pub fn new() -> Self {
    Self::default()
  }

  /// Creates a message from a `Vec<u8>`, taking ownership.
  pub fn from_vec(data: Vec<u8>) -> Self {
    Self {
      data: Some(Bytes::from(data)),
    }
  }

  /// Creates a message from `bytes::Bytes`.
  pub fn from_bytes(data: Bytes) -> Self {
    Self { data: Some(data) }
  }

  /// Creates a message from a static byte slice (zero-copy).
  pub fn from_static(data: &'static [u8]) -> Self {
    Self {
      data: Some(Bytes::from_static(data)),
    }
  }

  /// Returns a reference to the message payload bytes, if any.
  pub fn data(&self) -> Option<&[u8]> {
    self.data.as_deref()
  }

  /// Returns the size of the message payload in bytes.
  pub fn size(&self) -> usize {
    self.data.as_ref().map_or(0, |d| d.len())
  }

  /// Returns the internal `Bytes` object if data is present. Cloning `Bytes`
  /// is cheap as it is reference-counted.
  pub fn data_bytes(&self) -> Option<Bytes> {
    self.data.clone()
  }

  /// Builds the synthetic payload delivered to a requester whose destination
  /// vanished. Carries the exit reason of the unreachable actor.
  pub fn exit_notice(reason: ExitReason) -> Self {
    let mut buf = BytesMut::with_capacity(EXIT_NOTICE_TAG.len() + 4);
    buf.put_slice(EXIT_NOTICE_TAG);
    buf.put_u32(reason.raw());
    Self {
      data: Some(buf.freeze()),
    }
  }

  /// Decodes an exit notice previously built by [`Msg::exit_notice`].
  /// Returns `None` for ordinary payloads.
  pub fn as_exit_notice(&self) -> Option<ExitReason> {
    let data = self.data()?;
    if data.len() != EXIT_NOTICE_TAG.len() + 4 || &data[..4] != EXIT_NOTICE_TAG {
      return None;
    }
    let mut tail = &data[4..];
    Some(ExitReason::from_raw(tail.get_u32()))
  }
}

impl fmt::Debug for Msg {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if let Some(reason) = self.as_exit_notice() {
      return f.debug_struct("Msg").field("exit_notice", &reason).finish();
    }
    f.debug_struct("Msg")
      .field("size", &self.size())
      .finish()
  }
}
