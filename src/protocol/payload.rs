// src/protocol/payload.rs

//! Payload bodies of the non-empty operations.
//!
//! Bodies share the header's conventions: big-endian integers, node ids as
//! raw 20-byte runs, strings as u32-length-prefixed UTF-8. Decoding is
//! defensive; any truncation or length lie is a malformed-message error,
//! never a panic.

use crate::error::{BaspError, BaspResult};
use crate::message::Msg;
use crate::node::{ActorId, MessageId, NodeId, NODE_ID_LENGTH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeSet;

// Cap on the advertised signature count, far above anything sane.
const MAX_SIGNATURES: u32 = 1024;
const MAX_SIGNATURE_LEN: u32 = 4096;

/// Body of a `server_handshake` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHandshake {
  /// The responding node.
  pub node: NodeId,
  /// Actor published on the contacted port, 0 when the port has none.
  pub published_actor: ActorId,
  /// Interface signatures advertised for the published actor.
  pub sigs: BTreeSet<String>,
}

impl ServerHandshake {
  pub fn encode(&self, dst: &mut BytesMut) {
    dst.put_slice(self.node.as_bytes());
    dst.put_u64(self.published_actor);
    put_string_set(dst, &self.sigs);
  }

  pub fn decode(mut src: Bytes) -> BaspResult<Self> {
    let node = get_node_id(&mut src)?;
    if src.remaining() < 8 {
      return Err(truncated("server_handshake"));
    }
    let published_actor = src.get_u64();
    let sigs = get_string_set(&mut src, "server_handshake")?;
    expect_drained(&src, "server_handshake")?;
    Ok(Self {
      node,
      published_actor,
      sigs,
    })
  }
}

/// Body of a `client_handshake` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHandshake {
  /// The connecting node.
  pub node: NodeId,
  /// The signatures the client insisted on. Informational for the server;
  /// the actual check already happened on the client side.
  pub sigs: BTreeSet<String>,
}

impl ClientHandshake {
  pub fn encode(&self, dst: &mut BytesMut) {
    dst.put_slice(self.node.as_bytes());
    put_string_set(dst, &self.sigs);
  }

  pub fn decode(mut src: Bytes) -> BaspResult<Self> {
    let node = get_node_id(&mut src)?;
    let sigs = get_string_set(&mut src, "client_handshake")?;
    expect_drained(&src, "client_handshake")?;
    Ok(Self { node, sigs })
  }
}

/// Body of a `dispatch_message` frame: the message id followed by the opaque
/// user payload.
#[derive(Debug, Clone)]
pub struct DispatchPayload {
  pub mid: MessageId,
  pub msg: Msg,
}

impl DispatchPayload {
  pub fn encode(&self, dst: &mut BytesMut) {
    dst.put_u64(self.mid.raw());
    if let Some(data) = self.msg.data() {
      dst.put_slice(data);
    }
  }

  pub fn decode(mut src: Bytes) -> BaspResult<Self> {
    if src.remaining() < 8 {
      return Err(truncated("dispatch_message"));
    }
    let mid = MessageId::from_raw(src.get_u64());
    // The remainder is the user payload, taken as-is.
    let msg = if src.is_empty() {
      Msg::new()
    } else {
      Msg::from_bytes(src)
    };
    Ok(Self { mid, msg })
  }
}

fn put_string_set(dst: &mut BytesMut, set: &BTreeSet<String>) {
  dst.put_u32(set.len() as u32);
  for entry in set {
    dst.put_u32(entry.len() as u32);
    dst.put_slice(entry.as_bytes());
  }
}

fn get_string_set(src: &mut Bytes, what: &str) -> BaspResult<BTreeSet<String>> {
  if src.remaining() < 4 {
    return Err(truncated(what));
  }
  let count = src.get_u32();
  if count > MAX_SIGNATURES {
    return Err(BaspError::MalformedMessage(format!(
      "{}: {} signatures exceed limit",
      what, count
    )));
  }
  let mut set = BTreeSet::new();
  for _ in 0..count {
    if src.remaining() < 4 {
      return Err(truncated(what));
    }
    let len = src.get_u32();
    if len > MAX_SIGNATURE_LEN || src.remaining() < len as usize {
      return Err(truncated(what));
    }
    let raw = src.split_to(len as usize);
    let sig = String::from_utf8(raw.to_vec())
      .map_err(|_| BaspError::MalformedMessage(format!("{}: signature is not UTF-8", what)))?;
    set.insert(sig);
  }
  Ok(set)
}

fn get_node_id(src: &mut Bytes) -> BaspResult<NodeId> {
  if src.remaining() < NODE_ID_LENGTH {
    return Err(truncated("node id"));
  }
  let mut bytes = [0u8; NODE_ID_LENGTH];
  src.copy_to_slice(&mut bytes);
  Ok(NodeId::from_bytes(bytes))
}

fn expect_drained(src: &Bytes, what: &str) -> BaspResult<()> {
  if src.is_empty() {
    Ok(())
  } else {
    Err(BaspError::MalformedMessage(format!(
      "{}: {} trailing bytes",
      what,
      src.len()
    )))
  }
}

fn truncated(what: &str) -> BaspError {
  BaspError::MalformedMessage(format!("{}: truncated payload", what))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sigs(entries: &[&str]) -> BTreeSet<String> {
    entries.iter().map(|s| s.to_string()).collect()
  }

  #[test]
  fn server_handshake_round_trips() {
    let hs = ServerHandshake {
      node: NodeId::random(),
      published_actor: 7,
      sigs: sigs(&["caf::replies_to<int>::with<int>"]),
    };
    let mut buf = BytesMut::new();
    hs.encode(&mut buf);
    assert_eq!(ServerHandshake::decode(buf.freeze()).unwrap(), hs);
  }

  #[test]
  fn client_handshake_round_trips_empty_sigs() {
    let hs = ClientHandshake {
      node: NodeId::random(),
      sigs: BTreeSet::new(),
    };
    let mut buf = BytesMut::new();
    hs.encode(&mut buf);
    assert_eq!(ClientHandshake::decode(buf.freeze()).unwrap(), hs);
  }

  #[test]
  fn truncated_handshake_is_malformed() {
    let hs = ServerHandshake {
      node: NodeId::random(),
      published_actor: 1,
      sigs: sigs(&["sig"]),
    };
    let mut buf = BytesMut::new();
    hs.encode(&mut buf);
    let full = buf.freeze();
    for cut in [0, NODE_ID_LENGTH, full.len() - 1] {
      let err = ServerHandshake::decode(full.slice(..cut)).unwrap_err();
      assert!(matches!(err, BaspError::MalformedMessage(_)), "cut at {}", cut);
    }
  }

  #[test]
  fn signature_length_lie_is_malformed() {
    let mut buf = BytesMut::new();
    buf.put_slice(NodeId::random().as_bytes());
    buf.put_u64(0);
    buf.put_u32(1); // one signature ...
    buf.put_u32(64); // ... claiming 64 bytes ...
    buf.put_slice(b"short"); // ... with 5 present
    assert!(ServerHandshake::decode(buf.freeze()).is_err());
  }

  #[test]
  fn dispatch_payload_separates_mid_and_body() {
    let payload = DispatchPayload {
      mid: MessageId::make_request(9),
      msg: Msg::from_static(b"hello"),
    };
    let mut buf = BytesMut::new();
    payload.encode(&mut buf);
    let decoded = DispatchPayload::decode(buf.freeze()).unwrap();
    assert_eq!(decoded.mid, payload.mid);
    assert_eq!(decoded.msg.data(), Some(&b"hello"[..]));
  }
}
