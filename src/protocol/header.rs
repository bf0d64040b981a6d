// src/protocol/header.rs

//! Fixed-size message headers: big-endian, bit-exact, no allocation on
//! decode.

use crate::error::{BaspError, BaspResult};
use crate::node::{ActorId, NodeId, INVALID_ACTOR_ID, NODE_ID_LENGTH};

use bytes::{Buf, BufMut, BytesMut};

/// Encoded size of a [`Header`]: two node ids, two actor ids, payload
/// length, operation, operation data.
pub const HEADER_SIZE: usize = 2 * NODE_ID_LENGTH + 8 + 8 + 4 + 4 + 4;

/// Operation tag of a BASP frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
  /// First message on every accepted connection; the server reveals its
  /// node id and the signatures of the actor published on the contacted
  /// port.
  ServerHandshake = 0,
  /// The client's answer, revealing its own node id.
  ClientHandshake = 1,
  /// A user message routed to an actor.
  DispatchMessage = 2,
  /// The sender created a proxy for one of our local actors.
  AnnounceProxyInstance = 3,
  /// A previously announced actor terminated; exit reason rides in
  /// `operation_data`.
  KillProxyInstance = 4,
}

impl TryFrom<u32> for Opcode {
  type Error = BaspError;

  fn try_from(raw: u32) -> Result<Self, Self::Error> {
    match raw {
      0 => Ok(Opcode::ServerHandshake),
      1 => Ok(Opcode::ClientHandshake),
      2 => Ok(Opcode::DispatchMessage),
      3 => Ok(Opcode::AnnounceProxyInstance),
      4 => Ok(Opcode::KillProxyInstance),
      other => Err(BaspError::UnknownOpcode(other)),
    }
  }
}

/// Decoded BASP message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
  pub from_node: NodeId,
  pub to_node: NodeId,
  pub from_actor: ActorId,
  pub to_actor: ActorId,
  pub payload_len: u32,
  pub operation: Opcode,
  pub operation_data: u32,
}

impl Header {
  /// Serializes the header in declaration order, big-endian.
  pub fn encode(&self, dst: &mut BytesMut) {
    dst.reserve(HEADER_SIZE);
    dst.put_slice(self.from_node.as_bytes());
    dst.put_slice(self.to_node.as_bytes());
    dst.put_u64(self.from_actor);
    dst.put_u64(self.to_actor);
    dst.put_u32(self.payload_len);
    dst.put_u32(self.operation as u32);
    dst.put_u32(self.operation_data);
  }

  /// Decodes a header from exactly [`HEADER_SIZE`] bytes and checks the
  /// opcode-independent and opcode-specific consistency rules.
  pub fn decode(src: &[u8], max_payload_len: u32) -> BaspResult<Header> {
    if src.len() != HEADER_SIZE {
      return Err(BaspError::MalformedMessage(format!(
        "header is {} bytes, expected {}",
        src.len(),
        HEADER_SIZE
      )));
    }
    let mut buf = src;
    let from_node = get_node_id(&mut buf);
    let to_node = get_node_id(&mut buf);
    let from_actor = buf.get_u64();
    let to_actor = buf.get_u64();
    let payload_len = buf.get_u32();
    let operation = Opcode::try_from(buf.get_u32())?;
    let operation_data = buf.get_u32();
    let hdr = Header {
      from_node,
      to_node,
      from_actor,
      to_actor,
      payload_len,
      operation,
      operation_data,
    };
    hdr.validate(max_payload_len)?;
    Ok(hdr)
  }

  fn validate(&self, max_payload_len: u32) -> BaspResult<()> {
    if self.payload_len > max_payload_len {
      return Err(BaspError::PayloadTooLarge {
        got: self.payload_len,
        limit: max_payload_len,
      });
    }
    match self.operation {
      Opcode::ServerHandshake => {
        // The published actor id travels in the payload, not the header.
        self.check(self.payload_len > 0, "server_handshake without payload")?;
        self.check(!self.from_node.is_invalid(), "server_handshake from invalid node")?;
        self.check(
          self.from_actor == INVALID_ACTOR_ID,
          "server_handshake with header actor id",
        )
      }
      Opcode::ClientHandshake => {
        self.check(self.payload_len > 0, "client_handshake without payload")?;
        self.check(!self.from_node.is_invalid(), "client_handshake from invalid node")
      }
      Opcode::DispatchMessage => {
        // At minimum the message id must be present.
        self.check(self.payload_len >= 8, "dispatch_message payload too short")?;
        self.check(!self.to_node.is_invalid(), "dispatch_message to invalid node")?;
        self.check(
          self.to_actor != INVALID_ACTOR_ID,
          "dispatch_message to invalid actor",
        )
      }
      Opcode::AnnounceProxyInstance => {
        self.check(self.payload_len == 0, "announce_proxy_instance with payload")?;
        self.check(!self.from_node.is_invalid(), "announce from invalid node")?;
        self.check(
          self.to_actor != INVALID_ACTOR_ID,
          "announce for invalid actor",
        )
      }
      Opcode::KillProxyInstance => {
        self.check(self.payload_len == 0, "kill_proxy_instance with payload")?;
        self.check(!self.from_node.is_invalid(), "kill_proxy from invalid node")?;
        self.check(
          self.from_actor != INVALID_ACTOR_ID,
          "kill_proxy for invalid actor",
        )
      }
    }
  }

  fn check(&self, ok: bool, what: &str) -> BaspResult<()> {
    if ok {
      Ok(())
    } else {
      Err(BaspError::MalformedMessage(what.to_string()))
    }
  }
}

fn get_node_id(buf: &mut &[u8]) -> NodeId {
  let mut bytes = [0u8; NODE_ID_LENGTH];
  buf.copy_to_slice(&mut bytes);
  NodeId::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::DEFAULT_MAX_PAYLOAD_LEN;

  fn sample_header(operation: Opcode) -> Header {
    Header {
      from_node: NodeId::random(),
      to_node: NodeId::random(),
      from_actor: 0,
      to_actor: 7,
      payload_len: 0,
      operation,
      operation_data: 0,
    }
  }

  fn encode(hdr: &Header) -> BytesMut {
    let mut buf = BytesMut::new();
    hdr.encode(&mut buf);
    buf
  }

  #[test]
  fn header_size_matches_encoding() {
    let buf = encode(&sample_header(Opcode::AnnounceProxyInstance));
    assert_eq!(buf.len(), HEADER_SIZE);
  }

  #[test]
  fn announce_round_trips() {
    let hdr = sample_header(Opcode::AnnounceProxyInstance);
    let buf = encode(&hdr);
    let decoded = Header::decode(&buf, DEFAULT_MAX_PAYLOAD_LEN).unwrap();
    assert_eq!(decoded, hdr);
  }

  #[test]
  fn unknown_opcode_is_rejected() {
    let mut buf = encode(&sample_header(Opcode::AnnounceProxyInstance));
    // The operation field sits 8 bytes from the end.
    let off = HEADER_SIZE - 8;
    buf[off..off + 4].copy_from_slice(&999u32.to_be_bytes());
    let err = Header::decode(&buf, DEFAULT_MAX_PAYLOAD_LEN).unwrap_err();
    assert!(matches!(err, BaspError::UnknownOpcode(999)));
  }

  #[test]
  fn oversized_payload_is_rejected() {
    let mut hdr = sample_header(Opcode::DispatchMessage);
    hdr.payload_len = DEFAULT_MAX_PAYLOAD_LEN + 1;
    let buf = encode(&hdr);
    let err = Header::decode(&buf, DEFAULT_MAX_PAYLOAD_LEN).unwrap_err();
    assert!(matches!(err, BaspError::PayloadTooLarge { .. }));
  }

  #[test]
  fn server_handshake_requires_payload() {
    let mut hdr = sample_header(Opcode::ServerHandshake);
    hdr.payload_len = 0;
    let buf = encode(&hdr);
    assert!(Header::decode(&buf, DEFAULT_MAX_PAYLOAD_LEN).is_err());
  }

  #[test]
  fn kill_proxy_requires_actor_id() {
    let mut hdr = sample_header(Opcode::KillProxyInstance);
    hdr.from_actor = 0;
    let buf = encode(&hdr);
    assert!(Header::decode(&buf, DEFAULT_MAX_PAYLOAD_LEN).is_err());
  }
}
