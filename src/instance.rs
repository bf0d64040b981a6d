// src/instance.rs

//! The BASP protocol state machine.
//!
//! A [`BaspInstance`] owns the routing table and the published-actor set and
//! frames every connection's byte stream into protocol operations. It is
//! transport-agnostic and side-effect free towards actors: anything touching
//! proxies, the registry, or handshake callbacks goes through the
//! [`Callee`] seam implemented by the broker.

use crate::backend::{Backend, ConnectionHandle};
use crate::config::BaspConfig;
use crate::error::{BaspError, BaspResult};
use crate::message::Msg;
use crate::node::{
  ActorAddr, ActorId, ExitReason, MessageId, NodeId, INVALID_ACTOR_ID,
};
use crate::protocol::{
  ClientHandshake, DispatchPayload, Header, Opcode, ServerHandshake, BASP_VERSION, HEADER_SIZE,
};
use crate::routing::RoutingTable;

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

/// Reply channel of a pending `connect` operation.
pub type HandshakeReplySender = oneshot::Sender<Result<ActorAddr, BaspError>>;

/// Read state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
  /// The next chunk is a fixed-size header.
  AwaitHeader,
  /// The next chunk is the payload announced by the pending header.
  AwaitPayload,
  /// Protocol error; the broker must close the connection.
  Close,
}

/// Per-connection protocol state, owned by the broker's context store.
pub struct ConnectionContext {
  pub hdl: ConnectionHandle,
  /// Peer node id; invalid until some handshake revealed it.
  pub peer: NodeId,
  /// Remote port for client-initiated connections, 0 otherwise.
  pub remote_port: u16,
  pub cstate: ConnState,
  /// Header awaiting its payload; `Some` iff `cstate == AwaitPayload`.
  pub pending: Option<Header>,
  /// Delivered exactly once with the outcome of a client connect.
  pub callback: Option<HandshakeReplySender>,
  /// Signatures the peer must advertise before we accept the handshake.
  pub expected_sigs: BTreeSet<String>,
}

impl ConnectionContext {
  pub fn new(hdl: ConnectionHandle) -> Self {
    Self {
      hdl,
      peer: NodeId::INVALID,
      remote_port: 0,
      cstate: ConnState::AwaitHeader,
      pending: None,
      callback: None,
      expected_sigs: BTreeSet::new(),
    }
  }

  /// Size of the next read this connection expects.
  pub fn next_read_size(&self) -> usize {
    match self.cstate {
      ConnState::AwaitPayload => self
        .pending
        .map(|hdr| hdr.payload_len as usize)
        .unwrap_or(HEADER_SIZE),
      _ => HEADER_SIZE,
    }
  }
}

/// Hooks the state machine dispatches into. Implemented by the broker; unit
/// tests substitute recorders.
pub trait Callee {
  /// Completes a client handshake: signature check, proxy for the
  /// published actor, reply delivery. Returns `false` when the connection
  /// must be closed (signature mismatch).
  fn finalize_handshake(
    &mut self,
    instance: &mut BaspInstance,
    backend: &mut dyn Backend,
    ctx: &mut ConnectionContext,
    hs: &ServerHandshake,
  ) -> bool;

  /// Delivers one routed message to its destination actor (local or
  /// proxied).
  fn deliver(
    &mut self,
    instance: &mut BaspInstance,
    backend: &mut dyn Backend,
    ctx: &mut ConnectionContext,
    hdr: &Header,
    mid: MessageId,
    msg: Msg,
  );

  /// A remote node created a proxy for our local actor `aid`.
  fn proxy_announced(
    &mut self,
    instance: &mut BaspInstance,
    backend: &mut dyn Backend,
    nid: NodeId,
    aid: ActorId,
  );

  /// The remote actor `(nid, aid)` terminated.
  fn kill_proxy(&mut self, nid: NodeId, aid: ActorId, reason: ExitReason);

  /// Kills and erases every proxy hosted for `nid`.
  fn purge_proxies(&mut self, nid: NodeId);

  /// Drops bookkeeping (known remotes) for `nid`.
  fn forget_node(&mut self, nid: NodeId);
}

/// Protocol core shared by all connections of one broker.
pub struct BaspInstance {
  this_node: NodeId,
  tbl: RoutingTable,
  /// port -> (published actor, advertised signatures). The same actor may
  /// appear under several ports, each with its own signature set.
  published: HashMap<u16, (ActorAddr, BTreeSet<String>)>,
  max_payload_len: u32,
}

impl BaspInstance {
  pub fn new(config: &BaspConfig) -> Self {
    Self {
      this_node: config.this_node,
      tbl: RoutingTable::new(config.max_indirect_hops),
      published: HashMap::new(),
      max_payload_len: config.max_payload_len,
    }
  }

  pub fn this_node(&self) -> NodeId {
    self.this_node
  }

  pub fn tbl(&self) -> &RoutingTable {
    &self.tbl
  }

  pub fn tbl_mut(&mut self) -> &mut RoutingTable {
    &mut self.tbl
  }

  // --- published actors ---

  pub fn add_published_actor(&mut self, port: u16, addr: ActorAddr, sigs: BTreeSet<String>) {
    self.published.insert(port, (addr, sigs));
  }

  pub fn published_on(&self, port: u16) -> Option<&(ActorAddr, BTreeSet<String>)> {
    self.published.get(&port)
  }

  /// Drops whatever is published under `port` (acceptor closed).
  pub fn remove_published_port(&mut self, port: u16) -> Option<(ActorAddr, BTreeSet<String>)> {
    self.published.remove(&port)
  }

  /// Removes `addr` from `port`, or from every port when `port` is 0.
  /// Returns the ports that were actually removed.
  pub fn remove_published_actor(&mut self, addr: ActorAddr, port: u16) -> Vec<u16> {
    let mut removed = Vec::new();
    self.published.retain(|p, (a, _)| {
      let matches = *a == addr && (port == 0 || *p == port);
      if matches {
        removed.push(*p);
      }
      !matches
    });
    removed
  }

  // --- state machine ---

  /// Feeds one read chunk into the connection's state machine. The chunk
  /// is exactly the size previously announced by
  /// [`ConnectionContext::next_read_size`].
  pub fn handle(
    &mut self,
    callee: &mut dyn Callee,
    backend: &mut dyn Backend,
    ctx: &mut ConnectionContext,
    data: Bytes,
  ) -> ConnState {
    match ctx.cstate {
      ConnState::AwaitHeader => {
        let hdr = match Header::decode(&data, self.max_payload_len) {
          Ok(hdr) => hdr,
          Err(e) => {
            warn!(handle = %ctx.hdl, error = %e, "closing connection, bad header");
            ctx.cstate = ConnState::Close;
            return ConnState::Close;
          }
        };
        trace!(handle = %ctx.hdl, header = ?hdr, "decoded header");
        if hdr.payload_len == 0 {
          ctx.cstate = self.act(callee, backend, ctx, hdr, Bytes::new());
        } else {
          ctx.pending = Some(hdr);
          ctx.cstate = ConnState::AwaitPayload;
        }
      }
      ConnState::AwaitPayload => {
        let hdr = match ctx.pending.take() {
          Some(hdr) => hdr,
          None => {
            // Driver bug, not peer input.
            warn!(handle = %ctx.hdl, "payload chunk without pending header");
            ctx.cstate = ConnState::Close;
            return ConnState::Close;
          }
        };
        debug_assert_eq!(data.len(), hdr.payload_len as usize);
        ctx.cstate = self.act(callee, backend, ctx, hdr, data);
      }
      ConnState::Close => {}
    }
    ctx.cstate
  }

  fn act(
    &mut self,
    callee: &mut dyn Callee,
    backend: &mut dyn Backend,
    ctx: &mut ConnectionContext,
    hdr: Header,
    payload: Bytes,
  ) -> ConnState {
    let result = match hdr.operation {
      Opcode::ServerHandshake => self.handle_server_handshake(callee, backend, ctx, &hdr, payload),
      Opcode::ClientHandshake => self.handle_client_handshake(ctx, &hdr, payload),
      Opcode::DispatchMessage => self.handle_dispatch(callee, backend, ctx, &hdr, payload),
      Opcode::AnnounceProxyInstance => {
        callee.proxy_announced(self, backend, hdr.from_node, hdr.to_actor);
        Ok(())
      }
      Opcode::KillProxyInstance => {
        callee.kill_proxy(
          hdr.from_node,
          hdr.from_actor,
          ExitReason::from_raw(hdr.operation_data),
        );
        Ok(())
      }
    };
    match result {
      Ok(()) => ConnState::AwaitHeader,
      Err(e) => {
        warn!(handle = %ctx.hdl, op = ?hdr.operation, error = %e, "closing connection");
        ConnState::Close
      }
    }
  }

  fn handle_server_handshake(
    &mut self,
    callee: &mut dyn Callee,
    backend: &mut dyn Backend,
    ctx: &mut ConnectionContext,
    hdr: &Header,
    payload: Bytes,
  ) -> BaspResult<()> {
    check_version(hdr)?;
    let hs = ServerHandshake::decode(payload)?;
    if hs.node.is_invalid() {
      return Err(BaspError::MalformedMessage(
        "server_handshake with invalid node id".into(),
      ));
    }
    // Learn the direct route before resolving proxies against it. A
    // handshake from ourselves (loopback connect) adds no route.
    if hs.node != self.this_node && self.tbl.lookup_direct(hs.node).is_none() {
      self.tbl.add_direct(hs.node, ctx.hdl);
    }
    // Finalization consumes the expected set; keep a copy to state in the
    // reply.
    let stated_sigs = ctx.expected_sigs.clone();
    if !callee.finalize_handshake(self, backend, ctx, &hs) {
      return Err(BaspError::SignatureMismatch);
    }
    // Reveal ourselves so the server can add its direct route.
    let reply = ClientHandshake {
      node: self.this_node,
      sigs: stated_sigs,
    };
    let mut body = BytesMut::new();
    reply.encode(&mut body);
    let reply_hdr = Header {
      from_node: self.this_node,
      to_node: hs.node,
      from_actor: INVALID_ACTOR_ID,
      to_actor: INVALID_ACTOR_ID,
      payload_len: 0,
      operation: Opcode::ClientHandshake,
      operation_data: BASP_VERSION,
    };
    self.write_frame(backend, ctx.hdl, reply_hdr, Some(&body));
    backend.flush(ctx.hdl);
    Ok(())
  }

  fn handle_client_handshake(
    &mut self,
    ctx: &mut ConnectionContext,
    hdr: &Header,
    payload: Bytes,
  ) -> BaspResult<()> {
    check_version(hdr)?;
    let hs = ClientHandshake::decode(payload)?;
    if hs.node.is_invalid() {
      return Err(BaspError::MalformedMessage(
        "client_handshake with invalid node id".into(),
      ));
    }
    if !hs.sigs.is_empty() {
      trace!(node = %hs.node, sigs = ?hs.sigs, "peer stated expected signatures");
    }
    if hs.node == self.this_node {
      ctx.peer = hs.node;
      return Ok(());
    }
    if let Some(existing) = self.tbl.lookup_direct(hs.node) {
      if existing != ctx.hdl {
        info!(node = %hs.node, "dropping redundant connection from already-connected node");
        return Err(BaspError::MalformedMessage(
          "second connection from a directly connected node".into(),
        ));
      }
    } else {
      self.tbl.add_direct(hs.node, ctx.hdl);
    }
    ctx.peer = hs.node;
    Ok(())
  }

  fn handle_dispatch(
    &mut self,
    callee: &mut dyn Callee,
    backend: &mut dyn Backend,
    ctx: &mut ConnectionContext,
    hdr: &Header,
    payload: Bytes,
  ) -> BaspResult<()> {
    let dp = DispatchPayload::decode(payload)?;
    let src_invalid = hdr.from_node.is_invalid() || hdr.from_actor == INVALID_ACTOR_ID;
    if src_invalid && dp.mid.is_request() {
      // Nobody could ever receive the answer.
      debug!(handle = %ctx.hdl, "dropping request without valid source");
      return Ok(());
    }
    // A message relayed from a third node teaches us an indirect route
    // through this connection's peer.
    if !hdr.from_node.is_invalid()
      && hdr.from_node != self.this_node
      && !ctx.peer.is_invalid()
      && hdr.from_node != ctx.peer
    {
      self.tbl.add_indirect(ctx.peer, hdr.from_node);
    }
    callee.deliver(self, backend, ctx, hdr, dp.mid, dp.msg);
    Ok(())
  }

  // --- outbound writes ---

  /// Encodes `hdr` (with `payload_len` patched to fit `payload`) plus the
  /// payload into the connection's write buffer. Does not flush.
  fn write_frame(
    &mut self,
    backend: &mut dyn Backend,
    hdl: ConnectionHandle,
    mut hdr: Header,
    payload: Option<&BytesMut>,
  ) {
    hdr.payload_len = payload.map_or(0, |p| p.len() as u32);
    let buf = backend.wr_buf(hdl);
    hdr.encode(buf);
    if let Some(p) = payload {
      buf.put_slice(p);
    }
  }

  /// Opens the server side of the protocol on a freshly accepted
  /// connection: node id plus whatever is published under the contacted
  /// port. Does not flush.
  pub fn write_server_handshake(
    &mut self,
    backend: &mut dyn Backend,
    hdl: ConnectionHandle,
    port: Option<u16>,
  ) {
    let (published_actor, sigs) = match port.and_then(|p| self.published.get(&p)) {
      Some((addr, sigs)) => (addr.id, sigs.clone()),
      None => (INVALID_ACTOR_ID, BTreeSet::new()),
    };
    let body_data = ServerHandshake {
      node: self.this_node,
      published_actor,
      sigs,
    };
    let mut body = BytesMut::new();
    body_data.encode(&mut body);
    let hdr = Header {
      from_node: self.this_node,
      to_node: NodeId::INVALID,
      from_actor: INVALID_ACTOR_ID,
      to_actor: INVALID_ACTOR_ID,
      payload_len: 0,
      operation: Opcode::ServerHandshake,
      operation_data: BASP_VERSION,
    };
    self.write_frame(backend, hdl, hdr, Some(&body));
  }

  /// Tells `nid` that we now hold a proxy for its actor `aid`. Returns
  /// `false` without writing when no route to `nid` exists.
  pub fn write_announce_proxy(
    &mut self,
    backend: &mut dyn Backend,
    nid: NodeId,
    aid: ActorId,
  ) -> bool {
    let path = match self.tbl.lookup(nid) {
      Some(path) => path,
      None => {
        info!(node = %nid, "cannot announce proxy, no route to host");
        return false;
      }
    };
    let hdr = Header {
      from_node: self.this_node,
      to_node: nid,
      from_actor: INVALID_ACTOR_ID,
      to_actor: aid,
      payload_len: 0,
      operation: Opcode::AnnounceProxyInstance,
      operation_data: 0,
    };
    self.write_frame(backend, path.hdl, hdr, None);
    self.tbl.flush(backend, &path);
    true
  }

  /// Tells `nid` that our local actor `aid` (which it proxies) has
  /// terminated. Returns `false` without writing when no route remains.
  pub fn write_kill_proxy(
    &mut self,
    backend: &mut dyn Backend,
    nid: NodeId,
    aid: ActorId,
    reason: ExitReason,
  ) -> bool {
    let path = match self.tbl.lookup(nid) {
      Some(path) => path,
      None => {
        info!(node = %nid, aid, "cannot send exit message for proxy, no route to host");
        return false;
      }
    };
    let hdr = Header {
      from_node: self.this_node,
      to_node: nid,
      from_actor: aid,
      to_actor: INVALID_ACTOR_ID,
      payload_len: 0,
      operation: Opcode::KillProxyInstance,
      operation_data: reason.raw(),
    };
    self.write_frame(backend, path.hdl, hdr, None);
    self.tbl.flush(backend, &path);
    true
  }

  /// Serializes one user message towards `dst` along the best known path.
  pub fn dispatch(
    &mut self,
    backend: &mut dyn Backend,
    src: ActorAddr,
    dst: ActorAddr,
    mid: MessageId,
    msg: Msg,
  ) -> BaspResult<()> {
    let path = self
      .tbl
      .lookup(dst.node)
      .ok_or(BaspError::RouteUnknown(dst.node))?;
    let mut body = BytesMut::new();
    DispatchPayload { mid, msg }.encode(&mut body);
    let hdr = Header {
      from_node: src.node,
      to_node: dst.node,
      from_actor: src.id,
      to_actor: dst.id,
      payload_len: 0,
      operation: Opcode::DispatchMessage,
      operation_data: 0,
    };
    self.write_frame(backend, path.hdl, hdr, Some(&body));
    self.tbl.flush(backend, &path);
    Ok(())
  }

  // --- node lifecycle ---

  /// Removes every trace of `nid`: proxies, direct and indirect routes,
  /// known-remote bookkeeping. Safe to call repeatedly.
  pub fn handle_node_shutdown(&mut self, callee: &mut dyn Callee, nid: NodeId) {
    callee.purge_proxies(nid);
    if let Some(hdl) = self.tbl.lookup_direct(nid) {
      self.tbl.erase_direct(hdl);
    }
    self.tbl.erase_indirect(nid);
    callee.forget_node(nid);
  }
}

fn check_version(hdr: &Header) -> BaspResult<()> {
  if hdr.operation_data != BASP_VERSION {
    return Err(BaspError::VersionMismatch {
      got: hdr.operation_data,
      expected: BASP_VERSION,
    });
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::test_support::MemBackend;
  use crate::config::DEFAULT_MAX_PAYLOAD_LEN;

  fn node(seed: u8) -> NodeId {
    let mut bytes = [0u8; crate::node::NODE_ID_LENGTH];
    bytes[0] = seed;
    NodeId::from_bytes(bytes)
  }

  fn hdl(raw: u64) -> ConnectionHandle {
    ConnectionHandle::from_raw(raw)
  }

  #[derive(Default)]
  struct RecordingCallee {
    delivered: Vec<(NodeId, ActorId, NodeId, ActorId, MessageId)>,
    announced: Vec<(NodeId, ActorId)>,
    killed: Vec<(NodeId, ActorId, ExitReason)>,
    purged: Vec<NodeId>,
    forgotten: Vec<NodeId>,
    accept_handshakes: bool,
  }

  impl Callee for RecordingCallee {
    fn finalize_handshake(
      &mut self,
      _instance: &mut BaspInstance,
      _backend: &mut dyn Backend,
      ctx: &mut ConnectionContext,
      hs: &ServerHandshake,
    ) -> bool {
      ctx.peer = hs.node;
      self.accept_handshakes
    }

    fn deliver(
      &mut self,
      _instance: &mut BaspInstance,
      _backend: &mut dyn Backend,
      _ctx: &mut ConnectionContext,
      hdr: &Header,
      mid: MessageId,
      _msg: Msg,
    ) {
      self
        .delivered
        .push((hdr.from_node, hdr.from_actor, hdr.to_node, hdr.to_actor, mid));
    }

    fn proxy_announced(
      &mut self,
      _instance: &mut BaspInstance,
      _backend: &mut dyn Backend,
      nid: NodeId,
      aid: ActorId,
    ) {
      self.announced.push((nid, aid));
    }

    fn kill_proxy(&mut self, nid: NodeId, aid: ActorId, reason: ExitReason) {
      self.killed.push((nid, aid, reason));
    }

    fn purge_proxies(&mut self, nid: NodeId) {
      self.purged.push(nid);
    }

    fn forget_node(&mut self, nid: NodeId) {
      self.forgotten.push(nid);
    }
  }

  fn instance_for(this: NodeId) -> BaspInstance {
    let mut config = BaspConfig::new(this);
    config.max_payload_len = DEFAULT_MAX_PAYLOAD_LEN;
    BaspInstance::new(&config)
  }

  fn encode_frame(hdr: Header, body: &[u8]) -> (Bytes, Bytes) {
    let mut hdr = hdr;
    hdr.payload_len = body.len() as u32;
    let mut buf = BytesMut::new();
    hdr.encode(&mut buf);
    (buf.freeze(), Bytes::copy_from_slice(body))
  }

  fn dispatch_frame(from: NodeId, to: NodeId, to_actor: ActorId, mid: MessageId) -> (Bytes, Bytes) {
    let mut body = BytesMut::new();
    DispatchPayload {
      mid,
      msg: Msg::from_static(b"payload"),
    }
    .encode(&mut body);
    encode_frame(
      Header {
        from_node: from,
        to_node: to,
        from_actor: 9,
        to_actor,
        payload_len: 0,
        operation: Opcode::DispatchMessage,
        operation_data: 0,
      },
      &body,
    )
  }

  #[test]
  fn framing_alternates_header_and_payload_reads() {
    let this = node(1);
    let peer = node(2);
    let mut instance = instance_for(this);
    let mut callee = RecordingCallee::default();
    let mut backend = MemBackend::new();
    let mut ctx = ConnectionContext::new(hdl(1));
    ctx.peer = peer;

    assert_eq!(ctx.next_read_size(), HEADER_SIZE);

    let (hdr_bytes, body_bytes) = dispatch_frame(peer, this, 7, MessageId::ASYNC);
    let state = instance.handle(&mut callee, &mut backend, &mut ctx, hdr_bytes);
    assert_eq!(state, ConnState::AwaitPayload);
    assert_eq!(ctx.next_read_size(), body_bytes.len());

    let state = instance.handle(&mut callee, &mut backend, &mut ctx, body_bytes);
    assert_eq!(state, ConnState::AwaitHeader);
    assert_eq!(ctx.next_read_size(), HEADER_SIZE);
    assert_eq!(callee.delivered.len(), 1);
  }

  #[test]
  fn zero_payload_frames_stay_in_header_state() {
    let this = node(1);
    let peer = node(2);
    let mut instance = instance_for(this);
    let mut callee = RecordingCallee::default();
    let mut backend = MemBackend::new();
    let mut ctx = ConnectionContext::new(hdl(1));

    let (hdr_bytes, _) = encode_frame(
      Header {
        from_node: peer,
        to_node: this,
        from_actor: INVALID_ACTOR_ID,
        to_actor: 7,
        payload_len: 0,
        operation: Opcode::AnnounceProxyInstance,
        operation_data: 0,
      },
      &[],
    );
    let state = instance.handle(&mut callee, &mut backend, &mut ctx, hdr_bytes);
    assert_eq!(state, ConnState::AwaitHeader);
    assert_eq!(callee.announced, vec![(peer, 7)]);
  }

  #[test]
  fn unknown_opcode_closes_the_connection() {
    let this = node(1);
    let mut instance = instance_for(this);
    let mut callee = RecordingCallee::default();
    let mut backend = MemBackend::new();
    let mut ctx = ConnectionContext::new(hdl(1));

    let (hdr_bytes, _) = encode_frame(
      Header {
        from_node: node(2),
        to_node: this,
        from_actor: 0,
        to_actor: 7,
        payload_len: 0,
        operation: Opcode::AnnounceProxyInstance,
        operation_data: 0,
      },
      &[],
    );
    let mut raw = BytesMut::from(&hdr_bytes[..]);
    let off = HEADER_SIZE - 8;
    raw[off..off + 4].copy_from_slice(&999u32.to_be_bytes());

    let state = instance.handle(&mut callee, &mut backend, &mut ctx, raw.freeze());
    assert_eq!(state, ConnState::Close);
    assert!(callee.announced.is_empty());
  }

  #[test]
  fn kill_proxy_carries_reason_from_operation_data() {
    let this = node(1);
    let peer = node(2);
    let mut instance = instance_for(this);
    let mut callee = RecordingCallee::default();
    let mut backend = MemBackend::new();
    let mut ctx = ConnectionContext::new(hdl(1));

    let (hdr_bytes, _) = encode_frame(
      Header {
        from_node: peer,
        to_node: this,
        from_actor: 42,
        to_actor: INVALID_ACTOR_ID,
        payload_len: 0,
        operation: Opcode::KillProxyInstance,
        operation_data: ExitReason::NORMAL.raw(),
      },
      &[],
    );
    instance.handle(&mut callee, &mut backend, &mut ctx, hdr_bytes);
    assert_eq!(callee.killed, vec![(peer, 42, ExitReason::NORMAL)]);
  }

  #[test]
  fn requests_without_source_are_dropped() {
    let this = node(1);
    let peer = node(2);
    let mut instance = instance_for(this);
    let mut callee = RecordingCallee::default();
    let mut backend = MemBackend::new();
    let mut ctx = ConnectionContext::new(hdl(1));
    ctx.peer = peer;

    let mut body = BytesMut::new();
    DispatchPayload {
      mid: MessageId::make_request(1),
      msg: Msg::new(),
    }
    .encode(&mut body);
    let (hdr_bytes, body_bytes) = encode_frame(
      Header {
        from_node: NodeId::INVALID,
        to_node: this,
        from_actor: INVALID_ACTOR_ID,
        to_actor: 7,
        payload_len: 0,
        operation: Opcode::DispatchMessage,
        operation_data: 0,
      },
      &body,
    );
    instance.handle(&mut callee, &mut backend, &mut ctx, hdr_bytes);
    let state = instance.handle(&mut callee, &mut backend, &mut ctx, body_bytes);
    assert_eq!(state, ConnState::AwaitHeader);
    assert!(callee.delivered.is_empty());
  }

  #[test]
  fn relayed_messages_teach_indirect_routes() {
    let this = node(1);
    let peer = node(2);
    let third = node(3);
    let mut instance = instance_for(this);
    let mut callee = RecordingCallee::default();
    let mut backend = MemBackend::new();
    let mut ctx = ConnectionContext::new(hdl(1));
    ctx.peer = peer;
    instance.tbl_mut().add_direct(peer, hdl(1));

    let (hdr_bytes, body_bytes) = dispatch_frame(third, this, 7, MessageId::ASYNC);
    instance.handle(&mut callee, &mut backend, &mut ctx, hdr_bytes);
    instance.handle(&mut callee, &mut backend, &mut ctx, body_bytes);

    let path = instance.tbl().lookup(third).expect("indirect route learned");
    assert_eq!(path.next_hop, peer);
  }

  #[test]
  fn server_handshake_version_mismatch_closes() {
    let this = node(1);
    let server = node(2);
    let mut instance = instance_for(this);
    let mut callee = RecordingCallee {
      accept_handshakes: true,
      ..Default::default()
    };
    let mut backend = MemBackend::new();
    let mut ctx = ConnectionContext::new(hdl(1));

    let mut body = BytesMut::new();
    ServerHandshake {
      node: server,
      published_actor: INVALID_ACTOR_ID,
      sigs: BTreeSet::new(),
    }
    .encode(&mut body);
    let (hdr_bytes, body_bytes) = encode_frame(
      Header {
        from_node: server,
        to_node: NodeId::INVALID,
        from_actor: INVALID_ACTOR_ID,
        to_actor: INVALID_ACTOR_ID,
        payload_len: 0,
        operation: Opcode::ServerHandshake,
        operation_data: BASP_VERSION + 1,
      },
      &body,
    );
    instance.handle(&mut callee, &mut backend, &mut ctx, hdr_bytes);
    let state = instance.handle(&mut callee, &mut backend, &mut ctx, body_bytes);
    assert_eq!(state, ConnState::Close);
  }

  #[test]
  fn accepted_server_handshake_adds_route_and_replies() {
    let this = node(1);
    let server = node(2);
    let mut instance = instance_for(this);
    let mut callee = RecordingCallee {
      accept_handshakes: true,
      ..Default::default()
    };
    let mut backend = MemBackend::new();
    let mut ctx = ConnectionContext::new(hdl(1));

    let mut body = BytesMut::new();
    ServerHandshake {
      node: server,
      published_actor: 7,
      sigs: BTreeSet::new(),
    }
    .encode(&mut body);
    let (hdr_bytes, body_bytes) = encode_frame(
      Header {
        from_node: server,
        to_node: NodeId::INVALID,
        from_actor: INVALID_ACTOR_ID,
        to_actor: INVALID_ACTOR_ID,
        payload_len: 0,
        operation: Opcode::ServerHandshake,
        operation_data: BASP_VERSION,
      },
      &body,
    );
    instance.handle(&mut callee, &mut backend, &mut ctx, hdr_bytes);
    let state = instance.handle(&mut callee, &mut backend, &mut ctx, body_bytes);
    assert_eq!(state, ConnState::AwaitHeader);
    assert_eq!(instance.tbl().lookup_direct(server), Some(hdl(1)));

    // The client handshake reply went out on the same connection.
    let out = backend.outbound(hdl(1));
    let reply_hdr = Header::decode(&out[..HEADER_SIZE], DEFAULT_MAX_PAYLOAD_LEN).unwrap();
    assert_eq!(reply_hdr.operation, Opcode::ClientHandshake);
    assert_eq!(reply_hdr.from_node, this);
  }

  #[test]
  fn node_shutdown_is_idempotent() {
    let this = node(1);
    let peer = node(2);
    let mut instance = instance_for(this);
    let mut callee = RecordingCallee::default();
    instance.tbl_mut().add_direct(peer, hdl(1));
    instance.tbl_mut().add_indirect(peer, node(3));

    instance.handle_node_shutdown(&mut callee, peer);
    assert!(!instance.tbl().reachable(peer));
    assert!(!instance.tbl().reachable(node(3)));

    instance.handle_node_shutdown(&mut callee, peer);
    assert!(!instance.tbl().reachable(peer));
    assert_eq!(callee.purged, vec![peer, peer]);
  }

  #[test]
  fn dispatch_without_route_reports_unknown() {
    let this = node(1);
    let mut instance = instance_for(this);
    let mut backend = MemBackend::new();
    let err = instance
      .dispatch(
        &mut backend,
        ActorAddr::new(this, 1),
        ActorAddr::new(node(9), 2),
        MessageId::ASYNC,
        Msg::new(),
      )
      .unwrap_err();
    assert!(matches!(err, BaspError::RouteUnknown(_)));
  }
}
