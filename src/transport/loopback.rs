// src/transport/loopback.rs

//! In-process network of brokers.
//!
//! A [`LoopbackNetwork`] simulates port-addressed listeners and stream
//! connections entirely in memory. Bytes flushed on one side land in the
//! peer's inbox and are chopped into exactly the chunks the peer's broker
//! armed with `configure_read`. Deterministic and fast, this is the driver
//! the integration tests run on.

use crate::backend::{AcceptHandle, Backend, ConnectionHandle};
use crate::error::{BaspError, BaspResult};
use crate::runtime::{Command, MailboxSender};

use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{trace, warn};

struct Listener {
  handle: AcceptHandle,
  owner: MailboxSender,
}

struct Conn {
  owner: MailboxSender,
  peer: Option<ConnectionHandle>,
  /// Bytes flushed by the peer, not yet claimed by a read.
  inbox: BytesMut,
  /// Outstanding read credit; 0 while the broker has not armed a read.
  want: usize,
  open: bool,
}

#[derive(Default)]
struct Inner {
  next_id: u64,
  listeners: HashMap<u16, Listener>,
  acceptor_ports: HashMap<AcceptHandle, u16>,
  conns: HashMap<ConnectionHandle, Conn>,
}

impl Inner {
  fn fresh_id(&mut self) -> u64 {
    self.next_id += 1;
    self.next_id
  }

  /// Delivers one armed read if enough bytes are buffered.
  fn pump(&mut self, hdl: ConnectionHandle) {
    let Some(conn) = self.conns.get_mut(&hdl) else {
      return;
    };
    if !conn.open || conn.want == 0 || conn.inbox.len() < conn.want {
      return;
    }
    let chunk = conn.inbox.split_to(conn.want).freeze();
    conn.want = 0;
    let owner = conn.owner.clone();
    trace!(handle = %hdl, len = chunk.len(), "loopback delivering chunk");
    if owner
      .try_send(Command::NewData { handle: hdl, data: chunk })
      .is_err()
    {
      warn!(handle = %hdl, "loopback dropped a chunk, broker mailbox unavailable");
    }
  }
}

/// Shared in-memory network. Clones refer to the same network.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
  inner: Arc<Mutex<Inner>>,
}

impl LoopbackNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  /// Creates the backend to hand to a broker whose mailbox sender is part
  /// of the channel the broker is spawned with.
  pub fn backend(&self) -> LoopbackBackend {
    LoopbackBackend {
      net: self.clone(),
      bufs: HashMap::new(),
    }
  }

  /// Opens a listener on `port`, owned by the broker behind `owner`.
  pub fn listen(&self, port: u16, owner: &MailboxSender) -> BaspResult<AcceptHandle> {
    let mut inner = self.inner.lock();
    if inner.listeners.contains_key(&port) {
      return Err(BaspError::InvalidArgument(format!(
        "loopback port {} already in use",
        port
      )));
    }
    let handle = AcceptHandle::from_raw(inner.fresh_id());
    inner.listeners.insert(
      port,
      Listener {
        handle,
        owner: owner.clone(),
      },
    );
    inner.acceptor_ports.insert(handle, port);
    Ok(handle)
  }

  /// Connects to `port`, returning the caller-side connection handle. The
  /// listening broker receives a `NewConnection` event for its side.
  pub fn connect(&self, port: u16, owner: &MailboxSender) -> BaspResult<ConnectionHandle> {
    let mut inner = self.inner.lock();
    let (acceptor, listener_owner) = match inner.listeners.get(&port) {
      Some(listener) => (listener.handle, listener.owner.clone()),
      None => {
        return Err(BaspError::InvalidArgument(format!(
          "nothing listening on loopback port {}",
          port
        )))
      }
    };
    let client_hdl = ConnectionHandle::from_raw(inner.fresh_id());
    let server_hdl = ConnectionHandle::from_raw(inner.fresh_id());
    inner.conns.insert(
      client_hdl,
      Conn {
        owner: owner.clone(),
        peer: Some(server_hdl),
        inbox: BytesMut::new(),
        want: 0,
        open: true,
      },
    );
    inner.conns.insert(
      server_hdl,
      Conn {
        owner: listener_owner.clone(),
        peer: Some(client_hdl),
        inbox: BytesMut::new(),
        want: 0,
        open: true,
      },
    );
    if listener_owner
      .try_send(Command::NewConnection {
        handle: server_hdl,
        source: acceptor,
      })
      .is_err()
    {
      inner.conns.remove(&client_hdl);
      inner.conns.remove(&server_hdl);
      return Err(BaspError::ConnectionClosed);
    }
    Ok(client_hdl)
  }

  /// Severs a connection from outside the broker, as a transport failure
  /// would. Both brokers observe a `ConnectionClosed` event.
  pub fn sever(&self, hdl: ConnectionHandle) {
    let mut inner = self.inner.lock();
    let Some(conn) = inner.conns.get_mut(&hdl) else {
      return;
    };
    if !conn.open {
      return;
    }
    conn.open = false;
    let owner = conn.owner.clone();
    let peer = conn.peer;
    let _ = owner.try_send(Command::ConnectionClosed { handle: hdl });
    if let Some(peer_hdl) = peer {
      if let Some(peer_conn) = inner.conns.get_mut(&peer_hdl) {
        if peer_conn.open {
          peer_conn.open = false;
          let peer_owner = peer_conn.owner.clone();
          let _ = peer_owner.try_send(Command::ConnectionClosed { handle: peer_hdl });
        }
      }
    }
  }
}

/// Backend facade owned by one broker. Write buffers live here; everything
/// else is shared network state.
pub struct LoopbackBackend {
  net: LoopbackNetwork,
  bufs: HashMap<ConnectionHandle, BytesMut>,
}

impl Backend for LoopbackBackend {
  fn assign_scribe(&mut self, hdl: ConnectionHandle) -> BaspResult<()> {
    let inner = self.net.inner.lock();
    match inner.conns.get(&hdl) {
      Some(conn) if conn.open => Ok(()),
      _ => Err(BaspError::ScribeAssignFailed(format!(
        "unknown connection handle {}",
        hdl
      ))),
    }
  }

  fn assign_doorman(&mut self, hdl: AcceptHandle) -> BaspResult<()> {
    let inner = self.net.inner.lock();
    if inner.acceptor_ports.contains_key(&hdl) {
      Ok(())
    } else {
      Err(BaspError::DoormanAssignFailed(format!(
        "unknown acceptor handle {:?}",
        hdl
      )))
    }
  }

  fn wr_buf(&mut self, hdl: ConnectionHandle) -> &mut BytesMut {
    self.bufs.entry(hdl).or_default()
  }

  fn configure_read(&mut self, hdl: ConnectionHandle, n: usize) {
    let mut inner = self.net.inner.lock();
    if let Some(conn) = inner.conns.get_mut(&hdl) {
      conn.want = n;
    }
    inner.pump(hdl);
  }

  fn flush(&mut self, hdl: ConnectionHandle) {
    let Some(buf) = self.bufs.get_mut(&hdl) else {
      return;
    };
    if buf.is_empty() {
      return;
    }
    let bytes = buf.split();
    let mut inner = self.net.inner.lock();
    let peer = match inner.conns.get(&hdl) {
      Some(conn) if conn.open => conn.peer,
      _ => {
        trace!(handle = %hdl, "discarding flush on closed loopback connection");
        return;
      }
    };
    let Some(peer_hdl) = peer else {
      return;
    };
    if let Some(peer_conn) = inner.conns.get_mut(&peer_hdl) {
      if peer_conn.open {
        peer_conn.inbox.extend_from_slice(&bytes);
      }
    }
    inner.pump(peer_hdl);
  }

  fn close(&mut self, hdl: ConnectionHandle) {
    self.bufs.remove(&hdl);
    let mut inner = self.net.inner.lock();
    let Some(conn) = inner.conns.get_mut(&hdl) else {
      return;
    };
    if !conn.open {
      return;
    }
    conn.open = false;
    let peer = conn.peer;
    // The peer observes the close; the closing side gets no echo.
    if let Some(peer_hdl) = peer {
      if let Some(peer_conn) = inner.conns.get_mut(&peer_hdl) {
        if peer_conn.open {
          peer_conn.open = false;
          let peer_owner = peer_conn.owner.clone();
          let _ = peer_owner.try_send(Command::ConnectionClosed { handle: peer_hdl });
        }
      }
    }
  }

  fn close_acceptor(&mut self, hdl: AcceptHandle) {
    let mut inner = self.net.inner.lock();
    if let Some(port) = inner.acceptor_ports.remove(&hdl) {
      if let Some(listener) = inner.listeners.remove(&port) {
        let _ = listener.owner.try_send(Command::AcceptorClosed { handle: hdl });
      }
    }
  }

  fn local_port(&self, hdl: AcceptHandle) -> Option<u16> {
    self.net.inner.lock().acceptor_ports.get(&hdl).copied()
  }
}
