// src/transport/tcp.rs

//! Tokio TCP driver.
//!
//! One accept-loop task per listener, one reader plus one writer task per
//! connection. The reader honors the exact-read contract: it sleeps until
//! the broker arms a read, then reads precisely that many bytes and
//! delivers them as one `NewData` event.

use crate::backend::{AcceptHandle, Backend, ConnectionHandle};
use crate::error::{BaspError, BaspResult};
use crate::runtime::{Command, MailboxSender};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

enum WriteOp {
  Data(Bytes),
  Shutdown,
}

struct TcpConn {
  owner: MailboxSender,
  write_tx: UnboundedSender<WriteOp>,
  credit_tx: UnboundedSender<usize>,
  reader: JoinHandle<()>,
  closed: bool,
}

struct TcpAcceptor {
  owner: MailboxSender,
  port: u16,
  task: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
  next_id: u64,
  conns: HashMap<ConnectionHandle, TcpConn>,
  acceptors: HashMap<AcceptHandle, TcpAcceptor>,
}

impl Inner {
  fn fresh_id(&mut self) -> u64 {
    self.next_id += 1;
    self.next_id
  }
}

/// Shared TCP driver state. Clones refer to the same driver.
#[derive(Clone, Default)]
pub struct TcpNetwork {
  inner: Arc<Mutex<Inner>>,
}

impl TcpNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  /// Creates the backend to hand to a broker.
  pub fn backend(&self) -> TcpBackend {
    TcpBackend {
      net: self.clone(),
      bufs: HashMap::new(),
    }
  }

  /// Binds `addr` and starts accepting. Accepted connections surface as
  /// `NewConnection` events on `owner`. Returns the acceptor handle and
  /// the actually bound port.
  pub async fn listen(
    &self,
    addr: &str,
    owner: &MailboxSender,
  ) -> BaspResult<(AcceptHandle, u16)> {
    let listener = TcpListener::bind(addr).await?;
    let port = listener.local_addr()?.port();
    let handle = AcceptHandle::from_raw(self.inner.lock().fresh_id());
    let net = self.clone();
    let accept_owner = owner.clone();
    let task = tokio::spawn(async move {
      loop {
        match listener.accept().await {
          Ok((stream, peer)) => {
            trace!(%peer, "accepted TCP connection");
            let conn_hdl = net.register_stream(stream, &accept_owner);
            if accept_owner
              .send(Command::NewConnection {
                handle: conn_hdl,
                source: handle,
              })
              .await
              .is_err()
            {
              break;
            }
          }
          Err(e) => {
            warn!(error = %e, "TCP accept failed, stopping acceptor");
            let _ = accept_owner.try_send(Command::AcceptorClosed { handle });
            break;
          }
        }
      }
    });
    self.inner.lock().acceptors.insert(
      handle,
      TcpAcceptor {
        owner: owner.clone(),
        port,
        task,
      },
    );
    Ok((handle, port))
  }

  /// Connects to `addr`, returning the caller-side handle.
  pub async fn connect(&self, addr: &str, owner: &MailboxSender) -> BaspResult<ConnectionHandle> {
    let stream = TcpStream::connect(addr).await?;
    Ok(self.register_stream(stream, owner))
  }

  fn register_stream(&self, stream: TcpStream, owner: &MailboxSender) -> ConnectionHandle {
    let _ = stream.set_nodelay(true);
    let (rd, wr) = stream.into_split();
    let (write_tx, write_rx) = unbounded_channel();
    let (credit_tx, credit_rx) = unbounded_channel();
    let handle = ConnectionHandle::from_raw(self.inner.lock().fresh_id());
    let reader = tokio::spawn(reader_task(
      handle,
      rd,
      credit_rx,
      owner.clone(),
      self.clone(),
    ));
    tokio::spawn(writer_task(handle, wr, write_rx, self.clone()));
    self.inner.lock().conns.insert(
      handle,
      TcpConn {
        owner: owner.clone(),
        write_tx,
        credit_tx,
        reader,
        closed: false,
      },
    );
    handle
  }

  /// Marks `hdl` closed after a transport failure and tells its broker,
  /// unless the broker closed it first.
  fn notify_lost(&self, hdl: ConnectionHandle) {
    let owner = {
      let mut inner = self.inner.lock();
      match inner.conns.get_mut(&hdl) {
        Some(conn) if !conn.closed => {
          conn.closed = true;
          Some(conn.owner.clone())
        }
        _ => None,
      }
    };
    if let Some(owner) = owner {
      debug!(handle = %hdl, "TCP connection lost");
      tokio::spawn(async move {
        let _ = owner.send(Command::ConnectionClosed { handle: hdl }).await;
      });
    }
  }
}

async fn reader_task(
  hdl: ConnectionHandle,
  mut rd: OwnedReadHalf,
  mut credit_rx: UnboundedReceiver<usize>,
  owner: MailboxSender,
  net: TcpNetwork,
) {
  loop {
    let want = match credit_rx.recv().await {
      Some(n) if n > 0 => n,
      Some(_) => continue,
      None => break,
    };
    let mut buf = vec![0u8; want];
    match rd.read_exact(&mut buf).await {
      Ok(_) => {
        if owner
          .send(Command::NewData {
            handle: hdl,
            data: Bytes::from(buf),
          })
          .await
          .is_err()
        {
          break;
        }
      }
      Err(e) => {
        trace!(handle = %hdl, error = %e, "TCP read ended");
        net.notify_lost(hdl);
        break;
      }
    }
  }
}

async fn writer_task(
  hdl: ConnectionHandle,
  mut wr: OwnedWriteHalf,
  mut write_rx: UnboundedReceiver<WriteOp>,
  net: TcpNetwork,
) {
  while let Some(op) = write_rx.recv().await {
    match op {
      WriteOp::Data(bytes) => {
        if let Err(e) = wr.write_all(&bytes).await {
          trace!(handle = %hdl, error = %e, "TCP write failed");
          net.notify_lost(hdl);
          break;
        }
      }
      WriteOp::Shutdown => {
        let _ = wr.shutdown().await;
        break;
      }
    }
  }
}

/// Backend facade owned by one broker.
pub struct TcpBackend {
  net: TcpNetwork,
  bufs: HashMap<ConnectionHandle, BytesMut>,
}

impl Backend for TcpBackend {
  fn assign_scribe(&mut self, hdl: ConnectionHandle) -> BaspResult<()> {
    let inner = self.net.inner.lock();
    match inner.conns.get(&hdl) {
      Some(conn) if !conn.closed => Ok(()),
      _ => Err(BaspError::ScribeAssignFailed(format!(
        "unknown connection handle {}",
        hdl
      ))),
    }
  }

  fn assign_doorman(&mut self, hdl: AcceptHandle) -> BaspResult<()> {
    let inner = self.net.inner.lock();
    if inner.acceptors.contains_key(&hdl) {
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
    let inner = self.net.inner.lock();
    if let Some(conn) = inner.conns.get(&hdl) {
      if !conn.closed {
        let _ = conn.credit_tx.send(n);
      }
    }
  }

  fn flush(&mut self, hdl: ConnectionHandle) {
    let Some(buf) = self.bufs.get_mut(&hdl) else {
      return;
    };
    if buf.is_empty() {
      return;
    }
    let bytes = buf.split().freeze();
    let inner = self.net.inner.lock();
    match inner.conns.get(&hdl) {
      Some(conn) if !conn.closed => {
        let _ = conn.write_tx.send(WriteOp::Data(bytes));
      }
      _ => trace!(handle = %hdl, "discarding flush on closed TCP connection"),
    }
  }

  fn close(&mut self, hdl: ConnectionHandle) {
    self.bufs.remove(&hdl);
    let mut inner = self.net.inner.lock();
    if let Some(conn) = inner.conns.get_mut(&hdl) {
      if !conn.closed {
        conn.closed = true;
        let _ = conn.write_tx.send(WriteOp::Shutdown);
        conn.reader.abort();
      }
    }
  }

  fn close_acceptor(&mut self, hdl: AcceptHandle) {
    let mut inner = self.net.inner.lock();
    if let Some(acceptor) = inner.acceptors.remove(&hdl) {
      acceptor.task.abort();
      let _ = acceptor.owner.try_send(Command::AcceptorClosed { handle: hdl });
    }
  }

  fn local_port(&self, hdl: AcceptHandle) -> Option<u16> {
    self
      .net
      .inner
      .lock()
      .acceptors
      .get(&hdl)
      .map(|acceptor| acceptor.port)
  }
}
