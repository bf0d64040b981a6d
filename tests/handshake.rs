// tests/handshake.rs

use rbasp::broker::BrokerEvent;
use rbasp::transport::loopback::LoopbackNetwork;
use rbasp::{AcceptHandle, ActorAddr, BaspError, ConnectionHandle, LocalActor};

mod common;
use common::{sigs, spawn_node, wait_for_event, LONG_TIMEOUT};

const PING_SIG: &str = "caf::replies_to<int>::with<int>";

#[tokio::test]
async fn handshake_ok_resolves_published_actor() {
  let net = LoopbackNetwork::new();
  let a = spawn_node(&net);
  let b = spawn_node(&net);

  let (actor, _mailbox) = LocalActor::new(a.node_id(), 7, 16);
  let acceptor = net.listen(9999, a.sender()).unwrap();
  a.broker
    .publish(acceptor, 9999, actor, sigs(&[PING_SIG]))
    .await
    .unwrap();
  wait_for_event(&a.events, LONG_TIMEOUT, |e| {
    matches!(e, BrokerEvent::ActorPublished { port: 9999, .. })
  })
  .await;

  let conn = net.connect(9999, b.sender()).unwrap();
  let addr = b.broker.connect(conn, 9999, sigs(&[PING_SIG])).await.unwrap();
  assert_eq!(addr, ActorAddr::new(a.node_id(), 7));

  // The connecting side holds a proxy for the published actor now.
  let event = wait_for_event(&b.events, LONG_TIMEOUT, |e| {
    matches!(e, BrokerEvent::NewRemoteActor { .. })
  })
  .await;
  match event {
    BrokerEvent::NewRemoteActor { addr: proxy_addr } => assert_eq!(proxy_addr, addr),
    other => panic!("unexpected event: {:?}", other),
  }
}

#[tokio::test]
async fn handshake_signature_mismatch_closes_connection() {
  let net = LoopbackNetwork::new();
  let a = spawn_node(&net);
  let b = spawn_node(&net);

  let (actor, _mailbox) = LocalActor::new(a.node_id(), 7, 16);
  let acceptor = net.listen(9999, a.sender()).unwrap();
  a.broker
    .publish(acceptor, 9999, actor, sigs(&[PING_SIG]))
    .await
    .unwrap();

  let conn = net.connect(9999, b.sender()).unwrap();
  let err = b
    .broker
    .connect(conn, 9999, sigs(&["caf::other"]))
    .await
    .unwrap_err();
  assert!(matches!(err, BaspError::SignatureMismatch), "got {:?}", err);
  assert_eq!(
    err.to_string(),
    "expected signature does not comply to found signature"
  );

  // No proxy was created on the connecting side.
  assert!(b.events.try_recv().is_err());
}

#[tokio::test]
async fn connecting_to_an_unpublished_port_yields_invalid_addr() {
  let net = LoopbackNetwork::new();
  let a = spawn_node(&net);
  let b = spawn_node(&net);

  // A listener with no publication behind it: the handshake completes but
  // carries no actor.
  net.listen(4000, a.sender()).unwrap();
  let conn = net.connect(4000, b.sender()).unwrap();
  let addr = b.broker.connect(conn, 4000, sigs(&[])).await.unwrap();
  assert!(addr.is_invalid());
}

#[tokio::test]
async fn unpublish_closes_the_acceptor() {
  let net = LoopbackNetwork::new();
  let a = spawn_node(&net);
  let b = spawn_node(&net);

  let (actor, _mailbox) = LocalActor::new(a.node_id(), 7, 16);
  let acceptor = net.listen(4000, a.sender()).unwrap();
  a.broker
    .publish(acceptor, 4000, actor, sigs(&[]))
    .await
    .unwrap();
  a.broker
    .unpublish(ActorAddr::new(a.node_id(), 7), 4000)
    .await
    .unwrap();

  // The acceptor is gone with the publication.
  assert!(net.connect(4000, b.sender()).is_err());
}

#[tokio::test]
async fn connect_to_self_resolves_through_the_registry() {
  let net = LoopbackNetwork::new();
  let a = spawn_node(&net);

  let (actor, _mailbox) = LocalActor::new(a.node_id(), 7, 16);
  let acceptor = net.listen(5000, a.sender()).unwrap();
  a.broker
    .publish(acceptor, 5000, actor, sigs(&[PING_SIG]))
    .await
    .unwrap();

  let conn = net.connect(5000, a.sender()).unwrap();
  let addr = a.broker.connect(conn, 5000, sigs(&[PING_SIG])).await.unwrap();
  assert_eq!(addr, ActorAddr::new(a.node_id(), 7));
}

#[tokio::test]
async fn backend_assign_failures_surface_as_errors() {
  let net = LoopbackNetwork::new();
  let a = spawn_node(&net);
  let (actor, _mailbox) = LocalActor::new(a.node_id(), 7, 16);

  // Bogus handles: the backend refuses, the broker state stays clean.
  let err = a
    .broker
    .publish(AcceptHandle::from_raw(777), 9999, actor.clone(), sigs(&[]))
    .await
    .unwrap_err();
  assert!(matches!(err, BaspError::DoormanAssignFailed(_)));

  let err = a
    .broker
    .connect(ConnectionHandle::from_raw(777), 9999, sigs(&[]))
    .await
    .unwrap_err();
  assert!(matches!(err, BaspError::ScribeAssignFailed(_)));

  // The broker still works: a regular publish+connect cycle succeeds.
  let b = spawn_node(&net);
  let acceptor = net.listen(9999, a.sender()).unwrap();
  a.broker
    .publish(acceptor, 9999, actor, sigs(&[PING_SIG]))
    .await
    .unwrap();
  let conn = net.connect(9999, b.sender()).unwrap();
  let addr = b.broker.connect(conn, 9999, sigs(&[PING_SIG])).await.unwrap();
  assert_eq!(addr, ActorAddr::new(a.node_id(), 7));
}
