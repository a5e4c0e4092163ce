use stageweave::liveness::{
  HealthResponder, LivenessConfig, LivenessMonitor, PeerPoller, PollerConfig, ProbeOutcome,
  RecordingReviver, Roster,
};
use stageweave::protocol::{Message, MessageKind, ProtocolError};
use stageweave::transport::{ConnectionError, PeerConnection};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(2));

async fn start_responder(stage: &str) -> (u16, CancellationToken, tokio::task::JoinHandle<()>) {
  let responder = HealthResponder::bind(stage, "127.0.0.1:0").await.unwrap();
  let port = responder.local_addr().unwrap().port();
  let cancel = CancellationToken::new();
  let handle = tokio::spawn(responder.run(cancel.clone()));
  (port, cancel, handle)
}

async fn closed_port() -> u16 {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = listener.local_addr().unwrap().port();
  drop(listener);
  port
}

fn poller_config(port: u16) -> PollerConfig {
  PollerConfig {
    origin: "health_checker".to_string(),
    port,
    interval: Duration::from_millis(20),
    timeout: Duration::from_millis(500),
  }
}

#[tokio::test]
async fn probe_gets_exactly_one_alive_then_close() {
  let (port, cancel, handle) = start_responder("counter").await;

  let mut connection = PeerConnection::connect("127.0.0.1", port, TIMEOUT)
    .await
    .unwrap();
  let reply = connection
    .request(&Message::health_probe("health_checker"))
    .await
    .unwrap();
  assert_eq!(reply.kind, MessageKind::Alive);
  assert_eq!(reply.origin, "counter");

  let after = connection.recv().await.unwrap_err();
  assert!(matches!(
    after,
    ConnectionError::Protocol(ProtocolError::ConnectionBroken)
  ));

  cancel.cancel();
  handle.await.unwrap();
}

#[tokio::test]
async fn non_probe_message_gets_no_reply() {
  let (port, cancel, handle) = start_responder("counter").await;

  let mut connection = PeerConnection::connect("127.0.0.1", port, TIMEOUT)
    .await
    .unwrap();
  connection
    .send(&Message::data(1, "sanitizer", 1, "row"))
    .await
    .unwrap();
  assert!(connection.recv().await.is_err());

  // The responder keeps serving after ignoring the message.
  let mut again = PeerConnection::connect("127.0.0.1", port, TIMEOUT)
    .await
    .unwrap();
  let reply = again
    .request(&Message::health_probe("health_checker"))
    .await
    .unwrap();
  assert_eq!(reply.kind, MessageKind::Alive);

  cancel.cancel();
  handle.await.unwrap();
}

#[tokio::test]
async fn healthy_peer_is_not_revived() {
  let (port, cancel, handle) = start_responder("sorter").await;
  let reviver = RecordingReviver::new();
  let mut poller = PeerPoller::new("sorter", poller_config(port), Arc::new(reviver.clone()))
    .with_address("127.0.0.1");

  assert_eq!(poller.tick().await, ProbeOutcome::Alive);
  assert!(reviver.revived().is_empty());
  assert_eq!(poller.status().consecutive_failures, 0);
  assert!(poller.status().last_alive_at.is_some());

  cancel.cancel();
  handle.await.unwrap();
}

#[tokio::test]
async fn unreachable_peer_is_revived_once_per_failed_probe() {
  let port = closed_port().await;
  let reviver = RecordingReviver::new();
  let mut poller = PeerPoller::new("sorter", poller_config(port), Arc::new(reviver.clone()))
    .with_address("127.0.0.1");

  assert!(!poller.tick().await.is_alive());
  assert_eq!(reviver.revived(), vec!["sorter"]);

  assert!(!poller.tick().await.is_alive());
  assert_eq!(reviver.revived(), vec!["sorter", "sorter"]);

  let status = poller.status();
  assert_eq!(status.consecutive_failures, 2);
  assert_eq!(status.revivals, 2);
  assert!(status.last_failure_at.is_some());
  assert!(status.last_alive_at.is_none());
}

#[tokio::test]
async fn monitor_answers_probes_until_cancelled() {
  let port = closed_port().await;
  let config = LivenessConfig::new("filter")
    .with_bind_host("127.0.0.1")
    .with_port(port)
    .with_interval(Duration::from_millis(20));
  let monitor = LivenessMonitor::new(config, Roster::default(), Arc::new(RecordingReviver::new()));
  let cancel = CancellationToken::new();
  let mut tasks = monitor.spawn(cancel.clone()).await.unwrap();

  let mut connection = PeerConnection::connect("127.0.0.1", port, TIMEOUT)
    .await
    .unwrap();
  let reply = connection
    .request(&Message::health_probe("health_checker"))
    .await
    .unwrap();
  assert_eq!(reply, Message::alive("filter"));

  cancel.cancel();
  while let Some(joined) = tasks.join_next().await {
    joined.unwrap();
  }
}

#[tokio::test]
async fn peer_hanging_up_after_reply_still_counts_as_alive() {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = listener.local_addr().unwrap().port();
  let peer = tokio::spawn(async move {
    let (stream, _) = listener.accept().await.unwrap();
    let mut connection = PeerConnection::from_stream(stream).unwrap();
    let request = connection.recv().await.unwrap();
    assert_eq!(request.kind, MessageKind::HealthProbe);
    connection.send(&Message::alive("sorter")).await.unwrap();
    drop(connection);
  });

  let reviver = RecordingReviver::new();
  let poller = PeerPoller::new("sorter", poller_config(port), Arc::new(reviver.clone()))
    .with_address("127.0.0.1");
  assert_eq!(poller.probe().await, ProbeOutcome::Alive);
  assert!(reviver.revived().is_empty());
  peer.await.unwrap();
}
