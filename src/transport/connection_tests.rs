use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use socket2::SockRef;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use super::codec::BrokeCodec;
use super::connection::{CloseReason, ConnectionHandler, Outcome, ProtocolState, handle_connection};
use super::message::{Message, MessageKind};
use super::server::{configure_stream, connection_limit, next_backoff, serve};
use crate::broker::Broker;
use crate::client::{Client, ConnectionState};
use crate::config::BrokerSettings;
use crate::utils::{BrokerError, MalformedFrame};

const WAIT: Duration = Duration::from_secs(5);

fn handler_with(
    settings: BrokerSettings,
) -> (ConnectionHandler, Arc<Broker>, mpsc::Receiver<Message>) {
    let broker = Arc::new(Broker::new());
    let (tx, rx) = mpsc::channel(16);
    let client = Arc::new(Client::new(tx, CancellationToken::new()));
    let handler = ConnectionHandler::new(broker.clone(), Arc::new(settings), client);
    (handler, broker, rx)
}

fn handler() -> (ConnectionHandler, Arc<Broker>, mpsc::Receiver<Message>) {
    handler_with(BrokerSettings::default())
}

fn drain(rx: &mut mpsc::Receiver<Message>) -> Vec<Message> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

#[tokio::test]
async fn test_publish_retains_then_acks() {
    let (mut handler, broker, mut rx) = handler();

    let outcome = handler.dispatch(Message::publish("sensor/1", "23.5")).await;
    assert!(matches!(outcome, Outcome::Handled));
    assert_eq!(handler.state(), ProtocolState::Connected);
    assert_eq!(broker.retained("sensor/1"), Some(Bytes::from_static(b"23.5")));
    assert_eq!(drain(&mut rx), vec![Message::ack(MessageKind::Publish, "sensor/1")]);
}

#[tokio::test]
async fn test_publisher_subscribed_to_its_own_topic_gets_ack_before_delivery() {
    let (mut handler, _broker, mut rx) = handler();

    handler.dispatch(Message::Subscribe { topic: "t".into() }).await;
    drain(&mut rx);
    handler.dispatch(Message::publish("t", "p1")).await;

    assert_eq!(
        drain(&mut rx),
        vec![
            Message::ack(MessageKind::Publish, "t"),
            Message::publish("t", "p1"),
        ]
    );
}

#[tokio::test]
async fn test_subscribe_acks_then_delivers_retained() {
    let (mut handler, broker, mut rx) = handler();
    broker.retain("sensor/1", Bytes::from_static(b"23.5"));

    let outcome = handler
        .dispatch(Message::Subscribe {
            topic: "sensor/1".into(),
        })
        .await;
    assert!(matches!(outcome, Outcome::Handled));
    assert!(
        broker
            .subscribers()
            .is_subscribed("sensor/1", &handler.client().id)
    );
    assert_eq!(
        drain(&mut rx),
        vec![
            Message::ack(MessageKind::Subscribe, "sensor/1"),
            Message::publish("sensor/1", "23.5"),
        ]
    );
}

#[tokio::test]
async fn test_subscribe_without_retained_delivery() {
    let (mut handler, broker, mut rx) = handler_with(BrokerSettings {
        retain_on_subscribe: false,
        ..BrokerSettings::default()
    });
    broker.retain("t", Bytes::from_static(b"old"));

    handler.dispatch(Message::Subscribe { topic: "t".into() }).await;
    assert_eq!(drain(&mut rx), vec![Message::ack(MessageKind::Subscribe, "t")]);
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let (mut handler, broker, mut rx) = handler();

    handler.dispatch(Message::Subscribe { topic: "t".into() }).await;
    handler.dispatch(Message::Unsubscribe { topic: "t".into() }).await;
    assert_eq!(
        drain(&mut rx),
        vec![
            Message::ack(MessageKind::Subscribe, "t"),
            Message::ack(MessageKind::Unsubscribe, "t"),
        ]
    );

    let report = broker.publish("t", Bytes::from_static(b"p"));
    assert_eq!(report.delivered, 0);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_connect_is_acked_once() {
    let (mut handler, _broker, mut rx) = handler();

    let first = handler
        .dispatch(Message::Connect {
            client_id: "device-7".into(),
        })
        .await;
    assert!(matches!(first, Outcome::Handled));
    assert_eq!(drain(&mut rx), vec![Message::ack(MessageKind::Connect, "")]);

    let second = handler
        .dispatch(Message::Connect {
            client_id: "device-7".into(),
        })
        .await;
    assert!(matches!(
        second,
        Outcome::Error(BrokerError::UnsupportedMessageKind(MessageKind::Connect))
    ));
}

#[tokio::test]
async fn test_require_connect_rejects_publish_first() {
    let (mut handler, broker, mut rx) = handler_with(BrokerSettings {
        require_connect: true,
        ..BrokerSettings::default()
    });

    let outcome = handler.dispatch(Message::publish("t", "p")).await;
    assert!(matches!(
        outcome,
        Outcome::Error(BrokerError::UnsupportedMessageKind(MessageKind::Publish))
    ));
    assert_eq!(handler.state(), ProtocolState::AwaitingConnect);
    assert_eq!(broker.retained("t"), None);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_require_connect_allows_disconnect_first() {
    let (mut handler, _broker, _rx) = handler_with(BrokerSettings {
        require_connect: true,
        ..BrokerSettings::default()
    });

    let outcome = handler.dispatch(Message::Disconnect).await;
    assert!(matches!(outcome, Outcome::Disconnect));
}

#[tokio::test]
async fn test_ack_from_client_is_a_protocol_error() {
    let (mut handler, _broker, _rx) = handler();

    let outcome = handler
        .dispatch(Message::ack(MessageKind::Publish, "t"))
        .await;
    match outcome {
        Outcome::Error(err) => assert!(err.is_protocol_violation()),
        other => panic!("expected protocol error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_dropping_handler_unregisters_client() {
    let (mut handler, broker, _rx) = handler();
    handler.dispatch(Message::Subscribe { topic: "a".into() }).await;
    handler.dispatch(Message::Subscribe { topic: "b".into() }).await;
    let client = handler.client().clone();

    drop(handler);

    assert!(broker.subscribers().subscribers("a").is_empty());
    assert!(broker.subscribers().subscribers("b").is_empty());
    assert!(broker.subscribers().topics_of(&client.id).is_empty());
    assert_eq!(client.state(), ConnectionState::Closed);
}

// In-memory transport

fn spawn_connection(
    broker: Arc<Broker>,
    settings: BrokerSettings,
    shutdown: CancellationToken,
) -> (Framed<DuplexStream, BrokeCodec>, JoinHandle<CloseReason>) {
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);
    let task = tokio::spawn(handle_connection(
        server_side,
        broker,
        Arc::new(settings),
        shutdown,
    ));
    (Framed::new(client_side, BrokeCodec::new()), task)
}

#[tokio::test]
async fn test_handle_connection_until_disconnect() {
    let broker = Arc::new(Broker::new());
    let (mut peer, task) =
        spawn_connection(broker.clone(), BrokerSettings::default(), CancellationToken::new());

    peer.send(Message::Subscribe { topic: "t".into() }).await.unwrap();
    let ack = peer.next().await.unwrap().unwrap();
    assert_eq!(ack, Message::ack(MessageKind::Subscribe, "t"));
    assert_eq!(broker.subscribers().subscribers("t").len(), 1);

    broker.publish("t", Bytes::from_static(b"hello"));
    assert_eq!(
        peer.next().await.unwrap().unwrap(),
        Message::publish("t", "hello")
    );

    peer.send(Message::Disconnect).await.unwrap();
    let reason = timeout(WAIT, task).await.unwrap().unwrap();
    assert!(matches!(reason, CloseReason::Disconnect));
    assert!(broker.subscribers().subscribers("t").is_empty());
    assert!(peer.next().await.is_none());
}

#[tokio::test]
async fn test_handle_connection_peer_closed() {
    let broker = Arc::new(Broker::new());
    let (mut peer, task) =
        spawn_connection(broker.clone(), BrokerSettings::default(), CancellationToken::new());

    peer.send(Message::Subscribe { topic: "t".into() }).await.unwrap();
    peer.next().await.unwrap().unwrap();
    drop(peer);

    let reason = timeout(WAIT, task).await.unwrap().unwrap();
    assert!(matches!(reason, CloseReason::PeerClosed));
    assert!(broker.subscribers().subscribers("t").is_empty());
}

#[tokio::test]
async fn test_handle_connection_rejects_malformed_frame() {
    let broker = Arc::new(Broker::new());
    let (client_side, server_side) = tokio::io::duplex(1024);
    let task = tokio::spawn(handle_connection(
        server_side,
        broker,
        Arc::new(BrokerSettings::default()),
        CancellationToken::new(),
    ));

    let mut raw = client_side;
    raw.write_all(&[0x7F, 0, 0, 0, 0]).await.unwrap();

    let reason = timeout(WAIT, task).await.unwrap().unwrap();
    assert!(matches!(
        reason,
        CloseReason::Error(BrokerError::MalformedFrame(MalformedFrame::UnknownKind(0x7F)))
    ));
}

#[tokio::test]
async fn test_handle_connection_stops_on_shutdown() {
    let broker = Arc::new(Broker::new());
    let shutdown = CancellationToken::new();
    let (mut peer, task) = spawn_connection(broker.clone(), BrokerSettings::default(), shutdown.clone());

    peer.send(Message::Subscribe { topic: "t".into() }).await.unwrap();
    peer.next().await.unwrap().unwrap();

    shutdown.cancel();
    let reason = timeout(WAIT, task).await.unwrap().unwrap();
    assert!(matches!(reason, CloseReason::Cancelled));
    assert!(broker.subscribers().subscribers("t").is_empty());
}

#[tokio::test]
async fn test_graceful_close_gives_up_on_peer_that_stops_reading() {
    let broker = Arc::new(Broker::new());
    let settings = BrokerSettings {
        drain_timeout_ms: 200,
        ..BrokerSettings::default()
    };
    let (client_side, server_side) = tokio::io::duplex(64);
    let task = tokio::spawn(handle_connection(
        server_side,
        broker.clone(),
        Arc::new(settings),
        CancellationToken::new(),
    ));
    let mut peer = Framed::new(client_side, BrokeCodec::new());

    peer.send(Message::Subscribe { topic: "t".into() }).await.unwrap();
    assert_eq!(
        peer.next().await.unwrap().unwrap(),
        Message::ack(MessageKind::Subscribe, "t")
    );

    // Far more than the 64 byte pipe holds; the peer never reads again.
    for _ in 0..10 {
        broker.publish("t", Bytes::from(vec![0u8; 1024]));
    }
    peer.send(Message::Disconnect).await.unwrap();

    let reason = timeout(Duration::from_secs(3), task)
        .await
        .expect("connection task still waiting on the stalled peer")
        .unwrap();
    assert!(matches!(reason, CloseReason::Disconnect));
    assert!(broker.subscribers().subscribers("t").is_empty());
    drop(peer);
}

// TCP

struct TestServer {
    addr: std::net::SocketAddr,
    broker: Arc<Broker>,
    shutdown: CancellationToken,
    task: JoinHandle<crate::utils::Result<()>>,
}

async fn start(settings: BrokerSettings) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let broker = Arc::new(Broker::new());
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(serve(
        listener,
        broker.clone(),
        Arc::new(settings),
        shutdown.clone(),
    ));
    TestServer {
        addr,
        broker,
        shutdown,
        task,
    }
}

async fn connect(addr: std::net::SocketAddr) -> Framed<TcpStream, BrokeCodec> {
    Framed::new(TcpStream::connect(addr).await.unwrap(), BrokeCodec::new())
}

async fn recv(peer: &mut Framed<TcpStream, BrokeCodec>) -> Message {
    timeout(WAIT, peer.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("connection closed")
        .expect("decode failed")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn test_publish_subscribe_over_tcp() {
    let server = start(BrokerSettings::default()).await;
    let mut a = connect(server.addr).await;
    let mut b = connect(server.addr).await;

    a.send(Message::Subscribe {
        topic: "sensor/1".into(),
    })
    .await
    .unwrap();
    assert_eq!(recv(&mut a).await, Message::ack(MessageKind::Subscribe, "sensor/1"));

    b.send(Message::publish("sensor/1", "23.5")).await.unwrap();
    assert_eq!(recv(&mut b).await, Message::ack(MessageKind::Publish, "sensor/1"));
    assert_eq!(recv(&mut a).await, Message::publish("sensor/1", "23.5"));
    assert_eq!(
        server.broker.retained("sensor/1"),
        Some(Bytes::from_static(b"23.5"))
    );

    a.send(Message::Disconnect).await.unwrap();
    wait_until(|| server.broker.subscribers().subscribers("sensor/1").is_empty()).await;

    b.send(Message::publish("sensor/1", "24.0")).await.unwrap();
    assert_eq!(recv(&mut b).await, Message::ack(MessageKind::Publish, "sensor/1"));
    assert_eq!(
        server.broker.retained("sensor/1"),
        Some(Bytes::from_static(b"24.0"))
    );

    server.shutdown.cancel();
    timeout(WAIT, server.task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_late_subscriber_gets_latest_retained() {
    let server = start(BrokerSettings::default()).await;
    let mut publisher = connect(server.addr).await;

    for payload in ["p1", "p2"] {
        publisher
            .send(Message::publish("t", payload))
            .await
            .unwrap();
        assert_eq!(recv(&mut publisher).await, Message::ack(MessageKind::Publish, "t"));
    }

    let mut late = connect(server.addr).await;
    late.send(Message::Subscribe { topic: "t".into() }).await.unwrap();
    assert_eq!(recv(&mut late).await, Message::ack(MessageKind::Subscribe, "t"));
    assert_eq!(recv(&mut late).await, Message::publish("t", "p2"));

    server.shutdown.cancel();
}

#[tokio::test]
async fn test_malformed_frame_closes_only_offender() {
    let server = start(BrokerSettings::default()).await;
    let mut a = connect(server.addr).await;
    let mut b = connect(server.addr).await;

    a.send(Message::Subscribe { topic: "t".into() }).await.unwrap();
    recv(&mut a).await;

    let mut offender = TcpStream::connect(server.addr).await.unwrap();
    offender.write_all(&[0xFF, 0, 0, 0, 1, 0]).await.unwrap();
    let mut offender = Framed::new(offender, BrokeCodec::new());
    let closed = timeout(WAIT, offender.next()).await.unwrap();
    assert!(!matches!(closed, Some(Ok(_))));

    b.send(Message::publish("t", "still-up")).await.unwrap();
    assert_eq!(recv(&mut b).await, Message::ack(MessageKind::Publish, "t"));
    assert_eq!(recv(&mut a).await, Message::publish("t", "still-up"));

    server.shutdown.cancel();
}

#[tokio::test]
async fn test_connection_limit_drops_extra_connections() {
    let server = start(BrokerSettings {
        max_connections: 1,
        ..BrokerSettings::default()
    })
    .await;

    let mut first = connect(server.addr).await;
    first.send(Message::Subscribe { topic: "t".into() }).await.unwrap();
    assert_eq!(recv(&mut first).await, Message::ack(MessageKind::Subscribe, "t"));

    let mut second = connect(server.addr).await;
    let refused = timeout(WAIT, second.next()).await.unwrap();
    assert!(!matches!(refused, Some(Ok(_))));

    first.send(Message::Disconnect).await.unwrap();
    wait_until(|| server.broker.subscribers().subscribers("t").is_empty()).await;

    // The slot is released once the first connection's task finishes.
    let mut third = connect(server.addr).await;
    let mut attempts = 0;
    loop {
        third.send(Message::Subscribe { topic: "t".into() }).await.ok();
        match timeout(WAIT, third.next()).await.unwrap() {
            Some(Ok(message)) => {
                assert_eq!(message, Message::ack(MessageKind::Subscribe, "t"));
                break;
            }
            _ => {
                attempts += 1;
                assert!(attempts < 50, "slot was never released");
                sleep(Duration::from_millis(20)).await;
                third = connect(server.addr).await;
            }
        }
    }

    server.shutdown.cancel();
}

#[tokio::test]
async fn test_shutdown_closes_open_connections() {
    let server = start(BrokerSettings::default()).await;
    let mut a = connect(server.addr).await;
    a.send(Message::Subscribe { topic: "t".into() }).await.unwrap();
    recv(&mut a).await;

    server.shutdown.cancel();
    timeout(WAIT, server.task).await.unwrap().unwrap().unwrap();

    let closed = timeout(WAIT, a.next()).await.unwrap();
    assert!(!matches!(closed, Some(Ok(_))));
    assert!(server.broker.subscribers().subscribers("t").is_empty());
}

#[tokio::test]
async fn test_serve_with_unbounded_connection_limit() {
    let server = start(BrokerSettings {
        max_connections: usize::MAX,
        ..BrokerSettings::default()
    })
    .await;

    let mut peer = connect(server.addr).await;
    peer.send(Message::Subscribe { topic: "t".into() }).await.unwrap();
    assert_eq!(recv(&mut peer).await, Message::ack(MessageKind::Subscribe, "t"));

    server.shutdown.cancel();
    timeout(WAIT, server.task).await.unwrap().unwrap().unwrap();
}

#[test]
fn test_connection_limit_is_clamped_to_semaphore_capacity() {
    assert_eq!(connection_limit(10), 10);
    assert_eq!(connection_limit(usize::MAX), Semaphore::MAX_PERMITS);
}

#[test]
fn test_accept_backoff_doubles_up_to_cap() {
    let first = next_backoff(None);
    assert_eq!(first, Duration::from_millis(5));
    assert_eq!(next_backoff(Some(first)), Duration::from_millis(10));

    let mut delay = first;
    for _ in 0..20 {
        delay = next_backoff(Some(delay));
    }
    assert_eq!(delay, Duration::from_secs(1));
}

#[tokio::test]
async fn test_accepted_sockets_get_nodelay_and_keepalive() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    let _client = client.unwrap();
    let (stream, _) = accepted.unwrap();

    configure_stream(&stream).unwrap();
    assert!(stream.nodelay().unwrap());
    assert!(SockRef::from(&stream).keepalive().unwrap());
}
