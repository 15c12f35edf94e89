use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, try_join_all};
use futures_util::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tungstenite::Message as WsMessage;
use tungstenite::http::StatusCode;
use tungstenite::protocol::Role;
use tungstenite::protocol::frame::coding::CloseCode;

use crate::broker::{Broker, ChatPayload};
use crate::client::HubClient;
use crate::config::{HubSettings, Settings};
use crate::transport::frame::Frame;
use crate::transport::handler::{CloseReason, ConnectionHandler};
use crate::transport::websocket::{bind, serve};
use crate::utils::HubError;

const ORIGIN: &str = "http://localhost:5173";

struct TestHub {
    url: String,
    broker: Arc<Broker>,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
}

async fn start_hub(settings: Settings) -> TestHub {
    let listener = bind("127.0.0.1:0").await.expect("Failed to bind");
    let addr = listener.local_addr().unwrap();
    let url = format!("ws://{addr}{}", settings.server.path);

    let broker = Arc::new(Broker::new(&settings.hub).unwrap());
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(serve(listener, broker.clone(), settings, shutdown.clone()));

    TestHub {
        url,
        broker,
        shutdown,
        server,
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

async fn next_content(client: &mut HubClient) -> String {
    let frame = tokio::time::timeout(Duration::from_secs(5), client.next_message())
        .await
        .expect("timed out waiting for MESSAGE")
        .unwrap()
        .expect("connection closed before MESSAGE");
    ChatPayload::parse(&frame.body).unwrap().content
}

fn expect_http_status(result: Result<HubClient, HubError>, status: StatusCode) {
    match result {
        Err(HubError::WebSocket(tungstenite::Error::Http(response))) => {
            assert_eq!(response.status(), status)
        }
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("handshake should have been rejected"),
    }
}

#[tokio::test]
async fn test_connect_negotiates_version() {
    let hub = start_hub(Settings::default()).await;
    let client = HubClient::connect(&hub.url, ORIGIN).await.unwrap();

    assert_eq!(client.version(), Some("1.2"));
    assert!(client.session().is_some());
    assert_eq!(hub.broker.registry().len(), 1);
}

#[tokio::test]
async fn test_all_subscribers_see_one_order() {
    let hub = start_hub(Settings::default()).await;
    let mut alice = HubClient::connect(&hub.url, ORIGIN).await.unwrap();
    let mut bob = HubClient::connect(&hub.url, ORIGIN).await.unwrap();
    alice.subscribe("/topic/messages").await.unwrap();
    bob.subscribe("/topic/messages").await.unwrap();

    alice
        .send_chat("/app/sendMessage", "alice", "M1")
        .await
        .unwrap();
    assert_eq!(next_content(&mut alice).await, "M1");
    bob.send_chat("/app/sendMessage", "bob", "M2").await.unwrap();

    assert_eq!(next_content(&mut alice).await, "M2");
    assert_eq!(next_content(&mut bob).await, "M1");
    assert_eq!(next_content(&mut bob).await, "M2");
}

#[tokio::test]
async fn test_many_subscribers_receive_every_message_in_order() {
    let hub = start_hub(Settings::default()).await;
    let mut subscribers = try_join_all((0..5).map(|_| HubClient::connect(&hub.url, ORIGIN)))
        .await
        .unwrap();
    for subscriber in subscribers.iter_mut() {
        subscriber.subscribe("/topic/messages").await.unwrap();
    }

    let mut sender = HubClient::connect(&hub.url, ORIGIN).await.unwrap();
    for i in 0..10 {
        sender
            .send_chat("/app/sendMessage", "sender", &format!("m{i}"))
            .await
            .unwrap();
    }

    let expected: Vec<String> = (0..10).map(|i| format!("m{i}")).collect();
    let received = join_all(subscribers.iter_mut().map(|subscriber| async move {
        let mut contents = Vec::new();
        for _ in 0..10 {
            contents.push(next_content(subscriber).await);
        }
        contents
    }))
    .await;
    for contents in received {
        assert_eq!(contents, expected);
    }
}

#[tokio::test]
async fn test_body_is_echoed_verbatim() {
    let hub = start_hub(Settings::default()).await;
    let mut client = HubClient::connect(&hub.url, ORIGIN).await.unwrap();
    let subscription = client.subscribe("/topic/messages").await.unwrap();

    let body = r#"{ "id": 42, "content":"héllo  world", "sender":"a" }"#;
    client
        .send_frame(
            &Frame::new("SEND")
                .header("destination", "/app/sendMessage")
                .header("content-type", "application/json")
                .with_body(body),
        )
        .await
        .unwrap();

    let frame = client.next_message().await.unwrap().unwrap();
    assert_eq!(frame.body, body);
    assert_eq!(frame.get("destination"), Some("/topic/messages"));
    assert_eq!(frame.get("subscription"), Some(subscription.as_str()));
    assert_eq!(frame.get("content-type"), Some("application/json"));
}

#[tokio::test]
async fn test_rejected_handshakes_leave_registry_unchanged() {
    let hub = start_hub(Settings::default()).await;

    expect_http_status(
        HubClient::connect(&hub.url, "http://evil.example").await,
        StatusCode::FORBIDDEN,
    );

    let wrong_path = hub.url.replace("/chat", "/nope");
    expect_http_status(
        HubClient::connect(&wrong_path, ORIGIN).await,
        StatusCode::NOT_FOUND,
    );

    assert!(hub.broker.registry().is_empty());
}

#[tokio::test]
async fn test_connection_limit() {
    let mut settings = Settings::default();
    settings.hub.max_connections = 1;
    let hub = start_hub(settings).await;

    let _first = HubClient::connect(&hub.url, ORIGIN).await.unwrap();
    expect_http_status(
        HubClient::connect(&hub.url, ORIGIN).await,
        StatusCode::SERVICE_UNAVAILABLE,
    );
    assert_eq!(hub.broker.registry().len(), 1);
}

#[tokio::test]
async fn test_disconnect_cleans_up() {
    let hub = start_hub(Settings::default()).await;
    let mut client = HubClient::connect(&hub.url, ORIGIN).await.unwrap();
    client.subscribe("/topic/messages").await.unwrap();
    assert_eq!(hub.broker.topics().subscribers("/topic/messages").len(), 1);

    let leftover = client.disconnect().await.unwrap();
    assert!(leftover.is_empty());

    let broker = hub.broker.clone();
    eventually(move || broker.registry().is_empty()).await;
    assert!(hub.broker.topics().is_empty());
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let hub = start_hub(Settings::default()).await;
    let mut alice = HubClient::connect(&hub.url, ORIGIN).await.unwrap();
    let mut bob = HubClient::connect(&hub.url, ORIGIN).await.unwrap();
    alice.subscribe("/topic/messages").await.unwrap();
    let subscription = bob.subscribe("/topic/messages").await.unwrap();
    bob.unsubscribe(&subscription).await.unwrap();

    alice
        .send_chat("/app/sendMessage", "alice", "after")
        .await
        .unwrap();
    assert_eq!(next_content(&mut alice).await, "after");

    let received = bob.disconnect().await.unwrap();
    assert!(received.iter().all(|frame| frame.command != "MESSAGE"));
}

#[tokio::test]
async fn test_malformed_frame_closes_only_sender() {
    let hub = start_hub(Settings::default()).await;
    let mut alice = HubClient::connect(&hub.url, ORIGIN).await.unwrap();
    let mut bob = HubClient::connect(&hub.url, ORIGIN).await.unwrap();
    alice.subscribe("/topic/messages").await.unwrap();
    bob.subscribe("/topic/messages").await.unwrap();

    alice.send_raw("this is not a frame").await.unwrap();
    let error = alice.next_frame().await.unwrap().expect("expected ERROR");
    assert_eq!(error.command, "ERROR");
    assert!(alice.next_frame().await.unwrap().is_none());

    let broker = hub.broker.clone();
    eventually(move || broker.registry().len() == 1).await;

    bob.send_chat("/app/sendMessage", "bob", "still here")
        .await
        .unwrap();
    assert_eq!(next_content(&mut bob).await, "still here");
}

#[tokio::test]
async fn test_invalid_payload_is_a_decode_error() {
    let hub = start_hub(Settings::default()).await;
    let mut client = HubClient::connect(&hub.url, ORIGIN).await.unwrap();

    client
        .send_frame(
            &Frame::new("SEND")
                .header("destination", "/app/sendMessage")
                .with_body("plain text"),
        )
        .await
        .unwrap();

    let error = client.next_frame().await.unwrap().expect("expected ERROR");
    assert_eq!(error.command, "ERROR");
    assert!(error.body.contains("invalid message payload"));
    assert_eq!(hub.broker.dispatcher().last_sequence(), 0);
}

#[tokio::test]
async fn test_unroutable_send_keeps_connection_open() {
    let hub = start_hub(Settings::default()).await;
    let mut client = HubClient::connect(&hub.url, ORIGIN).await.unwrap();
    client.subscribe("/topic/messages").await.unwrap();

    client
        .send_chat("/app/unknown", "alice", "lost")
        .await
        .unwrap();
    client
        .send_chat("/app/sendMessage", "alice", "found")
        .await
        .unwrap();

    assert_eq!(next_content(&mut client).await, "found");
    assert_eq!(hub.broker.dispatcher().last_sequence(), 1);
}

#[tokio::test]
async fn test_send_to_topic_through_broker_prefix() {
    let hub = start_hub(Settings::default()).await;
    let mut client = HubClient::connect(&hub.url, ORIGIN).await.unwrap();
    client.subscribe("/topic/room-1").await.unwrap();
    client.subscribe("/topic/messages").await.unwrap();

    client
        .send_chat("/topic/room-1", "alice", "direct")
        .await
        .unwrap();

    let frame = client.next_message().await.unwrap().unwrap();
    assert_eq!(frame.get("destination"), Some("/topic/room-1"));
    assert_eq!(ChatPayload::parse(&frame.body).unwrap().content, "direct");
}

#[tokio::test]
async fn test_shutdown_closes_connections() {
    let hub = start_hub(Settings::default()).await;
    let mut client = HubClient::connect(&hub.url, ORIGIN).await.unwrap();
    client.subscribe("/topic/messages").await.unwrap();

    hub.shutdown.cancel();
    let closed = tokio::time::timeout(Duration::from_secs(5), client.next_frame())
        .await
        .expect("timed out waiting for close")
        .unwrap();
    assert!(closed.is_none());

    tokio::time::timeout(Duration::from_secs(10), hub.server)
        .await
        .expect("server did not stop")
        .unwrap();
    assert!(hub.broker.registry().is_empty());
    assert!(hub.broker.topics().is_empty());
}

type ClientSocket = WebSocketStream<DuplexStream>;

/// Runs a handler over an in-memory stream of `buffer` bytes.
async fn spawn_handler(
    broker: &Arc<Broker>,
    settings: HubSettings,
    buffer: usize,
) -> (ClientSocket, JoinHandle<CloseReason>) {
    let (client_io, server_io) = tokio::io::duplex(buffer);
    let server_ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
    let client_ws = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

    let handler = ConnectionHandler::new(
        server_ws,
        broker.clone(),
        settings,
        None,
        CancellationToken::new(),
    );
    (client_ws, tokio::spawn(handler.run()))
}

async fn send_frame(client_ws: &mut ClientSocket, frame: Frame) {
    client_ws
        .send(WsMessage::text(frame.encode()))
        .await
        .unwrap();
}

async fn read_frame(client_ws: &mut ClientSocket) -> Frame {
    let message = client_ws.next().await.unwrap().unwrap();
    Frame::decode_all(message.to_text().unwrap())
        .unwrap()
        .remove(0)
}

async fn stomp_connect(client_ws: &mut ClientSocket) {
    send_frame(client_ws, Frame::new("CONNECT").header("accept-version", "1.2")).await;
    assert_eq!(read_frame(client_ws).await.command, "CONNECTED");
}

#[tokio::test]
async fn test_evicted_connection_is_closed_with_policy_code() {
    let broker = Arc::new(Broker::default());
    let (mut client_ws, task) = spawn_handler(&broker, Settings::default().hub, 64 * 1024).await;
    stomp_connect(&mut client_ws).await;

    let id = broker.registry().ids()[0];
    broker.registry().lookup(id).unwrap().evict();

    match client_ws.next().await {
        Some(Ok(WsMessage::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Policy),
        other => panic!("expected close frame, got {other:?}"),
    }
    assert_eq!(task.await.unwrap(), CloseReason::SlowConsumer);
    assert!(broker.registry().is_empty());
}

#[tokio::test]
async fn test_stalled_reader_is_dropped_within_grace() {
    let mut settings = Settings::default().hub;
    settings.outbound_queue_capacity = 4;
    settings.grace_timeout_ms = 200;
    let broker = Arc::new(Broker::default());
    let (mut client_ws, task) = spawn_handler(&broker, settings, 512).await;
    stomp_connect(&mut client_ws).await;

    send_frame(
        &mut client_ws,
        Frame::new("SUBSCRIBE")
            .header("id", "sub-0")
            .header("destination", "/topic/messages")
            .header("receipt", "r1"),
    )
    .await;
    assert_eq!(read_frame(&mut client_ws).await.command, "RECEIPT");

    // the client stops reading from here on; each frame outgrows the buffer
    // while the queue itself never overflows
    let body = format!(r#"{{"sender":"flood","content":"{}"}}"#, "x".repeat(2048));
    for _ in 0..3 {
        broker
            .dispatcher()
            .handle_inbound(None, "/app/sendMessage", body.as_str(), None)
            .unwrap();
    }

    let reason = tokio::time::timeout(Duration::from_secs(3), task)
        .await
        .expect("stalled connection was never dropped")
        .unwrap();
    assert_eq!(reason, CloseReason::SlowConsumer);
    assert!(broker.registry().is_empty());
    assert!(broker.topics().is_empty());
    drop(client_ws);
}

#[tokio::test]
async fn test_socket_without_connect_is_closed_after_deadline() {
    let mut settings = Settings::default().hub;
    settings.connect_timeout_ms = 100;
    let broker = Arc::new(Broker::default());
    let (mut client_ws, task) = spawn_handler(&broker, settings, 64 * 1024).await;

    let reason = tokio::time::timeout(Duration::from_secs(3), task)
        .await
        .expect("handler kept waiting for CONNECT")
        .unwrap();
    assert!(matches!(reason, CloseReason::Protocol(_)));
    assert_eq!(read_frame(&mut client_ws).await.command, "ERROR");
    assert!(broker.registry().is_empty());
}

#[tokio::test]
async fn test_refused_subscribe_answers_with_error_for_receipt() {
    let broker = Arc::new(Broker::default());
    let (mut client_ws, task) = spawn_handler(&broker, Settings::default().hub, 64 * 1024).await;
    stomp_connect(&mut client_ws).await;

    let id = broker.registry().ids()[0];
    broker.registry().unregister(id);

    send_frame(
        &mut client_ws,
        Frame::new("SUBSCRIBE")
            .header("id", "sub-0")
            .header("destination", "/topic/messages")
            .header("receipt", "r1"),
    )
    .await;
    let error = read_frame(&mut client_ws).await;
    assert_eq!(error.command, "ERROR");
    assert_eq!(error.get("receipt-id"), Some("r1"));
    assert!(broker.topics().is_empty());

    drop(client_ws);
    assert!(matches!(
        task.await.unwrap(),
        CloseReason::ClientClosed | CloseReason::TransportError(_)
    ));
}

#[tokio::test]
async fn test_frames_before_connect_are_rejected() {
    let broker = Arc::new(Broker::default());
    let (mut client_ws, task) = spawn_handler(&broker, Settings::default().hub, 64 * 1024).await;

    send_frame(
        &mut client_ws,
        Frame::new("SUBSCRIBE").header("destination", "/topic/messages"),
    )
    .await;

    assert_eq!(read_frame(&mut client_ws).await.command, "ERROR");
    assert!(matches!(task.await.unwrap(), CloseReason::Protocol(_)));
    assert!(broker.registry().is_empty());
    assert!(broker.topics().is_empty());
}
