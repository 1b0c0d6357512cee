//! Integration tests for end-to-end diagram sync.
//!
//! These tests start a real relay server and connect real clients,
//! verifying the full request, broadcast and reconnect pipeline.

use diagram_sync::client::{ClientConfig, DiagramClient};
use diagram_sync::dispatcher::ConnectionEvent;
use diagram_sync::error::ClientError;
use diagram_sync::protocol::{Originator, ServerMessageType};
use diagram_sync::server::{
    EchoHandler, OperationHandler, OperationOutcome, OperationRequest, RelayServer, ServerConfig,
};
use diagram_sync::supervisor::SupervisorState;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct TestServer {
    server: Arc<RelayServer>,
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl TestServer {
    fn url(&self) -> String {
        format!("ws://{}/ws/diagrams", self.addr)
    }

    async fn stop(self) {
        self.server.shutdown();
        self.task.await.unwrap();
    }
}

/// Start a relay server on `bind_addr` (port 0 picks a free port).
async fn start_server_on(bind_addr: &str, handler: Arc<dyn OperationHandler>) -> TestServer {
    let config = ServerConfig {
        bind_addr: bind_addr.to_string(),
        heartbeat_interval_secs: 30,
        ..ServerConfig::default()
    };
    start_server_with(config, handler).await
}

async fn start_server_with(config: ServerConfig, handler: Arc<dyn OperationHandler>) -> TestServer {
    init_logging();
    let server = Arc::new(RelayServer::with_handler(config, handler));
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let s = server.clone();
    let task = tokio::spawn(async move {
        s.serve(listener).await.unwrap();
    });
    TestServer { server, addr, task }
}

async fn start_test_server() -> TestServer {
    start_server_on("127.0.0.1:0", Arc::new(EchoHandler)).await
}

fn client_config(url: &str, agent_id: &str) -> ClientConfig {
    ClientConfig::new(url)
        .with_agent_id(agent_id)
        .with_request_timeout(Duration::from_secs(2))
        .with_reconnect_delay(Duration::from_millis(50))
}

async fn connected_client(url: &str, agent_id: &str) -> (DiagramClient, UnboundedReceiver<ConnectionEvent>) {
    let mut client = DiagramClient::new(client_config(url, agent_id));
    let events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    (client, events)
}

async fn next_event(events: &mut UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
    timeout(Duration::from_secs(3), events.recv())
        .await
        .expect("no connection event within 3s")
        .expect("event stream closed")
}

/// Wait until the server has `expected` subscribers on `diagram_id`.
async fn wait_for_subscribers(server: &RelayServer, diagram_id: &str, expected: usize) {
    for _ in 0..150 {
        if server.fanout().subscriber_count(diagram_id).await == expected {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("diagram {diagram_id} never reached {expected} subscribers");
}

struct Slow(Duration);

impl OperationHandler for Slow {
    fn apply(&self, request: OperationRequest) -> BoxFuture<'static, Result<OperationOutcome, String>> {
        let delay = self.0;
        Box::pin(async move {
            sleep(delay).await;
            EchoHandler.apply(request).await
        })
    }
}

struct Reject;

impl OperationHandler for Reject {
    fn apply(&self, _request: OperationRequest) -> BoxFuture<'static, Result<OperationOutcome, String>> {
        Box::pin(async { Err("diagram is locked".to_string()) })
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let server = start_test_server().await;
    let url = format!("{}?agent_id=raw", server.url());

    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_frame_over_limit_closes_connection() {
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        heartbeat_interval_secs: 0,
        max_frame_bytes: 4096,
    };
    let server = start_server_with(config, Arc::new(EchoHandler)).await;
    let url = format!("{}?agent_id=big", server.url());
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let big = diagram_sync::ClientMessage::agent_operation("big", "d-1", "add_node", json!({"blob": "x".repeat(8192)}));
    ws.send(Message::Text(big.with_request_id("r-1").encode().unwrap().into()))
        .await
        .unwrap();

    // The server may answer with an error frame, then the socket ends.
    let ended = timeout(Duration::from_secs(3), async {
        while let Some(Ok(frame)) = ws.next().await {
            if let Message::Text(text) = frame {
                let reply = diagram_sync::ServerMessage::decode(text.as_str()).unwrap();
                assert_eq!(reply.msg_type, ServerMessageType::Error);
                assert!(reply.request_id.is_none());
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "connection should end after an oversized frame");
    assert_eq!(server.server.stats().await.operations_applied, 0);
}

#[tokio::test]
async fn test_client_connects() {
    let server = start_test_server().await;
    let (client, mut events) = connected_client(&server.url(), "agent-1").await;

    assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);
    assert_eq!(client.connection_state(), SupervisorState::Connected);
    assert!(client.ping().await.unwrap() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_connect_to_missing_server_fails() {
    init_logging();
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = DiagramClient::new(client_config(&format!("ws://127.0.0.1:{port}/ws/diagrams"), "agent-1"));

    let result = client.connect().await;
    assert!(matches!(result, Err(ClientError::ConnectionError { .. })));
    assert_eq!(client.connection_state(), SupervisorState::Disconnected);
}

#[tokio::test]
async fn test_operation_reply_resolves_request() {
    let server = start_test_server().await;
    let (client, _events) = connected_client(&server.url(), "agent-1").await;

    let reply = client
        .apply_operation("d-1", "add_node", json!({"id": "n1"}))
        .await
        .unwrap();
    assert_eq!(reply.msg_type, ServerMessageType::DiagramUpdated);
    assert_eq!(reply.success, Some(true));
    assert_eq!(reply.diagram_uuid.as_deref(), Some("d-1"));
    assert_eq!(reply.result, Some(json!({"operation": "add_node"})));
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn test_rejected_operation_is_remote_error() {
    let server = start_server_on("127.0.0.1:0", Arc::new(Reject)).await;
    let (client, _events) = connected_client(&server.url(), "agent-1").await;

    let result = client.apply_operation("d-1", "add_node", json!({})).await;
    assert_eq!(result, Err(ClientError::RemoteError("diagram is locked".into())));
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn test_request_timeout_and_late_reply() {
    let server = start_server_on("127.0.0.1:0", Arc::new(Slow(Duration::from_millis(400)))).await;
    let (client, _events) = connected_client(&server.url(), "agent-1").await;
    let mut sub = client.subscribe("d-1");
    wait_for_subscribers(&server.server, "d-1", 1).await;

    let message = diagram_sync::ClientMessage::agent_operation("agent-1", "d-1", "add_node", json!({}));
    let result = client.request_with_timeout(message, Duration::from_millis(100)).await;
    assert!(matches!(result, Err(ClientError::RequestTimeout(_))));
    assert_eq!(client.pending_requests(), 0);

    // The broadcast still arrives; the late reply is dropped.
    let event = timeout(Duration::from_secs(2), sub.recv()).await.unwrap().unwrap();
    assert_eq!(event.originator, Some(Originator::Agent));
    assert!(client.ping().await.is_ok());
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn test_broadcast_routed_to_subscribers_of_that_diagram() {
    let server = start_test_server().await;
    let (watcher_d1, _e1) = connected_client(&server.url(), "user-1").await;
    let (watcher_d2, _e2) = connected_client(&server.url(), "user-2").await;
    let (agent, _e3) = connected_client(&server.url(), "bot").await;

    let mut d1 = watcher_d1.subscribe("d-1");
    let mut d2 = watcher_d2.subscribe("d-2");
    wait_for_subscribers(&server.server, "d-1", 1).await;
    wait_for_subscribers(&server.server, "d-2", 1).await;

    agent
        .apply_operation("d-1", "move_node", json!({"id": "n1", "x": 10}))
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(2), d1.recv()).await.unwrap().unwrap();
    assert_eq!(event.diagram_id, "d-1");
    assert!(event.is_from(Originator::Agent));
    assert_eq!(event.changes[0]["operation"], json!("move_node"));

    assert!(timeout(Duration::from_millis(200), d2.recv()).await.is_err());
}

#[tokio::test]
async fn test_user_change_broadcast_from_server() {
    let server = start_test_server().await;
    let (client, _events) = connected_client(&server.url(), "bot").await;
    let mut sub = client.subscribe("d-7");
    wait_for_subscribers(&server.server, "d-7", 1).await;

    let delivered = server
        .server
        .broadcast("d-7", vec![json!({"renamed": "n3"})], Originator::User)
        .await
        .unwrap();
    assert_eq!(delivered, 1);

    let event = timeout(Duration::from_secs(2), sub.recv()).await.unwrap().unwrap();
    assert!(event.is_from(Originator::User));
    assert_eq!(event.changes, vec![json!({"renamed": "n3"})]);
}

#[tokio::test]
async fn test_unsubscribe() {
    let server = start_test_server().await;
    let (client, _events) = connected_client(&server.url(), "bot").await;

    assert!(!client.unsubscribe("never-subscribed"));

    let mut sub = client.subscribe("d-1");
    wait_for_subscribers(&server.server, "d-1", 1).await;
    assert!(client.unsubscribe("d-1"));
    wait_for_subscribers(&server.server, "d-1", 0).await;
    assert_eq!(sub.recv().await, None);
    assert!(client.subscriptions().is_empty());
}

#[tokio::test]
async fn test_two_clients_independent() {
    let server = start_test_server().await;
    let (a, _ea) = connected_client(&server.url(), "agent-a").await;
    let (b, _eb) = connected_client(&server.url(), "agent-b").await;

    let _sub = a.subscribe("d-1");
    wait_for_subscribers(&server.server, "d-1", 1).await;
    assert!(b.subscriptions().is_empty());

    b.stop().await;
    assert_eq!(b.connection_state(), SupervisorState::Stopped);
    assert!(a.ping().await.is_ok());
    assert_eq!(server.server.stats().await.active_channels, 1);
}

#[tokio::test]
async fn test_reconnect_restores_subscriptions() {
    let first = start_test_server().await;
    let addr = first.addr;
    let url = first.url();
    let (client, mut events) = connected_client(&url, "agent-1").await;
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);

    let mut d1 = client.subscribe("d1");
    let _d2 = client.subscribe("d2");
    wait_for_subscribers(&first.server, "d1", 1).await;
    wait_for_subscribers(&first.server, "d2", 1).await;

    first.stop().await;
    assert!(matches!(next_event(&mut events).await, ConnectionEvent::Disconnected { .. }));

    let second = start_server_on(&addr.to_string(), Arc::new(EchoHandler)).await;
    assert_eq!(
        next_event(&mut events).await,
        ConnectionEvent::Reconnected { resubscribed: 2 }
    );
    wait_for_subscribers(&second.server, "d1", 1).await;
    wait_for_subscribers(&second.server, "d2", 1).await;

    second
        .server
        .broadcast("d1", vec![json!({"op": "after-restart"})], Originator::User)
        .await
        .unwrap();
    let event = timeout(Duration::from_secs(2), d1.recv()).await.unwrap().unwrap();
    assert_eq!(event.changes, vec![json!({"op": "after-restart"})]);
}

#[tokio::test]
async fn test_stop_fails_pending_request() {
    let server = start_server_on("127.0.0.1:0", Arc::new(Slow(Duration::from_secs(5)))).await;
    let (client, _events) = connected_client(&server.url(), "agent-1").await;
    let client = Arc::new(client);

    let c = client.clone();
    let call = tokio::spawn(async move { c.apply_operation("d-1", "add_node", json!({})).await });
    while client.pending_requests() == 0 {
        sleep(Duration::from_millis(5)).await;
    }

    client.stop().await;
    assert_eq!(call.await.unwrap(), Err(ClientError::ConnectionLost));
    assert_eq!(client.pending_requests(), 0);
}
