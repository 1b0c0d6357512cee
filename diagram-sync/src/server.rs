//! WebSocket relay server with per-diagram fan-out.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── OperationHandler (persistence)
//!            ├── connection task ──────┤
//! Client B ──┘   (one per socket)      └── BroadcastFanout
//!                                              │
//!                                   ┌──────────┼───────────┐
//!                                   ▼          ▼           ▼
//!                                Client A   Client B    Client C
//!                               (subscribed to the diagram)
//! ```
//!
//! Each connection task:
//! - answers `ping` and control frames directly
//! - hands `agent_operation` to the [`OperationHandler`], replies to the
//!   requester and broadcasts the committed changes
//! - drains its outbox of broadcast frames
//! - pushes a heartbeat `pong` on a fixed interval

use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{Sink, SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::Interval;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{BroadcastFanout, Outbox};
use crate::protocol::{ClientMessage, ClientMessageType, Originator, ProtocolError, ServerMessage, ServerMessageType};
use crate::transport::identity_from_query;

type BoxError = Box<dyn Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Heartbeat interval in seconds (0 disables the heartbeat)
    pub heartbeat_interval_secs: u64,
    /// Largest accepted inbound text frame
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            heartbeat_interval_secs: 30,
            max_frame_bytes: 1024 * 1024,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_channels: usize,
    pub operations_applied: u64,
    pub operations_failed: u64,
}

/// An operation an agent asked to apply to a diagram.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
    pub diagram_id: String,
    pub operation: String,
    pub data: Value,
    pub agent_id: String,
}

/// What a successful operation produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationOutcome {
    /// Change records broadcast to the diagram's subscribers
    pub changes: Vec<Value>,
    /// Opaque result returned to the requester only
    pub result: Option<Value>,
}

/// Applies and persists diagram operations on behalf of the relay.
pub trait OperationHandler: Send + Sync + 'static {
    fn apply(&self, request: OperationRequest) -> BoxFuture<'static, Result<OperationOutcome, String>>;
}

/// Accepts every operation and reports it back as a single change record.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

impl OperationHandler for EchoHandler {
    fn apply(&self, request: OperationRequest) -> BoxFuture<'static, Result<OperationOutcome, String>> {
        Box::pin(async move {
            let change = json!({
                "operation": request.operation,
                "data": request.data,
                "agent_id": request.agent_id,
            });
            Ok(OperationOutcome {
                result: Some(json!({ "operation": request.operation })),
                changes: vec![change],
            })
        })
    }
}

/// State shared by the accept loop and every connection task.
#[derive(Clone)]
struct Shared {
    config: ServerConfig,
    fanout: Arc<BroadcastFanout>,
    handler: Arc<dyn OperationHandler>,
    stats: Arc<RwLock<ServerStats>>,
    shutdown: watch::Receiver<bool>,
}

/// The relay server.
pub struct RelayServer {
    shared: Shared,
    shutdown: watch::Sender<bool>,
}

impl RelayServer {
    /// Create a relay server that accepts every operation.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_handler(config, Arc::new(EchoHandler))
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Create with a custom persistence collaborator.
    pub fn with_handler(config: ServerConfig, handler: Arc<dyn OperationHandler>) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        Self {
            shared: Shared {
                config,
                fanout: Arc::new(BroadcastFanout::new()),
                handler,
                stats: Arc::new(RwLock::new(ServerStats::default())),
                shutdown: shutdown_rx,
            },
            shutdown,
        }
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Relay server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind and serve until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until [`shutdown`](Self::shutdown).
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        let mut shutdown = self.shared.shutdown.clone();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            log::warn!("Failed to accept connection: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let shared = self.shared.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }
        log::info!("Relay server stopped");
        Ok(())
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Serve one already-upgraded socket for `agent_id`.
    pub async fn serve_socket<S>(&self, ws: WebSocketStream<S>, agent_id: String) -> Result<(), BoxError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        Connection::new(self.shared.clone(), agent_id).run(ws).await
    }

    /// Push a committed change made outside the relay (for example through
    /// a REST endpoint) to the diagram's subscribers.
    pub async fn broadcast(
        &self,
        diagram_id: &str,
        changes: Vec<Value>,
        originator: Originator,
    ) -> Result<usize, ProtocolError> {
        self.shared.fanout.broadcast(diagram_id, changes, originator).await
    }

    async fn handle_connection(stream: TcpStream, addr: SocketAddr, shared: Shared) -> Result<(), BoxError> {
        let mut identity = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            identity = request.uri().query().and_then(identity_from_query);
            Ok(response)
        };
        let limit = Some(shared.config.max_frame_bytes);
        let ws_config = WebSocketConfig::default()
            .max_message_size(limit)
            .max_frame_size(limit);
        let ws = tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?;

        let agent_id = identity.unwrap_or_else(|| format!("anonymous-{addr}"));
        log::info!("WebSocket connection established from {addr} as {agent_id}");
        Connection::new(shared, agent_id).run(ws).await
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.shared.stats.read().await.clone();
        stats.active_channels = self.shared.fanout.channel_count().await;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn fanout(&self) -> &Arc<BroadcastFanout> {
        &self.shared.fanout
    }
}

/// One connected socket.
struct Connection {
    conn_id: Uuid,
    agent_id: String,
    outbox: Outbox,
    outbox_rx: mpsc::UnboundedReceiver<Arc<String>>,
    shared: Shared,
}

impl Connection {
    fn new(shared: Shared, agent_id: String) -> Self {
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        Self {
            conn_id: Uuid::new_v4(),
            agent_id,
            outbox,
            outbox_rx,
            shared,
        }
    }

    async fn run<S>(mut self, ws: WebSocketStream<S>) -> Result<(), BoxError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        {
            let mut s = self.shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let outcome = self.pump(ws).await;

        let dropped = self.shared.fanout.unsubscribe_all(&self.conn_id).await;
        log::info!(
            "Connection {} ({}) closed, left {dropped} diagrams",
            self.conn_id,
            self.agent_id
        );
        {
            let mut s = self.shared.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        outcome
    }

    async fn pump<S>(&mut self, ws: WebSocketStream<S>) -> Result<(), BoxError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut ws_sender, mut ws_receiver) = ws.split();
        let mut heartbeat = heartbeat_timer(self.shared.config.heartbeat_interval_secs);
        let mut shutdown = self.shared.shutdown.clone();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.respond(&mut ws_sender, text.as_str()).await?;
                        }
                        Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                            Ok(text) => self.respond(&mut ws_sender, text).await?,
                            Err(_) => {
                                let reply = ServerMessage::error("binary frames must be UTF-8 JSON", None);
                                send_message(&mut ws_sender, &reply).await?;
                            }
                        },
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed by {}", self.agent_id);
                            break;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Err(tungstenite::Error::Capacity(e))) => {
                            log::warn!("Closing connection from {}: {e}", self.agent_id);
                            let reply = ServerMessage::error(format!("frame rejected: {e}"), None);
                            let _ = send_message(&mut ws_sender, &reply).await;
                            let _ = ws_sender.send(Message::Close(None)).await;
                            break;
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {}: {e}", self.agent_id);
                            break;
                        }
                        _ => {}
                    }
                }

                Some(frame) = self.outbox_rx.recv() => {
                    ws_sender.send(Message::Text(frame.as_str().to_owned().into())).await?;
                }

                _ = tick(&mut heartbeat) => {
                    send_message(&mut ws_sender, &ServerMessage::pong()).await?;
                }

                _ = shutdown_requested(&mut shutdown) => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        Ok(())
    }

    async fn respond<W>(&self, sink: &mut W, text: &str) -> Result<(), BoxError>
    where
        W: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        {
            let mut s = self.shared.stats.write().await;
            s.total_messages += 1;
            s.total_bytes += text.len() as u64;
        }
        if let Some(reply) = self.handle_frame(text).await {
            send_message(sink, &reply).await?;
        }
        Ok(())
    }

    /// Process one inbound frame; returns the direct reply, if any.
    async fn handle_frame(&self, text: &str) -> Option<ServerMessage> {
        let limit = self.shared.config.max_frame_bytes;
        if text.len() > limit {
            log::warn!("Rejecting {} byte frame from {}", text.len(), self.agent_id);
            return Some(ServerMessage::error(
                format!("frame of {} bytes exceeds limit of {limit}", text.len()),
                None,
            ));
        }

        let message = match ClientMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Malformed frame from {}: {e}", self.agent_id);
                return Some(ServerMessage::error(format!("malformed message: {e}"), None));
            }
        };
        let request_id = message.request_id.clone();

        match &message.msg_type {
            ClientMessageType::Subscribe => {
                let Some(diagram_id) = message.diagram_uuid.as_deref() else {
                    return Some(ServerMessage::error("subscribe requires diagram_uuid", request_id));
                };
                self.shared
                    .fanout
                    .subscribe(diagram_id, self.conn_id, self.sender_of(&message), self.outbox.clone())
                    .await;
                request_id.map(|id| ack(ServerMessageType::Subscribed, &id, diagram_id))
            }
            ClientMessageType::Unsubscribe => {
                let Some(diagram_id) = message.diagram_uuid.as_deref() else {
                    return Some(ServerMessage::error("unsubscribe requires diagram_uuid", request_id));
                };
                self.shared.fanout.unsubscribe(diagram_id, &self.conn_id).await;
                request_id.map(|id| ack(ServerMessageType::Unsubscribed, &id, diagram_id))
            }
            ClientMessageType::AgentOperation => self.apply_operation(message).await,
            ClientMessageType::Ping => Some(match request_id {
                Some(id) => ServerMessage::reply(ServerMessageType::Pong, &id, None),
                None => ServerMessage::pong(),
            }),
            ClientMessageType::Other(kind) => {
                log::debug!("Unknown message type {kind} from {}", self.agent_id);
                Some(ServerMessage::error(format!("unknown message type: {kind}"), request_id))
            }
        }
    }

    async fn apply_operation(&self, message: ClientMessage) -> Option<ServerMessage> {
        let request_id = message.request_id.clone();
        let agent_id = self.sender_of(&message).to_string();
        let (Some(diagram_id), Some(operation)) = (message.diagram_uuid, message.operation) else {
            return Some(ServerMessage::error(
                "agent_operation requires diagram_uuid and operation",
                request_id,
            ));
        };

        let request = OperationRequest {
            diagram_id: diagram_id.clone(),
            operation,
            data: message.data.unwrap_or(Value::Null),
            agent_id,
        };
        log::debug!("Applying {} to diagram {diagram_id} for {}", request.operation, request.agent_id);

        match self.shared.handler.apply(request).await {
            Ok(outcome) => {
                self.shared.stats.write().await.operations_applied += 1;
                if let Err(e) = self
                    .shared
                    .fanout
                    .broadcast(&diagram_id, outcome.changes.clone(), Originator::Agent)
                    .await
                {
                    log::error!("Failed to broadcast update for diagram {diagram_id}: {e}");
                }
                request_id.map(|id| ServerMessage {
                    diagram_uuid: Some(diagram_id),
                    changes: Some(outcome.changes),
                    updated_by: Some(Originator::Agent),
                    ..ServerMessage::reply(ServerMessageType::DiagramUpdated, &id, outcome.result)
                })
            }
            Err(e) => {
                self.shared.stats.write().await.operations_failed += 1;
                log::warn!("Operation on diagram {diagram_id} failed: {e}");
                Some(ServerMessage::error(e, request_id))
            }
        }
    }

    /// The agent a frame speaks for; falls back to the connection identity.
    fn sender_of<'a>(&'a self, message: &'a ClientMessage) -> &'a str {
        if message.agent_id.is_empty() {
            &self.agent_id
        } else {
            &message.agent_id
        }
    }
}

fn ack(msg_type: ServerMessageType, request_id: &str, diagram_id: &str) -> ServerMessage {
    ServerMessage {
        diagram_uuid: Some(diagram_id.to_string()),
        ..ServerMessage::reply(msg_type, request_id, None)
    }
}

async fn send_message<W>(sink: &mut W, message: &ServerMessage) -> Result<(), BoxError>
where
    W: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    sink.send(Message::Text(message.encode()?.into())).await?;
    Ok(())
}

fn heartbeat_timer(interval_secs: u64) -> Option<Interval> {
    (interval_secs > 0).then(|| {
        let period = Duration::from_secs(interval_secs);
        tokio::time::interval_at(tokio::time::Instant::now() + period, period)
    })
}

/// Resolves once shutdown is signalled. The borrowed `watch::Ref` is
/// released here so callers' futures stay `Send`.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        // Heartbeat disabled: never fires
        None => std::future::pending().await,
    }
}
