//! Client handle for one logical connection to the relay server.
//!
//! Provides:
//! - Connection lifecycle (connect, automatic reconnect, stop)
//! - Correlated requests (`agent_operation`, `ping`, or any custom message)
//! - Diagram subscriptions as per-diagram event streams
//! - Connection-level events (connected, reconnected, remote errors)
//!
//! Each `DiagramClient` owns its own correlator and subscription manager, so
//! any number of clients can live in one process.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::correlator::RequestCorrelator;
use crate::dispatcher::ConnectionEvent;
use crate::error::ClientError;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::subscription::{DiagramSubscription, SubscriptionInfo, SubscriptionManager};
use crate::supervisor::{
    Connector, ReconnectionSupervisor, SupervisorConfig, SupervisorState, WsConnector,
};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint, without the identity parameter
    pub server_url: String,
    /// Identity sent with every message and in the connection URL
    pub agent_id: String,
    /// Deadline for correlated requests
    pub request_timeout: Duration,
    /// Fixed delay between reconnect attempts
    pub reconnect_delay: Duration,
    /// Attempts for the initial `connect()`
    pub connect_attempts: u32,
    /// Treat the connection as dead after this long without inbound traffic
    pub liveness_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090/ws/diagrams".to_string(),
            agent_id: generate_agent_id(),
            request_timeout: Duration::from_millis(30_000),
            reconnect_delay: Duration::from_millis(3_000),
            connect_attempts: 1,
            liveness_timeout: Some(Duration::from_secs(90)),
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = attempts;
        self
    }

    pub fn with_liveness_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.liveness_timeout = timeout;
        self
    }

    fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            server_url: self.server_url.clone(),
            identity: self.agent_id.clone(),
            reconnect_delay: self.reconnect_delay,
            connect_attempts: self.connect_attempts,
            liveness_timeout: self.liveness_timeout,
        }
    }
}

/// A fresh agent identity.
pub fn generate_agent_id() -> String {
    format!("agent-{}", Uuid::new_v4())
}

/// The diagram client.
pub struct DiagramClient {
    config: ClientConfig,
    correlator: RequestCorrelator,
    subscriptions: SubscriptionManager,
    supervisor: ReconnectionSupervisor,
    event_rx: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
}

impl DiagramClient {
    /// Create a client that connects over the network.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_connector(config, Arc::new(WsConnector))
    }

    /// Create a client with a custom transport factory.
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let correlator = RequestCorrelator::new();
        let subscriptions = SubscriptionManager::new(config.agent_id.clone());
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let supervisor = ReconnectionSupervisor::new(
            config.supervisor_config(),
            connector,
            correlator.clone(),
            subscriptions.clone(),
            event_tx,
        );
        Self {
            config,
            correlator,
            subscriptions,
            supervisor,
            event_rx: Some(event_rx),
        }
    }

    /// Take the connection event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.event_rx.take()
    }

    /// Connect and keep the connection alive until [`stop`](Self::stop).
    ///
    /// Subscriptions made before connecting are sent as part of connecting.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.supervisor.start().await
    }

    /// Send a correlated request with the configured timeout.
    pub async fn request(&self, message: ClientMessage) -> Result<ServerMessage, ClientError> {
        self.request_with_timeout(message, self.config.request_timeout).await
    }

    /// Send a correlated request with an explicit timeout.
    pub async fn request_with_timeout(
        &self,
        message: ClientMessage,
        timeout: Duration,
    ) -> Result<ServerMessage, ClientError> {
        if self.supervisor.is_stopped() {
            return Err(ClientError::Stopped);
        }
        let transport = self.supervisor.transport().ok_or(ClientError::NotConnected)?;
        self.correlator.request(&transport, message, timeout).await
    }

    /// Apply an operation to a diagram and wait for the server's verdict.
    pub async fn apply_operation(
        &self,
        diagram_id: &str,
        operation: &str,
        data: Value,
    ) -> Result<ServerMessage, ClientError> {
        let message =
            ClientMessage::agent_operation(&self.config.agent_id, diagram_id, operation, data);
        self.request(message).await
    }

    /// Round-trip a ping; returns how long it took.
    pub async fn ping(&self) -> Result<Duration, ClientError> {
        let started = tokio::time::Instant::now();
        self.request(ClientMessage::ping(&self.config.agent_id)).await?;
        Ok(started.elapsed())
    }

    /// Receive change events for `diagram_id`.
    pub fn subscribe(&self, diagram_id: &str) -> DiagramSubscription {
        self.subscriptions.subscribe(diagram_id)
    }

    /// Stop receiving events for `diagram_id`. Unknown ids are a no-op.
    pub fn unsubscribe(&self, diagram_id: &str) -> bool {
        self.subscriptions.unsubscribe(diagram_id)
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.subscriptions.subscriptions()
    }

    pub fn connection_state(&self) -> SupervisorState {
        self.supervisor.state()
    }

    /// Wait until the client is connected (with subscriptions restored).
    pub async fn wait_connected(&self) -> Result<(), ClientError> {
        let mut state = self.supervisor.watch_state();
        let reached = state
            .wait_for(|s| matches!(s, SupervisorState::Connected | SupervisorState::Stopped))
            .await
            .map(|s| *s)
            .map_err(|_| ClientError::Stopped)?;
        match reached {
            SupervisorState::Connected => Ok(()),
            _ => Err(ClientError::Stopped),
        }
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_count()
    }

    /// Shut down: no reconnects, pending requests fail, subscriptions end.
    pub async fn stop(&self) {
        self.supervisor.stop().await;
    }

    pub fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    pub fn server_url(&self) -> &str {
        &self.config.server_url
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl Drop for DiagramClient {
    fn drop(&mut self) {
        self.supervisor.halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ClientMessageType, ServerMessageType};
    use crate::supervisor::tests::PipeConnector;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message;

    fn test_config() -> ClientConfig {
        ClientConfig::new("ws://test/ws/diagrams")
            .with_agent_id("agent-test")
            .with_reconnect_delay(Duration::from_millis(20))
            .with_liveness_timeout(None)
    }

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.request_timeout, Duration::from_millis(30_000));
        assert_eq!(config.reconnect_delay, Duration::from_millis(3_000));
        assert_eq!(config.connect_attempts, 1);
        assert!(config.agent_id.starts_with("agent-"));
        assert_ne!(config.agent_id, ClientConfig::default().agent_id);
    }

    #[test]
    fn test_client_creation() {
        let client = DiagramClient::new(ClientConfig::new("ws://localhost:9090/ws/diagrams").with_agent_id("bot-7"));
        assert_eq!(client.agent_id(), "bot-7");
        assert_eq!(client.server_url(), "ws://localhost:9090/ws/diagrams");
        assert_eq!(client.connection_state(), SupervisorState::Disconnected);
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_request_before_connect_is_not_connected() {
        let client = DiagramClient::new(test_config());
        let result = client.apply_operation("d-1", "add_node", json!({})).await;
        assert_eq!(result, Err(ClientError::NotConnected));
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = DiagramClient::new(test_config());
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_apply_operation_round_trip() {
        let (connector, mut ends) = PipeConnector::new();
        let client = Arc::new(DiagramClient::with_connector(test_config(), connector));
        client.connect().await.unwrap();
        let mut server = ends.recv().await.unwrap();

        let c = client.clone();
        let call = tokio::spawn(async move {
            c.apply_operation("d-1", "add_node", json!({"id": "n1"})).await
        });

        let frame = server.next().await.unwrap().unwrap();
        let sent = ClientMessage::decode(frame.into_text().unwrap().as_str()).unwrap();
        assert_eq!(sent.msg_type, ClientMessageType::AgentOperation);
        assert_eq!(sent.agent_id, "agent-test");
        let request_id = sent.request_id.unwrap();

        let reply = ServerMessage::reply(ServerMessageType::DiagramUpdated, &request_id, Some(json!({"version": 2})));
        server.send(Message::Text(reply.encode().unwrap().into())).await.unwrap();

        let result = call.await.unwrap().unwrap();
        assert_eq!(result.result, Some(json!({"version": 2})));
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_wait_connected_and_stop() {
        let (connector, _ends) = PipeConnector::new();
        let client = DiagramClient::with_connector(test_config(), connector);
        client.connect().await.unwrap();
        timeout(Duration::from_secs(1), client.wait_connected()).await.unwrap().unwrap();

        client.stop().await;
        assert_eq!(client.connection_state(), SupervisorState::Stopped);
        assert_eq!(client.wait_connected().await, Err(ClientError::Stopped));
        assert_eq!(client.ping().await, Err(ClientError::Stopped));
    }

    #[tokio::test]
    async fn test_subscribe_before_connect_sent_on_connect() {
        let (connector, mut ends) = PipeConnector::new();
        let client = DiagramClient::with_connector(test_config(), connector);
        let _sub = client.subscribe("d-42");
        assert_eq!(client.subscriptions().len(), 1);

        client.connect().await.unwrap();
        let mut server = ends.recv().await.unwrap();
        let frame = server.next().await.unwrap().unwrap();
        let sent = ClientMessage::decode(frame.into_text().unwrap().as_str()).unwrap();
        assert_eq!(sent.msg_type, ClientMessageType::Subscribe);
        assert_eq!(sent.diagram_uuid.as_deref(), Some("d-42"));
    }
}
