//! JSON wire protocol for diagram channels.
//!
//! Every frame is a UTF-8 JSON text message. The `type` field selects the
//! message kind; the remaining fields are optional and depend on it:
//!
//! ```text
//! client → server  { type, diagram_uuid?, operation?, data?, agent_id, request_id?, timestamp }
//! server → client  { type, diagram_uuid?, changes?, updated_by?, timestamp?, error?,
//!                    request_id?, success?, result? }
//! ```
//!
//! Operation payloads (`data`, `changes`, `result`) stay opaque
//! `serde_json::Value`s. Only the collaborator that understands a given
//! operation decodes them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Who performed a change: a human editor session or an automated agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Originator {
    User,
    Agent,
}

impl std::fmt::Display for Originator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Agent => write!(f, "agent"),
        }
    }
}

/// Client → server message kinds.
///
/// Unknown kinds are kept verbatim in `Other` so newer peers can be relayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ClientMessageType {
    Subscribe,
    Unsubscribe,
    AgentOperation,
    Ping,
    Other(String),
}

impl From<String> for ClientMessageType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "subscribe" => Self::Subscribe,
            "unsubscribe" => Self::Unsubscribe,
            "agent_operation" => Self::AgentOperation,
            "ping" => Self::Ping,
            _ => Self::Other(s),
        }
    }
}

impl From<ClientMessageType> for String {
    fn from(t: ClientMessageType) -> Self {
        t.as_str().to_string()
    }
}

impl ClientMessageType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::AgentOperation => "agent_operation",
            Self::Ping => "ping",
            Self::Other(s) => s,
        }
    }
}

/// Server → client message kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ServerMessageType {
    DiagramUpdated,
    Pong,
    Error,
    /// Acknowledges a `subscribe` that carried a request id.
    Subscribed,
    /// Acknowledges an `unsubscribe` that carried a request id.
    Unsubscribed,
    Other(String),
}

impl From<String> for ServerMessageType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "diagram_updated" => Self::DiagramUpdated,
            "pong" => Self::Pong,
            "error" => Self::Error,
            "subscribed" => Self::Subscribed,
            "unsubscribed" => Self::Unsubscribed,
            _ => Self::Other(s),
        }
    }
}

impl From<ServerMessageType> for String {
    fn from(t: ServerMessageType) -> Self {
        t.as_str().to_string()
    }
}

impl ServerMessageType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::DiagramUpdated => "diagram_updated",
            Self::Pong => "pong",
            Self::Error => "error",
            Self::Subscribed => "subscribed",
            Self::Unsubscribed => "unsubscribed",
            Self::Other(s) => s,
        }
    }
}

/// A frame sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub msg_type: ClientMessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagram_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Browser sessions may omit it; the server then falls back to the
    /// identity from the connection URL.
    #[serde(default)]
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ClientMessage {
    fn new(msg_type: ClientMessageType, agent_id: &str) -> Self {
        Self {
            msg_type,
            diagram_uuid: None,
            operation: None,
            data: None,
            agent_id: agent_id.to_string(),
            request_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Join a diagram channel.
    pub fn subscribe(agent_id: &str, diagram_id: &str) -> Self {
        Self {
            diagram_uuid: Some(diagram_id.to_string()),
            ..Self::new(ClientMessageType::Subscribe, agent_id)
        }
    }

    /// Leave a diagram channel.
    pub fn unsubscribe(agent_id: &str, diagram_id: &str) -> Self {
        Self {
            diagram_uuid: Some(diagram_id.to_string()),
            ..Self::new(ClientMessageType::Unsubscribe, agent_id)
        }
    }

    /// Apply an operation to a diagram on behalf of an agent.
    pub fn agent_operation(
        agent_id: &str,
        diagram_id: &str,
        operation: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            diagram_uuid: Some(diagram_id.to_string()),
            operation: Some(operation.into()),
            data: Some(data),
            ..Self::new(ClientMessageType::AgentOperation, agent_id)
        }
    }

    pub fn ping(agent_id: &str) -> Self {
        Self::new(ClientMessageType::Ping, agent_id)
    }

    /// Stamp a request id, turning the message into a correlated request.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// A frame sent by the server: either a direct reply (carries `request_id`)
/// or an unsolicited broadcast / heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub msg_type: ServerMessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagram_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<Originator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl ServerMessage {
    pub fn new(msg_type: ServerMessageType) -> Self {
        Self {
            msg_type,
            diagram_uuid: None,
            changes: None,
            updated_by: None,
            timestamp: Some(Utc::now()),
            error: None,
            request_id: None,
            success: None,
            result: None,
        }
    }

    /// Broadcast event for a committed diagram change.
    pub fn diagram_updated(diagram_id: &str, changes: Vec<Value>, originator: Originator) -> Self {
        Self {
            diagram_uuid: Some(diagram_id.to_string()),
            changes: Some(changes),
            updated_by: Some(originator),
            ..Self::new(ServerMessageType::DiagramUpdated)
        }
    }

    /// Successful direct reply to a request.
    pub fn reply(msg_type: ServerMessageType, request_id: &str, result: Option<Value>) -> Self {
        Self {
            request_id: Some(request_id.to_string()),
            success: Some(true),
            result,
            ..Self::new(msg_type)
        }
    }

    /// Error frame; connection-level when `request_id` is `None`.
    pub fn error(message: impl Into<String>, request_id: Option<String>) -> Self {
        Self {
            error: Some(message.into()),
            request_id,
            success: Some(false),
            ..Self::new(ServerMessageType::Error)
        }
    }

    pub fn pong() -> Self {
        Self::new(ServerMessageType::Pong)
    }

    /// Application-level failure carried by this frame, if any.
    pub fn failure(&self) -> Option<String> {
        if self.msg_type == ServerMessageType::Error {
            return Some(self.error.clone().unwrap_or_else(|| "unknown error".to_string()));
        }
        if self.success == Some(false) {
            return Some(self.error.clone().unwrap_or_else(|| "request failed".to_string()));
        }
        None
    }

    /// View this frame as a diagram change event.
    pub fn diagram_event(&self) -> Result<DiagramEvent, ProtocolError> {
        if self.msg_type != ServerMessageType::DiagramUpdated {
            return Err(ProtocolError::InvalidMessageType(self.msg_type.as_str().to_string()));
        }
        let diagram_id = self
            .diagram_uuid
            .clone()
            .ok_or(ProtocolError::MissingField("diagram_uuid"))?;
        Ok(DiagramEvent {
            diagram_id,
            changes: self.changes.clone().unwrap_or_default(),
            originator: self.updated_by,
            timestamp: self.timestamp,
        })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// A change to one diagram as delivered to a subscription listener.
///
/// `originator` is passed through untouched; a listener that caused the
/// change itself decides whether to skip it.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagramEvent {
    pub diagram_id: String,
    pub changes: Vec<Value>,
    pub originator: Option<Originator>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl DiagramEvent {
    pub fn is_from(&self, originator: Originator) -> bool {
        self.originator == Some(originator)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid message type: {0}")]
    InvalidMessageType(String),
    #[error("Missing field: {0}")]
    MissingField(&'static str),
}
