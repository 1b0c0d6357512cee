//! # diagram-sync: Real-time diagram change propagation
//!
//! Keeps agents and editors in step on shared diagrams over a single
//! persistent WebSocket per client.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┐    WebSocket     ┌──────────────────┐
//! │ DiagramClient                │ ◄──────────────► │ RelayServer      │
//! │  ├─ RequestCorrelator        │    JSON frames   │  ├─ Operation-   │
//! │  ├─ SubscriptionManager      │                  │  │   Handler     │
//! │  ├─ EventDispatcher          │                  │  └─ Broadcast-   │
//! │  └─ ReconnectionSupervisor   │                  │      Fanout      │
//! │       └─ Transport           │                  └──────────────────┘
//! └──────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire frames (`ClientMessage`, `ServerMessage`)
//! - [`error`]: Client error type
//! - [`transport`]: One WebSocket connection with open/message/close events
//! - [`correlator`]: Request ↔ reply matching with per-request deadlines
//! - [`subscription`]: Desired diagram subscriptions and event streams
//! - [`dispatcher`]: Routing of inbound frames
//! - [`supervisor`]: Connect, liveness and automatic reconnect
//! - [`client`]: `DiagramClient` facade
//! - [`broadcast`]: Server-side per-diagram fan-out
//! - [`server`]: WebSocket relay server

pub mod protocol;
pub mod error;
pub mod transport;
pub mod correlator;
pub mod subscription;
pub mod dispatcher;
pub mod supervisor;
pub mod client;
pub mod broadcast;
pub mod server;

// Re-exports for convenience
pub use protocol::{
    ClientMessage, ClientMessageType, DiagramEvent, Originator, ProtocolError, ServerMessage,
    ServerMessageType,
};
pub use error::ClientError;
pub use transport::{FrameSink, Transport, TransportEvent, TransportState};
pub use correlator::{PendingInfo, RequestCorrelator};
pub use subscription::{DiagramSubscription, SubscriptionInfo, SubscriptionManager};
pub use dispatcher::{ConnectionEvent, Dispatch, EventDispatcher};
pub use supervisor::{Connector, ReconnectionSupervisor, SupervisorConfig, SupervisorState, WsConnector};
pub use client::{generate_agent_id, ClientConfig, DiagramClient};
pub use broadcast::{BroadcastFanout, BroadcastStats, DiagramChannel};
pub use server::{
    EchoHandler, OperationHandler, OperationOutcome, OperationRequest, RelayServer, ServerConfig,
    ServerStats,
};
