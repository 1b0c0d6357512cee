//! Classification of inbound frames.
//!
//! ```text
//! frame ─► parse ──✗──► log + drop
//!            │
//!            ├─ request_id pending? ──► RequestCorrelator (exclusively)
//!            ├─ request_id unknown  ──► drop (late reply)
//!            ├─ diagram_updated     ──► SubscriptionManager listeners
//!            ├─ error               ──► ConnectionEvent::RemoteError
//!            └─ pong                ──► liveness only
//! ```

use tokio::sync::mpsc;

use crate::correlator::RequestCorrelator;
use crate::protocol::{ServerMessage, ServerMessageType};
use crate::subscription::SubscriptionManager;

/// Connection-level notifications, delivered on the client's event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The first connection is up.
    Connected,
    /// A lost connection was restored and `resubscribed` channels re-asserted.
    Reconnected { resubscribed: usize },
    /// The connection dropped; a reconnect is scheduled.
    Disconnected { reason: String },
    /// The server reported an error not tied to any request.
    RemoteError { message: String },
    /// The client was stopped; no more events follow.
    Stopped,
}

/// What the dispatcher did with one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Completed a pending request.
    Reply,
    /// Carried a request id that is not pending; dropped.
    StaleReply,
    /// Delivered to this many subscription listeners.
    Broadcast { delivered: usize },
    /// Forwarded as a connection-level error.
    ConnectionError,
    /// Liveness signal only.
    Heartbeat,
    /// Well-formed but of no interest to the core.
    Ignored,
    /// Could not be parsed; dropped.
    Malformed,
}

/// Routes frames for one client. Cheap to clone.
#[derive(Clone)]
pub struct EventDispatcher {
    correlator: RequestCorrelator,
    subscriptions: SubscriptionManager,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl EventDispatcher {
    pub fn new(
        correlator: RequestCorrelator,
        subscriptions: SubscriptionManager,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Self {
            correlator,
            subscriptions,
            events,
        }
    }

    pub fn dispatch(&self, frame: &str) -> Dispatch {
        let message = match ServerMessage::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Dropping malformed frame: {e}");
                return Dispatch::Malformed;
            }
        };

        if let Some(request_id) = message.request_id.clone() {
            let diagram_uuid = message.diagram_uuid.clone();
            let msg_type = message.msg_type.clone();
            if self.correlator.resolve(message) {
                return Dispatch::Reply;
            }
            log::debug!(
                "Dropping {msg_type:?} reply for unknown request {request_id} (diagram {})",
                diagram_uuid.as_deref().unwrap_or("-")
            );
            return Dispatch::StaleReply;
        }

        match message.msg_type {
            ServerMessageType::DiagramUpdated => match message.diagram_event() {
                Ok(event) => {
                    let delivered = self.subscriptions.deliver(&event);
                    log::debug!(
                        "Update for diagram {} by {:?} reached {delivered} listeners",
                        event.diagram_id,
                        event.originator
                    );
                    Dispatch::Broadcast { delivered }
                }
                Err(e) => {
                    log::warn!("Dropping diagram update: {e}");
                    Dispatch::Malformed
                }
            },
            ServerMessageType::Error => {
                let message = message.failure().unwrap_or_default();
                log::warn!("Server error: {message}");
                let _ = self.events.send(ConnectionEvent::RemoteError { message });
                Dispatch::ConnectionError
            }
            ServerMessageType::Pong => Dispatch::Heartbeat,
            other => {
                log::debug!("Ignoring {} frame", other.as_str());
                Dispatch::Ignored
            }
        }
    }
}
