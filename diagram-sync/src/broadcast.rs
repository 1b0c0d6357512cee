//! Fan-out of committed diagram changes to subscribed connections.
//!
//! Each diagram id maps to a [`DiagramChannel`] holding the outboxes of the
//! connections subscribed to it. A connection may sit in many channels, so
//! every connection owns one outbox and channels only hold senders to it.
//! Frames are encoded once and shared as `Arc<String>`.
//!
//! Delivery is best effort and at most once per connection per event:
//! nothing is buffered for connections that are not subscribed at send time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::{Originator, ProtocolError, ServerMessage};

/// Per-connection queue of encoded frames.
pub type Outbox = mpsc::UnboundedSender<Arc<String>>;

/// Statistics for monitoring channel health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_subscribers: usize,
}

/// Atomic counters so the send path never takes a write lock for stats.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

struct Subscriber {
    agent_id: String,
    outbox: Outbox,
}

/// The set of connections subscribed to one diagram.
pub struct DiagramChannel {
    subscribers: RwLock<HashMap<Uuid, Subscriber>>,
    atomic_stats: AtomicBroadcastStats,
}

impl Default for DiagramChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagramChannel {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            atomic_stats: AtomicBroadcastStats::new(),
        }
    }

    /// Add a connection. Returns `false` if it was already subscribed.
    pub async fn add_subscriber(&self, conn_id: Uuid, agent_id: &str, outbox: Outbox) -> bool {
        let mut subscribers = self.subscribers.write().await;
        if subscribers.contains_key(&conn_id) {
            return false;
        }
        subscribers.insert(
            conn_id,
            Subscriber {
                agent_id: agent_id.to_string(),
                outbox,
            },
        );
        true
    }

    pub async fn remove_subscriber(&self, conn_id: &Uuid) -> bool {
        self.subscribers.write().await.remove(conn_id).is_some()
    }

    /// Push one encoded frame to every subscriber.
    ///
    /// Returns how many outboxes accepted it. Closed outboxes are pruned.
    pub async fn send(&self, frame: Arc<String>) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let subscribers = self.subscribers.read().await;
            for (conn_id, subscriber) in subscribers.iter() {
                if subscriber.outbox.send(frame.clone()).is_ok() {
                    delivered += 1;
                } else {
                    dead.push(*conn_id);
                }
            }
        }
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        if !dead.is_empty() {
            self.atomic_stats
                .messages_dropped
                .fetch_add(dead.len() as u64, Ordering::Relaxed);
            let mut subscribers = self.subscribers.write().await;
            for conn_id in &dead {
                subscribers.remove(conn_id);
            }
            log::warn!("Pruned {} closed subscribers", dead.len());
        }
        delivered
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn has_subscriber(&self, conn_id: &Uuid) -> bool {
        self.subscribers.read().await.contains_key(conn_id)
    }

    /// Agent ids of the subscribed connections.
    pub async fn agents(&self) -> Vec<String> {
        self.subscribers
            .read()
            .await
            .values()
            .map(|s| s.agent_id.clone())
            .collect()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_subscribers: self.subscribers.read().await.len(),
        }
    }
}

/// Maps diagram ids to channels. Process-local and in-memory.
pub struct BroadcastFanout {
    channels: RwLock<HashMap<String, Arc<DiagramChannel>>>,
}

impl Default for BroadcastFanout {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastFanout {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, diagram_id: &str) -> Option<Arc<DiagramChannel>> {
        self.channels.read().await.get(diagram_id).cloned()
    }

    /// Subscribe a connection to a diagram, creating its channel on first
    /// use. Idempotent.
    ///
    /// The subscriber is added while the channel map is write-locked, so a
    /// concurrent [`remove_if_empty`](Self::remove_if_empty) cannot drop the
    /// channel between creation and insertion.
    pub async fn subscribe(
        &self,
        diagram_id: &str,
        conn_id: Uuid,
        agent_id: &str,
        outbox: Outbox,
    ) -> bool {
        let mut channels = self.channels.write().await;
        let channel = channels
            .entry(diagram_id.to_string())
            .or_insert_with(|| Arc::new(DiagramChannel::new()));
        let added = channel.add_subscriber(conn_id, agent_id, outbox).await;
        drop(channels);
        if added {
            log::info!("{agent_id} ({conn_id}) subscribed to diagram {diagram_id}");
        }
        added
    }

    /// Unsubscribe a connection from a diagram. Unknown pairs are a no-op.
    pub async fn unsubscribe(&self, diagram_id: &str, conn_id: &Uuid) -> bool {
        let Some(channel) = self.get(diagram_id).await else {
            return false;
        };
        let removed = channel.remove_subscriber(conn_id).await;
        if removed {
            log::info!("{conn_id} unsubscribed from diagram {diagram_id}");
            self.remove_if_empty(diagram_id).await;
        }
        removed
    }

    /// Drop a connection from every channel (connection teardown).
    pub async fn unsubscribe_all(&self, conn_id: &Uuid) -> usize {
        let channels: Vec<(String, Arc<DiagramChannel>)> = self
            .channels
            .read()
            .await
            .iter()
            .map(|(id, channel)| (id.clone(), channel.clone()))
            .collect();

        let mut removed = 0;
        for (diagram_id, channel) in channels {
            if channel.remove_subscriber(conn_id).await {
                removed += 1;
                self.remove_if_empty(&diagram_id).await;
            }
        }
        removed
    }

    /// Deliver a committed change to every connection subscribed to
    /// `diagram_id`, tagged with who made it.
    ///
    /// Returns the number of connections reached.
    pub async fn broadcast(
        &self,
        diagram_id: &str,
        changes: Vec<Value>,
        originator: Originator,
    ) -> Result<usize, ProtocolError> {
        let event = ServerMessage::diagram_updated(diagram_id, changes, originator);
        self.broadcast_message(diagram_id, &event).await
    }

    /// Deliver an arbitrary pre-built frame to a diagram channel.
    pub async fn broadcast_message(
        &self,
        diagram_id: &str,
        message: &ServerMessage,
    ) -> Result<usize, ProtocolError> {
        let Some(channel) = self.get(diagram_id).await else {
            log::debug!("No subscribers for diagram {diagram_id}");
            return Ok(0);
        };
        let frame = Arc::new(message.encode()?);
        let delivered = channel.send(frame).await;
        log::debug!("Broadcast to diagram {diagram_id} reached {delivered} connections");
        Ok(delivered)
    }

    /// Remove a channel with no subscribers left.
    pub async fn remove_if_empty(&self, diagram_id: &str) -> bool {
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get(diagram_id) {
            if channel.subscriber_count().await == 0 {
                channels.remove(diagram_id);
                return true;
            }
        }
        false
    }

    pub async fn subscriber_count(&self, diagram_id: &str) -> usize {
        match self.get(diagram_id).await {
            Some(channel) => channel.subscriber_count().await,
            None => 0,
        }
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn active_diagrams(&self) -> Vec<String> {
        self.channels.read().await.keys().cloned().collect()
    }
}
