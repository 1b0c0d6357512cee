//! Desired diagram channel membership, independent of connection churn.
//!
//! The manager remembers which diagrams the caller wants events for and
//! hands out one [`DiagramSubscription`] stream per `subscribe` call. While
//! attached to a live transport it mirrors changes to the server; on
//! (re)attach it re-asserts the whole set before anything else happens.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures_util::Stream;
use tokio::sync::mpsc;

use crate::error::ClientError;
use crate::protocol::{ClientMessage, DiagramEvent};
use crate::transport::{lock, FrameSink};

/// Public view of one desired subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionInfo {
    pub diagram_id: String,
    pub since: DateTime<Utc>,
    pub listeners: usize,
}

/// Stream of change events for one diagram.
///
/// Ends when the diagram is unsubscribed or the client is stopped.
pub struct DiagramSubscription {
    diagram_id: String,
    rx: mpsc::UnboundedReceiver<DiagramEvent>,
}

impl DiagramSubscription {
    pub fn diagram_id(&self) -> &str {
        &self.diagram_id
    }

    /// Wait for the next event; `None` once the subscription is gone.
    pub async fn recv(&mut self) -> Option<DiagramEvent> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<DiagramEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for DiagramSubscription {
    type Item = DiagramEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

struct ChannelEntry {
    since: DateTime<Utc>,
    listeners: Vec<mpsc::UnboundedSender<DiagramEvent>>,
}

#[derive(Default)]
struct ManagerState {
    desired: HashMap<String, ChannelEntry>,
    link: Option<Arc<dyn FrameSink>>,
}

impl ManagerState {
    fn send(&self, message: ClientMessage) {
        let Some(link) = &self.link else {
            return;
        };
        let result = message.encode().map_err(ClientError::from).and_then(|frame| link.send_text(frame));
        if let Err(e) = result {
            // Desired state is already updated; the next attach re-asserts it.
            log::warn!("Failed to send {} control message: {e}", message.msg_type.as_str());
        }
    }
}

/// Tracks desired channel membership for one client. Cheap to clone.
#[derive(Clone)]
pub struct SubscriptionManager {
    agent_id: String,
    state: Arc<Mutex<ManagerState>>,
}

impl SubscriptionManager {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            state: Arc::new(Mutex::new(ManagerState::default())),
        }
    }

    /// Start receiving events for `diagram_id`.
    ///
    /// Only the first subscription to an id reaches the wire; later calls
    /// just add another listener stream.
    pub fn subscribe(&self, diagram_id: &str) -> DiagramSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = lock(&self.state);
        match state.desired.get_mut(diagram_id) {
            Some(entry) => entry.listeners.push(tx),
            None => {
                state.desired.insert(
                    diagram_id.to_string(),
                    ChannelEntry {
                        since: Utc::now(),
                        listeners: vec![tx],
                    },
                );
                log::info!("Subscribing to diagram {diagram_id}");
                state.send(ClientMessage::subscribe(&self.agent_id, diagram_id));
            }
        }
        DiagramSubscription {
            diagram_id: diagram_id.to_string(),
            rx,
        }
    }

    /// Stop receiving events for `diagram_id` and end its listener streams.
    ///
    /// Returns `false` (and sends nothing) if the id was not subscribed.
    pub fn unsubscribe(&self, diagram_id: &str) -> bool {
        let mut state = lock(&self.state);
        if state.desired.remove(diagram_id).is_none() {
            return false;
        }
        log::info!("Unsubscribing from diagram {diagram_id}");
        state.send(ClientMessage::unsubscribe(&self.agent_id, diagram_id));
        true
    }

    /// Bind to a freshly opened transport, re-asserting every desired id.
    ///
    /// Returns the number of subscribe messages sent. On a send failure the
    /// manager stays detached.
    pub fn attach(&self, link: Arc<dyn FrameSink>) -> Result<usize, ClientError> {
        let mut state = lock(&self.state);
        for diagram_id in state.desired.keys() {
            let frame = ClientMessage::subscribe(&self.agent_id, diagram_id).encode()?;
            link.send_text(frame)?;
        }
        let count = state.desired.len();
        state.link = Some(link);
        if count > 0 {
            log::info!("Re-subscribed to {count} diagrams");
        }
        Ok(count)
    }

    /// Forget the transport after it closed. Desired state is kept.
    pub fn detach(&self) {
        lock(&self.state).link = None;
    }

    /// Drop every subscription without telling the server (teardown).
    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.desired.clear();
        state.link = None;
    }

    /// Hand an event to every live listener of its diagram.
    ///
    /// Returns the number of listeners reached. Listeners whose stream was
    /// dropped are pruned.
    pub fn deliver(&self, event: &DiagramEvent) -> usize {
        let mut state = lock(&self.state);
        let Some(entry) = state.desired.get_mut(&event.diagram_id) else {
            return 0;
        };
        entry.listeners.retain(|tx| tx.send(event.clone()).is_ok());
        entry.listeners.len()
    }

    pub fn is_subscribed(&self, diagram_id: &str) -> bool {
        lock(&self.state).desired.contains_key(diagram_id)
    }

    pub fn is_attached(&self) -> bool {
        lock(&self.state).link.is_some()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).desired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of desired subscriptions, oldest first.
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        let state = lock(&self.state);
        let mut infos: Vec<SubscriptionInfo> = state
            .desired
            .iter()
            .map(|(id, entry)| SubscriptionInfo {
                diagram_id: id.clone(),
                since: entry.since,
                listeners: entry.listeners.len(),
            })
            .collect();
        infos.sort_by(|a, b| a.since.cmp(&b.since).then_with(|| a.diagram_id.cmp(&b.diagram_id)));
        infos
    }
}
