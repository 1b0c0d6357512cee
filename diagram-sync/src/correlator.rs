//! Request/response correlation over a fire-and-forget transport.
//!
//! Every request gets an identifier of the form `<tag>-<n>`: `tag` is random
//! per correlator and `n` a monotonic counter, so identifiers are never
//! reused for the life of the owning client. Each pending entry owns a
//! deadline task and a oneshot completion. Whichever path removes the entry
//! from the table first (reply, deadline or connection loss) completes it;
//! the others find nothing and do nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::ClientError;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::transport::{lock, FrameSink};

type Completion = oneshot::Sender<Result<ServerMessage, ClientError>>;

struct PendingRequest {
    message_type: String,
    created_at: Instant,
    deadline: Instant,
    completion: Completion,
    timer: Option<JoinHandle<()>>,
}

impl PendingRequest {
    fn complete(mut self, outcome: Result<ServerMessage, ClientError>) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        // The caller may have stopped waiting; that is fine.
        let _ = self.completion.send(outcome);
    }
}

/// Snapshot of one in-flight request, for diagnostics.
#[derive(Debug, Clone)]
pub struct PendingInfo {
    pub request_id: String,
    pub message_type: String,
    pub age: Duration,
    pub remaining: Duration,
}

struct CorrelatorInner {
    tag: String,
    next_seq: AtomicU64,
    pending: Mutex<HashMap<String, PendingRequest>>,
}

/// Matches replies to requests by `request_id`. Cheap to clone.
#[derive(Clone)]
pub struct RequestCorrelator {
    inner: Arc<CorrelatorInner>,
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestCorrelator {
    pub fn new() -> Self {
        let tag = Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            inner: Arc::new(CorrelatorInner {
                tag,
                next_seq: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Generate a fresh request identifier.
    pub fn next_request_id(&self) -> String {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{seq}", self.inner.tag)
    }

    /// Send `message` as a correlated request and wait for its outcome.
    ///
    /// Resolves with the matching reply, or fails with `RemoteError`,
    /// `RequestTimeout`, `ConnectionLost` or the send error. Any request id
    /// already on the message is replaced.
    pub async fn request(
        &self,
        sink: &dyn FrameSink,
        message: ClientMessage,
        timeout: Duration,
    ) -> Result<ServerMessage, ClientError> {
        let request_id = self.next_request_id();
        let message = message.with_request_id(request_id.clone());
        let frame = message.encode()?;
        let rx = self.register(&request_id, message.msg_type.as_str(), timeout);

        log::debug!("Sending request {request_id} ({})", message.msg_type.as_str());
        if let Err(e) = sink.send_text(frame) {
            let entry = lock(&self.inner.pending).remove(&request_id);
            if let Some(timer) = entry.and_then(|entry| entry.timer) {
                timer.abort();
            }
            return Err(e);
        }

        match rx.await {
            Ok(outcome) => outcome,
            // Completion dropped without a verdict: only possible when the
            // correlator itself went away with the connection.
            Err(_) => Err(ClientError::ConnectionLost),
        }
    }

    fn register(
        &self,
        request_id: &str,
        message_type: &str,
        timeout: Duration,
    ) -> oneshot::Receiver<Result<ServerMessage, ClientError>> {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let mut pending = lock(&self.inner.pending);
        pending.insert(
            request_id.to_string(),
            PendingRequest {
                message_type: message_type.to_string(),
                created_at: now,
                deadline: now + timeout,
                completion: tx,
                timer: None,
            },
        );

        let correlator = self.clone();
        let id = request_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            correlator.expire(&id);
        });
        if let Some(entry) = pending.get_mut(request_id) {
            entry.timer = Some(timer);
        }
        rx
    }

    fn expire(&self, request_id: &str) {
        let entry = lock(&self.inner.pending).remove(request_id);
        if let Some(mut entry) = entry {
            log::warn!("Request {request_id} ({}) timed out", entry.message_type);
            // Running inside the timer itself; nothing to abort.
            entry.timer = None;
            entry.complete(Err(ClientError::RequestTimeout(request_id.to_string())));
        }
    }

    /// Offer an inbound frame to the pending table.
    ///
    /// Returns `true` if the frame answered a pending request and was
    /// consumed. Frames without a request id, or whose request is no
    /// longer pending, are left alone.
    pub fn resolve(&self, reply: ServerMessage) -> bool {
        let Some(request_id) = reply.request_id.as_deref() else {
            return false;
        };
        let entry = lock(&self.inner.pending).remove(request_id);
        let Some(entry) = entry else {
            return false;
        };

        log::debug!(
            "Request {request_id} answered after {:?}",
            entry.created_at.elapsed()
        );
        let outcome = match reply.failure() {
            Some(message) => Err(ClientError::RemoteError(message)),
            None => Ok(reply),
        };
        entry.complete(outcome);
        true
    }

    /// Fail every pending request with `error`. Returns how many were failed.
    pub fn fail_all(&self, error: ClientError) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut pending = lock(&self.inner.pending);
            pending.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        for entry in drained {
            entry.complete(Err(error.clone()));
        }
        if count > 0 {
            log::info!("Failed {count} pending requests: {error}");
        }
        count
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        lock(&self.inner.pending).contains_key(request_id)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// In-flight requests, oldest first.
    pub fn pending(&self) -> Vec<PendingInfo> {
        let now = Instant::now();
        let mut infos: Vec<PendingInfo> = lock(&self.inner.pending)
            .iter()
            .map(|(id, entry)| PendingInfo {
                request_id: id.clone(),
                message_type: entry.message_type.clone(),
                age: now.saturating_duration_since(entry.created_at),
                remaining: entry.deadline.saturating_duration_since(now),
            })
            .collect();
        infos.sort_by(|a, b| b.age.cmp(&a.age));
        infos
    }
}
