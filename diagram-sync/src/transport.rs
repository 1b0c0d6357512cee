//! One physical WebSocket to the relay server.
//!
//! The rest of the client touches only `send_text`, `close` and the
//! [`TransportEvent`] stream returned at connect time. A reader task turns
//! inbound frames into events, a writer task drains an unbounded outgoing
//! queue, so sending never suspends the caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::error::ClientError;

/// Query parameter carrying the client's self-generated identity.
pub const IDENTITY_PARAM: &str = "agent_id";

/// Transport lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Events emitted by a transport, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The socket is open and frames may be sent.
    Open,
    /// One inbound text frame.
    Message(String),
    /// A transport-level error. A `Closed` event always follows.
    Error(String),
    /// The socket closed. Emitted exactly once per transport.
    Closed(String),
}

/// Anything that accepts outbound text frames.
///
/// The correlator and subscription manager only need this much of a
/// transport, which keeps them testable without a socket.
pub trait FrameSink: Send + Sync {
    fn send_text(&self, frame: String) -> Result<(), ClientError>;
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct TransportInner {
    identity: String,
    state: Mutex<TransportState>,
    last_activity: Mutex<Instant>,
    /// Taken on close so the writer task sees its queue end.
    outgoing: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    close_notified: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl TransportInner {
    fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    /// Move to `Closed` and notify, at most once no matter how many close
    /// paths race here.
    fn finish_close(&self, reason: String) {
        *lock(&self.state) = TransportState::Closed;
        lock(&self.outgoing).take();
        if self.close_notified.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("Transport for {} closed: {reason}", self.identity);
        let _ = self.events.send(TransportEvent::Closed(reason));
    }
}

/// Handle to one WebSocket connection. Cheap to clone.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Transport {
    /// Open a WebSocket to `url`, identifying as `identity`.
    pub async fn connect(
        url: &str,
        identity: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), ClientError> {
        let endpoint = endpoint_url(url, identity);
        let (ws_stream, _) = tokio_tungstenite::connect_async(endpoint.as_str())
            .await
            .map_err(|e| ClientError::ConnectionError {
                url: endpoint.clone(),
                reason: e.to_string(),
            })?;
        log::info!("Connected to {endpoint}");
        Ok(Self::from_stream(ws_stream, identity))
    }

    /// Wrap an already-established WebSocket stream.
    pub fn from_stream<S>(
        ws_stream: S,
        identity: &str,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>)
    where
        S: Stream<Item = Result<Message, tungstenite::Error>>
            + Sink<Message, Error = tungstenite::Error>
            + Send
            + Unpin
            + 'static,
    {
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(TransportInner {
            identity: identity.to_string(),
            state: Mutex::new(TransportState::Connecting),
            last_activity: Mutex::new(Instant::now()),
            outgoing: Mutex::new(Some(out_tx)),
            events: event_tx,
            close_notified: AtomicBool::new(false),
            reader: Mutex::new(None),
        });

        *lock(&inner.state) = TransportState::Open;
        let _ = inner.events.send(TransportEvent::Open);

        // Writer task: forward outgoing queue to the socket
        let writer_inner = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let is_close = matches!(msg, Message::Close(_));
                if let Err(e) = ws_writer.send(msg).await {
                    if let Some(inner) = writer_inner.upgrade() {
                        log::debug!("Write failed for {}: {e}", inner.identity);
                        inner.finish_close(format!("write failed: {e}"));
                    }
                    break;
                }
                if is_close {
                    break;
                }
            }
        });

        // Reader task: turn frames into events
        let reader_inner = inner.clone();
        let reader = tokio::spawn(async move {
            let mut reason = "connection closed".to_string();
            while let Some(frame) = ws_reader.next().await {
                reader_inner.touch();
                match frame {
                    Ok(Message::Text(text)) => {
                        let _ = reader_inner
                            .events
                            .send(TransportEvent::Message(text.as_str().to_owned()));
                    }
                    Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => {
                            let _ = reader_inner.events.send(TransportEvent::Message(text));
                        }
                        Err(_) => {
                            log::warn!("Dropping non UTF-8 binary frame");
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        if let Some(frame) = frame {
                            reason = format!("closed by peer: {}", frame.reason.as_str());
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        reason = e.to_string();
                        let _ = reader_inner.events.send(TransportEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
            reader_inner.finish_close(reason);
        });
        *lock(&inner.reader) = Some(reader);

        (Self { inner }, event_rx)
    }

    /// Close the socket. Emits `Closed` unless it was already emitted.
    pub fn close(&self) {
        {
            let mut state = lock(&self.inner.state);
            if matches!(*state, TransportState::Closing | TransportState::Closed) {
                return;
            }
            *state = TransportState::Closing;
        }
        if let Some(outgoing) = lock(&self.inner.outgoing).as_ref() {
            let _ = outgoing.send(Message::Close(None));
        }
        if let Some(reader) = lock(&self.inner.reader).take() {
            reader.abort();
        }
        self.inner.finish_close("closed locally".to_string());
    }

    pub fn state(&self) -> TransportState {
        *lock(&self.inner.state)
    }

    pub fn is_open(&self) -> bool {
        self.state() == TransportState::Open
    }

    /// Identity token sent in the connection URL.
    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    /// When the last inbound frame (of any kind) arrived.
    pub fn last_activity(&self) -> Instant {
        *lock(&self.inner.last_activity)
    }
}

impl FrameSink for Transport {
    fn send_text(&self, frame: String) -> Result<(), ClientError> {
        if !self.is_open() {
            return Err(ClientError::NotConnected);
        }
        match lock(&self.inner.outgoing).as_ref() {
            Some(outgoing) => outgoing
                .send(Message::Text(frame.into()))
                .map_err(|_| ClientError::NotConnected),
            None => Err(ClientError::NotConnected),
        }
    }
}

/// Append the identity query parameter to a server URL.
pub fn endpoint_url(url: &str, identity: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}{IDENTITY_PARAM}={}", urlencoding::encode(identity))
}

/// Read the identity parameter back out of a URL query string.
pub fn identity_from_query(query: &str) -> Option<String> {
    query
        .split('&')
        .find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            if key != IDENTITY_PARAM {
                return None;
            }
            urlencoding::decode(value).ok().map(|identity| identity.into_owned())
        })
        .filter(|identity| !identity.is_empty())
}
