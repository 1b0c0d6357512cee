//! Connection state machine and automatic reconnection.
//!
//! ```text
//!  Disconnected ──► Connecting ──► Connected ──(loss)──► Disconnected
//!       ▲               │                                     │
//!       └───(failure)───┘◄──────────(after delay)─────────────┘
//!
//!  stop() from any state ──► Stopped (terminal)
//! ```
//!
//! One task per client owns the inbound stream of the current transport and
//! feeds it to the dispatcher in arrival order. On loss it fails every
//! pending request, detaches the subscription manager and retries after a
//! fixed delay until it succeeds or the client is stopped. A new transport
//! only becomes visible to callers after the subscription set was re-sent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

use crate::correlator::RequestCorrelator;
use crate::dispatcher::{ConnectionEvent, EventDispatcher};
use crate::error::ClientError;
use crate::subscription::SubscriptionManager;
use crate::transport::{lock, Transport, TransportEvent};

/// Supervisor states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Disconnected,
    Connecting,
    Connected,
    Stopped,
}

pub type ConnectResult = Result<(Transport, mpsc::UnboundedReceiver<TransportEvent>), ClientError>;

/// Opens transports. The default goes over the network; tests plug in
/// in-memory pipes.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str, identity: &str) -> BoxFuture<'static, ConnectResult>;
}

/// Connects with `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: &str, identity: &str) -> BoxFuture<'static, ConnectResult> {
        let url = url.to_string();
        let identity = identity.to_string();
        Box::pin(async move { Transport::connect(&url, &identity).await })
    }
}

/// Retry and liveness policy.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub server_url: String,
    pub identity: String,
    /// Delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Attempts for the initial connect before giving up.
    pub connect_attempts: u32,
    /// Close the transport when nothing arrives for this long.
    pub liveness_timeout: Option<Duration>,
}

struct SupervisorInner {
    config: SupervisorConfig,
    connector: Arc<dyn Connector>,
    correlator: RequestCorrelator,
    subscriptions: SubscriptionManager,
    dispatcher: EventDispatcher,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    link: Mutex<Option<Transport>>,
    state: watch::Sender<SupervisorState>,
    stopped: AtomicBool,
    stop_signal: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Keeps one client connected. Cheap to clone.
#[derive(Clone)]
pub struct ReconnectionSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ReconnectionSupervisor {
    pub fn new(
        config: SupervisorConfig,
        connector: Arc<dyn Connector>,
        correlator: RequestCorrelator,
        subscriptions: SubscriptionManager,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let dispatcher =
            EventDispatcher::new(correlator.clone(), subscriptions.clone(), events.clone());
        let (state, _) = watch::channel(SupervisorState::Disconnected);
        Self {
            inner: Arc::new(SupervisorInner {
                config,
                connector,
                correlator,
                subscriptions,
                dispatcher,
                events,
                link: Mutex::new(None),
                state,
                stopped: AtomicBool::new(false),
                stop_signal: Notify::new(),
                task: Mutex::new(None),
            }),
        }
    }

    /// Establish the first connection and start supervising it.
    ///
    /// Tries `connect_attempts` times, `reconnect_delay` apart; if every
    /// attempt fails the last `ConnectionError` is returned and nothing keeps
    /// running. Calling it again while supervising is a no-op.
    pub async fn start(&self) -> Result<(), ClientError> {
        if self.is_stopped() {
            return Err(ClientError::Stopped);
        }
        if lock(&self.inner.task).is_some() {
            return Ok(());
        }

        let attempts = self.inner.config.connect_attempts.max(1);
        let mut last_error = ClientError::NotConnected;
        for attempt in 1..=attempts {
            self.set_state(SupervisorState::Connecting);
            match self.connect_once().await {
                Ok((transport, events)) => {
                    if let Err(e) = self.install(&transport) {
                        transport.close();
                        self.set_state(SupervisorState::Disconnected);
                        return Err(e);
                    }
                    let _ = self.inner.events.send(ConnectionEvent::Connected);

                    let supervisor = self.clone();
                    let task = tokio::spawn(async move {
                        supervisor.run(transport, events).await;
                    });
                    *lock(&self.inner.task) = Some(task);
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("Connect attempt {attempt}/{attempts} failed: {e}");
                    self.set_state(SupervisorState::Disconnected);
                    last_error = e;
                }
            }
            if attempt < attempts && !self.sleep_unless_stopped(self.inner.config.reconnect_delay).await {
                return Err(ClientError::Stopped);
            }
        }
        Err(last_error)
    }

    /// Stop supervising: cancel retries, close the transport, fail pending
    /// requests and drop all subscriptions. Terminal.
    pub async fn stop(&self) {
        self.halt();
        let task = lock(&self.inner.task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Synchronous part of [`stop`](Self::stop); safe to call from `Drop`.
    pub fn halt(&self) {
        let transport = {
            let mut link = lock(&self.inner.link);
            if self.inner.stopped.swap(true, Ordering::SeqCst) {
                return;
            }
            link.take()
        };
        self.inner.stop_signal.notify_one();
        if let Some(transport) = transport {
            transport.close();
        }
        self.inner.subscriptions.clear();
        self.inner.correlator.fail_all(ClientError::ConnectionLost);
        self.inner.state.send_replace(SupervisorState::Stopped);
        let _ = self.inner.events.send(ConnectionEvent::Stopped);
        log::info!("Supervisor for {} stopped", self.inner.config.identity);
    }

    pub fn state(&self) -> SupervisorState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SupervisorState> {
        self.inner.state.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// The transport requests should currently go to.
    pub fn transport(&self) -> Option<Transport> {
        lock(&self.inner.link).clone()
    }

    async fn connect_once(&self) -> ConnectResult {
        let config = &self.inner.config;
        let connect = self.inner.connector.connect(&config.server_url, &config.identity);
        tokio::select! {
            result = connect => result,
            _ = self.inner.stop_signal.notified() => Err(ClientError::Stopped),
        }
    }

    /// Make `transport` the live link: re-subscribe first, then publish.
    fn install(&self, transport: &Transport) -> Result<usize, ClientError> {
        let mut link = lock(&self.inner.link);
        if self.is_stopped() {
            return Err(ClientError::Stopped);
        }
        let resubscribed = self.inner.subscriptions.attach(Arc::new(transport.clone()))?;
        *link = Some(transport.clone());
        drop(link);
        self.set_state(SupervisorState::Connected);
        Ok(resubscribed)
    }

    fn set_state(&self, next: SupervisorState) {
        self.inner.state.send_if_modified(|current| {
            if *current == SupervisorState::Stopped || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    /// Returns `false` if the stop signal fired first.
    async fn sleep_unless_stopped(&self, delay: Duration) -> bool {
        if self.is_stopped() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => !self.is_stopped(),
            _ = self.inner.stop_signal.notified() => false,
        }
    }

    async fn run(
        self,
        mut transport: Transport,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        loop {
            let Some(reason) = self.pump(&transport, &mut events).await else {
                return;
            };
            if self.is_stopped() {
                return;
            }
            self.connection_lost(reason);

            loop {
                if !self.sleep_unless_stopped(self.inner.config.reconnect_delay).await {
                    return;
                }
                self.set_state(SupervisorState::Connecting);
                match self.connect_once().await {
                    Ok((next, next_events)) => match self.install(&next) {
                        Ok(resubscribed) => {
                            log::info!(
                                "Reconnected to {} ({resubscribed} subscriptions restored)",
                                self.inner.config.server_url
                            );
                            let _ = self
                                .inner
                                .events
                                .send(ConnectionEvent::Reconnected { resubscribed });
                            transport = next;
                            events = next_events;
                            break;
                        }
                        Err(ClientError::Stopped) => {
                            next.close();
                            return;
                        }
                        Err(e) => {
                            log::warn!("Re-subscription failed: {e}");
                            next.close();
                            self.set_state(SupervisorState::Disconnected);
                        }
                    },
                    Err(ClientError::Stopped) => return,
                    Err(e) => {
                        log::warn!("Reconnect failed: {e}");
                        self.set_state(SupervisorState::Disconnected);
                    }
                }
            }
        }
    }

    /// Feed inbound frames to the dispatcher until the transport closes
    /// (returns the reason) or the supervisor is stopped (returns `None`).
    async fn pump(
        &self,
        transport: &Transport,
        events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Option<String> {
        loop {
            let idle = async {
                match self.inner.config.liveness_timeout {
                    Some(limit) => {
                        let deadline = tokio::time::Instant::from_std(transport.last_activity() + limit);
                        tokio::time::sleep_until(deadline).await
                    }
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = self.inner.stop_signal.notified() => return None,
                event = events.recv() => match event {
                    Some(TransportEvent::Message(text)) => {
                        self.inner.dispatcher.dispatch(&text);
                    }
                    Some(TransportEvent::Open) => {}
                    Some(TransportEvent::Error(e)) => {
                        log::warn!("Transport error: {e}");
                    }
                    Some(TransportEvent::Closed(reason)) => return Some(reason),
                    None => return Some("transport gone".to_string()),
                },
                _ = idle => {
                    log::warn!("No traffic from server, treating connection as dead");
                    transport.close();
                    return Some("liveness timeout".to_string());
                }
            }
        }
    }

    fn connection_lost(&self, reason: String) {
        {
            let mut link = lock(&self.inner.link);
            if self.is_stopped() {
                return;
            }
            *link = None;
        }
        self.inner.subscriptions.detach();
        self.set_state(SupervisorState::Disconnected);
        let failed = self.inner.correlator.fail_all(ClientError::ConnectionLost);
        log::warn!(
            "Connection lost ({reason}); {failed} pending requests failed, reconnecting in {:?}",
            self.inner.config.reconnect_delay
        );
        let _ = self.inner.events.send(ConnectionEvent::Disconnected { reason });
    }
}
