//! Connection lifecycle: open, send, receive, close, and backoff-driven reconnects.
//!
//! The physical channel sits behind [`Connector`]; a successful open yields a
//! [`Link`] (text sink + text stream). The manager owns [`ConnectionState`] and
//! [`ReconnectState`] and publishes both on watch channels.

use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};

use crate::backoff::BackoffPolicy;

pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// An open channel. End of `stream` means the peer went away.
pub struct Link {
    sink: FrameSink,
    stream: FrameStream,
}

impl Link {
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

/// Opens the physical channel.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> Result<Link, TransportError>;
}

/// Channel-level failure. Always handled inside the manager.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("channel closed")]
    Closed,
}

/// `send` was called while the connection was not open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("not connected")]
pub struct NotConnected;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closing,
    Disconnected,
}

/// Reconnect bookkeeping. `attempt` counts reconnects scheduled since the last open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectState {
    pub attempt: u32,
    pub last_disconnect: Option<DateTime<Utc>>,
    /// Delay of the reconnect currently scheduled, if any.
    pub next_delay: Option<Duration>,
    /// Max attempts reached; stays set until a manual reconnect.
    pub exhausted: bool,
}

/// Result of writing a frame to an open link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The write failed. The link is already torn down and a reconnect is
    /// scheduled unless attempts are exhausted.
    Lost { reason: String },
}

/// What the manager observed while waiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Frame(String),
    /// The link dropped without `close()`. A reconnect is already scheduled
    /// unless attempts are exhausted.
    Lost { reason: String },
    /// The backoff wait elapsed; the owner should call `connect()`.
    ReconnectDue,
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    policy: BackoffPolicy,
    link: Option<Link>,
    reconnect_at: Option<Instant>,
    state: watch::Sender<ConnectionState>,
    reconnect: watch::Sender<ReconnectState>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, policy: BackoffPolicy) -> Self {
        Self {
            connector,
            policy,
            link: None,
            reconnect_at: None,
            state: watch::Sender::new(ConnectionState::Idle),
            reconnect: watch::Sender::new(ReconnectState::default()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn reconnect_state(&self) -> ReconnectState {
        self.reconnect.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn subscribe_reconnect(&self) -> watch::Receiver<ReconnectState> {
        self.reconnect.subscribe()
    }

    /// Opens the channel. On failure a reconnect is scheduled and the returned
    /// state is `Disconnected`.
    pub async fn connect(&mut self) -> ConnectionState {
        let current = self.state();
        if matches!(current, ConnectionState::Open | ConnectionState::Connecting) {
            debug!("connect ignored in state {:?}", current);
            return current;
        }
        self.reconnect_at = None;
        self.set_state(ConnectionState::Connecting);
        match self.connector.open().await {
            Ok(link) => {
                self.link = Some(link);
                self.reconnect.send_modify(|r| {
                    r.attempt = 0;
                    r.next_delay = None;
                    r.exhausted = false;
                });
                self.set_state(ConnectionState::Open);
                info!("connected");
            }
            Err(e) => {
                warn!("connect failed: {}", e);
                self.set_state(ConnectionState::Disconnected);
                self.schedule_reconnect();
            }
        }
        self.state()
    }

    /// Resets the attempt counter and connects without waiting out the backoff.
    pub async fn reconnect_now(&mut self) -> ConnectionState {
        if self.state() == ConnectionState::Open {
            debug!("reconnect requested while open; nothing to do");
            return ConnectionState::Open;
        }
        self.reconnect_at = None;
        self.reconnect.send_modify(|r| {
            r.attempt = 0;
            r.next_delay = None;
            r.exhausted = false;
        });
        self.connect().await
    }

    /// Transmits one text frame. A transport failure is handled like an
    /// unexpected close and reported to the caller as [`Delivery::Lost`].
    pub async fn send(&mut self, frame: String) -> Result<Delivery, NotConnected> {
        if self.state() != ConnectionState::Open {
            return Err(NotConnected);
        }
        let link = self.link.as_mut().ok_or(NotConnected)?;
        let sent = link.sink.send(frame).await;
        match sent {
            Ok(()) => Ok(Delivery::Sent),
            Err(e) => {
                warn!("send failed: {}", e);
                let reason = e.to_string();
                self.on_lost();
                Ok(Delivery::Lost { reason })
            }
        }
    }

    /// Manual close. Cancels any scheduled reconnect and never schedules one.
    pub async fn close(&mut self) {
        self.reconnect_at = None;
        self.reconnect.send_modify(|r| r.next_delay = None);
        if let Some(mut link) = self.link.take() {
            self.set_state(ConnectionState::Closing);
            if let Err(e) = link.sink.close().await {
                debug!("close handshake failed: {}", e);
            }
            info!("connection closed");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Waits for the next frame, link loss, or reconnect deadline.
    pub async fn next_event(&mut self) -> ConnectionEvent {
        let deadline = self.reconnect_at;
        tokio::select! {
            item = next_frame(&mut self.link) => match item {
                Some(Ok(text)) => ConnectionEvent::Frame(text),
                Some(Err(e)) => {
                    warn!("transport error: {}", e);
                    self.lost_event(e.to_string())
                }
                None => self.lost_event("closed by peer".to_string()),
            },
            _ = wait_until(deadline) => {
                self.reconnect_at = None;
                ConnectionEvent::ReconnectDue
            }
        }
    }

    fn lost_event(&mut self, reason: String) -> ConnectionEvent {
        self.on_lost();
        ConnectionEvent::Lost { reason }
    }

    fn on_lost(&mut self) {
        self.link = None;
        self.set_state(ConnectionState::Disconnected);
        self.reconnect
            .send_modify(|r| r.last_disconnect = Some(Utc::now()));
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        let attempt = self.reconnect.borrow().attempt;
        if self.policy.exhausted(attempt) {
            error!("giving up after {} reconnect attempts", attempt);
            self.reconnect_at = None;
            self.reconnect.send_modify(|r| {
                r.next_delay = None;
                r.exhausted = true;
            });
            return;
        }
        let delay = self.policy.delay(attempt);
        warn!(
            "reconnecting in {:?} (attempt {}/{})",
            delay,
            attempt + 1,
            self.policy.max_attempts
        );
        self.reconnect_at = Some(deadline_after(delay));
        self.reconnect.send_modify(|r| {
            r.attempt = attempt + 1;
            r.next_delay = Some(delay);
        });
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("connection {:?} -> {:?}", current, state);
            *current = state;
            true
        });
    }
}

/// `now + delay`, saturating at a deadline that never comes.
pub(crate) fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay)
        .unwrap_or_else(|| now + Duration::from_secs(FAR_FUTURE_SECS))
}

// Roughly thirty years, the same horizon tokio uses internally.
const FAR_FUTURE_SECS: u64 = 86400 * 365 * 30;

async fn next_frame(link: &mut Option<Link>) -> Option<Result<String, TransportError>> {
    match link {
        Some(link) => link.stream.next().await,
        None => pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
