//! Session controller: the public entry point for a UI.
//!
//! All protocol state lives in one task. [`SessionController`] is a cloneable
//! handle that queues commands to it and exposes read-only watch projections:
//! connection state, reconnect status, the conversation log, the live streaming
//! text, and the latest metrics payload. Transient notices go out on a broadcast
//! channel. Dropping every handle stops the task and closes the channel.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Interval, MissedTickBehavior};

use crate::assembler::{AssemblyOutcome, StreamAssembler};
use crate::backoff::BackoffPolicy;
use crate::connection::{
    deadline_after, ConnectionEvent, ConnectionManager, ConnectionState, Connector, Delivery,
    NotConnected, ReconnectState,
};
use crate::conversation::ConversationMessage;
use crate::messages::{
    EncodeError, PerformanceRequest, RequestOptions, ServerEvent, StreamRequest,
    PERFORMANCE_UPDATE,
};

/// Content given to an in-flight response when the channel drops.
pub const CONNECTION_LOST: &str = "Connection lost";
/// Content given to an in-flight response on a manual close.
pub const CONNECTION_CLOSED: &str = "Connection closed";

const COMMAND_QUEUE: usize = 64;
const NOTICE_QUEUE: usize = 64;
/// Longer poll intervals are clamped to this.
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(86400 * 365);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub backoff: BackoffPolicy,
    /// Interval between `performance_request` frames while open. Zero disables polling.
    pub poll_interval: Duration,
    /// Merged under the options of every prompt.
    pub defaults: RequestOptions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            poll_interval: Duration::from_secs(30),
            defaults: RequestOptions::default(),
        }
    }
}

/// Transient, user-facing notice.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Connected,
    Status {
        text: String,
        connection_id: Option<String>,
    },
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    /// Reconnect attempts exhausted; only `reconnect_now` recovers.
    ConnectionLost,
    NotConnected,
    EmptyPrompt,
    StreamError(String),
    ServerMessage {
        kind: Option<String>,
        payload: Value,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("prompt is empty")]
    EmptyPrompt,
    #[error(transparent)]
    NotConnected(#[from] NotConnected),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("session task has stopped")]
    Stopped,
}

enum Command {
    Connect(oneshot::Sender<ConnectionState>),
    SendPrompt {
        text: String,
        options: RequestOptions,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    ClearHistory(oneshot::Sender<()>),
    ReconnectNow(oneshot::Sender<ConnectionState>),
    Close(oneshot::Sender<()>),
}

/// Handle to one conversation session.
#[derive(Clone)]
pub struct SessionController {
    commands: mpsc::Sender<Command>,
    connection_state: watch::Receiver<ConnectionState>,
    reconnect: watch::Receiver<ReconnectState>,
    conversation: watch::Receiver<Vec<ConversationMessage>>,
    streaming_text: watch::Receiver<String>,
    metrics: watch::Receiver<Option<Value>>,
    notices: broadcast::Sender<Notice>,
}

impl SessionController {
    /// Starts the session task on the current tokio runtime. Does not connect.
    pub fn spawn(config: SessionConfig, connector: impl Connector + 'static) -> Self {
        let connection = ConnectionManager::new(Arc::new(connector), config.backoff);
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (conversation, conversation_rx) = watch::channel(Vec::new());
        let (streaming_text, streaming_rx) = watch::channel(String::new());
        let (metrics, metrics_rx) = watch::channel(None);
        let (notices, _) = broadcast::channel(NOTICE_QUEUE);

        let handle = Self {
            commands,
            connection_state: connection.subscribe_state(),
            reconnect: connection.subscribe_reconnect(),
            conversation: conversation_rx,
            streaming_text: streaming_rx,
            metrics: metrics_rx,
            notices: notices.clone(),
        };

        let actor = SessionActor {
            connection,
            assembler: StreamAssembler::new(),
            log: Vec::new(),
            config,
            conversation,
            streaming_text,
            metrics,
            notices,
        };
        tokio::spawn(actor.run(command_rx));
        handle
    }

    /// Opens the channel; resolves with the state reached by this attempt.
    pub async fn connect(&self) -> Result<ConnectionState, SessionError> {
        self.request(Command::Connect).await
    }

    /// Echoes `text` into the log and transmits it. Blank text or a closed
    /// connection is rejected with a notice and nothing is sent.
    pub async fn send_prompt(
        &self,
        text: impl Into<String>,
        options: RequestOptions,
    ) -> Result<(), SessionError> {
        let text = text.into();
        self.request(|reply| Command::SendPrompt {
            text,
            options,
            reply,
        })
        .await?
    }

    /// Empties the log and drops any in-flight response. Connection is untouched.
    pub async fn clear_history(&self) -> Result<(), SessionError> {
        self.request(Command::ClearHistory).await
    }

    /// Resets backoff and connects immediately.
    pub async fn reconnect_now(&self) -> Result<ConnectionState, SessionError> {
        self.request(Command::ReconnectNow).await
    }

    /// Closes the channel and cancels pending reconnects. `connect` reopens it.
    pub async fn close(&self) -> Result<(), SessionError> {
        self.request(Command::Close).await
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection_state.clone()
    }

    pub fn reconnect_status(&self) -> watch::Receiver<ReconnectState> {
        self.reconnect.clone()
    }

    pub fn conversation(&self) -> watch::Receiver<Vec<ConversationMessage>> {
        self.conversation.clone()
    }

    pub fn streaming_text(&self) -> watch::Receiver<String> {
        self.streaming_text.clone()
    }

    pub fn metrics(&self) -> watch::Receiver<Option<Value>> {
        self.metrics.clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Snapshot of the conversation log.
    pub fn messages(&self) -> Vec<ConversationMessage> {
        self.conversation.borrow().clone()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| SessionError::Stopped)?;
        rx.await.map_err(|_| SessionError::Stopped)
    }
}

struct SessionActor {
    connection: ConnectionManager,
    assembler: StreamAssembler,
    log: Vec<ConversationMessage>,
    config: SessionConfig,
    conversation: watch::Sender<Vec<ConversationMessage>>,
    streaming_text: watch::Sender<String>,
    metrics: watch::Sender<Option<Value>>,
    notices: broadcast::Sender<Notice>,
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let polling = !self.config.poll_interval.is_zero();
        let period = self
            .config
            .poll_interval
            .clamp(Duration::from_millis(1), MAX_POLL_INTERVAL);
        let mut poll = tokio::time::interval_at(deadline_after(period), period);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let open = self.connection.state() == ConnectionState::Open;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command, &mut poll).await,
                    None => break,
                },
                event = self.connection.next_event() => {
                    self.handle_connection_event(event, &mut poll).await;
                }
                _ = poll.tick(), if polling && open => self.request_metrics().await,
            }
        }

        self.connection.close().await;
        debug!("session task stopped");
    }

    async fn handle_command(&mut self, command: Command, poll: &mut Interval) {
        match command {
            Command::Connect(reply) => {
                let state = self.connect(poll).await;
                let _ = reply.send(state);
            }
            Command::SendPrompt {
                text,
                options,
                reply,
            } => {
                let result = self.send_prompt(text, options).await;
                let _ = reply.send(result);
            }
            Command::ClearHistory(reply) => {
                self.assembler.reset();
                self.log.clear();
                self.publish_log();
                self.streaming_text.send_replace(String::new());
                let _ = reply.send(());
            }
            Command::ReconnectNow(reply) => {
                let was_open = self.connection.state() == ConnectionState::Open;
                let state = self.connection.reconnect_now().await;
                if !was_open {
                    self.after_connect(state, poll);
                }
                let _ = reply.send(state);
            }
            Command::Close(reply) => {
                self.connection.close().await;
                self.abort_response(CONNECTION_CLOSED);
                let _ = reply.send(());
            }
        }
    }

    async fn handle_connection_event(&mut self, event: ConnectionEvent, poll: &mut Interval) {
        match event {
            ConnectionEvent::Frame(text) => self.handle_frame(&text),
            ConnectionEvent::Lost { reason } => self.connection_lost(&reason),
            ConnectionEvent::ReconnectDue => {
                self.connect(poll).await;
            }
        }
    }

    fn connection_lost(&mut self, reason: &str) {
        info!("connection lost: {}", reason);
        self.abort_response(CONNECTION_LOST);
        self.notify_reconnect();
    }

    async fn connect(&mut self, poll: &mut Interval) -> ConnectionState {
        let was_open = self.connection.state() == ConnectionState::Open;
        let state = self.connection.connect().await;
        if !was_open {
            self.after_connect(state, poll);
        }
        state
    }

    fn after_connect(&mut self, state: ConnectionState, poll: &mut Interval) {
        if state == ConnectionState::Open {
            poll.reset();
            self.notify(Notice::Connected);
        } else {
            self.notify_reconnect();
        }
    }

    fn notify_reconnect(&self) {
        let status = self.connection.reconnect_state();
        if status.exhausted {
            self.notify(Notice::ConnectionLost);
        } else if let Some(delay) = status.next_delay {
            self.notify(Notice::Reconnecting {
                attempt: status.attempt,
                delay,
            });
        }
    }

    async fn send_prompt(&mut self, text: String, options: RequestOptions) -> Result<(), SessionError> {
        if text.trim().is_empty() {
            self.notify(Notice::EmptyPrompt);
            return Err(SessionError::EmptyPrompt);
        }
        if self.connection.state() != ConnectionState::Open {
            self.notify(Notice::NotConnected);
            return Err(NotConnected.into());
        }

        let options = options.merged_over(&self.config.defaults);
        let frame = StreamRequest::new(&text, &options)?.to_json()?;
        self.append(ConversationMessage::user(text));
        match self.connection.send(frame).await {
            Ok(Delivery::Sent) => Ok(()),
            // The echo stays; the loss is reported through the reconnect path.
            Ok(Delivery::Lost { reason }) => {
                self.connection_lost(&reason);
                Ok(())
            }
            Err(e) => {
                self.notify(Notice::NotConnected);
                Err(e.into())
            }
        }
    }

    async fn request_metrics(&mut self) {
        let frame = match PerformanceRequest::default().to_json() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("performance request not encoded: {}", e);
                return;
            }
        };
        match self.connection.send(frame).await {
            Ok(Delivery::Sent) => {}
            Ok(Delivery::Lost { reason }) => self.connection_lost(&reason),
            Err(_) => debug!("performance poll skipped: not connected"),
        }
    }

    fn handle_frame(&mut self, text: &str) {
        let event = match ServerEvent::parse(text) {
            Ok(event) => event,
            Err(e) => {
                warn!("dropping frame: {}", e);
                return;
            }
        };
        debug!("received {} frame", event.kind());

        match event {
            ServerEvent::Status {
                text,
                connection_id,
            } => {
                info!("server status: {}", text);
                self.notify(Notice::Status {
                    text,
                    connection_id,
                });
            }
            ServerEvent::Message { kind, payload } => {
                if kind.as_deref() == Some(PERFORMANCE_UPDATE) {
                    self.metrics.send_replace(Some(payload));
                } else {
                    self.notify(Notice::ServerMessage { kind, payload });
                }
            }
            event => {
                let stream_error = match &event {
                    ServerEvent::Error(message) => Some(message.clone()),
                    _ => None,
                };
                match self.assembler.handle(event) {
                    AssemblyOutcome::Opened { superseded } => {
                        if let Some(stale) = superseded {
                            self.append(stale);
                        }
                        self.streaming_text.send_replace(String::new());
                    }
                    AssemblyOutcome::Streaming(text) => {
                        self.streaming_text.send_replace(text);
                    }
                    AssemblyOutcome::Finalized(message) => {
                        self.append(message);
                        self.streaming_text.send_replace(String::new());
                    }
                    AssemblyOutcome::Unattached(message) => {
                        warn!("error frame outside a response: {}", message);
                        self.append(ConversationMessage::system(message));
                    }
                    AssemblyOutcome::Ignored => {}
                }
                if let Some(message) = stream_error {
                    self.notify(Notice::StreamError(message));
                }
            }
        }
    }

    fn abort_response(&mut self, reason: &str) {
        if let Some(message) = self.assembler.abort(reason) {
            self.append(message);
            self.streaming_text.send_replace(String::new());
        }
    }

    fn append(&mut self, message: ConversationMessage) {
        self.log.push(message);
        self.publish_log();
    }

    fn publish_log(&self) {
        self.conversation.send_replace(self.log.clone());
    }

    fn notify(&self, notice: Notice) {
        // No subscribers is fine.
        let _ = self.notices.send(notice);
    }
}
