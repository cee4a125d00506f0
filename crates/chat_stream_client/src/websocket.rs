//! WebSocket transport: opens a `ws://` / `wss://` connection and exposes it as a [`Link`].

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{future, SinkExt, StreamExt};
use log::debug;
use tokio_tungstenite::tungstenite::Message;

use crate::connection::{Connector, Link, TransportError};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connects to a WebSocket server at `url` (e.g. `ws://localhost:8765/ws`).
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self) -> Result<Link, TransportError> {
        debug!("opening {}", self.url);
        let (ws_stream, _) = tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(self.url.as_str()),
        )
        .await
        .map_err(|_| TransportError::Timeout(self.connect_timeout))??;
        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(TransportError::from)
            .with(|text: String| future::ready(Ok::<_, TransportError>(Message::Text(text))));

        // Text frames only; a Close frame ends the stream.
        let stream = read
            .take_while(|item| future::ready(!matches!(item, Ok(Message::Close(_)))))
            .filter_map(|item| {
                future::ready(match item {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(_) => None,
                    Err(e) => Some(Err(TransportError::from(e))),
                })
            });

        Ok(Link::new(Box::pin(sink), Box::pin(stream)))
    }
}
