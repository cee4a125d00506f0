//! In-memory transport for session tests. The "server" side gets a [`Peer`] per
//! successful open; dropping the peer looks like the remote end going away.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chat_stream_client::{Connector, Link, TransportError};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<Peer>,
    refusals: Arc<AtomicU32>,
    opens: Arc<Mutex<Vec<Instant>>>,
}

pub struct MemoryServer {
    peers: mpsc::UnboundedReceiver<Peer>,
    refusals: Arc<AtomicU32>,
    opens: Arc<Mutex<Vec<Instant>>>,
}

pub fn memory_transport() -> (MemoryConnector, MemoryServer) {
    let (tx, rx) = mpsc::unbounded_channel();
    let refusals = Arc::new(AtomicU32::new(0));
    let opens = Arc::new(Mutex::new(Vec::new()));
    (
        MemoryConnector {
            peers: tx,
            refusals: refusals.clone(),
            opens: opens.clone(),
        },
        MemoryServer {
            peers: rx,
            refusals,
            opens,
        },
    )
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self) -> Result<Link, TransportError> {
        self.opens.lock().unwrap().push(Instant::now());
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Connect("refused".into()));
        }

        let (to_server, from_client) = mpsc::unbounded_channel::<String>();
        let (to_client, from_server) = mpsc::unbounded_channel::<Result<String, TransportError>>();

        let sink = futures_util::sink::unfold(to_server, |tx, text: String| async move {
            tx.send(text).map_err(|_| TransportError::Closed)?;
            Ok::<_, TransportError>(tx)
        });
        let stream = futures_util::stream::unfold(from_server, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        self.peers
            .send(Peer {
                to_client,
                from_client,
            })
            .map_err(|_| TransportError::Connect("server gone".into()))?;
        Ok(Link::new(Box::pin(sink), Box::pin(stream)))
    }
}

impl MemoryServer {
    pub async fn accept(&mut self) -> Peer {
        self.peers.recv().await.expect("connector dropped")
    }

    /// Fail the next `n` opens.
    pub fn refuse_next(&self, n: u32) {
        self.refusals.store(n, Ordering::SeqCst);
    }

    /// Time of every `open()` call, successful or not.
    pub fn open_attempts(&self) -> Vec<Instant> {
        self.opens.lock().unwrap().clone()
    }
}

pub struct Peer {
    to_client: mpsc::UnboundedSender<Result<String, TransportError>>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl Peer {
    pub fn send(&self, frame: Value) {
        self.send_raw(&frame.to_string());
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.to_client.send(Ok(text.to_string()));
    }

    /// Surface a transport error on the client's read side.
    pub fn fail(&self) {
        let _ = self.to_client.send(Err(TransportError::Closed));
    }

    /// Stop accepting client frames while the read side stays live, so the
    /// client's next write fails.
    pub fn stop_reading(&mut self) {
        self.from_client.close();
    }

    pub async fn recv(&mut self) -> Option<Value> {
        let text = self.from_client.recv().await?;
        Some(serde_json::from_str(&text).expect("client sent JSON"))
    }

    /// Next frame of type `typ`, skipping others (e.g. metrics polls).
    pub async fn recv_of_type(&mut self, typ: &str) -> Value {
        loop {
            let frame = self.recv().await.expect("client link closed");
            if frame["type"] == typ {
                return frame;
            }
        }
    }

    /// Frames already sent by the client, without waiting.
    pub fn drain(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(text) = self.from_client.try_recv() {
            frames.push(serde_json::from_str(&text).expect("client sent JSON"));
        }
        frames
    }
}
