//! Incremental response assembly.
//!
//! Idle --metadata--> Accumulating --token--> Accumulating
//! Accumulating --complete|error--> Idle (finalized message emitted)
//!
//! At most one [`PendingAssembly`] exists. A `metadata` frame that arrives while a
//! response is still open force-finalizes the stale one first.

use chrono::{DateTime, Utc};
use log::{debug, warn};

use crate::conversation::{ConversationMessage, Role};
use crate::messages::{Metadata, ServerEvent};

/// Accumulator for the response currently streaming.
#[derive(Debug, Clone)]
pub struct PendingAssembly {
    id: String,
    content: String,
    fragments: Vec<String>,
    metadata: Metadata,
    created_at: DateTime<Utc>,
}

impl PendingAssembly {
    fn open(id: Option<String>, metadata: Metadata) -> Self {
        Self {
            id: id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            content: String::new(),
            fragments: Vec::new(),
            metadata,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Raw fragments in arrival order.
    pub fn fragments(&self) -> &[String] {
        &self.fragments
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn finalize(self, content: String, metadata: Metadata) -> ConversationMessage {
        ConversationMessage {
            id: self.id,
            role: Role::Assistant,
            content,
            created_at: self.created_at,
            streaming: false,
            metadata,
        }
    }
}

/// What a frame did to the assembler.
#[derive(Debug, Clone, PartialEq)]
pub enum AssemblyOutcome {
    /// A response opened. `superseded` is a stale response that was still open.
    Opened {
        superseded: Option<ConversationMessage>,
    },
    /// Running text of the open response after appending a fragment.
    Streaming(String),
    /// The open response ended (`complete` or `error`).
    Finalized(ConversationMessage),
    /// An `error` frame arrived with no response open.
    Unattached(String),
    /// Frame had no effect on assembly state.
    Ignored,
}

#[derive(Debug, Default)]
pub struct StreamAssembler {
    pending: Option<PendingAssembly>,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_accumulating(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending(&self) -> Option<&PendingAssembly> {
        self.pending.as_ref()
    }

    /// Live text of the open response, empty when idle.
    pub fn streaming_text(&self) -> &str {
        self.pending.as_ref().map_or("", |p| p.content.as_str())
    }

    pub fn handle(&mut self, event: ServerEvent) -> AssemblyOutcome {
        match event {
            ServerEvent::Metadata { id, metadata } => {
                let superseded = self.pending.take().map(|stale| {
                    warn!(
                        "response {} still open when a new one started; finalizing it",
                        stale.id
                    );
                    let content = stale.content.clone();
                    let metadata = stale.metadata.clone();
                    stale.finalize(content, metadata)
                });
                let pending = PendingAssembly::open(id, metadata);
                debug!("response {} opened", pending.id);
                self.pending = Some(pending);
                AssemblyOutcome::Opened { superseded }
            }
            ServerEvent::Token(fragment) => match self.pending.as_mut() {
                Some(pending) => {
                    pending.content.push_str(&fragment);
                    pending.fragments.push(fragment);
                    AssemblyOutcome::Streaming(pending.content.clone())
                }
                None => {
                    warn!("token frame with no open response dropped");
                    AssemblyOutcome::Ignored
                }
            },
            ServerEvent::Complete { metadata } => match self.pending.take() {
                Some(pending) => {
                    let mut merged = pending.metadata.clone();
                    merged.extend(metadata);
                    let content = pending.content.clone();
                    debug!(
                        "response {} complete ({} fragments)",
                        pending.id,
                        pending.fragments.len()
                    );
                    AssemblyOutcome::Finalized(pending.finalize(content, merged))
                }
                None => {
                    warn!("complete frame with no open response ignored");
                    AssemblyOutcome::Ignored
                }
            },
            ServerEvent::Error(message) => match self.pending.take() {
                Some(pending) => {
                    warn!("response {} failed: {}", pending.id, message);
                    let metadata = pending.metadata.clone();
                    AssemblyOutcome::Finalized(pending.finalize(message, metadata))
                }
                None => AssemblyOutcome::Unattached(message),
            },
            ServerEvent::Status { .. } | ServerEvent::Message { .. } => AssemblyOutcome::Ignored,
        }
    }

    /// Ends the open response with `reason` as its content (channel went away).
    pub fn abort(&mut self, reason: &str) -> Option<ConversationMessage> {
        self.pending.take().map(|pending| {
            let metadata = pending.metadata.clone();
            pending.finalize(reason.to_string(), metadata)
        })
    }

    /// Discards the open response without producing a message.
    pub fn reset(&mut self) {
        if let Some(pending) = self.pending.take() {
            debug!("discarding open response {}", pending.id);
        }
    }
}
