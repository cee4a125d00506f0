//! WebSocket frame types and codec. Client ↔ server JSON.
//!
//! Outgoing: `stream_request` (one per user turn) and `performance_request`.
//! Incoming: `{ "id", "type", "content", "metadata", "timestamp" }` where `type`
//! is one of `status`, `metadata`, `token`, `complete`, `error`, `message`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque key/value map passed through from the peer (or to it).
pub type Metadata = Map<String, Value>;

/// Pacing hint sent when the caller does not override it.
pub const DEFAULT_STREAM_DELAY: f64 = 0.03;

/// Sub-type of a `message` frame that carries auxiliary metrics.
pub const PERFORMANCE_UPDATE: &str = "performance_update";

/// Per-request options supplied alongside a prompt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    pub context: Metadata,
    pub metadata: Metadata,
    pub stream_delay: Option<f64>,
}

impl RequestOptions {
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_stream_delay(mut self, delay: f64) -> Self {
        self.stream_delay = Some(delay);
        self
    }

    /// Layer `self` over `defaults`; keys in `self` win.
    pub fn merged_over(&self, defaults: &RequestOptions) -> RequestOptions {
        let mut context = defaults.context.clone();
        context.extend(self.context.clone());
        let mut metadata = defaults.metadata.clone();
        metadata.extend(self.metadata.clone());
        RequestOptions {
            context,
            metadata,
            stream_delay: self.stream_delay.or(defaults.stream_delay),
        }
    }

    fn has_attachments(&self) -> bool {
        self.context
            .get("attachments")
            .and_then(Value::as_array)
            .is_some_and(|a| !a.is_empty())
    }
}

/// Client → server: one user turn.
#[derive(Debug, Clone, Serialize)]
pub struct StreamRequest<'a> {
    #[serde(rename = "type")]
    pub typ: &'static str,
    pub prompt: &'a str,
    pub context: &'a Metadata,
    pub stream_delay: f64,
    pub metadata: &'a Metadata,
}

impl<'a> StreamRequest<'a> {
    /// Refuses a blank prompt unless `context.attachments` is a non-empty array.
    pub fn new(prompt: &'a str, options: &'a RequestOptions) -> Result<Self, EncodeError> {
        if prompt.trim().is_empty() && !options.has_attachments() {
            return Err(EncodeError::EmptyPrompt);
        }
        Ok(Self {
            typ: "stream_request",
            prompt,
            context: &options.context,
            stream_delay: options.stream_delay.unwrap_or(DEFAULT_STREAM_DELAY),
            metadata: &options.metadata,
        })
    }

    pub fn to_json(&self) -> Result<String, EncodeError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Client → server: ask for a metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceRequest {
    #[serde(rename = "type")]
    pub typ: &'static str,
}

impl Default for PerformanceRequest {
    fn default() -> Self {
        Self {
            typ: "performance_request",
        }
    }
}

impl PerformanceRequest {
    pub fn to_json(&self) -> Result<String, EncodeError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Outgoing frame could not be produced.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("prompt is empty")]
    EmptyPrompt,
    #[error("serialize failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Incoming frame was rejected. The frame is dropped; the channel stays open.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown frame type: {0}")]
    UnknownType(String),
    #[error("{0} frame has no content")]
    MissingContent(&'static str),
}

/// Server → client wire shape. Every field but `type` is optional.
#[derive(Debug, Clone, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    typ: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    metadata: Option<Metadata>,
    #[serde(default)]
    connection_id: Option<String>,
}

/// One server frame; discriminator is the JSON "type" field.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Channel-level notice such as "connected".
    Status {
        text: String,
        connection_id: Option<String>,
    },
    /// Opens a new streaming response.
    Metadata {
        id: Option<String>,
        metadata: Metadata,
    },
    Token(String),
    /// Closes the current response; `metadata` is merged over the opening map.
    Complete { metadata: Metadata },
    /// Aborts the current response with a human-readable message.
    Error(String),
    /// Out-of-band notice, tagged by `payload.type`.
    Message { kind: Option<String>, payload: Value },
}

impl ServerEvent {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawFrame = serde_json::from_str(text)?;
        Self::from_raw(raw)
    }

    pub fn from_json(value: &Value) -> Result<Self, ProtocolError> {
        let raw: RawFrame = serde_json::from_value(value.clone())?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawFrame) -> Result<Self, ProtocolError> {
        match raw.typ.as_str() {
            "status" => {
                let connection_id = raw.connection_id.or_else(|| {
                    raw.metadata
                        .as_ref()
                        .and_then(|m| m.get("connection_id"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                });
                Ok(ServerEvent::Status {
                    text: raw.content.or(raw.message).unwrap_or_default(),
                    connection_id,
                })
            }
            "metadata" => Ok(ServerEvent::Metadata {
                id: raw.id.filter(|id| !id.is_empty()),
                metadata: raw.metadata.unwrap_or_default(),
            }),
            "token" => raw
                .content
                .map(ServerEvent::Token)
                .ok_or(ProtocolError::MissingContent("token")),
            "complete" => Ok(ServerEvent::Complete {
                metadata: raw.metadata.unwrap_or_default(),
            }),
            "error" => Ok(ServerEvent::Error(
                raw.content
                    .or(raw.message)
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or_else(|| "Unknown error".to_string()),
            )),
            "message" => {
                let payload = match raw.metadata {
                    Some(map) => Value::Object(map),
                    None => raw
                        .content
                        .as_deref()
                        .and_then(|c| serde_json::from_str::<Value>(c).ok())
                        .filter(Value::is_object)
                        .unwrap_or_else(|| Value::Object(Metadata::new())),
                };
                let kind = payload
                    .get("type")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Ok(ServerEvent::Message { kind, payload })
            }
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Status { .. } => "status",
            ServerEvent::Metadata { .. } => "metadata",
            ServerEvent::Token(_) => "token",
            ServerEvent::Complete { .. } => "complete",
            ServerEvent::Error(_) => "error",
            ServerEvent::Message { .. } => "message",
        }
    }
}
