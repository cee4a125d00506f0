//! Streaming chat session client (config, WebSocket protocol, response assembly,
//! reconnection). Used by the `chat-stream` terminal binary and embeddable in a UI.

pub mod assembler;
pub mod backoff;
pub mod config;
pub mod connection;
pub mod conversation;
pub mod messages;
pub mod session;
pub mod websocket;

pub use assembler::{AssemblyOutcome, PendingAssembly, StreamAssembler};
pub use backoff::BackoffPolicy;
pub use config::{default_config_path, Config, ConfigError};
pub use connection::{
    ConnectionEvent, ConnectionManager, ConnectionState, Connector, Delivery, Link,
    NotConnected, ReconnectState, TransportError,
};
pub use conversation::{ConversationMessage, Role};
pub use messages::{Metadata, ProtocolError, RequestOptions, ServerEvent};
pub use session::{Notice, SessionConfig, SessionController, SessionError};
pub use websocket::WebSocketConnector;
