//! Conversation log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::messages::Metadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One entry in the conversation log. Immutable once `streaming` is false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub streaming: bool,
    #[serde(default)]
    pub metadata: Metadata,
}

impl ConversationMessage {
    /// Local echo of a prompt the user just sent.
    pub fn user(content: impl Into<String>) -> Self {
        Self::finished(Role::User, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::finished(Role::System, content)
    }

    fn finished(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            created_at: Utc::now(),
            streaming: false,
            metadata: Metadata::new(),
        }
    }
}
