//! Wire message types: one-line JSON, `\n`-terminated.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Closed set of message types exchanged on the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    TaskAssignment,
    TaskCompleted,
    TaskFailed,
    ReviewRequest,
    ReviewApproved,
    ReviewRejected,
    Escalation,
    Heartbeat,
}

/// A single message on the channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub from: String,
    pub to: String,
    pub payload: Value,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correlation_id: Option<String>,
}

impl Message {
    pub fn new(message_type: MessageType, from: impl Into<String>, to: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type,
            from: from.into(),
            to: to.into(),
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Serialize as a single `\n`-terminated JSON line.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut s = serde_json::to_string(self)?;
        s.push('\n');
        Ok(s)
    }

    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim())
    }
}
