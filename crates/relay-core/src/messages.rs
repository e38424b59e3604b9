use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{MessageId, ToolActivityId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One entry of the conversation transcript.
///
/// While `is_streaming` is set, `content` and `thinking` only ever grow by
/// appending; nothing is removed or reordered.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub is_streaming: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_activity: Vec<ToolActivity>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            role: Role::User,
            content: content.into(),
            is_streaming: false,
            thinking: None,
            tool_activity: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Empty assistant message that is about to receive streamed content.
    pub fn assistant_streaming() -> Self {
        Self {
            id: MessageId::new(),
            role: Role::Assistant,
            content: String::new(),
            is_streaming: true,
            thinking: None,
            tool_activity: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn append_content(&mut self, delta: &str) {
        self.content.push_str(delta);
    }

    pub fn append_thinking(&mut self, delta: &str) {
        self.thinking.get_or_insert_with(String::new).push_str(delta);
    }
}

/// A tool invocation the assistant reported while answering.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolActivity {
    pub id: ToolActivityId,
    pub tool: String,
    pub input: Value,
    pub timestamp: DateTime<Utc>,
}

/// Output of a tool the server ran, kept beside the message for inspection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<ToolActivityId>,
    pub tool: String,
    pub result: Value,
    pub received_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_message_starts_empty() {
        let msg = ChatMessage::assistant_streaming();
        assert_eq!(msg.role, Role::Assistant);
        assert!(msg.is_streaming);
        assert!(msg.content.is_empty());
        assert!(msg.thinking.is_none());
    }

    #[test]
    fn thinking_is_separate_from_content() {
        let mut msg = ChatMessage::assistant_streaming();
        msg.append_thinking("Let me ");
        msg.append_thinking("check.");
        msg.append_content("Done.");
        assert_eq!(msg.thinking.as_deref(), Some("Let me check."));
        assert_eq!(msg.content, "Done.");
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
        assert_eq!(
            serde_json::to_string(&Role::Assistant).unwrap(),
            "\"assistant\""
        );
    }
}
