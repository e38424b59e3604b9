use std::fmt;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde_json::Value;

use crate::actions::ProposedAction;
use crate::errors::TransportError;
use crate::ids::{ConversationId, ToolActivityId};

/// Dispatched events for one turn, in arrival order. A transport read failure
/// is yielded once as `Err`, after which the stream ends.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<ChatEvent, TransportError>> + Send>>;

/// Event kinds named by the `event:` line. Kinds this client does not know
/// are carried as `Unknown` with the raw name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Text,
    TextDelta,
    Thinking,
    ToolCall,
    ToolResult,
    ActionPreview,
    Done,
    Error,
    Unknown(String),
}

impl EventKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "text" => Self::Text,
            "text_delta" => Self::TextDelta,
            "thinking" => Self::Thinking,
            "tool_call" => Self::ToolCall,
            "tool_result" => Self::ToolResult,
            "action_preview" => Self::ActionPreview,
            "done" => Self::Done,
            "error" => Self::Error,
            other => Self::Unknown(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Text => "text",
            Self::TextDelta => "text_delta",
            Self::Thinking => "thinking",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::ActionPreview => "action_preview",
            Self::Done => "done",
            Self::Error => "error",
            Self::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified stream event.
///
/// `Done` and `Error` end the turn. `Error` is an ordinary event, not a
/// failure of the stream: content received before it stays valid.
#[derive(Clone, Debug, PartialEq)]
pub enum ChatEvent {
    Text {
        content: String,
    },
    TextDelta {
        content: String,
    },
    Thinking {
        content: String,
    },
    ToolCall {
        id: Option<ToolActivityId>,
        tool: String,
        input: Value,
        /// When the server started the call, if it said.
        timestamp: Option<DateTime<Utc>>,
    },
    ToolResult {
        id: Option<ToolActivityId>,
        tool: String,
        result: Value,
    },
    ActionPreview(Box<ProposedAction>),
    Done {
        conversation_id: Option<ConversationId>,
    },
    Error {
        message: String,
        code: Option<String>,
    },
    Unknown {
        kind: String,
        payload: Value,
    },
}

impl ChatEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Text { .. } => EventKind::Text,
            Self::TextDelta { .. } => EventKind::TextDelta,
            Self::Thinking { .. } => EventKind::Thinking,
            Self::ToolCall { .. } => EventKind::ToolCall,
            Self::ToolResult { .. } => EventKind::ToolResult,
            Self::ActionPreview(_) => EventKind::ActionPreview,
            Self::Done { .. } => EventKind::Done,
            Self::Error { .. } => EventKind::Error,
            Self::Unknown { kind, .. } => EventKind::Unknown(kind.clone()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    /// Text that belongs in the visible message body, if any.
    pub fn content_delta(&self) -> Option<&str> {
        match self {
            Self::Text { content } | Self::TextDelta { content } => Some(content),
            _ => None,
        }
    }
}
