use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use relay_core::actions::ProposedAction;
use relay_core::events::{ChatEvent, EventKind};
use relay_core::ids::{ConversationId, ToolActivityId};

use crate::decoder::Frame;

/// Classify a decoded frame.
///
/// Unrecognized kinds are forwarded as [`ChatEvent::Unknown`]. A recognized
/// kind whose payload does not have the expected shape is forwarded the same
/// way, with a warning, rather than being dropped. `done` and `error` are the
/// exception: they always come out as themselves so the turn can end.
pub fn dispatch(frame: Frame) -> ChatEvent {
    let Frame { kind, payload } = frame;
    match EventKind::parse(&kind) {
        EventKind::Text => ChatEvent::Text {
            content: content_of(&payload),
        },
        EventKind::TextDelta => ChatEvent::TextDelta {
            content: content_of(&payload),
        },
        EventKind::Thinking => ChatEvent::Thinking {
            content: content_of(&payload),
        },
        EventKind::ToolCall => match parse::<ToolCallPayload>(&kind, &payload) {
            Some(call) => ChatEvent::ToolCall {
                id: call.id,
                tool: call.tool,
                input: call.input,
                timestamp: call.timestamp,
            },
            None => unknown(kind, payload),
        },
        EventKind::ToolResult => match parse::<ToolResultPayload>(&kind, &payload) {
            Some(result) => ChatEvent::ToolResult {
                id: result.id,
                tool: result.tool,
                result: result.result,
            },
            None => unknown(kind, payload),
        },
        EventKind::ActionPreview => match parse::<ProposedAction>(&kind, &payload) {
            Some(action) => ChatEvent::ActionPreview(Box::new(action)),
            None => unknown(kind, payload),
        },
        EventKind::Done => done_event(&payload),
        EventKind::Error => error_event(&payload),
        EventKind::Unknown(_) => unknown(kind, payload),
    }
}

fn unknown(kind: String, payload: Value) -> ChatEvent {
    ChatEvent::Unknown { kind, payload }
}

fn parse<T: DeserializeOwned>(kind: &str, payload: &Value) -> Option<T> {
    match T::deserialize(payload) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(kind, error = %e, "payload does not match its event kind, forwarding as unknown");
            None
        }
    }
}

/// `{"content": "..."}`, or a bare JSON string.
fn content_of(payload: &Value) -> String {
    match payload {
        Value::String(s) => s.clone(),
        other => other
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
    }
}

/// `done` always ends the turn; a conversation id that is missing or not a
/// string is dropped.
fn done_event(payload: &Value) -> ChatEvent {
    let conversation_id = payload
        .get("conversation_id")
        .or_else(|| payload.get("conversationId"))
        .and_then(Value::as_str)
        .map(ConversationId::from_raw);
    if conversation_id.is_none() && !payload.is_object() {
        debug!(%payload, "done payload is not an object");
    }
    ChatEvent::Done { conversation_id }
}

fn error_event(payload: &Value) -> ChatEvent {
    let message = payload
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| payload.get("error").and_then(Value::as_str))
        .or_else(|| {
            payload
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
        })
        .or_else(|| payload.as_str())
        .unwrap_or("unknown error")
        .to_owned();
    let code = payload.get("code").and_then(|code| match code {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    });
    ChatEvent::Error { message, code }
}

#[derive(Deserialize)]
struct ToolCallPayload {
    #[serde(default)]
    id: Option<ToolActivityId>,
    #[serde(default, alias = "name", alias = "tool_name")]
    tool: String,
    #[serde(default, alias = "args", alias = "arguments")]
    input: Value,
    #[serde(default, alias = "created_at", alias = "createdAt")]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct ToolResultPayload {
    #[serde(default)]
    id: Option<ToolActivityId>,
    #[serde(default, alias = "name", alias = "tool_name")]
    tool: String,
    #[serde(default, alias = "output")]
    result: Value,
}
