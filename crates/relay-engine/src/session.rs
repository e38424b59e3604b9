use chrono::Utc;
use tracing::debug;

use relay_core::errors::SessionError;
use relay_core::events::ChatEvent;
use relay_core::ids::{ConversationId, ToolActivityId};
use relay_core::messages::{ChatMessage, ToolActivity, ToolResultRecord};
use relay_core::request::{ChatRequest, HistoryMessage, PageContext};

const DEFAULT_HISTORY_LIMIT: usize = 20;

#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Settled messages sent back with each request as context.
    pub history_limit: usize,
    pub use_dynamic_queries: Option<bool>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            use_dynamic_queries: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnState {
    Streaming,
    Finalized,
    Errored,
}

impl TurnState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Streaming)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::Finalized => "finalized",
            Self::Errored => "errored",
        }
    }
}

/// What [`ConversationSession::apply`] did with an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    /// The turn's message or context changed.
    Accepted,
    /// Delivered to a streaming turn, but not something the transcript tracks
    /// (action previews, unknown kinds).
    Unhandled,
    /// No turn was streaming; the event arrived after the turn ended.
    Ignored,
}

#[derive(Debug)]
struct Turn {
    message_index: usize,
    state: TurnState,
    tool_results: Vec<ToolResultRecord>,
    error: Option<String>,
}

/// One conversation: transcript, continuation id, page context, and the
/// state of the most recent assistant turn.
///
/// Only one turn streams at a time. A turn's assistant message exists from
/// [`start_turn`](Self::start_turn) on and, once the turn is finalized or
/// errored, is never touched again.
#[derive(Debug)]
pub struct ConversationSession {
    options: SessionOptions,
    conversation_id: Option<ConversationId>,
    page_context: Option<PageContext>,
    messages: Vec<ChatMessage>,
    awaiting_response: bool,
    turn: Option<Turn>,
}

impl Default for ConversationSession {
    fn default() -> Self {
        Self::new(SessionOptions::default())
    }
}

impl ConversationSession {
    pub fn new(options: SessionOptions) -> Self {
        Self {
            options,
            conversation_id: None,
            page_context: None,
            messages: Vec::new(),
            awaiting_response: false,
            turn: None,
        }
    }

    /// Record the user's message and build the request for it. The text is
    /// sent exactly as given; whitespace only counts when deciding emptiness.
    pub fn submit(&mut self, text: &str) -> Result<ChatRequest, SessionError> {
        if text.trim().is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        if self.is_busy() {
            return Err(SessionError::TurnInProgress);
        }

        let history = self.history();
        self.messages.push(ChatMessage::user(text));
        self.awaiting_response = true;

        Ok(ChatRequest {
            message: text.to_owned(),
            conversation_id: self.conversation_id.clone(),
            messages: history,
            page_context: self.page_context.clone(),
            use_dynamic_queries: self.options.use_dynamic_queries,
        })
    }

    /// The request failed before streaming began. The user message stays in
    /// the transcript; no assistant message is created.
    pub fn abandon_submission(&mut self) -> bool {
        std::mem::replace(&mut self.awaiting_response, false)
    }

    /// Open the assistant message for a submitted request.
    pub fn start_turn(&mut self) -> Result<&ChatMessage, SessionError> {
        if !self.awaiting_response {
            return Err(if self.is_streaming() {
                SessionError::TurnInProgress
            } else {
                SessionError::NoActiveTurn
            });
        }
        self.awaiting_response = false;

        let message_index = self.messages.len();
        self.messages.push(ChatMessage::assistant_streaming());
        self.turn = Some(Turn {
            message_index,
            state: TurnState::Streaming,
            tool_results: Vec::new(),
            error: None,
        });
        Ok(&self.messages[message_index])
    }

    pub fn apply(&mut self, event: &ChatEvent) -> Applied {
        let Some(turn) = self
            .turn
            .as_mut()
            .filter(|turn| turn.state == TurnState::Streaming)
        else {
            debug!(kind = %event.kind(), "no streaming turn, event ignored");
            return Applied::Ignored;
        };
        let message = &mut self.messages[turn.message_index];

        match event {
            ChatEvent::Text { content } | ChatEvent::TextDelta { content } => {
                message.append_content(content);
            }
            ChatEvent::Thinking { content } => message.append_thinking(content),
            ChatEvent::ToolCall {
                id,
                tool,
                input,
                timestamp,
            } => {
                message.tool_activity.push(ToolActivity {
                    id: id.clone().unwrap_or_else(ToolActivityId::new),
                    tool: tool.clone(),
                    input: input.clone(),
                    timestamp: timestamp.unwrap_or_else(Utc::now),
                });
            }
            ChatEvent::ToolResult { id, tool, result } => {
                turn.tool_results.push(ToolResultRecord {
                    id: id.clone(),
                    tool: tool.clone(),
                    result: result.clone(),
                    received_at: Utc::now(),
                });
            }
            ChatEvent::Done { conversation_id } => {
                message.is_streaming = false;
                turn.state = TurnState::Finalized;
                if let Some(id) = conversation_id {
                    self.conversation_id = Some(id.clone());
                }
            }
            ChatEvent::Error { message: text, code } => {
                message.is_streaming = false;
                turn.state = TurnState::Errored;
                turn.error = Some(match code {
                    Some(code) => format!("{text} ({code})"),
                    None => text.clone(),
                });
            }
            ChatEvent::ActionPreview(_) | ChatEvent::Unknown { .. } => return Applied::Unhandled,
        }
        Applied::Accepted
    }

    /// Move a streaming turn to `errored` after a transport failure or
    /// cancellation. Partial content is kept. Returns false if no turn was
    /// streaming.
    pub fn fail_turn(&mut self, reason: impl Into<String>) -> bool {
        let Some(turn) = self
            .turn
            .as_mut()
            .filter(|turn| turn.state == TurnState::Streaming)
        else {
            return false;
        };
        self.messages[turn.message_index].is_streaming = false;
        turn.state = TurnState::Errored;
        turn.error = Some(reason.into());
        true
    }

    /// Forget the transcript and continuation id. Refused mid-turn.
    pub fn reset(&mut self) -> Result<(), SessionError> {
        if self.is_busy() {
            return Err(SessionError::TurnInProgress);
        }
        self.conversation_id = None;
        self.messages.clear();
        self.turn = None;
        Ok(())
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// The assistant message of the most recent turn.
    pub fn current_message(&self) -> Option<&ChatMessage> {
        self.turn.as_ref().map(|turn| &self.messages[turn.message_index])
    }

    pub fn turn_state(&self) -> Option<TurnState> {
        self.turn.as_ref().map(|turn| turn.state)
    }

    pub fn turn_error(&self) -> Option<&str> {
        self.turn.as_ref().and_then(|turn| turn.error.as_deref())
    }

    pub fn tool_results(&self) -> &[ToolResultRecord] {
        self.turn
            .as_ref()
            .map(|turn| turn.tool_results.as_slice())
            .unwrap_or_default()
    }

    pub fn is_streaming(&self) -> bool {
        self.turn_state() == Some(TurnState::Streaming)
    }

    /// Submitted and waiting for the stream, or streaming.
    pub fn is_busy(&self) -> bool {
        self.awaiting_response || self.is_streaming()
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.conversation_id.as_ref()
    }

    pub fn page_context(&self) -> Option<&PageContext> {
        self.page_context.as_ref()
    }

    pub fn set_page_context(&mut self, context: Option<PageContext>) {
        self.page_context = context;
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    fn history(&self) -> Vec<HistoryMessage> {
        let settled: Vec<&ChatMessage> = self
            .messages
            .iter()
            .filter(|m| !m.is_streaming && !m.content.is_empty())
            .collect();
        let skip = settled.len().saturating_sub(self.options.history_limit);
        settled[skip..]
            .iter()
            .map(|m| HistoryMessage {
                role: m.role,
                content: m.content.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::messages::Role;
    use serde_json::json;

    fn text(content: &str) -> ChatEvent {
        ChatEvent::Text {
            content: content.into(),
        }
    }

    fn done(id: Option<&str>) -> ChatEvent {
        ChatEvent::Done {
            conversation_id: id.map(ConversationId::from_raw),
        }
    }

    fn streaming_session() -> ConversationSession {
        let mut session = ConversationSession::default();
        session.submit("hello").unwrap();
        session.start_turn().unwrap();
        session
    }

    #[test]
    fn text_accumulates_and_done_finalizes() {
        let mut session = streaming_session();
        assert!(session.current_message().unwrap().is_streaming);

        assert_eq!(session.apply(&text("Hel")), Applied::Accepted);
        assert_eq!(
            session.apply(&ChatEvent::TextDelta {
                content: "lo".into()
            }),
            Applied::Accepted
        );
        assert_eq!(session.apply(&done(Some("c1"))), Applied::Accepted);

        let message = session.current_message().unwrap();
        assert_eq!(message.content, "Hello");
        assert!(!message.is_streaming);
        assert_eq!(session.turn_state(), Some(TurnState::Finalized));
        assert_eq!(session.conversation_id().unwrap().as_str(), "c1");
    }

    #[test]
    fn thinking_stays_out_of_content() {
        let mut session = streaming_session();
        session.apply(&ChatEvent::Thinking {
            content: "checking the board".into(),
        });
        session.apply(&text("Done."));

        let message = session.current_message().unwrap();
        assert_eq!(message.content, "Done.");
        assert_eq!(message.thinking.as_deref(), Some("checking the board"));
    }

    #[test]
    fn tool_call_gets_local_id_when_absent() {
        let mut session = streaming_session();
        session.apply(&ChatEvent::ToolCall {
            id: None,
            tool: "search_tasks".into(),
            input: json!({"query": "overdue"}),
            timestamp: None,
        });
        session.apply(&ChatEvent::ToolCall {
            id: Some(ToolActivityId::from_raw("tool_7")),
            tool: "get_project".into(),
            input: json!({}),
            timestamp: None,
        });

        let activity = &session.current_message().unwrap().tool_activity;
        assert_eq!(activity.len(), 2);
        assert!(activity[0].id.as_str().starts_with("tool_"));
        assert_eq!(activity[1].id.as_str(), "tool_7");
    }

    #[test]
    fn tool_call_keeps_server_timestamp() {
        let at: chrono::DateTime<Utc> = "2026-03-01T09:30:00Z".parse().unwrap();
        let mut session = streaming_session();
        let before = Utc::now();
        session.apply(&ChatEvent::ToolCall {
            id: Some(ToolActivityId::from_raw("tool_1")),
            tool: "search_tasks".into(),
            input: json!({}),
            timestamp: Some(at),
        });
        session.apply(&ChatEvent::ToolCall {
            id: None,
            tool: "get_project".into(),
            input: json!({}),
            timestamp: None,
        });

        let activity = &session.current_message().unwrap().tool_activity;
        assert_eq!(activity[0].timestamp, at);
        assert!(activity[1].timestamp >= before);
    }

    #[test]
    fn tool_result_is_context_not_content() {
        let mut session = streaming_session();
        session.apply(&ChatEvent::ToolResult {
            id: None,
            tool: "search_tasks".into(),
            result: json!({"count": 2}),
        });
        assert!(session.current_message().unwrap().content.is_empty());
        assert_eq!(session.tool_results().len(), 1);
        assert_eq!(session.tool_results()[0].result["count"], 2);
    }

    #[test]
    fn error_event_keeps_partial_content() {
        let mut session = streaming_session();
        session.apply(&text("Partial answer"));
        session.apply(&ChatEvent::Error {
            message: "model overloaded".into(),
            code: Some("529".into()),
        });

        let message = session.current_message().unwrap();
        assert_eq!(message.content, "Partial answer");
        assert!(!message.is_streaming);
        assert_eq!(session.turn_state(), Some(TurnState::Errored));
        assert_eq!(session.turn_error(), Some("model overloaded (529)"));
    }

    #[test]
    fn events_after_terminal_are_ignored() {
        let mut session = streaming_session();
        session.apply(&text("final"));
        session.apply(&done(None));

        assert_eq!(session.apply(&text(" late")), Applied::Ignored);
        assert_eq!(
            session.apply(&ChatEvent::Error {
                message: "late".into(),
                code: None
            }),
            Applied::Ignored
        );
        assert_eq!(session.current_message().unwrap().content, "final");
        assert_eq!(session.turn_state(), Some(TurnState::Finalized));
    }

    #[test]
    fn action_preview_is_unhandled_by_transcript() {
        let mut session = streaming_session();
        let event = ChatEvent::Unknown {
            kind: "citation".into(),
            payload: json!({}),
        };
        assert_eq!(session.apply(&event), Applied::Unhandled);
        assert!(session.is_streaming());
    }

    #[test]
    fn submit_while_busy_is_refused() {
        let mut session = ConversationSession::default();
        session.submit("first").unwrap();
        assert_eq!(session.submit("second"), Err(SessionError::TurnInProgress));

        session.start_turn().unwrap();
        assert_eq!(session.submit("second"), Err(SessionError::TurnInProgress));
        assert_eq!(session.start_turn().unwrap_err(), SessionError::TurnInProgress);

        session.apply(&done(None));
        assert!(session.submit("second").is_ok());
    }

    #[test]
    fn empty_message_is_refused() {
        let mut session = ConversationSession::default();
        assert_eq!(session.submit("   \n"), Err(SessionError::EmptyMessage));
        assert!(session.messages().is_empty());
    }

    #[test]
    fn message_text_is_sent_verbatim() {
        let mut session = ConversationSession::default();
        let pasted = "    fn main() {}\n";
        let request = session.submit(pasted).unwrap();
        assert_eq!(request.message, pasted);
        assert_eq!(session.messages()[0].content, pasted);
    }

    #[test]
    fn start_turn_requires_submission() {
        let mut session = ConversationSession::default();
        assert_eq!(session.start_turn().unwrap_err(), SessionError::NoActiveTurn);
    }

    #[test]
    fn abandoned_submission_creates_no_assistant_message() {
        let mut session = ConversationSession::default();
        session.submit("hello").unwrap();
        assert!(session.abandon_submission());

        assert_eq!(session.messages().len(), 1);
        assert_eq!(session.messages()[0].role, Role::User);
        assert!(session.current_message().is_none());
        assert!(!session.is_busy());
        assert!(!session.abandon_submission());
    }

    #[test]
    fn fail_turn_only_affects_streaming_turn() {
        let mut session = streaming_session();
        session.apply(&text("so far"));
        assert!(session.fail_turn("cancelled"));
        assert!(!session.fail_turn("again"));

        assert_eq!(session.turn_state(), Some(TurnState::Errored));
        assert_eq!(session.turn_error(), Some("cancelled"));
        assert_eq!(session.current_message().unwrap().content, "so far");
    }

    #[test]
    fn next_request_carries_continuation_and_history() {
        let mut session = ConversationSession::new(SessionOptions {
            history_limit: 20,
            use_dynamic_queries: Some(true),
        });
        session.set_page_context(Some(PageContext::new("project")));
        session.submit("hello").unwrap();
        session.start_turn().unwrap();
        session.apply(&text("Hi there"));
        session.apply(&done(Some("c1")));

        let request = session.submit("what's overdue?").unwrap();
        assert_eq!(request.message, "what's overdue?");
        assert_eq!(request.conversation_id.unwrap().as_str(), "c1");
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[0].role, Role::User);
        assert_eq!(request.messages[1].content, "Hi there");
        assert_eq!(request.page_context.unwrap().page_type, "project");
        assert_eq!(request.use_dynamic_queries, Some(true));
    }

    #[test]
    fn history_is_bounded_to_most_recent() {
        let mut session = ConversationSession::new(SessionOptions {
            history_limit: 2,
            use_dynamic_queries: None,
        });
        for n in 0..3 {
            session.submit(&format!("q{n}")).unwrap();
            session.start_turn().unwrap();
            session.apply(&text(&format!("a{n}")));
            session.apply(&done(None));
        }

        let request = session.submit("q3").unwrap();
        let contents: Vec<&str> = request.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["q2", "a2"]);
    }

    #[test]
    fn reset_clears_conversation() {
        let mut session = streaming_session();
        assert_eq!(session.reset(), Err(SessionError::TurnInProgress));
        session.apply(&done(Some("c1")));
        session.reset().unwrap();
        assert!(session.messages().is_empty());
        assert!(session.conversation_id().is_none());
        assert!(session.turn_state().is_none());
    }
}
