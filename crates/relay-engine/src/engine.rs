use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use relay_core::errors::{SessionError, TransportError};
use relay_core::events::ChatEvent;
use relay_core::ids::{ActionId, ConversationId};
use relay_core::messages::ChatMessage;
use relay_core::request::PageContext;
use relay_core::transport::ChatTransport;

use crate::error::TurnError;
use crate::registry::ActionRegistry;
use crate::session::{Applied, ConversationSession, SessionOptions, TurnState};

/// Outcome of a turn that reached `done` or an in-stream `error` event.
#[derive(Clone, Debug)]
pub struct TurnReport {
    pub state: TurnState,
    pub message: ChatMessage,
    pub error: Option<String>,
    pub conversation_id: Option<ConversationId>,
    /// Actions previewed during this turn, in arrival order.
    pub proposed: Vec<ActionId>,
    pub events: usize,
}

/// Drives turns: submits through the session, opens the transport, and feeds
/// every event to the session and action previews to the registry.
pub struct ChatEngine {
    transport: Arc<dyn ChatTransport>,
    actions: Arc<ActionRegistry>,
    session: ConversationSession,
}

impl ChatEngine {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        actions: Arc<ActionRegistry>,
        options: SessionOptions,
    ) -> Self {
        Self {
            transport,
            actions,
            session: ConversationSession::new(options),
        }
    }

    pub fn session(&self) -> &ConversationSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut ConversationSession {
        &mut self.session
    }

    pub fn actions(&self) -> &Arc<ActionRegistry> {
        &self.actions
    }

    pub fn set_page_context(&mut self, context: Option<PageContext>) {
        self.session.set_page_context(context);
    }

    /// Run one turn to completion.
    ///
    /// `on_event` sees each event together with the assistant message after
    /// the event was applied. A transport failure or cancellation leaves the
    /// turn `errored` with its partial content and is returned as `Err`; an
    /// in-stream `error` event is a normal completion with `state: Errored`.
    /// The stream is dropped as soon as `done` or `error` arrives; anything
    /// the server sends after that is never read.
    #[instrument(skip_all, fields(conversation_id = tracing::field::Empty))]
    pub async fn send<F>(
        &mut self,
        text: &str,
        cancel: &CancellationToken,
        mut on_event: F,
    ) -> Result<TurnReport, TurnError>
    where
        F: FnMut(&ChatEvent, &ChatMessage),
    {
        let request = self.session.submit(text)?;
        if let Some(id) = &request.conversation_id {
            tracing::Span::current().record("conversation_id", id.as_str());
        }

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            result = self.transport.open_stream(&request) => result,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                self.session.abandon_submission();
                warn!(error = %e, kind = e.error_kind(), "chat request failed before streaming");
                return Err(e.into());
            }
        };

        self.session.start_turn()?;
        let mut proposed = Vec::new();
        let mut events = 0usize;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.session.fail_turn("cancelled");
                    info!(events, "turn cancelled");
                    return Err(TransportError::Cancelled.into());
                }
                next = stream.next() => next,
            };

            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    self.session.fail_turn(e.to_string());
                    warn!(error = %e, events, "stream failed mid-turn");
                    return Err(e.into());
                }
                None => {
                    let e = TransportError::StreamInterrupted(
                        "stream ended before the turn completed".into(),
                    );
                    self.session.fail_turn(e.to_string());
                    warn!(events, "stream ended without a terminal event");
                    return Err(e.into());
                }
            };

            events += 1;
            if let ChatEvent::ActionPreview(action) = &event {
                match self.actions.propose((**action).clone()) {
                    Ok(handle) => proposed.push(handle.id().clone()),
                    Err(e) => warn!(error = %e, "action preview not registered"),
                }
            }

            if self.session.apply(&event) == Applied::Ignored {
                continue;
            }
            if let Some(message) = self.session.current_message() {
                on_event(&event, message);
            }
            if !self.session.is_streaming() {
                debug!(events, "terminal event received, releasing stream");
                break;
            }
        }
        drop(stream);

        let message = self
            .session
            .current_message()
            .cloned()
            .ok_or(TurnError::Session(SessionError::NoActiveTurn))?;
        let state = self.session.turn_state().unwrap_or(TurnState::Errored);
        info!(
            state = state.as_str(),
            events,
            proposed = proposed.len(),
            chars = message.content.len(),
            "turn complete"
        );

        Ok(TurnReport {
            state,
            message,
            error: self.session.turn_error().map(str::to_owned),
            conversation_id: self.session.conversation_id().cloned(),
            proposed,
            events,
        })
    }
}
