use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;

use relay_core::errors::TransportError;
use relay_core::events::EventStream;
use relay_core::ids::ActionId;
use relay_core::request::{ActionResolution, ChatRequest};
use relay_core::transport::{ActionBackend, ChatTransport};
use relay_stream::event_stream;

/// Pre-programmed chat responses. Bodies are raw bytes and go through the
/// real frame decoder, so chunk boundaries can be placed anywhere.
pub enum MockResponse {
    /// Body chunks, then a clean end of stream.
    Chunks(Vec<Bytes>),
    /// Body chunks, then a read failure.
    Interrupted(Vec<Bytes>, String),
    /// Body chunks, then the connection stays open and silent.
    Stall(Vec<Bytes>),
    /// Fail the request before any byte is read.
    Error(TransportError),
    /// Wait a duration, then behave like the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn body(body: &str) -> Self {
        Self::Chunks(vec![Bytes::copy_from_slice(body.as_bytes())])
    }

    /// Split `body` at the given byte offsets.
    pub fn split(body: &str, offsets: &[usize]) -> Self {
        let bytes = body.as_bytes();
        let mut chunks = Vec::with_capacity(offsets.len() + 1);
        let mut start = 0;
        for &offset in offsets {
            let offset = offset.clamp(start, bytes.len());
            chunks.push(Bytes::copy_from_slice(&bytes[start..offset]));
            start = offset;
        }
        chunks.push(Bytes::copy_from_slice(&bytes[start..]));
        Self::Chunks(chunks)
    }

    /// A plain answer: one text frame and a done frame.
    pub fn text_turn(text: &str, conversation_id: Option<&str>) -> Self {
        let done = match conversation_id {
            Some(id) => serde_json::json!({ "conversation_id": id }),
            None => serde_json::json!({}),
        };
        Self::body(&format!(
            "{}{}",
            frame("text", &serde_json::json!({ "content": text })),
            frame("done", &done)
        ))
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// One `event:`/`data:` frame, blank-line terminated.
pub fn frame(kind: &str, payload: &Value) -> String {
    format!("event: {kind}\ndata: {payload}\n\n")
}

/// Scripted reply for one approve or reject call.
pub enum MockBackendReply {
    Success(String),
    /// Answered with `success: false`.
    Refuse(String),
    Fail(TransportError),
}

impl MockBackendReply {
    fn into_result(self) -> Result<ActionResolution, TransportError> {
        match self {
            Self::Success(message) => Ok(resolution(true, message)),
            Self::Refuse(message) => Ok(resolution(false, message)),
            Self::Fail(e) => Err(e),
        }
    }
}

fn resolution(success: bool, message: String) -> ActionResolution {
    ActionResolution {
        success,
        message,
        entity_type: None,
        entity_id: None,
    }
}

/// Deterministic chat transport and action backend for tests and offline use.
///
/// Chat responses are consumed in order; backend calls succeed unless a reply
/// was queued for them.
pub struct MockTransport {
    responses: Mutex<VecDeque<MockResponse>>,
    requests: Mutex<Vec<ChatRequest>>,
    approve_replies: Mutex<VecDeque<MockBackendReply>>,
    reject_replies: Mutex<VecDeque<MockBackendReply>>,
    approve_calls: Mutex<Vec<ActionId>>,
    reject_calls: Mutex<Vec<(ActionId, Option<String>)>>,
    backend_delay: Option<Duration>,
    call_count: AtomicUsize,
}

impl MockTransport {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            approve_replies: Mutex::new(VecDeque::new()),
            reject_replies: Mutex::new(VecDeque::new()),
            approve_calls: Mutex::new(Vec::new()),
            reject_calls: Mutex::new(Vec::new()),
            backend_delay: None,
            call_count: AtomicUsize::new(0),
        }
    }

    /// Make every approve/reject call wait before answering.
    pub fn with_backend_delay(mut self, delay: Duration) -> Self {
        self.backend_delay = Some(delay);
        self
    }

    pub fn push_response(&self, response: MockResponse) {
        self.responses.lock().push_back(response);
    }

    pub fn push_approve_reply(&self, reply: MockBackendReply) {
        self.approve_replies.lock().push_back(reply);
    }

    pub fn push_reject_reply(&self, reply: MockBackendReply) {
        self.reject_replies.lock().push_back(reply);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }

    pub fn approve_calls(&self) -> Vec<ActionId> {
        self.approve_calls.lock().clone()
    }

    pub fn reject_calls(&self) -> Vec<(ActionId, Option<String>)> {
        self.reject_calls.lock().clone()
    }

    async fn backend_pause(&self) {
        if let Some(delay) = self.backend_delay {
            tokio::time::sleep(delay).await;
        }
    }
}

fn ok_chunks(chunks: Vec<Bytes>) -> impl futures::Stream<Item = Result<Bytes, TransportError>> {
    stream::iter(chunks.into_iter().map(Ok))
}

#[async_trait]
impl ChatTransport for MockTransport {
    async fn open_stream(&self, request: &ChatRequest) -> Result<EventStream, TransportError> {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(request.clone());

        let mut current = self
            .responses
            .lock()
            .pop_front()
            .ok_or_else(|| TransportError::InvalidRequest("mock responses exhausted".into()))?;

        loop {
            match current {
                MockResponse::Chunks(chunks) => return Ok(event_stream(ok_chunks(chunks))),
                MockResponse::Interrupted(chunks, reason) => {
                    let failure = stream::once(async move { Err(TransportError::Network(reason)) });
                    return Ok(event_stream(ok_chunks(chunks).chain(failure)));
                }
                MockResponse::Stall(chunks) => {
                    return Ok(event_stream(ok_chunks(chunks).chain(stream::pending())));
                }
                MockResponse::Error(e) => return Err(e),
                MockResponse::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    current = *inner;
                }
            }
        }
    }
}

#[async_trait]
impl ActionBackend for MockTransport {
    async fn approve(&self, id: &ActionId) -> Result<ActionResolution, TransportError> {
        self.approve_calls.lock().push(id.clone());
        self.backend_pause().await;
        self.approve_replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| MockBackendReply::Success("Action executed".into()))
            .into_result()
    }

    async fn reject(
        &self,
        id: &ActionId,
        reason: Option<&str>,
    ) -> Result<ActionResolution, TransportError> {
        self.reject_calls
            .lock()
            .push((id.clone(), reason.map(str::to_owned)));
        self.backend_pause().await;
        self.reject_replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| MockBackendReply::Success("Action rejected".into()))
            .into_result()
    }
}
