use async_trait::async_trait;

use crate::errors::TransportError;
use crate::events::EventStream;
use crate::ids::ActionId;
use crate::request::{ActionResolution, ChatRequest};

/// Opens the streamed response for one turn.
///
/// An `Err` means the request failed before any byte of the body was decoded.
/// Failures after that point arrive through the returned stream.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open_stream(&self, request: &ChatRequest) -> Result<EventStream, TransportError>;
}

/// Backend confirmation for proposed actions, addressed by action id only.
#[async_trait]
pub trait ActionBackend: Send + Sync {
    async fn approve(&self, id: &ActionId) -> Result<ActionResolution, TransportError>;

    async fn reject(
        &self,
        id: &ActionId,
        reason: Option<&str>,
    ) -> Result<ActionResolution, TransportError>;
}
