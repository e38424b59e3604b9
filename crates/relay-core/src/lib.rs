//! Shared vocabulary for the relay chat client: identities, the chat and
//! action data model, the dispatched event set, wire request/response shapes,
//! and the error hierarchy every other crate speaks.

pub mod actions;
pub mod errors;
pub mod events;
pub mod ids;
pub mod messages;
pub mod request;
pub mod transport;

pub use actions::{ActionStatus, ChangeType, DiffEntry, ProposedAction};
pub use errors::{ActionError, ActionOp, SessionError, TransportError};
pub use events::{ChatEvent, EventKind, EventStream};
pub use ids::{ActionId, ConversationId, MessageId, ToolActivityId};
pub use messages::{ChatMessage, Role, ToolActivity, ToolResultRecord};
pub use request::{ActionResolution, ChatRequest, HistoryMessage, PageContext};
pub use transport::{ActionBackend, ChatTransport};
