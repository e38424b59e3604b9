pub mod engine;
pub mod error;
pub mod mock;
pub mod registry;
pub mod session;

pub use engine::{ChatEngine, TurnReport};
pub use error::TurnError;
pub use mock::{MockBackendReply, MockResponse, MockTransport};
pub use registry::{ActionHandle, ActionRegistry};
pub use session::{Applied, ConversationSession, SessionOptions, TurnState};
