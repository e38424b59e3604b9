//! HTTP binding for the chat stream and action resolution endpoints.

mod http;

pub use http::{ClientConfig, HttpTransport, DEFAULT_ACTIONS_PATH, DEFAULT_CHAT_PATH};
