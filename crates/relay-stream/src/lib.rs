//! Turns the chat response body into dispatched events.
//!
//! ```text
//! bytes ─► FrameDecoder ─► Frame { kind, payload } ─► dispatch ─► ChatEvent
//! ```
//!
//! [`FrameDecoder`] is a pure state machine over `(buffer, chunk)`;
//! [`FrameStream`] drives it from an async byte source that it owns for the
//! duration of the stream and drops as soon as decoding ends.

pub mod decoder;
pub mod dispatch;
pub mod frame_stream;

pub use decoder::{Frame, FrameDecoder, DEFAULT_EVENT_KIND};
pub use dispatch::dispatch;
pub use frame_stream::{event_stream, FrameStream};
