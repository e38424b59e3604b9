use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures::{Stream, StreamExt};
use pin_project_lite::pin_project;
use tracing::debug;

use relay_core::errors::TransportError;
use relay_core::events::EventStream;

use crate::decoder::{Frame, FrameDecoder};
use crate::dispatch::dispatch;

pin_project! {
    /// Async frame decoding over a byte source.
    ///
    /// The source is owned exclusively by this stream and dropped exactly once:
    /// when it completes, when it yields an error, or when the `FrameStream`
    /// itself is dropped before either (caller abandoned the turn).
    pub struct FrameStream<S> {
        #[pin]
        source: Option<S>,
        decoder: FrameDecoder,
        pending: VecDeque<Frame>,
    }
}

impl<S> FrameStream<S> {
    pub fn new(source: S) -> Self {
        Self {
            source: Some(source),
            decoder: FrameDecoder::new(),
            pending: VecDeque::new(),
        }
    }

    /// Whether the byte source has already been let go.
    pub fn is_released(&self) -> bool {
        self.source.is_none()
    }
}

impl<S, B, E> Stream for FrameStream<S>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: fmt::Display,
{
    type Item = Result<Frame, TransportError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if let Some(frame) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }

            let Some(source) = this.source.as_mut().as_pin_mut() else {
                return Poll::Ready(None);
            };

            match ready!(source.poll_next(cx)) {
                Some(Ok(chunk)) => {
                    this.pending.extend(this.decoder.feed(chunk.as_ref()));
                }
                Some(Err(e)) => {
                    this.source.set(None);
                    debug!(error = %e, "byte source failed, released");
                    return Poll::Ready(Some(Err(TransportError::StreamInterrupted(
                        e.to_string(),
                    ))));
                }
                None => {
                    this.source.set(None);
                    debug!("byte source completed, released");
                    this.pending.extend(this.decoder.finish());
                }
            }
        }
    }
}

/// Decode and dispatch a response body into the event stream for one turn.
pub fn event_stream<S, B, E>(source: S) -> EventStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + 'static,
    E: fmt::Display + 'static,
{
    Box::pin(FrameStream::new(source).map(|frame| frame.map(dispatch)))
}
