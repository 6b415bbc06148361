//! Server-sent event framing for streamed completions
//!
//! Upstreams are free to split an event across network packets, so bytes are buffered until a
//! blank line closes the event. Each complete event is then decoded into [`SseItem`]s.
use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::task::{Context, Poll};

/// The terminal marker both upstreams and this proxy send after the last chunk.
pub const DONE_EVENT: &str = "data: [DONE]\n\n";

/// Render a JSON chunk as a single SSE event.
pub fn data_event(value: &Value) -> String {
    format!("data: {value}\n\n")
}

/// Yields only complete SSE events from a byte stream.
pub struct SseBufferedStream<S> {
    inner: S,
    buffer: BytesMut,
}

impl<S> SseBufferedStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
        }
    }
}

impl<S, E> Stream for SseBufferedStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        loop {
            if let Some(end) = event_end(&this.buffer) {
                return Poll::Ready(Some(Ok(this.buffer.split_to(end).freeze())));
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => this.buffer.extend_from_slice(&chunk),
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) if this.buffer.is_empty() => return Poll::Ready(None),
                // Upstream closed mid-event; hand over what we have
                Poll::Ready(None) => return Poll::Ready(Some(Ok(this.buffer.split().freeze()))),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Index just past the first event terminator, accepting both `\n\n` and `\r\n\r\n`.
fn event_end(buf: &[u8]) -> Option<usize> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| p + 2);
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4);
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// One decoded `data:` payload.
#[derive(Debug, Clone, PartialEq)]
pub enum SseItem {
    Chunk(Value),
    /// An in-band `{"error": ...}` object.
    Error(Value),
    Done,
    /// A payload that isn't JSON. Kept so callers can decide whether to care.
    Malformed(String),
}

/// Decode every `data:` line of a complete event. Comments and other fields are ignored.
pub fn parse_event(event: &[u8]) -> Vec<SseItem> {
    String::from_utf8_lossy(event)
        .lines()
        .filter_map(|line| line.trim_end_matches('\r').strip_prefix("data:"))
        .map(str::trim)
        .filter(|data| !data.is_empty())
        .map(|data| {
            if data == "[DONE]" {
                return SseItem::Done;
            }
            match serde_json::from_str::<Value>(data) {
                Ok(value) if value.get("error").is_some_and(|e| !e.is_null()) => {
                    SseItem::Error(value)
                }
                Ok(value) => SseItem::Chunk(value),
                Err(_) => SseItem::Malformed(data.to_string()),
            }
        })
        .collect()
}
