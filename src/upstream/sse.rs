//! Decoding of the upstream's `streamGenerateContent?alt=sse` body.

use crate::error::{ProxyError, Result};
use crate::upstream::types::GenerateContentResponse;

use bytes::Bytes;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::stream::{Stream, StreamExt};
use serde_json::Value;
use std::pin::Pin;

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<GenerateContentResponse>> + Send>>;

/// Decode one `data:` payload.
///
/// The payload may be wrapped in `{"response": ...}` and may be a one-element
/// array. Returns `None` for `[DONE]`, empty payloads and anything unparseable.
pub fn decode_payload(data: &str) -> Option<GenerateContentResponse> {
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }

    let mut value: Value = serde_json::from_str(data).ok()?;
    if let Value::Array(items) = value {
        value = items.into_iter().next()?;
    }
    let inner = match value {
        Value::Object(mut map) if map.contains_key("response") => map.remove("response")?,
        other => other,
    };
    if !inner.is_object() {
        return None;
    }
    serde_json::from_value(inner).ok()
}

/// Turn a raw byte stream into decoded upstream chunks.
///
/// Frames split across network reads are reassembled. Malformed frames are
/// skipped; a transport failure ends the stream with an error item.
pub fn decode_stream<S, E>(bytes: S) -> ChunkStream
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Into<ProxyError> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let events = bytes.eventsource();
        tokio::pin!(events);
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => match decode_payload(&event.data) {
                    Some(chunk) => yield Ok(chunk),
                    None => tracing::debug!(len = event.data.len(), "Skipping upstream frame"),
                },
                Err(EventStreamError::Transport(e)) => {
                    yield Err(e.into());
                    break;
                }
                Err(_) => tracing::debug!("Skipping malformed upstream frame"),
            }
        }
    })
}
