//! SSE framing for the Messages API stream.
//!
//! [`SseDecoder`] is a synchronous state machine over raw body bytes. It only
//! decodes complete lines, so an event, a line, or a multi-byte character split
//! across network chunks comes out the same as if it had arrived whole.
//! [`classify`] turns a framed event into what the read loop acts on.

use bytes::BytesMut;
use pal_core::errors::GatewayError;
use serde::de::DeserializeOwned;
use serde::Deserialize;

pub const EVENT_CONTENT_BLOCK_DELTA: &str = "content_block_delta";
pub const EVENT_MESSAGE_STOP: &str = "message_stop";

/// One `event:` + `data:` pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Line-oriented SSE decoder.
///
/// An event is emitted as soon as both a name and a payload are pending, then
/// the accumulator resets. A blank line also resets it. Comment lines (`:`) and
/// unknown fields are ignored.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
    event: Option<String>,
    data: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line = self.buffer.split_to(pos + 1);
            let line = String::from_utf8_lossy(&line[..pos]);
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush an unterminated final line once the body has ended.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        if self.buffer.is_empty() {
            return Vec::new();
        }
        let rest = self.buffer.split();
        let line = String::from_utf8_lossy(&rest);
        self.process_line(&line).into_iter().collect()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        let line = line.trim();

        if line.is_empty() {
            self.reset();
            return None;
        }
        if line.starts_with(':') {
            return None;
        }

        if let Some(name) = line.strip_prefix("event:") {
            self.event = Some(name.trim().to_string());
        } else if let Some(payload) = line.strip_prefix("data:") {
            self.data = Some(payload.trim().to_string());
        } else {
            return None;
        }

        match (&self.event, &self.data) {
            (Some(event), Some(data)) if !event.is_empty() && !data.is_empty() => {
                let out = SseEvent {
                    event: event.clone(),
                    data: data.clone(),
                };
                self.reset();
                Some(out)
            }
            _ => None,
        }
    }

    fn reset(&mut self) {
        self.event = None;
        self.data = None;
    }
}

/// What the read loop does with an event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamSignal {
    TextDelta(String),
    Stop,
    Ignored,
}

#[derive(Deserialize)]
struct ContentBlockDelta {
    delta: Option<Delta>,
}

#[derive(Deserialize)]
struct Delta {
    #[serde(rename = "type")]
    kind: Option<String>,
    text: Option<String>,
}

/// Interpret an event. Every known event carries JSON; a payload that does not
/// parse is a `MalformedResponse` the caller logs and skips.
pub fn classify(event: &SseEvent) -> Result<StreamSignal, GatewayError> {
    match event.event.as_str() {
        EVENT_CONTENT_BLOCK_DELTA => {
            let parsed: ContentBlockDelta = payload(event)?;
            Ok(match parsed.delta {
                Some(Delta {
                    kind: Some(kind),
                    text,
                }) if kind == "text_delta" => StreamSignal::TextDelta(text.unwrap_or_default()),
                _ => StreamSignal::Ignored,
            })
        }
        EVENT_MESSAGE_STOP => {
            let _: serde_json::Value = payload(event)?;
            Ok(StreamSignal::Stop)
        }
        _ => {
            let _: serde_json::Value = payload(event)?;
            Ok(StreamSignal::Ignored)
        }
    }
}

fn payload<T: DeserializeOwned>(event: &SseEvent) -> Result<T, GatewayError> {
    serde_json::from_str(&event.data)
        .map_err(|e| GatewayError::MalformedResponse(format!("{} payload: {e}", event.event)))
}
