//! Server-sent event framing.
//!
//! The gateway writes one `data: <json>\n\n` frame per [`StreamEvent`] with no
//! `event:` field. [`FrameBuffer`] does the inverse on raw bytes and is shared
//! by the client decoder and the upstream provider parser.

use axum::response::sse::Event;
use thiserror::Error;

use crate::events::StreamEvent;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid event payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serializes one event as a complete wire frame.
pub fn encode(event: &StreamEvent) -> Result<String, serde_json::Error> {
    Ok(format!("data: {}\n\n", serde_json::to_string(event)?))
}

/// Same frame, as an axum SSE event (axum adds the `data:` prefix).
pub fn to_sse_event(event: &StreamEvent) -> Result<Event, serde_json::Error> {
    Ok(Event::default().data(serde_json::to_string(event)?))
}

/// Accumulates bytes and yields the `data` payload of each complete frame.
/// Comment lines (keep-alives) and frames without data are dropped.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend(bytes.iter().copied().filter(|b| *b != b'\r'));
        let mut payloads = Vec::new();
        while let Some(end) = find_boundary(&self.buf) {
            let frame: Vec<u8> = self.buf.drain(..end + 2).collect();
            if let Some(data) = frame_data(&frame[..end]) {
                payloads.push(data);
            }
        }
        payloads
    }

    /// Drains a trailing frame that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        frame_data(&rest)
    }
}

fn find_boundary(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

fn frame_data(frame: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(frame);
    let mut data: Option<String> = None;
    for line in text.lines() {
        let Some(value) = line.strip_prefix("data:") else {
            continue;
        };
        let value = value.strip_prefix(' ').unwrap_or(value);
        match data.as_mut() {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(value);
            }
            None => data = Some(value.to_string()),
        }
    }
    data
}

/// Client-side decoder: bytes in, typed events out.
#[derive(Debug, Default)]
pub struct SseDecoder {
    frames: FrameBuffer,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<StreamEvent, DecodeError>> {
        self.frames
            .push(bytes)
            .into_iter()
            .map(|payload| decode_payload(&payload))
            .collect()
    }

    pub fn finish(&mut self) -> Option<Result<StreamEvent, DecodeError>> {
        self.frames.finish().map(|payload| decode_payload(&payload))
    }
}

pub fn decode_payload(payload: &str) -> Result<StreamEvent, DecodeError> {
    Ok(serde_json::from_str(payload)?)
}
