use snafu::ResultExt;

use crate::error::{EventDecodeSnafu, NonUtf8FrameSnafu, ProtocolResult};
use crate::wire::StreamEvent;

/// Sentinel payload that terminates the event stream.
const DONE_PAYLOAD: &str = "[DONE]";

/// One decoded server-sent frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Event(StreamEvent),
    Done,
}

/// Incremental decoder for the backend's `text/event-stream` payload.
///
/// Frames are `data: <json>` blocks separated by blank lines and terminated
/// by a literal `data: [DONE]`. Bytes are buffered until a full frame is
/// available, so chunk boundaries may fall anywhere, including inside a
/// multi-byte UTF-8 sequence.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes and returns every frame completed by them, in order.
    pub fn feed(&mut self, bytes: &[u8]) -> ProtocolResult<Vec<ServerFrame>> {
        self.buffer.extend_from_slice(bytes);

        let mut frames = Vec::new();
        while let Some(boundary) = find_frame_boundary(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..boundary.end).collect();
            let text = std::str::from_utf8(&block[..boundary.start]).context(NonUtf8FrameSnafu {
                stage: "decode-sse-frame",
            })?;

            if let Some(frame) = parse_frame(text)? {
                frames.push(frame);
            }
        }

        Ok(frames)
    }
}

struct FrameBoundary {
    /// Length of the frame body, excluding the blank-line separator.
    start: usize,
    /// Length of the frame body plus its separator.
    end: usize,
}

fn find_frame_boundary(buffer: &[u8]) -> Option<FrameBoundary> {
    // Accept both LF and CRLF framing; the separator is an empty line.
    for index in 0..buffer.len().saturating_sub(1) {
        if buffer[index] == b'\n' && buffer[index + 1] == b'\n' {
            return Some(FrameBoundary {
                start: index,
                end: index + 2,
            });
        }
        if index + 3 < buffer.len() && &buffer[index..index + 4] == b"\r\n\r\n" {
            return Some(FrameBoundary {
                start: index,
                end: index + 4,
            });
        }
    }
    None
}

fn parse_frame(block: &str) -> ProtocolResult<Option<ServerFrame>> {
    let mut payload_lines = Vec::new();

    for line in block.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(value) = line.strip_prefix("data:") {
            payload_lines.push(value.strip_prefix(' ').unwrap_or(value));
        }
        // `event:`, `id:`, `retry:` and comment lines carry nothing here.
    }

    if payload_lines.is_empty() {
        return Ok(None);
    }

    let payload = payload_lines.join("\n");
    if payload.trim() == DONE_PAYLOAD {
        return Ok(Some(ServerFrame::Done));
    }

    let event = serde_json::from_str::<StreamEvent>(&payload).context(EventDecodeSnafu {
        stage: "decode-sse-event",
    })?;
    Ok(Some(ServerFrame::Event(event)))
}
