use serde_json::Value;

use crate::stream_event::{StreamEvent, StreamEventKind, PROGRESS_VALUE_MAX};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Public struct `StreamFrame` used across Quill components.
///
/// One assembled unit from the event-stream transport: the declared event
/// type tag, the joined data payload, and the server-assigned event id used
/// as the resumption token.
pub struct StreamFrame {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl StreamFrame {
    fn is_empty(&self) -> bool {
        self.event.is_none() && self.data.is_empty() && self.id.is_none()
    }
}

#[derive(Debug, Default)]
/// Public struct `StreamFrameAssembler` used across Quill components.
///
/// Incrementally assembles transport byte chunks into complete frames.
/// Chunk boundaries may fall anywhere, including inside a multi-byte
/// character; lines are only decoded once a full line is buffered.
pub struct StreamFrameAssembler {
    line_buffer: Vec<u8>,
    pending: StreamFrame,
}

impl StreamFrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one transport chunk and returns every frame completed by it.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<StreamFrame> {
        self.line_buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.line_buffer.iter().position(|byte| *byte == b'\n') {
            let raw_line: Vec<u8> = self.line_buffer.drain(..=pos).collect();
            let line = match std::str::from_utf8(&raw_line[..pos]) {
                Ok(line) => line.trim_end_matches('\r'),
                // A line that is not valid UTF-8 cannot carry a usable
                // field; skip it and keep the stream alive.
                Err(_) => continue,
            };

            if line.is_empty() {
                if !self.pending.is_empty() {
                    frames.push(std::mem::take(&mut self.pending));
                }
                continue;
            }
            self.apply_line(line);
        }
        frames
    }

    /// Flushes a trailing frame left unterminated at end of stream.
    pub fn finish(&mut self) -> Option<StreamFrame> {
        self.line_buffer.clear();
        if self.pending.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.pending))
    }

    fn apply_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        if let Some(event) = line.strip_prefix("event:") {
            self.pending.event = Some(event.trim().to_string());
            return;
        }
        if let Some(data) = line.strip_prefix("data:") {
            if !self.pending.data.is_empty() {
                self.pending.data.push('\n');
            }
            self.pending.data.push_str(data.trim());
            return;
        }
        if let Some(id) = line.strip_prefix("id:") {
            let id = id.trim();
            if !id.is_empty() {
                self.pending.id = Some(id.to_string());
            }
        }
    }
}

/// Decodes one assembled frame into a typed event, or `None` when the frame
/// is malformed or carries an unknown type tag. Pure; the caller decides
/// whether and how to log discards. A bad frame never terminates the stream.
pub fn decode_stream_frame(frame: &StreamFrame) -> Option<StreamEvent> {
    if frame.data.trim().is_empty() {
        return None;
    }
    let payload: Value = serde_json::from_str(frame.data.trim()).ok()?;

    let declared = frame
        .event
        .as_deref()
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .or_else(|| payload.get("type").and_then(Value::as_str))?;
    let kind = StreamEventKind::parse(declared)?;

    match kind {
        StreamEventKind::Progress => decode_progress_payload(&payload),
        StreamEventKind::Preview => decode_preview_payload(&payload),
        StreamEventKind::Completed => decode_completed_payload(&payload),
        StreamEventKind::Failed => decode_failed_payload(&payload),
        StreamEventKind::Heartbeat => decode_heartbeat_payload(&payload),
    }
}

fn decode_progress_payload(payload: &Value) -> Option<StreamEvent> {
    let raw_value = payload.get("value").and_then(Value::as_f64)?;
    let value = clamp_progress_value(raw_value);
    let step_label = payload.get("step_label").and_then(Value::as_str)?;
    let estimated_remaining_seconds = payload
        .get("estimated_remaining_seconds")
        .and_then(Value::as_u64);
    Some(StreamEvent::Progress {
        value,
        step_label: step_label.to_string(),
        estimated_remaining_seconds,
    })
}

fn decode_preview_payload(payload: &Value) -> Option<StreamEvent> {
    let content_fragment = payload.get("content_fragment").and_then(Value::as_str)?;
    let is_partial = payload.get("is_partial").and_then(Value::as_bool)?;
    Some(StreamEvent::Preview {
        content_fragment: content_fragment.to_string(),
        is_partial,
        word_count: payload.get("word_count").and_then(Value::as_u64),
        estimated_tokens: payload.get("estimated_tokens").and_then(Value::as_u64),
    })
}

fn decode_completed_payload(payload: &Value) -> Option<StreamEvent> {
    let final_content = payload.get("final_content").and_then(Value::as_str)?;
    let token_count = payload.get("token_count").and_then(Value::as_u64)?;
    Some(StreamEvent::Completed {
        final_content: final_content.to_string(),
        token_count,
        word_count: payload.get("word_count").and_then(Value::as_u64),
        model_used: payload
            .get("model_used")
            .and_then(Value::as_str)
            .map(str::to_string),
        saved_resource_id: payload
            .get("saved_resource_id")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

fn decode_failed_payload(payload: &Value) -> Option<StreamEvent> {
    let error_code = payload.get("error_code").and_then(Value::as_str)?;
    let error_message = payload.get("error_message").and_then(Value::as_str)?;
    let retryable = payload.get("retryable").and_then(Value::as_bool)?;
    Some(StreamEvent::Failed {
        error_code: error_code.to_string(),
        error_message: error_message.to_string(),
        retryable,
    })
}

fn decode_heartbeat_payload(payload: &Value) -> Option<StreamEvent> {
    let server_timestamp_unix_ms = payload
        .get("server_timestamp_unix_ms")
        .or_else(|| payload.get("server_timestamp"))
        .and_then(Value::as_u64)?;
    Some(StreamEvent::Heartbeat {
        server_timestamp_unix_ms,
    })
}

fn clamp_progress_value(raw: f64) -> u8 {
    if !raw.is_finite() || raw <= 0.0 {
        return 0;
    }
    if raw >= f64::from(PROGRESS_VALUE_MAX) {
        return PROGRESS_VALUE_MAX;
    }
    raw.round() as u8
}
