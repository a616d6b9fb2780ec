//! Newline-delimited JSON framing for the worker's stdout

use crate::errors::{BridgeError, Result};
use serde_json::Value;

const EXCERPT_CHARS: usize = 200;

/// One decoded line from the worker
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    /// `{"status": "ready"}`
    Ready,
    /// Any other JSON value. `outcome` is the whole message unless it carries
    /// `"ok": false`, in which case it is the worker's error text.
    Response {
        id: Option<u64>,
        outcome: std::result::Result<Value, String>,
    },
}

impl WireMessage {
    pub fn from_value(value: Value) -> Self {
        let Some(object) = value.as_object() else {
            return WireMessage::Response {
                id: None,
                outcome: Ok(value),
            };
        };

        if !object.contains_key("ok")
            && object.get("status").and_then(Value::as_str) == Some("ready")
        {
            return WireMessage::Ready;
        }

        let id = object.get("id").and_then(Value::as_u64);
        if object.get("ok") == Some(&Value::Bool(false)) {
            let error = match object.get("error") {
                Some(Value::String(text)) => text.clone(),
                Some(other) => other.to_string(),
                None => "Worker reported an error without a message".to_string(),
            };
            return WireMessage::Response {
                id,
                outcome: Err(error),
            };
        }

        WireMessage::Response {
            id,
            outcome: Ok(value),
        }
    }
}

/// Accumulates stdout chunks and yields complete lines
///
/// Bytes are buffered rather than text so that a multi-byte character split
/// across two reads decodes correctly.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held back waiting for a newline
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Append a chunk and decode every line it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<WireMessage>> {
        self.buffer.extend_from_slice(chunk);

        let mut messages = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            if let Some(message) = decode_line(&self.buffer[start..end]) {
                messages.push(message);
            }
            start = end + 1;
        }
        self.buffer.drain(..start);
        messages
    }

    /// Decode a final unterminated fragment at end of stream
    pub fn finish(&mut self) -> Option<Result<WireMessage>> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest)
    }
}

fn decode_line(raw: &[u8]) -> Option<Result<WireMessage>> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    if raw.iter().all(u8::is_ascii_whitespace) {
        return None;
    }

    let text = match std::str::from_utf8(raw) {
        Ok(text) => text,
        Err(e) => {
            return Some(Err(parse_error(&String::from_utf8_lossy(raw), e.to_string())));
        }
    };

    Some(
        serde_json::from_str::<Value>(text)
            .map(WireMessage::from_value)
            .map_err(|e| parse_error(text, e.to_string())),
    )
}

fn parse_error(line: &str, reason: String) -> BridgeError {
    BridgeError::ProtocolParse {
        excerpt: excerpt(line),
        reason,
    }
}

/// First 200 characters of a line, for logs and error messages
pub fn excerpt(line: &str) -> String {
    let trimmed = line.trim();
    match trimmed.char_indices().nth(EXCERPT_CHARS) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}
