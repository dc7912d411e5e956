//! Length-prefixed JSON frame protocol spoken over the sandbox's standard
//! streams.
//!
//! Wire unit: a 4-byte big-endian length prefix followed by that many bytes
//! of UTF-8 JSON. The length prefix, not content parsing, is the framing
//! authority: a frame whose payload fails to parse is logged and skipped
//! without desynchronizing the stream.
//!
//! ```text
//! host ──[{id, tool, args, timeoutMs}]──────────▶ sandbox
//! host ──[{type: "credential", name, value}]────▶ sandbox
//! host ◀──[{type: "result", id, ...}]─────────── sandbox
//! host ◀──[{type: "error", id?, message}]─────── sandbox
//! host ◀──[{type: "credential_ack", name}]────── sandbox
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Size of the frame length prefix.
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Upper bound on a declared frame length. A prefix above this is treated as
/// stream corruption rather than a frame to wait for.
pub const MAX_FRAME_BYTES: usize = 32 * 1024 * 1024;

/// A tool-execution request sent to the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolRequest {
    /// Correlation ID; the matching `result`/`error` frame echoes it back.
    pub id: String,
    /// Tool name (e.g. "shell").
    pub tool: String,
    /// Tool-specific arguments.
    pub args: Value,
    /// How long the sandbox may spend on this request.
    pub timeout_ms: u64,
}

/// Messages arriving on the sandbox's output stream, discriminated by `type`.
///
/// `Result` keeps its tool-specific fields as a flattened map; the envelope
/// (`type`, `id`) is stripped before the payload reaches `execute()` callers.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxMessage {
    Result {
        id: String,
        #[serde(flatten)]
        payload: serde_json::Map<String, Value>,
    },
    Error {
        /// Absent for protocol-level errors not tied to any request.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        message: String,
    },
    Credential {
        name: String,
        value: String,
    },
    CredentialAck {
        name: String,
    },
}

// Hand-written so a logged message can never leak a credential value.
impl std::fmt::Debug for SandboxMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Result { id, payload } => f
                .debug_struct("Result")
                .field("id", id)
                .field("payload", payload)
                .finish(),
            Self::Error { id, message } => f
                .debug_struct("Error")
                .field("id", id)
                .field("message", message)
                .finish(),
            Self::Credential { name, .. } => f
                .debug_struct("Credential")
                .field("name", name)
                .field("value", &"[REDACTED]")
                .finish(),
            Self::CredentialAck { name } => {
                f.debug_struct("CredentialAck").field("name", name).finish()
            }
        }
    }
}

/// Encode a message as one frame: 4-byte big-endian length + JSON payload.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    let payload = serde_json::to_vec(message)?;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_BYTES + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Stateful stream decoder.
///
/// Accepts arbitrary byte chunks; chunk boundaries never have to align with
/// frame boundaries. Bytes belonging to an incomplete trailing frame stay
/// buffered until later chunks complete them.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every complete message decoded.
    ///
    /// A frame whose payload is not valid JSON is skipped with a warning;
    /// subsequent frames keep decoding. A length prefix above
    /// [`MAX_FRAME_BYTES`] discards the buffered stream, since there is no
    /// way to find the next frame boundary after a corrupt prefix.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buf.extend_from_slice(chunk);

        let mut decoded = Vec::new();
        loop {
            if self.buf.len() < LENGTH_PREFIX_BYTES {
                break;
            }
            let len =
                u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
            if len > MAX_FRAME_BYTES {
                tracing::warn!(
                    declared = len,
                    buffered = self.buf.len(),
                    "frame length prefix exceeds cap; discarding buffered stream data"
                );
                self.buf.clear();
                break;
            }
            if self.buf.len() < LENGTH_PREFIX_BYTES + len {
                break;
            }
            let payload = self.buf[LENGTH_PREFIX_BYTES..LENGTH_PREFIX_BYTES + len].to_vec();
            self.buf.drain(..LENGTH_PREFIX_BYTES + len);
            match serde_json::from_slice(&payload) {
                Ok(value) => decoded.push(value),
                Err(e) => {
                    tracing::warn!(error = %e, frame_len = len, "skipping frame with malformed JSON");
                }
            }
        }
        decoded
    }

    /// Number of bytes waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_trip() {
        let message = json!({"id": "r1", "tool": "shell", "args": ["echo hi"], "timeoutMs": 5000});
        let frame = encode_frame(&message).unwrap();

        let mut decoder = FrameDecoder::new();
        let decoded = decoder.push(&frame);
        assert_eq!(decoded, vec![message]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_one_byte_at_a_time() {
        let message = json!({"type": "result", "id": "r2", "stdout": "hi\n"});
        let frame = encode_frame(&message).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut decoded = Vec::new();
        for byte in &frame {
            decoded.extend(decoder.push(std::slice::from_ref(byte)));
        }
        assert_eq!(decoded, vec![message]);
    }

    #[test]
    fn test_partial_frame_buffers_until_complete() {
        let message = json!({"type": "credential_ack", "name": "API_KEY"});
        let frame = encode_frame(&message).unwrap();
        let (head, tail) = frame.split_at(frame.len() / 2);

        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(head).is_empty());
        let decoded = decoder.push(tail);
        assert_eq!(decoded, vec![message]);
    }

    #[test]
    fn test_two_frames_in_one_chunk() {
        let first = json!({"type": "result", "id": "a"});
        let second = json!({"type": "result", "id": "b"});
        let mut bytes = encode_frame(&first).unwrap();
        bytes.extend(encode_frame(&second).unwrap());

        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.push(&bytes), vec![first, second]);
    }

    #[test]
    fn test_malformed_json_does_not_desync() {
        let garbage = b"{not json";
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(garbage.len() as u32).to_be_bytes());
        bytes.extend_from_slice(garbage);
        let good = json!({"type": "result", "id": "after-garbage"});
        bytes.extend(encode_frame(&good).unwrap());

        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.push(&bytes), vec![good]);
    }

    #[test]
    fn test_oversized_prefix_discards_stream() {
        let mut decoder = FrameDecoder::new();
        let mut bytes = ((MAX_FRAME_BYTES + 1) as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(b"whatever follows");
        assert!(decoder.push(&bytes).is_empty());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_message_discriminants() {
        let value = json!({"type": "error", "message": "boom"});
        let message: SandboxMessage = serde_json::from_value(value).unwrap();
        match message {
            SandboxMessage::Error { id, message } => {
                assert_eq!(id, None);
                assert_eq!(message, "boom");
            }
            other => panic!("expected error, got {other:?}"),
        }

        let value = json!({"type": "result", "id": "r9", "exitCode": 0, "stdout": "ok"});
        let message: SandboxMessage = serde_json::from_value(value).unwrap();
        match message {
            SandboxMessage::Result { id, payload } => {
                assert_eq!(id, "r9");
                assert_eq!(payload.get("exitCode"), Some(&json!(0)));
            }
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[test]
    fn test_request_wire_field_names() {
        let request = ToolRequest {
            id: "r1".to_string(),
            tool: "shell".to_string(),
            args: json!(["echo hi"]),
            timeout_ms: 5000,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value.get("timeoutMs"), Some(&json!(5000)));
        assert!(value.get("timeout_ms").is_none());
    }
}
