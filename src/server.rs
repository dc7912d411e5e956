//! The in-container tool server (`drydock serve`).
//!
//! Runs as the sandbox image's entrypoint with the frame protocol on its
//! standard streams: requests and credentials arrive on stdin, results and
//! acks leave on stdout. Logging goes to stderr only; stdout carries nothing
//! but frames.
//!
//! Each request is served on its own task so a slow command does not block
//! the read loop; replies may therefore leave in a different order than
//! their requests arrived, which is fine because the host correlates by
//! request ID, not arrival order.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use secrecy::SecretString;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::SandboxError;
use crate::sandbox::protocol::{encode_frame, FrameDecoder, SandboxMessage, ToolRequest};

/// Cap on captured stdout/stderr per command.
const MAX_OUTPUT_BYTES: usize = 256 * 1024;

/// Credentials delivered by the host, kept in process memory only.
type CredentialStore = Arc<Mutex<HashMap<String, SecretString>>>;

/// Writer shared by all in-flight requests so frames never interleave.
type SharedStdout = Arc<tokio::sync::Mutex<tokio::io::Stdout>>;

/// Run the tool-server loop until stdin closes.
pub async fn run() -> Result<(), SandboxError> {
    let mut stdin = tokio::io::stdin();
    let stdout: SharedStdout = Arc::new(tokio::sync::Mutex::new(tokio::io::stdout()));
    let credentials: CredentialStore = Arc::new(Mutex::new(HashMap::new()));

    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 8192];
    loop {
        let n = stdin.read(&mut buf).await?;
        if n == 0 {
            tracing::info!("input stream closed, tool server exiting");
            return Ok(());
        }
        for value in decoder.push(&buf[..n]) {
            handle_message(value, &stdout, &credentials);
        }
    }
}

fn handle_message(value: Value, stdout: &SharedStdout, credentials: &CredentialStore) {
    // Frames with a `type` discriminant are control messages; everything
    // else should be a tool request.
    if value.get("type").is_some() {
        match serde_json::from_value::<SandboxMessage>(value) {
            Ok(SandboxMessage::Credential { name, value }) => {
                credentials
                    .lock()
                    .unwrap()
                    .insert(name.clone(), SecretString::from(value));
                tracing::info!(credential = %name, "credential stored");
                let ack = SandboxMessage::CredentialAck { name };
                let stdout = Arc::clone(stdout);
                tokio::spawn(async move {
                    write_frame(&stdout, &ack).await;
                });
            }
            Ok(other) => {
                tracing::warn!(message = ?other, "ignoring unexpected control message");
            }
            Err(e) => {
                tracing::warn!(error = %e, "ignoring unrecognized control message");
            }
        }
        return;
    }

    match serde_json::from_value::<ToolRequest>(value) {
        Ok(request) => {
            let stdout = Arc::clone(stdout);
            tokio::spawn(async move {
                let reply = dispatch_request(&request).await;
                write_frame(&stdout, &reply).await;
            });
        }
        Err(e) => {
            tracing::warn!(error = %e, "discarding malformed request frame");
            let reply = SandboxMessage::Error {
                id: None,
                message: format!("malformed request: {e}"),
            };
            let stdout = Arc::clone(stdout);
            tokio::spawn(async move {
                write_frame(&stdout, &reply).await;
            });
        }
    }
}

async fn dispatch_request(request: &ToolRequest) -> SandboxMessage {
    match request.tool.as_str() {
        "shell" => match run_shell(request).await {
            Ok(payload) => result_message(&request.id, payload),
            Err(message) => SandboxMessage::Error {
                id: Some(request.id.clone()),
                message,
            },
        },
        other => SandboxMessage::Error {
            id: Some(request.id.clone()),
            message: format!("unknown tool: {other}"),
        },
    }
}

fn result_message(id: &str, payload: Value) -> SandboxMessage {
    let payload = match payload {
        Value::Object(map) => map,
        other => [("output".to_string(), other)].into_iter().collect(),
    };
    SandboxMessage::Result {
        id: id.to_string(),
        payload,
    }
}

/// Execute a shell command bounded by the request's own timeout.
async fn run_shell(request: &ToolRequest) -> Result<Value, String> {
    let command = shell_command(&request.args)?;
    let timeout = Duration::from_millis(request.timeout_ms);

    let child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(&command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn shell: {e}"))?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(json!({
            "exitCode": output.status.code().unwrap_or(-1),
            "stdout": truncated(&output.stdout),
            "stderr": truncated(&output.stderr),
        })),
        Ok(Err(e)) => Err(format!("shell execution failed: {e}")),
        Err(_) => Err(format!(
            "command timed out after {}ms",
            request.timeout_ms
        )),
    }
}

/// Extract the command string from the request's `args`: either a plain
/// string or an array of strings joined by spaces.
fn shell_command(args: &Value) -> Result<String, String> {
    match args {
        Value::String(s) if !s.trim().is_empty() => Ok(s.clone()),
        Value::Array(items) => {
            let parts: Option<Vec<&str>> = items.iter().map(Value::as_str).collect();
            match parts {
                Some(parts) if !parts.is_empty() => Ok(parts.join(" ")),
                _ => Err("shell args must be a non-empty array of strings".to_string()),
            }
        }
        _ => Err("shell args must be a string or an array of strings".to_string()),
    }
}

fn truncated(bytes: &[u8]) -> String {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if text.len() > MAX_OUTPUT_BYTES {
        let mut cut = MAX_OUTPUT_BYTES;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("\n... [output truncated]");
    }
    text
}

async fn write_frame(stdout: &SharedStdout, message: &SandboxMessage) {
    let frame = match encode_frame(message) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode reply frame");
            return;
        }
    };
    let mut stdout = stdout.lock().await;
    if let Err(e) = stdout.write_all(&frame).await {
        tracing::error!(error = %e, "failed to write reply frame");
        return;
    }
    if let Err(e) = stdout.flush().await {
        tracing::error!(error = %e, "failed to flush reply frame");
    }
}
