//! Integration tests for the container handle and frame protocol.
//!
//! Uses scripted `sh` child processes standing in for the attached container
//! runtime process, so no container runtime is needed: the scripts read the
//! request frames off stdin and reply with pre-encoded response frames.

use std::process::Stdio;
use std::time::{Duration, Instant};

use serde_json::json;

use drydock::error::SandboxError;
use drydock::sandbox::{encode_frame, ContainerHandle, HandleOptions, ToolRequest};

/// Render bytes as `\0ooo` escapes for `printf %b`, so a script can emit
/// arbitrary binary frames portably.
fn printf_escapes(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("\\0{b:03o}")).collect()
}

fn scripted_child(script: &str) -> tokio::process::Child {
    tokio::process::Command::new("sh")
        .arg("-c")
        .arg(script)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn scripted child")
}

fn test_options() -> HandleOptions {
    HandleOptions {
        // `true` swallows the force-removal CLI call.
        runtime_bin: "true".to_string(),
        cli_timeout: Duration::from_secs(1),
        request_timeout_buffer: Duration::from_millis(100),
        max_lifetime: Duration::from_secs(60),
    }
}

fn shell_request(id: &str, timeout_ms: u64) -> ToolRequest {
    ToolRequest {
        id: id.to_string(),
        tool: "shell".to_string(),
        args: json!(["echo hi"]),
        timeout_ms,
    }
}

/// A script that consumes exactly `request_bytes` from stdin, then emits the
/// given frames, then keeps stdin open so later writes do not hit a closed
/// pipe.
fn responder_script(request_bytes: usize, frames: &[Vec<u8>]) -> String {
    let mut all = Vec::new();
    for frame in frames {
        all.extend_from_slice(frame);
    }
    format!(
        "dd of=/dev/null bs=1 count={request_bytes} 2>/dev/null; \
         printf %b '{}'; \
         exec cat >/dev/null",
        printf_escapes(&all)
    )
}

#[tokio::test]
async fn test_execute_resolves_with_correlated_result() {
    let request = shell_request("r1", 5000);
    let request_len = encode_frame(&request).unwrap().len();
    let response =
        encode_frame(&json!({"type": "result", "id": "r1", "exitCode": 0, "stdout": "hi\n"}))
            .unwrap();

    let child = scripted_child(&responder_script(request_len, &[response]));
    let handle = ContainerHandle::start("run-exec", "ctr-exec", child, test_options()).unwrap();

    let result = handle.execute(request).await.unwrap();
    assert_eq!(result.get("stdout"), Some(&json!("hi\n")));
    assert_eq!(result.get("exitCode"), Some(&json!(0)));
    // Envelope fields are stripped from the payload.
    assert!(result.get("type").is_none());

    handle.destroy().await;
}

#[tokio::test]
async fn test_error_frame_rejects_the_matching_request() {
    let request = shell_request("r1", 5000);
    let request_len = encode_frame(&request).unwrap().len();
    let response =
        encode_frame(&json!({"type": "error", "id": "r1", "message": "denied"})).unwrap();

    let child = scripted_child(&responder_script(request_len, &[response]));
    let handle = ContainerHandle::start("run-err", "ctr-err", child, test_options()).unwrap();

    let err = handle.execute(request).await.unwrap_err();
    match err {
        SandboxError::Rejected { id, message } => {
            assert_eq!(id, "r1");
            assert_eq!(message, "denied");
        }
        other => panic!("expected rejection, got {other}"),
    }

    handle.destroy().await;
}

#[tokio::test]
async fn test_responses_correlate_out_of_call_order() {
    let first = shell_request("a", 5000);
    let second = shell_request("b", 5000);
    let both_len =
        encode_frame(&first).unwrap().len() + encode_frame(&second).unwrap().len();

    // Replies arrive in the reverse order of the requests.
    let reply_b = encode_frame(&json!({"type": "result", "id": "b", "which": "second"})).unwrap();
    let reply_a = encode_frame(&json!({"type": "result", "id": "a", "which": "first"})).unwrap();

    let child = scripted_child(&responder_script(both_len, &[reply_b, reply_a]));
    let handle = ContainerHandle::start("run-order", "ctr-order", child, test_options()).unwrap();

    let (result_a, result_b) = tokio::join!(handle.execute(first), handle.execute(second));
    assert_eq!(result_a.unwrap().get("which"), Some(&json!("first")));
    assert_eq!(result_b.unwrap().get("which"), Some(&json!("second")));

    handle.destroy().await;
}

#[tokio::test]
async fn test_timeout_rejects_only_that_request() {
    // Never responds, but keeps its streams open.
    let child = scripted_child("exec cat >/dev/null");
    let handle = ContainerHandle::start("run-timeout", "ctr-timeout", child, test_options()).unwrap();

    let started = Instant::now();
    let err = handle.execute(shell_request("slow", 200)).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, SandboxError::RequestTimeout { .. }));
    // No earlier than timeout_ms + buffer, no later than generous slack.
    assert!(elapsed >= Duration::from_millis(300), "rejected too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "rejected too late: {elapsed:?}");

    // The handle stays usable after a per-request timeout.
    assert!(handle.is_usable());

    handle.destroy().await;
}

#[tokio::test]
async fn test_process_exit_rejects_all_pending_requests() {
    // Accepts the request bytes, then exits with code 7 before replying.
    let child = scripted_child("dd of=/dev/null bs=1 count=1 2>/dev/null; exit 7");
    let handle = ContainerHandle::start("run-exit", "ctr-exit", child, test_options()).unwrap();

    let err = handle.execute(shell_request("doomed", 10_000)).await.unwrap_err();
    match err {
        SandboxError::ProcessExited { code, .. } => assert_eq!(code, Some(7)),
        other => panic!("expected process exit, got {other}"),
    }

    // Unexpected exit poisons the handle for new requests.
    let err = handle.execute(shell_request("after", 1000)).await.unwrap_err();
    assert!(matches!(err, SandboxError::ProcessExited { .. }));

    handle.destroy().await;
}

#[tokio::test]
async fn test_destroy_rejects_in_flight_requests_exactly_once() {
    let child = scripted_child("exec cat >/dev/null");
    let handle = ContainerHandle::start("run-destroy", "ctr-destroy", child, test_options()).unwrap();

    let in_flight = {
        let handle = std::sync::Arc::clone(&handle);
        tokio::spawn(async move { handle.execute(shell_request("pending", 60_000)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Destroy races from multiple triggers must be safe.
    tokio::join!(handle.destroy(), handle.destroy());

    let outcome = in_flight.await.unwrap();
    assert!(matches!(outcome, Err(SandboxError::Destroyed)));
    assert!(handle.is_destroyed());

    // Fire-and-forget delivery also fails fast once destroyed.
    let err = handle
        .deliver_credential("TOKEN", secrecy::SecretString::from("value".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::Destroyed));
}

#[tokio::test]
async fn test_credential_delivery_is_fire_and_forget() {
    // Consumes stdin forever and never acknowledges anything.
    let child = scripted_child("exec cat >/dev/null");
    let handle = ContainerHandle::start("run-cred", "ctr-cred", child, test_options()).unwrap();

    let started = Instant::now();
    handle
        .deliver_credential("API_KEY", secrecy::SecretString::from("sk-test".to_string()))
        .await
        .unwrap();
    // Returns as soon as the frame is written; no ack wait.
    assert!(started.elapsed() < Duration::from_secs(1));

    handle.destroy().await;
}
