//! Handle to one live sandbox container.
//!
//! The handle owns the CLI process attached to the container's standard
//! streams. Requests are written as frames on stdin; a reader task decodes
//! stdout frames and settles the matching pending entry by request ID. A
//! supervisor task watches the process itself: if it exits while the handle
//! is still live, every pending request is failed with the exit status,
//! because the process is the source of truth for whether the container is
//! alive.
//!
//! Teardown is guarded by an atomic tri-state (`running → destroying →
//! destroyed`): the lifetime timer, the owning caller, and the manager's
//! bulk-cleanup paths can all race `destroy()` safely, and only the first
//! caller performs the real work.

use std::collections::HashMap;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::SandboxError;
use crate::sandbox::protocol::{encode_frame, FrameDecoder, SandboxMessage, ToolRequest};
use crate::sandbox::runtime::RuntimeCli;

const STATE_RUNNING: u8 = 0;
const STATE_DESTROYING: u8 = 1;
const STATE_DESTROYED: u8 = 2;

/// Construction-time settings for a handle.
#[derive(Debug, Clone)]
pub struct HandleOptions {
    /// Container runtime CLI binary, used for force-removal on destroy.
    pub runtime_bin: String,
    /// Timeout for the removal CLI call.
    pub cli_timeout: Duration,
    /// Fixed buffer added to each request's own timeout.
    pub request_timeout_buffer: Duration,
    /// Hard cap on the container's lifetime.
    pub max_lifetime: Duration,
}

impl Default for HandleOptions {
    fn default() -> Self {
        Self {
            runtime_bin: "docker".to_string(),
            cli_timeout: Duration::from_secs(30),
            request_timeout_buffer: Duration::from_secs(10),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

/// One live sandbox container for the duration of one task run.
///
/// Exclusively owned by the caller that created it; the manager keeps only a
/// weak lookup reference for out-of-band destroy and bulk cleanup.
pub struct ContainerHandle {
    run_id: String,
    container_id: String,
    state: AtomicU8,
    exited: AtomicBool,
    exit_info: StdMutex<Option<(Option<i32>, Option<i32>)>>,
    pending: StdMutex<HashMap<String, oneshot::Sender<Result<Value, SandboxError>>>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    kill: CancellationToken,
    lifetime_timer: StdMutex<Option<JoinHandle<()>>>,
    cli: RuntimeCli,
    request_timeout_buffer: Duration,
}

impl std::fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("run_id", &self.run_id)
            .field("container_id", &self.container_id)
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ContainerHandle {
    /// Wrap an attached CLI process in a handle and start its reader,
    /// supervisor, and lifetime-cap tasks.
    ///
    /// The child must have been spawned with piped stdin and stdout. Handles
    /// are normally obtained from
    /// [`ContainerManager::create`](crate::sandbox::ContainerManager::create).
    pub fn start(
        run_id: impl Into<String>,
        container_id: impl Into<String>,
        mut child: Child,
        options: HandleOptions,
    ) -> Result<Arc<Self>, SandboxError> {
        let run_id = run_id.into();
        let container_id = container_id.into();

        let stdin = child.stdin.take().ok_or_else(|| SandboxError::Protocol {
            reason: "attached process has no piped stdin".to_string(),
        })?;
        let mut stdout = child.stdout.take().ok_or_else(|| SandboxError::Protocol {
            reason: "attached process has no piped stdout".to_string(),
        })?;
        let stderr = child.stderr.take();

        let handle = Arc::new(Self {
            run_id: run_id.clone(),
            container_id,
            state: AtomicU8::new(STATE_RUNNING),
            exited: AtomicBool::new(false),
            exit_info: StdMutex::new(None),
            pending: StdMutex::new(HashMap::new()),
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            kill: CancellationToken::new(),
            lifetime_timer: StdMutex::new(None),
            cli: RuntimeCli::new(options.runtime_bin, options.cli_timeout),
            request_timeout_buffer: options.request_timeout_buffer,
        });

        if let Some(stderr) = stderr {
            let run_id = run_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(run_id = %run_id, line = %line, "sandbox stderr");
                }
            });
        }

        let reader = tokio::spawn({
            let handle = Arc::clone(&handle);
            async move {
                let mut decoder = FrameDecoder::new();
                let mut buf = vec![0u8; 8192];
                loop {
                    match stdout.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            for value in decoder.push(&buf[..n]) {
                                handle.dispatch(value);
                            }
                        }
                        Err(e) => {
                            tracing::warn!(
                                run_id = %handle.run_id,
                                error = %e,
                                "error reading sandbox output stream"
                            );
                            break;
                        }
                    }
                }
            }
        });

        tokio::spawn({
            let handle = Arc::clone(&handle);
            let kill = handle.kill.clone();
            async move {
                enum WaitOutcome {
                    Exited(Option<ExitStatus>),
                    Killed,
                }
                let outcome = tokio::select! {
                    status = child.wait() => WaitOutcome::Exited(status.ok()),
                    _ = kill.cancelled() => WaitOutcome::Killed,
                };
                let status = match outcome {
                    WaitOutcome::Exited(status) => status,
                    WaitOutcome::Killed => {
                        if let Err(e) = child.start_kill() {
                            tracing::debug!(
                                run_id = %handle.run_id,
                                error = %e,
                                "kill of attached process failed (may have exited already)"
                            );
                        }
                        child.wait().await.ok()
                    }
                };
                // Let the reader settle anything already buffered before
                // failing what is left.
                let _ = reader.await;
                if handle.state.load(Ordering::Acquire) == STATE_RUNNING {
                    let (code, signal) = exit_parts(status);
                    *handle.exit_info.lock().unwrap() = Some((code, signal));
                    handle.exited.store(true, Ordering::Release);
                    tracing::warn!(
                        run_id = %handle.run_id,
                        code = ?code,
                        signal = ?signal,
                        "sandbox process exited unexpectedly"
                    );
                    handle.fail_pending(|_| SandboxError::ProcessExited { code, signal });
                }
            }
        });

        let timer = tokio::spawn({
            let handle = Arc::clone(&handle);
            let max_lifetime = options.max_lifetime;
            async move {
                tokio::time::sleep(max_lifetime).await;
                // Drop our own join handle so destroy() does not abort the
                // task currently running it.
                drop(handle.lifetime_timer.lock().unwrap().take());
                tracing::warn!(
                    run_id = %handle.run_id,
                    container_id = %handle.container_id,
                    "sandbox exceeded its lifetime cap, forcing teardown"
                );
                handle.destroy().await;
            }
        });
        *handle.lifetime_timer.lock().unwrap() = Some(timer);

        Ok(handle)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// Whether the handle can still accept requests.
    pub fn is_usable(&self) -> bool {
        self.fail_fast_reason().is_none()
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_DESTROYED
    }

    /// Send one tool request and wait for its correlated response.
    ///
    /// Resolves with the `result` frame's payload, or fails on an `error`
    /// frame, on timeout (`timeout_ms` plus the fixed buffer), on process
    /// exit, or immediately if the handle is destroyed. A timeout rejects
    /// only this request; the handle stays usable.
    pub async fn execute(&self, request: ToolRequest) -> Result<Value, SandboxError> {
        if let Some(reason) = self.fail_fast_reason() {
            return Err(reason);
        }

        let frame = encode_frame(&request)?;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap();
            if pending.contains_key(&request.id) {
                return Err(SandboxError::Protocol {
                    reason: format!("request ID {} is already in flight", request.id),
                });
            }
            pending.insert(request.id.clone(), tx);
        }

        // A destroy or exit may have drained the map between the fail-fast
        // check and the insert; re-check so the entry cannot dangle.
        if let Some(reason) = self.fail_fast_reason() {
            self.pending.lock().unwrap().remove(&request.id);
            return Err(reason);
        }

        if let Err(e) = self.write_frame(&frame).await {
            self.pending.lock().unwrap().remove(&request.id);
            return Err(e);
        }

        let deadline = Duration::from_millis(request.timeout_ms) + self.request_timeout_buffer;
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without settling; only teardown paths do that.
            Ok(Err(_)) => Err(SandboxError::Destroyed),
            Err(_) => {
                self.pending.lock().unwrap().remove(&request.id);
                Err(SandboxError::RequestTimeout {
                    id: request.id,
                    after: deadline,
                })
            }
        }
    }

    /// Deliver a credential to the sandbox, fire-and-forget.
    ///
    /// No pending entry is registered and no acknowledgment is awaited; the
    /// sandbox's `credential_ack` is observational only.
    pub async fn deliver_credential(
        &self,
        name: &str,
        value: SecretString,
    ) -> Result<(), SandboxError> {
        if let Some(reason) = self.fail_fast_reason() {
            return Err(reason);
        }
        let frame = encode_frame(&serde_json::json!({
            "type": "credential",
            "name": name,
            "value": value.expose_secret(),
        }))?;
        self.write_frame(&frame).await?;
        tracing::debug!(run_id = %self.run_id, credential = name, "credential delivered");
        Ok(())
    }

    /// Tear the sandbox down. Idempotent and safe to race.
    ///
    /// The first caller to win the state transition cancels the lifetime
    /// timer, fails every pending request, closes the input stream,
    /// force-removes the container, and kills the attached process. Later
    /// and concurrent calls are no-ops.
    pub async fn destroy(&self) {
        if self
            .state
            .compare_exchange(
                STATE_RUNNING,
                STATE_DESTROYING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        tracing::info!(
            run_id = %self.run_id,
            container_id = %self.container_id,
            "destroying sandbox"
        );

        if let Some(timer) = self.lifetime_timer.lock().unwrap().take() {
            timer.abort();
        }

        self.fail_pending(|_| SandboxError::Destroyed);

        // Dropping stdin closes the container's input stream.
        drop(self.stdin.lock().await.take());

        self.cli.force_remove(&self.container_id).await;

        self.kill.cancel();
        self.state.store(STATE_DESTROYED, Ordering::Release);
    }

    fn fail_fast_reason(&self) -> Option<SandboxError> {
        if self.state.load(Ordering::Acquire) != STATE_RUNNING {
            return Some(SandboxError::Destroyed);
        }
        if self.exited.load(Ordering::Acquire) {
            let (code, signal) = self.exit_info.lock().unwrap().unwrap_or((None, None));
            return Some(SandboxError::ProcessExited { code, signal });
        }
        None
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<(), SandboxError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(SandboxError::Destroyed)?;
        // write_all retries partial writes under backpressure; flush makes
        // sure the frame is handed to the pipe before we wait on a reply.
        stdin.write_all(frame).await?;
        stdin.flush().await?;
        Ok(())
    }

    fn dispatch(&self, value: Value) {
        match serde_json::from_value::<SandboxMessage>(value) {
            Ok(SandboxMessage::Result { id, payload }) => {
                self.complete(&id, Ok(Value::Object(payload)));
            }
            Ok(SandboxMessage::Error {
                id: Some(id),
                message,
            }) => {
                let error = SandboxError::Rejected {
                    id: id.clone(),
                    message,
                };
                self.complete(&id, Err(error));
            }
            Ok(SandboxMessage::Error { id: None, message }) => {
                tracing::warn!(run_id = %self.run_id, %message, "protocol-level error from sandbox");
            }
            Ok(SandboxMessage::CredentialAck { name }) => {
                tracing::debug!(run_id = %self.run_id, credential = %name, "credential acknowledged");
            }
            Ok(SandboxMessage::Credential { name, .. }) => {
                tracing::warn!(
                    run_id = %self.run_id,
                    credential = %name,
                    "unexpected credential frame from sandbox"
                );
            }
            Err(e) => {
                tracing::warn!(run_id = %self.run_id, error = %e, "unrecognized message from sandbox");
            }
        }
    }

    fn complete(&self, id: &str, outcome: Result<Value, SandboxError>) {
        let sender = self.pending.lock().unwrap().remove(id);
        match sender {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => {
                tracing::warn!(
                    run_id = %self.run_id,
                    request = id,
                    "response for unknown or already-settled request"
                );
            }
        }
    }

    fn fail_pending(&self, make_error: impl Fn(&str) -> SandboxError) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().collect()
        };
        for (id, tx) in drained {
            let _ = tx.send(Err(make_error(&id)));
        }
    }
}

fn exit_parts(status: Option<ExitStatus>) -> (Option<i32>, Option<i32>) {
    match status {
        Some(status) => {
            #[cfg(unix)]
            let signal = {
                use std::os::unix::process::ExitStatusExt;
                status.signal()
            };
            #[cfg(not(unix))]
            let signal = None;
            (status.code(), signal)
        }
        None => (None, None),
    }
}
