//! Error types for drydock.
//!
//! Each failure class gets its own variant with named fields so callers can
//! match on what went wrong without parsing strings. Teardown paths never
//! surface errors through these types; they log and continue.

use std::time::Duration;

/// Errors from the sandbox orchestration subsystem.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// A container-runtime CLI invocation failed or timed out.
    #[error("container runtime command failed: {reason}")]
    Runtime { reason: String },

    /// Sandbox creation failed before a usable handle existed. Any container
    /// created along the way has already been force-removed.
    #[error("failed to create sandbox for run {run_id}: {reason}")]
    CreateFailed { run_id: String, reason: String },

    /// `create` was called for a run ID that already has a live sandbox.
    #[error("run {run_id} already has a live sandbox")]
    DuplicateRun { run_id: String },

    /// No tracked sandbox exists for the given run ID.
    #[error("no tracked sandbox for run {run_id}")]
    UnknownRun { run_id: String },

    /// The base image is missing and could not be built.
    #[error("sandbox image {tag} is not available and could not be built")]
    ImageUnavailable { tag: String },

    /// Name resolution for an allowed domain failed. Fatal to the run:
    /// without a resolved address set there is nothing to enforce.
    #[error("failed to resolve allowed domain {domain}: {reason}")]
    PolicyResolution { domain: String, reason: String },

    /// Installing firewall rules failed. The caller must remove the target
    /// container; a paused container with no enforced policy must not run.
    #[error("failed to apply network policy to container {container_id}: {reason}")]
    PolicyApplication { container_id: String, reason: String },

    /// A single request went unanswered past its deadline. The sandbox and
    /// handle remain usable for subsequent requests.
    #[error("request {id} received no response within {after:?}")]
    RequestTimeout { id: String, after: Duration },

    /// The sandbox replied to a request with an error frame.
    #[error("sandbox rejected request {id}: {message}")]
    Rejected { id: String, message: String },

    /// The handle has been destroyed; all operations fail fast.
    #[error("sandbox has been destroyed")]
    Destroyed,

    /// The attached process exited while requests were still pending or
    /// before one could be issued.
    #[error("sandbox process exited unexpectedly (code {code:?}, signal {signal:?})")]
    ProcessExited {
        code: Option<i32>,
        signal: Option<i32>,
    },

    /// A violation of the frame protocol (duplicate request ID, missing
    /// stream, unusable payload).
    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    #[error("sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("message serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised while resolving configuration from the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}
