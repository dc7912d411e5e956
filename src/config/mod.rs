//! Configuration for drydock.
//!
//! Everything is resolved from environment variables with documented
//! defaults; `.env` is loaded early in startup (see `main.rs`). Per-run
//! settings (workspace, domains, resource overrides) travel in
//! [`crate::sandbox::ContainerConfig`] instead and are supplied by the
//! caller, not the environment.

pub(crate) mod helpers;

use std::time::Duration;

use crate::error::ConfigError;

use self::helpers::{parse_optional_env, parse_string_env};

/// Process-level settings for the sandbox orchestration subsystem.
#[derive(Debug, Clone)]
pub struct SandboxRuntimeConfig {
    /// Container runtime CLI binary (e.g. "docker").
    pub runtime_bin: String,
    /// Tag for the sandbox runtime image.
    pub image: String,
    /// Tag for the firewall helper image.
    pub helper_image: String,
    /// Timeout for discrete CLI calls (create, pause, rm, ...).
    pub cli_timeout: Duration,
    /// Timeout for image builds, which are much slower than other CLI calls.
    pub build_timeout: Duration,
    /// Default memory limit in megabytes.
    pub memory_limit_mb: u64,
    /// Default CPU shares (relative weight).
    pub cpu_shares: u32,
    /// Default process-count cap inside the container.
    pub pids_limit: u32,
    /// Hard cap on container lifetime; the handle destroys itself when it
    /// fires regardless of activity.
    pub max_lifetime: Duration,
    /// Fixed buffer added to every request's own timeout to cover the
    /// round-trip envelope.
    pub request_timeout_buffer: Duration,
}

impl Default for SandboxRuntimeConfig {
    fn default() -> Self {
        Self {
            runtime_bin: "docker".to_string(),
            image: "drydock-sandbox:latest".to_string(),
            helper_image: "drydock-firewall:latest".to_string(),
            cli_timeout: Duration::from_secs(30),
            build_timeout: Duration::from_secs(600),
            memory_limit_mb: 2048,
            cpu_shares: 1024,
            pids_limit: 256,
            max_lifetime: Duration::from_secs(1800),
            request_timeout_buffer: Duration::from_secs(10),
        }
    }
}

impl SandboxRuntimeConfig {
    /// Resolve configuration from the environment, falling back to defaults.
    pub fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            runtime_bin: parse_string_env("DRYDOCK_RUNTIME_BIN", &defaults.runtime_bin)?,
            image: parse_string_env("DRYDOCK_IMAGE", &defaults.image)?,
            helper_image: parse_string_env("DRYDOCK_HELPER_IMAGE", &defaults.helper_image)?,
            cli_timeout: Duration::from_secs(parse_optional_env(
                "DRYDOCK_CLI_TIMEOUT_SECS",
                defaults.cli_timeout.as_secs(),
            )?),
            build_timeout: Duration::from_secs(parse_optional_env(
                "DRYDOCK_BUILD_TIMEOUT_SECS",
                defaults.build_timeout.as_secs(),
            )?),
            memory_limit_mb: parse_optional_env(
                "DRYDOCK_MEMORY_LIMIT_MB",
                defaults.memory_limit_mb,
            )?,
            cpu_shares: parse_optional_env("DRYDOCK_CPU_SHARES", defaults.cpu_shares)?,
            pids_limit: parse_optional_env("DRYDOCK_PIDS_LIMIT", defaults.pids_limit)?,
            max_lifetime: Duration::from_secs(parse_optional_env(
                "DRYDOCK_MAX_LIFETIME_SECS",
                defaults.max_lifetime.as_secs(),
            )?),
            request_timeout_buffer: Duration::from_millis(parse_optional_env(
                "DRYDOCK_REQUEST_BUFFER_MS",
                defaults.request_timeout_buffer.as_millis() as u64,
            )?),
        })
    }
}
