//! Thin wrapper around the container runtime's CLI.
//!
//! Every invocation carries a bounded timeout. Destructive calls (`rm -f`)
//! are best-effort: their failure is logged, not escalated, because the
//! runtime's own garbage collection may already have freed the resource.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};

use crate::error::SandboxError;

#[derive(Debug, Clone)]
pub(crate) struct RuntimeCli {
    bin: String,
    timeout: Duration,
}

impl RuntimeCli {
    pub(crate) fn new(bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            timeout,
        }
    }

    pub(crate) fn bin(&self) -> &str {
        &self.bin
    }

    /// Run one CLI call to completion within the default timeout.
    pub(crate) async fn run(&self, args: &[&str]) -> Result<std::process::Output, SandboxError> {
        self.run_with_timeout(args, self.timeout).await
    }

    /// Run one CLI call to completion within an explicit timeout.
    pub(crate) async fn run_with_timeout(
        &self,
        args: &[&str],
        timeout: Duration,
    ) -> Result<std::process::Output, SandboxError> {
        let result = tokio::time::timeout(
            timeout,
            Command::new(&self.bin)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(SandboxError::Runtime {
                reason: format!("{} {}: {e}", self.bin, args.join(" ")),
            }),
            Err(_) => Err(SandboxError::Runtime {
                reason: format!(
                    "{} {} timed out after {}s",
                    self.bin,
                    args.join(" "),
                    timeout.as_secs()
                ),
            }),
        }
    }

    /// Run one CLI call, requiring success; returns trimmed stdout.
    pub(crate) async fn run_ok(&self, args: &[&str]) -> Result<String, SandboxError> {
        let output = self.run(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SandboxError::Runtime {
                reason: format!(
                    "{} {} failed: {}",
                    self.bin,
                    args.join(" "),
                    stderr.trim()
                ),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Force-remove a container. Best-effort: failures are logged only.
    pub(crate) async fn force_remove(&self, container: &str) {
        match self.run(&["rm", "-f", container]).await {
            Ok(output) if output.status.success() => {
                tracing::debug!(container, "removed container");
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                tracing::warn!(container, stderr = %stderr.trim(), "failed to remove container");
            }
            Err(e) => {
                tracing::warn!(container, error = %e, "failed to run container removal");
            }
        }
    }

    /// Spawn a long-lived CLI process attached to a container's streams.
    ///
    /// stdin/stdout are piped for the frame protocol; stderr is piped so the
    /// handle can log it.
    pub(crate) fn spawn_attached(&self, args: &[&str]) -> Result<Child, SandboxError> {
        Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Runtime {
                reason: format!("failed to spawn {} {}: {e}", self.bin, args.join(" ")),
            })
    }
}
