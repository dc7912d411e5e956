//! On-demand image builds for the sandbox runtime image and the firewall
//! helper image.
//!
//! `ensure` is memoized per builder: once the image has been verified or
//! built, later calls return immediately. Build failures are reported via
//! logging and a `false` return; callers decide whether to abort the run.

use std::path::Path;

use crate::error::SandboxError;
use crate::sandbox::runtime::RuntimeCli;

/// Image definition for the sandbox runtime: a minimal base layer, a small
/// set of shell utilities, a non-root runtime user, and the tool-server
/// entrypoint. The `drydock` binary is copied into the build context by
/// [`ImageBuilder::assemble_context`].
const SANDBOX_DOCKERFILE: &str = "\
FROM debian:bookworm-slim
RUN apt-get update -qq \\
    && apt-get install -y -qq --no-install-recommends \\
        bash ca-certificates coreutils curl git jq \\
    && rm -rf /var/lib/apt/lists/*
RUN useradd --create-home --uid 1000 sandbox
COPY drydock /usr/local/bin/drydock
USER sandbox
WORKDIR /workspace
ENTRYPOINT [\"/usr/local/bin/drydock\", \"serve\"]
";

/// Image definition for the firewall helper: just a shell and iptables. The
/// manager runs it with `--network container:<id>` and `NET_ADMIN` to
/// program rules in the target's namespace.
const HELPER_DOCKERFILE: &str = "\
FROM alpine:3.20
RUN apk add --no-cache iptables
";

/// Which of the two embedded image definitions a builder produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    /// The hardened runtime image containing the tool server.
    Sandbox,
    /// The throwaway iptables helper.
    FirewallHelper,
}

#[derive(Debug)]
pub struct ImageBuilder {
    tag: String,
    kind: ImageKind,
    build_timeout: std::time::Duration,
    verified: tokio::sync::Mutex<bool>,
}

impl ImageBuilder {
    pub fn new(tag: impl Into<String>, kind: ImageKind, build_timeout: std::time::Duration) -> Self {
        Self {
            tag: tag.into(),
            kind,
            build_timeout,
            verified: tokio::sync::Mutex::new(false),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Make sure the image exists, building it if missing.
    ///
    /// Returns `true` once the image is available. Never panics and never
    /// propagates build errors; a failed build is logged and reported as
    /// `false`.
    pub(crate) async fn ensure(&self, cli: &RuntimeCli) -> bool {
        let mut verified = self.verified.lock().await;
        if *verified {
            return true;
        }

        if self.image_exists(cli).await {
            *verified = true;
            return true;
        }

        tracing::info!(tag = %self.tag, "image not found, building");
        match self.build(cli).await {
            Ok(()) => {
                tracing::info!(tag = %self.tag, "image built");
                *verified = true;
                true
            }
            Err(e) => {
                tracing::error!(tag = %self.tag, error = %e, "image build failed");
                false
            }
        }
    }

    async fn image_exists(&self, cli: &RuntimeCli) -> bool {
        cli.run(&["image", "inspect", &self.tag])
            .await
            .is_ok_and(|output| output.status.success())
    }

    async fn build(&self, cli: &RuntimeCli) -> Result<(), SandboxError> {
        // TempDir cleans the context up on drop, success or failure.
        let context = tempfile::tempdir()?;
        self.assemble_context(context.path())?;

        let context_path = context.path().display().to_string();
        let args = ["build", "--tag", self.tag.as_str(), context_path.as_str()];
        let output = cli.run_with_timeout(&args, self.build_timeout).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SandboxError::Runtime {
                reason: format!("image build for {} failed: {}", self.tag, stderr.trim()),
            });
        }
        Ok(())
    }

    /// Write the Dockerfile (and, for the sandbox image, the tool-server
    /// payload) into a fresh build-context directory.
    fn assemble_context(&self, dir: &Path) -> Result<(), SandboxError> {
        let dockerfile = match self.kind {
            ImageKind::Sandbox => SANDBOX_DOCKERFILE,
            ImageKind::FirewallHelper => HELPER_DOCKERFILE,
        };
        std::fs::write(dir.join("Dockerfile"), dockerfile)?;

        if self.kind == ImageKind::Sandbox {
            // The running executable is the tool server; `drydock serve`
            // becomes the image entrypoint.
            let exe = std::env::current_exe()?;
            std::fs::copy(&exe, dir.join("drydock"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_sandbox_dockerfile_shape() {
        assert!(SANDBOX_DOCKERFILE.contains("USER sandbox"));
        assert!(SANDBOX_DOCKERFILE.contains("ENTRYPOINT [\"/usr/local/bin/drydock\", \"serve\"]"));
        assert!(SANDBOX_DOCKERFILE.contains("COPY drydock"));
    }

    #[test]
    fn test_helper_dockerfile_has_iptables() {
        assert!(HELPER_DOCKERFILE.contains("iptables"));
    }

    #[test]
    fn test_assemble_sandbox_context() {
        let builder = ImageBuilder::new(
            "drydock-test:ctx",
            ImageKind::Sandbox,
            Duration::from_secs(60),
        );
        let dir = tempfile::tempdir().unwrap();
        builder.assemble_context(dir.path()).unwrap();
        assert!(dir.path().join("Dockerfile").exists());
        assert!(dir.path().join("drydock").exists());
    }

    #[test]
    fn test_assemble_helper_context_has_no_payload() {
        let builder = ImageBuilder::new(
            "drydock-test:helper",
            ImageKind::FirewallHelper,
            Duration::from_secs(60),
        );
        let dir = tempfile::tempdir().unwrap();
        builder.assemble_context(dir.path()).unwrap();
        assert!(dir.path().join("Dockerfile").exists());
        assert!(!dir.path().join("drydock").exists());
    }
}
