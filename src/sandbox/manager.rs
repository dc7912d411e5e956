//! Lifecycle management for sandbox containers.
//!
//! One manager instance tracks every live sandbox by run ID and is the only
//! component that talks to the container runtime's CLI for creation,
//! discovery, and bulk teardown. The tracking map holds weak references: the
//! caller that created a handle is its only owner.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::SandboxRuntimeConfig;
use crate::error::SandboxError;
use crate::sandbox::handle::{ContainerHandle, HandleOptions};
use crate::sandbox::image::{ImageBuilder, ImageKind};
use crate::sandbox::network::{apply_policy, NetworkPolicy, UNREACHABLE_RESOLVER};
use crate::sandbox::runtime::RuntimeCli;

/// Label carried by every container this subsystem creates; the sole
/// mechanism for telling them apart from unrelated containers on the host.
pub const SANDBOX_LABEL: &str = "drydock.sandbox";

/// Label recording which run a container belongs to.
pub const RUN_LABEL: &str = "drydock.run-id";

/// Immutable per-run sandbox request.
///
/// Network access is opt-in: an empty `allowed_domains` list means the
/// container gets no network at all.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Host directory bind-mounted read-write at /workspace.
    pub workspace_path: PathBuf,
    /// Optional host directory bind-mounted read-only at /skills.
    pub skills_path: Option<PathBuf>,
    /// Outbound domains the run may reach. Empty = no network.
    pub allowed_domains: Vec<String>,
    /// Ports reachable on allowed domains. Empty = 80/443.
    pub allowed_ports: Vec<u16>,
    /// Memory limit override in megabytes.
    pub memory_limit_mb: Option<u64>,
    /// CPU shares override.
    pub cpu_shares: Option<u32>,
    /// Process-count cap override.
    pub pids_limit: Option<u32>,
    /// Lifetime cap override.
    pub max_lifetime: Option<Duration>,
}

impl ContainerConfig {
    pub fn new(workspace_path: impl Into<PathBuf>) -> Self {
        Self {
            workspace_path: workspace_path.into(),
            skills_path: None,
            allowed_domains: Vec::new(),
            allowed_ports: Vec::new(),
            memory_limit_mb: None,
            cpu_shares: None,
            pids_limit: None,
            max_lifetime: None,
        }
    }
}

/// Creates, tracks, and reaps sandbox containers.
pub struct ContainerManager {
    config: SandboxRuntimeConfig,
    cli: RuntimeCli,
    base_image: ImageBuilder,
    helper_image: ImageBuilder,
    handles: Mutex<HashMap<String, Weak<ContainerHandle>>>,
}

impl ContainerManager {
    pub fn new(config: SandboxRuntimeConfig) -> Self {
        let cli = RuntimeCli::new(config.runtime_bin.clone(), config.cli_timeout);
        let base_image =
            ImageBuilder::new(config.image.clone(), ImageKind::Sandbox, config.build_timeout);
        let helper_image = ImageBuilder::new(
            config.helper_image.clone(),
            ImageKind::FirewallHelper,
            config.build_timeout,
        );
        Self {
            config,
            cli,
            base_image,
            helper_image,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Probe whether the container runtime CLI is usable.
    ///
    /// A feature-detection gate for callers, not a hard dependency: the
    /// answer is a boolean, never an error.
    pub async fn is_available(&self) -> bool {
        self.cli
            .run_with_timeout(&["version", "--format", "{{.Server.Version}}"], Duration::from_secs(5))
            .await
            .is_ok_and(|output| output.status.success())
    }

    /// Build the sandbox and firewall helper images if they are missing.
    ///
    /// Returns `true` when both are available afterwards.
    pub async fn build_images(&self) -> bool {
        let base = self.base_image.ensure(&self.cli).await;
        let helper = self.helper_image.ensure(&self.cli).await;
        base && helper
    }

    /// Create a sandbox for `run_id` and return its handle.
    ///
    /// The caller owns the returned handle and must call `destroy()` exactly
    /// once when the run ends; the manager keeps only a weak reference for
    /// out-of-band cleanup. Callers must serialize create/destroy per run
    /// ID.
    ///
    /// # Errors
    ///
    /// Fails if the run ID is already live, the base image cannot be
    /// provided, domain resolution fails, or any step of the
    /// create/start/pause/apply/unpause sequence fails. A container that
    /// exists when a later step fails is force-removed before the error is
    /// returned: a paused container with no enforced policy is a security
    /// incident, not a retryable condition.
    pub async fn create(
        &self,
        run_id: &str,
        config: ContainerConfig,
    ) -> Result<std::sync::Arc<ContainerHandle>, SandboxError> {
        {
            let handles = self.handles.lock().unwrap();
            if let Some(existing) = handles.get(run_id).and_then(Weak::upgrade) {
                if existing.is_usable() {
                    return Err(SandboxError::DuplicateRun {
                        run_id: run_id.to_string(),
                    });
                }
            }
        }

        if !self.base_image.ensure(&self.cli).await {
            return Err(SandboxError::ImageUnavailable {
                tag: self.base_image.tag().to_string(),
            });
        }

        // Resolve the policy exactly once; the same resolved set feeds both
        // the host entries and the firewall rules.
        let policy = if config.allowed_domains.is_empty() {
            None
        } else if !self.helper_image.ensure(&self.cli).await {
            tracing::warn!(
                run_id,
                "firewall helper image unavailable; degrading run to no network access"
            );
            None
        } else {
            Some(NetworkPolicy::resolve(&config.allowed_domains, &config.allowed_ports).await?)
        };

        let name = format!("drydock-{run_id}");
        let args = creation_args(&name, run_id, &config, policy.as_ref(), &self.config);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let container_id =
            self.cli
                .run_ok(&arg_refs)
                .await
                .map_err(|e| SandboxError::CreateFailed {
                    run_id: run_id.to_string(),
                    reason: e.to_string(),
                })?;

        // From here on the container exists; every failure path must remove
        // it before propagating.
        let child = match self.start_and_attach(&container_id, policy.as_ref()).await {
            Ok(child) => child,
            Err(e) => {
                self.cli.force_remove(&container_id).await;
                return Err(e);
            }
        };

        let options = HandleOptions {
            runtime_bin: self.config.runtime_bin.clone(),
            cli_timeout: self.config.cli_timeout,
            request_timeout_buffer: self.config.request_timeout_buffer,
            max_lifetime: config.max_lifetime.unwrap_or(self.config.max_lifetime),
        };
        let handle = match ContainerHandle::start(run_id, container_id.clone(), child, options) {
            Ok(handle) => handle,
            Err(e) => {
                self.cli.force_remove(&container_id).await;
                return Err(e);
            }
        };

        self.handles
            .lock()
            .unwrap()
            .insert(run_id.to_string(), std::sync::Arc::downgrade(&handle));

        tracing::info!(run_id, container_id = %handle.container_id(), "sandbox created");
        Ok(handle)
    }

    /// Start the created container and return the process attached to its
    /// streams, running the pause/apply/unpause sequence when a network
    /// policy is present.
    async fn start_and_attach(
        &self,
        container_id: &str,
        policy: Option<&NetworkPolicy>,
    ) -> Result<tokio::process::Child, SandboxError> {
        match policy {
            // No networking to protect during boot; attach directly.
            None => self
                .cli
                .spawn_attached(&["start", "--attach", "--interactive", container_id]),
            Some(policy) => {
                self.cli.run_ok(&["start", container_id]).await?;
                self.cli.run_ok(&["pause", container_id]).await?;
                apply_policy(&self.cli, self.helper_image.tag(), container_id, policy).await?;
                self.cli.run_ok(&["unpause", container_id]).await?;
                self.cli.spawn_attached(&["attach", container_id])
            }
        }
    }

    /// Destroy the tracked sandbox for `run_id`, if any.
    pub async fn destroy(&self, run_id: &str) -> Result<(), SandboxError> {
        let handle = self
            .handles
            .lock()
            .unwrap()
            .remove(run_id)
            .and_then(|weak| weak.upgrade());
        match handle {
            Some(handle) => {
                handle.destroy().await;
                Ok(())
            }
            None => Err(SandboxError::UnknownRun {
                run_id: run_id.to_string(),
            }),
        }
    }

    /// Remove labeled containers older than `max_age`.
    ///
    /// Intended for startup cleanup after an unclean shutdown. A container
    /// whose creation time cannot be parsed is removed conservatively.
    /// Returns the number removed.
    pub async fn prune(&self, max_age: Duration) -> Result<usize, SandboxError> {
        let filter = format!("label={SANDBOX_LABEL}");
        let output = self
            .cli
            .run_ok(&[
                "ps",
                "--all",
                "--filter",
                &filter,
                "--format",
                "{{.ID}}\t{{.CreatedAt}}",
            ])
            .await?;

        let now = Utc::now();
        let mut removed = 0;
        for line in output.lines().filter(|l| !l.trim().is_empty()) {
            let (id, created_raw) = line.split_once('\t').unwrap_or((line, ""));
            if should_prune(created_raw, now, max_age) {
                tracing::info!(container = id, created = created_raw, "pruning stale sandbox container");
                self.cli.force_remove(id).await;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Destroy every tracked handle, then sweep any remaining labeled
    /// containers (processes that died before registration, registration
    /// races).
    pub async fn destroy_all(&self) {
        let handles: Vec<_> = {
            let mut map = self.handles.lock().unwrap();
            map.drain().filter_map(|(_, weak)| weak.upgrade()).collect()
        };
        for handle in handles {
            handle.destroy().await;
        }

        let filter = format!("label={SANDBOX_LABEL}");
        match self
            .cli
            .run_ok(&["ps", "--all", "--filter", &filter, "--format", "{{.ID}}"])
            .await
        {
            Ok(output) => {
                for id in output.lines().filter(|l| !l.trim().is_empty()) {
                    self.cli.force_remove(id).await;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to list labeled containers during teardown");
            }
        }
    }
}

/// Build the container-creation argument vector.
///
/// Kept pure so the security-critical flag set can be unit-tested without a
/// container runtime.
fn creation_args(
    name: &str,
    run_id: &str,
    config: &ContainerConfig,
    policy: Option<&NetworkPolicy>,
    runtime: &SandboxRuntimeConfig,
) -> Vec<String> {
    let memory_mb = config.memory_limit_mb.unwrap_or(runtime.memory_limit_mb);
    let cpu_shares = config.cpu_shares.unwrap_or(runtime.cpu_shares);
    let pids_limit = config.pids_limit.unwrap_or(runtime.pids_limit);

    let mut args: Vec<String> = [
        "create",
        "--name",
        name,
        "--interactive",
        "--read-only",
        "--cap-drop",
        "ALL",
        "--security-opt",
        "no-new-privileges",
        "--tmpfs",
        "/tmp:rw,noexec,nosuid,size=256m",
        "--workdir",
        "/workspace",
    ]
    .into_iter()
    .map(String::from)
    .collect();

    args.extend([
        "--label".to_string(),
        format!("{SANDBOX_LABEL}=1"),
        "--label".to_string(),
        format!("{RUN_LABEL}={run_id}"),
        "--pids-limit".to_string(),
        pids_limit.to_string(),
        "--memory".to_string(),
        format!("{memory_mb}m"),
        "--cpu-shares".to_string(),
        cpu_shares.to_string(),
        "--volume".to_string(),
        format!("{}:/workspace:rw", config.workspace_path.display()),
    ]);

    if let Some(ref skills) = config.skills_path {
        args.extend([
            "--volume".to_string(),
            format!("{}:/skills:ro", skills.display()),
        ]);
    }

    match policy {
        None => {
            args.extend(["--network".to_string(), "none".to_string()]);
        }
        Some(policy) => {
            // Bridge networking with a dead resolver: all name resolution
            // inside the sandbox must come from the injected host entries,
            // which carry the same addresses the firewall allows.
            args.extend([
                "--network".to_string(),
                "bridge".to_string(),
                "--dns".to_string(),
                UNREACHABLE_RESOLVER.to_string(),
                "--sysctl".to_string(),
                "net.ipv6.conf.all.disable_ipv6=1".to_string(),
            ]);
            args.extend(policy.add_host_args());
        }
    }

    args.push(runtime.image.clone());
    args
}

/// Decide whether a container with the given raw creation timestamp should
/// be pruned. Unparseable timestamps prune conservatively.
fn should_prune(created_raw: &str, now: DateTime<Utc>, max_age: Duration) -> bool {
    match parse_created_at(created_raw) {
        Some(created) => {
            let age = now.signed_duration_since(created);
            age > chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX)
        }
        None => true,
    }
}

/// Parse the runtime's `CreatedAt` column, e.g.
/// `2026-08-07 10:30:00 +0200 CEST` (the trailing zone name is ignored).
fn parse_created_at(raw: &str) -> Option<DateTime<Utc>> {
    let mut parts = raw.split_whitespace();
    let date = parts.next()?;
    let time = parts.next()?;
    let offset = parts.next()?;
    DateTime::parse_from_str(
        &format!("{date} {time} {offset}"),
        "%Y-%m-%d %H:%M:%S %z",
    )
    .ok()
    .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime_config() -> SandboxRuntimeConfig {
        SandboxRuntimeConfig::default()
    }

    #[test]
    fn test_no_domains_means_no_network_and_no_pause_path() {
        let config = ContainerConfig::new("/tmp/ws");
        let args = creation_args("drydock-run1", "run1", &config, None, &runtime_config());

        let network_pos = args.iter().position(|a| a == "--network").unwrap();
        assert_eq!(args[network_pos + 1], "none");
        assert!(!args.iter().any(|a| a == "--add-host"));
        assert!(!args.iter().any(|a| a == "--dns"));
    }

    #[test]
    fn test_hardening_flags_always_present() {
        let config = ContainerConfig::new("/tmp/ws");
        let args = creation_args("drydock-run1", "run1", &config, None, &runtime_config());

        assert!(args.contains(&"--read-only".to_string()));
        assert!(args.contains(&"no-new-privileges".to_string()));
        let cap_pos = args.iter().position(|a| a == "--cap-drop").unwrap();
        assert_eq!(args[cap_pos + 1], "ALL");
        assert!(args.contains(&"/tmp:rw,noexec,nosuid,size=256m".to_string()));
        assert!(args.contains(&format!("{SANDBOX_LABEL}=1")));
        assert!(args.contains(&format!("{RUN_LABEL}=run1")));
        assert!(args.contains(&"/tmp/ws:/workspace:rw".to_string()));
    }

    #[test]
    fn test_resource_overrides_win_over_defaults() {
        let mut config = ContainerConfig::new("/tmp/ws");
        config.memory_limit_mb = Some(512);
        config.pids_limit = Some(64);
        let args = creation_args("drydock-run1", "run1", &config, None, &runtime_config());

        let mem_pos = args.iter().position(|a| a == "--memory").unwrap();
        assert_eq!(args[mem_pos + 1], "512m");
        let pids_pos = args.iter().position(|a| a == "--pids-limit").unwrap();
        assert_eq!(args[pids_pos + 1], "64");
    }

    #[test]
    fn test_skills_mount_is_read_only() {
        let mut config = ContainerConfig::new("/tmp/ws");
        config.skills_path = Some("/opt/skills".into());
        let args = creation_args("drydock-run1", "run1", &config, None, &runtime_config());
        assert!(args.contains(&"/opt/skills:/skills:ro".to_string()));
    }

    #[tokio::test]
    async fn test_domains_switch_to_bridge_with_dead_dns() {
        let policy = NetworkPolicy::resolve(&["localhost".to_string()], &[])
            .await
            .unwrap();
        let mut config = ContainerConfig::new("/tmp/ws");
        config.allowed_domains = vec!["localhost".to_string()];
        let args = creation_args(
            "drydock-run2",
            "run2",
            &config,
            Some(&policy),
            &runtime_config(),
        );

        let network_pos = args.iter().position(|a| a == "--network").unwrap();
        assert_eq!(args[network_pos + 1], "bridge");
        let dns_pos = args.iter().position(|a| a == "--dns").unwrap();
        assert_eq!(args[dns_pos + 1], UNREACHABLE_RESOLVER);
        assert!(args.contains(&"net.ipv6.conf.all.disable_ipv6=1".to_string()));
        assert!(args.iter().any(|a| a == "--add-host"));
    }

    #[test]
    fn test_prune_decision() {
        let now = Utc::now();
        let max_age = Duration::from_secs(3600);

        let young = (now - chrono::Duration::minutes(5))
            .format("%Y-%m-%d %H:%M:%S +0000 UTC")
            .to_string();
        assert!(!should_prune(&young, now, max_age));

        let old = (now - chrono::Duration::hours(2))
            .format("%Y-%m-%d %H:%M:%S +0000 UTC")
            .to_string();
        assert!(should_prune(&old, now, max_age));

        // Unparseable timestamps prune conservatively.
        assert!(should_prune("not a timestamp", now, max_age));
        assert!(should_prune("", now, max_age));
    }

    #[test]
    fn test_parse_created_at_with_zone_suffix() {
        let parsed = parse_created_at("2026-08-07 10:30:00 +0200 CEST").unwrap();
        assert_eq!(parsed.timezone(), Utc);
    }

    #[tokio::test]
    async fn test_destroy_unknown_run_is_an_error() {
        let manager = ContainerManager::new(runtime_config());
        assert!(matches!(
            manager.destroy("nope").await,
            Err(SandboxError::UnknownRun { .. })
        ));
    }
}
