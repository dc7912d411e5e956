//! Per-run network policy: resolve the domain allowlist once, then enforce
//! it with firewall rules installed from a helper container.
//!
//! The single resolution result feeds both `--add-host` entries (so declared
//! domains still resolve with DNS disabled) and the firewall allow-rules (so
//! only those same addresses are reachable). Resolving twice would let DNS
//! return a different address set for each consumer and open an enforcement
//! gap, so the resolved set is computed exactly once per run.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use crate::error::SandboxError;
use crate::sandbox::runtime::RuntimeCli;

/// Ports reachable on allowed addresses when the caller declares none.
pub const DEFAULT_ALLOWED_PORTS: &[u16] = &[80, 443];

/// Resolver address handed to the container. Nothing listens there, so all
/// name resolution inside the sandbox must go through the injected host
/// entries.
pub const UNREACHABLE_RESOLVER: &str = "127.0.0.1";

/// The resolved, enforceable allowlist for one run.
#[derive(Debug, Clone)]
pub struct NetworkPolicy {
    ports: Vec<u16>,
    resolved: BTreeMap<String, BTreeSet<IpAddr>>,
}

impl NetworkPolicy {
    /// Resolve every declared domain, collecting all returned IPv4 addresses.
    ///
    /// IPv6 is dropped at this point: the container runs with IPv6 disabled
    /// and the firewall rules are v4, so advertising v6 addresses in host
    /// entries would name endpoints the policy never allows. A domain that
    /// yields no usable address fails resolution, which fails the run.
    pub async fn resolve(domains: &[String], ports: &[u16]) -> Result<Self, SandboxError> {
        let ports = if ports.is_empty() {
            DEFAULT_ALLOWED_PORTS.to_vec()
        } else {
            ports.to_vec()
        };

        let mut resolved = BTreeMap::new();
        for domain in domains {
            let addrs = tokio::net::lookup_host((domain.as_str(), 0u16))
                .await
                .map_err(|e| SandboxError::PolicyResolution {
                    domain: domain.clone(),
                    reason: e.to_string(),
                })?
                .map(|addr| addr.ip())
                .filter(IpAddr::is_ipv4)
                .collect::<BTreeSet<_>>();

            if addrs.is_empty() {
                return Err(SandboxError::PolicyResolution {
                    domain: domain.clone(),
                    reason: "no IPv4 addresses returned".to_string(),
                });
            }
            tracing::debug!(domain = %domain, addresses = addrs.len(), "resolved allowed domain");
            resolved.insert(domain.clone(), addrs);
        }

        Ok(Self { ports, resolved })
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    /// `--add-host domain:ip` argument pairs for container creation, one per
    /// resolved address.
    pub fn add_host_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for (domain, addrs) in &self.resolved {
            for addr in addrs {
                args.push("--add-host".to_string());
                args.push(format!("{domain}:{addr}"));
            }
        }
        args
    }

    /// Every address the firewall will allow, across all domains.
    pub fn allowed_addresses(&self) -> BTreeSet<IpAddr> {
        self.resolved.values().flatten().copied().collect()
    }

    /// Shell script installing deny-by-default egress rules with explicit
    /// allowances for loopback, established traffic, and each resolved
    /// address/port pair. Runs inside the helper container.
    pub fn firewall_script(&self) -> String {
        let mut script = String::from(
            "set -e\n\
             iptables -A OUTPUT -o lo -j ACCEPT\n\
             iptables -A OUTPUT -m state --state ESTABLISHED,RELATED -j ACCEPT\n",
        );
        for addr in self.allowed_addresses() {
            for port in &self.ports {
                script.push_str(&format!(
                    "iptables -A OUTPUT -d {addr} -p tcp --dport {port} -j ACCEPT\n"
                ));
            }
        }
        script.push_str("iptables -P OUTPUT DROP\n");
        script
    }
}

/// Install the policy's firewall rules inside the target container's network
/// namespace via a short-lived helper container with `NET_ADMIN`.
///
/// Any failure here must make the caller remove the target container: the
/// target is paused and unprotected until the rules exist.
pub(crate) async fn apply_policy(
    cli: &RuntimeCli,
    helper_image: &str,
    container_id: &str,
    policy: &NetworkPolicy,
) -> Result<(), SandboxError> {
    let script = policy.firewall_script();
    let network = format!("container:{container_id}");
    let args = [
        "run",
        "--rm",
        "--network",
        network.as_str(),
        "--cap-add",
        "NET_ADMIN",
        helper_image,
        "sh",
        "-c",
        script.as_str(),
    ];

    cli.run_ok(&args)
        .await
        .map_err(|e| SandboxError::PolicyApplication {
            container_id: container_id.to_string(),
            reason: e.to_string(),
        })?;

    tracing::info!(
        container_id,
        addresses = policy.allowed_addresses().len(),
        ports = ?policy.ports(),
        "applied egress policy"
    );
    Ok(())
}
