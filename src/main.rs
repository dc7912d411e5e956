//! drydock - main entry point.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use drydock::sandbox::{ContainerConfig, ContainerManager, ToolRequest};
use drydock::SandboxRuntimeConfig;

#[derive(Parser, Debug)]
#[command(name = "drydock")]
#[command(about = "Hardened container sandboxes for agent-directed code execution")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check whether the container runtime is available.
    Doctor,
    /// Build the sandbox and firewall helper images if missing.
    BuildImage,
    /// Remove orphaned sandbox containers older than the given age.
    Prune {
        #[arg(long, default_value_t = 3600)]
        max_age_secs: u64,
    },
    /// Run one tool request in a fresh sandbox and print the result.
    Exec {
        /// Host directory mounted read-write at /workspace.
        #[arg(long)]
        workspace: PathBuf,
        /// Domain the sandbox may reach; repeatable. None means no network.
        #[arg(long = "domain")]
        domains: Vec<String>,
        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,
        /// Tool name (e.g. "shell").
        tool: String,
        /// Tool arguments.
        args: Vec<String>,
    },
    /// Tool-server mode; runs inside the sandbox image as its entrypoint.
    #[command(hide = true)]
    Serve,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let _ = dotenvy::dotenv();

    // Logs must go to stderr: in serve mode stdout carries protocol frames.
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("drydock=info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config = SandboxRuntimeConfig::resolve()?;

    match args.command {
        Command::Doctor => {
            let manager = ContainerManager::new(config);
            if manager.is_available().await {
                println!("container runtime is available");
            } else {
                println!("container runtime is not available");
                std::process::exit(1);
            }
        }
        Command::BuildImage => {
            let manager = ContainerManager::new(config);
            if !manager.build_images().await {
                std::process::exit(1);
            }
        }
        Command::Prune { max_age_secs } => {
            let manager = ContainerManager::new(config);
            let removed = manager.prune(Duration::from_secs(max_age_secs)).await?;
            println!("removed {removed} stale sandbox container(s)");
        }
        Command::Exec {
            workspace,
            domains,
            timeout_ms,
            tool,
            args: tool_args,
        } => {
            let manager = ContainerManager::new(config);
            let run_id = uuid::Uuid::new_v4().to_string();

            let mut container_config = ContainerConfig::new(workspace);
            container_config.allowed_domains = domains;

            let handle = manager.create(&run_id, container_config).await?;
            let request = ToolRequest {
                id: uuid::Uuid::new_v4().to_string(),
                tool,
                args: serde_json::json!(tool_args),
                timeout_ms,
            };
            let outcome = handle.execute(request).await;
            handle.destroy().await;

            let result = outcome?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Serve => {
            drydock::server::run().await?;
        }
    }

    Ok(())
}
