//! drydock: hardened container sandboxes for agent-directed code execution.
//!
//! An autonomous agent that runs untrusted, LLM-generated code needs a place
//! to run it that cannot hurt the host. drydock provides that place: one
//! hardened container per task run, driven over a length-prefixed JSON frame
//! protocol on the container's standard streams, with a default-deny network
//! policy resolved and enforced per run, and teardown that happens exactly
//! once no matter how the run ends.
//!
//! The crate is both sides of the boundary: the host-side orchestration
//! ([`sandbox`]) and the in-container tool server ([`server`]) that the
//! sandbox image runs as its entrypoint.

pub mod config;
pub mod error;
pub mod sandbox;
pub mod server;

pub use config::SandboxRuntimeConfig;
pub use error::{ConfigError, SandboxError};
pub use sandbox::{ContainerConfig, ContainerHandle, ContainerManager, ToolRequest};
