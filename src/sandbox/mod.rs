//! Sandbox orchestration: hardened containers for agent-directed code
//! execution.
//!
//! One container per task run, created and destroyed by the
//! [`ContainerManager`] and driven through a [`ContainerHandle`] speaking
//! length-prefixed JSON frames over the container's standard streams.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │ ContainerManager                                     │
//! │   create(run_id, config)                             │
//! │     ├─ ImageBuilder::ensure            (build once)  │
//! │     ├─ NetworkPolicy::resolve          (once / run)  │
//! │     ├─ create → start → pause → apply → unpause      │
//! │     └─ attach ──▶ ContainerHandle                    │
//! │                    ├─ execute()        frames on     │
//! │                    ├─ deliver_credential()  stdio    │
//! │                    └─ destroy()        idempotent    │
//! │   destroy(run_id) / prune(max_age) / destroy_all()   │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! The pause window exists only on the network-enabled path: the container
//! must not execute anything until its egress rules are installed. A failure
//! inside that window force-removes the container rather than ever leaving
//! it running unprotected.

pub mod handle;
pub mod image;
pub mod manager;
pub mod network;
pub mod protocol;
pub(crate) mod runtime;

pub use handle::{ContainerHandle, HandleOptions};
pub use image::{ImageBuilder, ImageKind};
pub use manager::{ContainerConfig, ContainerManager, RUN_LABEL, SANDBOX_LABEL};
pub use network::{NetworkPolicy, DEFAULT_ALLOWED_PORTS, UNREACHABLE_RESOLVER};
pub use protocol::{encode_frame, FrameDecoder, SandboxMessage, ToolRequest};
