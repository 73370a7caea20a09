#![deny(unused)]
//! Secure ephemeral container execution for agentbox.
//!
//! This crate runs untrusted, agent-generated code and shell commands in
//! short-lived hardened containers and always tears them down afterwards.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │  Tools (sandbox_shell, sandbox_write_file) │
//! │    ↓ delegate to SandboxManager            │
//! ├────────────────────────────────────────────┤
//! │  Sandbox session                           │
//! │    SecurityValidator → ImageProvisioner    │
//! │    → ContainerLifecycleManager             │
//! │    FileTransferChannel / CommandExecutor   │
//! ├────────────────────────────────────────────┤
//! │  ContainerEngine (bollard SDK | docker CLI)│
//! ├────────────────────────────────────────────┤
//! │  Container (rootless daemon, runsc)        │
//! │    uid 1000, caps dropped, no-new-privs    │
//! │    no host mounts by default               │
//! └────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use agentbox_sandbox::{engine, with_sandbox, SandboxConfiguration};
//!
//! let engine = engine::connect(engine::EngineBackend::Sdk, "docker")?;
//! let result = with_sandbox(engine, SandboxConfiguration::default(), |sandbox| async move {
//!     sandbox.write("/workspace/a.txt", "hello\n").await?;
//!     sandbox.run("cat /workspace/a.txt").await
//! })
//! .await?;
//! assert_eq!(result.stdout(), "hello\n");
//! ```

pub mod archive;
pub mod config;
pub mod engine;
pub mod exec;
pub mod image;
pub mod lifecycle;
pub mod paths;
pub mod result;
pub mod security;
pub mod session;
pub mod tools;
pub mod transfer;

pub use config::{CapabilityPolicy, MountPolicy, NetworkMode, ResourceLimits, SandboxConfiguration};
pub use engine::{ContainerEngine, EngineBackend, MockEngine};
pub use exec::CommandExecutor;
pub use image::{ImageProvisioner, ImageRecipe, DEFAULT_CACHE_VOLUME};
pub use lifecycle::{ContainerHandle, ContainerLifecycleManager, ContainerState};
pub use result::{
    ArtifactLocation, ExecutionRequest, ExecutionResult, ExecutionResultCollector,
    TIMEOUT_EXIT_CODE, TRANSPORT_FAILURE_EXIT_CODE,
};
pub use security::{SecurityPosture, SecurityValidator};
pub use session::{run_once, with_sandbox, Sandbox, SandboxBuilder};
pub use tools::{
    sandbox_tools, SandboxManager, SandboxReadFileTool, SandboxRunScriptTool, SandboxShellTool,
    SandboxWriteFileTool,
};
pub use transfer::FileTransferChannel;
