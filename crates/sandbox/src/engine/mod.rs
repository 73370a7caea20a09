//! Container engine abstraction.
//!
//! Every component of the sandbox talks to the container engine through the
//! [`ContainerEngine`] trait. Two real backends exist, picked at construction
//! time: [`DockerEngine`] speaks the Docker Engine API through `bollard`, and
//! [`CliEngine`] shells out to the `docker` binary. [`MockEngine`] keeps
//! everything in memory for tests.
//!
//! The engine connection is shared (`Arc<dyn ContainerEngine>`) across sandbox
//! instances and never mutated by them.

mod cli;
mod docker;
mod mock;

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use cli::CliEngine;
pub use docker::DockerEngine;
pub use mock::{MockEngine, MockFailure};

/// Label attached to every container this crate creates.
pub const MANAGED_BY_LABEL: &str = "managed-by";
/// Value of [`MANAGED_BY_LABEL`].
pub const MANAGED_BY_VALUE: &str = "agentbox";

// =============================================================================
// Engine Errors
// =============================================================================

/// Failure reported by a container engine backend.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("engine API error: {0}")]
    Api(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Result type for engine calls.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

// =============================================================================
// Engine Types
// =============================================================================

/// Daemon facts needed for security validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineInfo {
    /// Security options advertised by the daemon (e.g. `name=rootless`).
    pub security_options: Vec<String>,
    /// Names of the registered execution runtimes.
    pub runtimes: Vec<String>,
    pub server_version: Option<String>,
}

/// A mount attached to a container at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountSpec {
    /// Host directory bound into the container.
    Bind {
        source: String,
        target: String,
        read_only: bool,
    },
    /// Named engine volume.
    Volume { name: String, target: String },
    /// Empty anonymous filesystem hiding whatever the image or a bind placed
    /// at `target`.
    Shadow { target: String },
}

impl MountSpec {
    /// Whether this mount exposes a host path to the container.
    pub fn is_host_mount(&self) -> bool {
        matches!(self, Self::Bind { .. })
    }

    pub fn target(&self) -> &str {
        match self {
            Self::Bind { target, .. } | Self::Volume { target, .. } | Self::Shadow { target } => {
                target
            }
        }
    }
}

/// Fully resolved create-time options for one container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: String,
    pub cmd: Vec<String>,
    /// Numeric `uid:gid`.
    pub user: String,
    pub working_dir: String,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub runtime: Option<String>,
    pub cap_drop: Vec<String>,
    pub security_opt: Vec<String>,
    pub network_mode: String,
    pub memory_bytes: Option<i64>,
    pub nano_cpus: Option<i64>,
    pub pids_limit: Option<i64>,
    pub mounts: Vec<MountSpec>,
    pub extra_hosts: Vec<String>,
    pub init: bool,
}

/// Captured output of an exec call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i64,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Runtime state of a container as reported by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerStatus {
    pub status: String,
    pub running: bool,
    pub oom_killed: bool,
    pub exit_code: Option<i64>,
}

/// Listing entry for a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub state: String,
}

// =============================================================================
// Engine Trait
// =============================================================================

/// Control surface of an external container engine.
///
/// Every call is a blocking round-trip to the engine; implementations perform
/// no retries.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;

    /// Daemon configuration relevant to the security posture.
    async fn info(&self) -> EngineResult<EngineInfo>;

    /// Whether an image with this tag is present locally.
    async fn image_exists(&self, tag: &str) -> EngineResult<bool>;

    /// Build `tag` from a directory containing a `Dockerfile`.
    async fn image_build(&self, context_dir: &Path, tag: &str) -> EngineResult<()>;

    /// Create the named volume unless it already exists.
    async fn volume_ensure(&self, name: &str) -> EngineResult<()>;

    /// Create (but do not start) a container; returns its id.
    async fn container_create(&self, name: &str, spec: &ContainerSpec) -> EngineResult<String>;

    async fn container_start(&self, id: &str) -> EngineResult<()>;

    /// Run `argv` inside a running container and wait for it to finish.
    async fn container_exec(
        &self,
        id: &str,
        argv: &[String],
        workdir: &str,
        user: Option<&str>,
    ) -> EngineResult<ExecOutput>;

    /// `Ok(None)` when the container does not exist.
    async fn container_inspect(&self, id: &str) -> EngineResult<Option<ContainerStatus>>;

    async fn container_stop(&self, id: &str) -> EngineResult<()>;

    /// Force-remove a container. Removing a missing container is not an error.
    async fn container_remove(&self, id: &str) -> EngineResult<()>;

    /// Unpack a tar archive into `target_dir` inside the container.
    async fn archive_inject(&self, id: &str, target_dir: &str, archive: Bytes) -> EngineResult<()>;

    /// Pack `source_path` inside the container into a tar archive.
    async fn archive_extract(&self, id: &str, source_path: &str) -> EngineResult<Bytes>;

    /// Containers (running or not) carrying `label` (`key=value`).
    async fn list_containers(&self, label: &str) -> EngineResult<Vec<ContainerSummary>>;
}

// =============================================================================
// Backend Selection
// =============================================================================

/// Which engine implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineBackend {
    /// Docker Engine API via `bollard`.
    Sdk,
    /// The `docker` command line client.
    Cli,
}

impl FromStr for EngineBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sdk" | "api" => Ok(Self::Sdk),
            "cli" => Ok(Self::Cli),
            other => Err(format!("unknown engine backend '{}' (expected sdk or cli)", other)),
        }
    }
}

/// Connect to the local container engine with the chosen backend.
pub fn connect(backend: EngineBackend, docker_bin: &str) -> EngineResult<Arc<dyn ContainerEngine>> {
    match backend {
        EngineBackend::Sdk => Ok(Arc::new(DockerEngine::new()?)),
        EngineBackend::Cli => Ok(Arc::new(CliEngine::new(docker_bin))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_from_str() {
        assert_eq!("sdk".parse::<EngineBackend>(), Ok(EngineBackend::Sdk));
        assert_eq!("CLI".parse::<EngineBackend>(), Ok(EngineBackend::Cli));
        assert!("podman-rpc".parse::<EngineBackend>().is_err());
    }

    #[test]
    fn test_only_binds_are_host_mounts() {
        let bind = MountSpec::Bind {
            source: "/home/me/repo".into(),
            target: "/workspace".into(),
            read_only: false,
        };
        let shadow = MountSpec::Shadow {
            target: "/workspace/.venv".into(),
        };
        let volume = MountSpec::Volume {
            name: "agent_uv_cache".into(),
            target: "/uv_cache".into(),
        };
        assert!(bind.is_host_mount());
        assert!(!shadow.is_host_mount());
        assert!(!volume.is_host_mount());
        assert_eq!(shadow.target(), "/workspace/.venv");
    }
}
