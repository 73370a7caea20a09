//! Typed sandbox configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use agentbox_core::config::SandboxSettings;
use agentbox_core::{Error, Result};

/// Network attachment of the sandbox container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkMode {
    /// No network interfaces besides loopback.
    None,
    /// The engine's default bridge.
    Bridge,
    /// A named, pre-existing engine network.
    Isolated(String),
}

impl NetworkMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim() {
            "" | "none" => Ok(Self::None),
            "bridge" => Ok(Self::Bridge),
            "host" => Err(Error::invalid_request(
                "network mode 'host' is not allowed for sandboxes",
            )),
            other => {
                let name = other.strip_prefix("isolated:").unwrap_or(other);
                if name.is_empty() || name.starts_with("container:") {
                    return Err(Error::invalid_request(format!(
                        "invalid network mode '{}'",
                        other
                    )));
                }
                Ok(Self::Isolated(name.to_string()))
            }
        }
    }

    /// Value passed to the engine as the network mode.
    pub fn as_engine_mode(&self) -> &str {
        match self {
            Self::None => "none",
            Self::Bridge => "bridge",
            Self::Isolated(name) => name,
        }
    }
}

/// Whether host directories are exposed to the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountPolicy {
    /// Zero host mounts. Files move in and out only through archive transfer.
    NoMounts,
    /// Bind `host_path` at the workspace root, shadowing image-baked
    /// virtual-environment directories.
    WorkspaceBind { host_path: String },
}

impl MountPolicy {
    pub fn parse(s: &str, host_workspace: Option<&str>) -> Result<Self> {
        match s.trim() {
            "" | "no-mounts" => Ok(Self::NoMounts),
            "workspace-bind" => match host_workspace {
                Some(path) if !path.trim().is_empty() => Ok(Self::WorkspaceBind {
                    host_path: path.to_string(),
                }),
                _ => Err(Error::invalid_request(
                    "mount policy 'workspace-bind' requires host_workspace",
                )),
            },
            other => Err(Error::invalid_request(format!(
                "unknown mount policy '{}' (expected no-mounts or workspace-bind)",
                other
            ))),
        }
    }
}

/// Linux capabilities granted to the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CapabilityPolicy {
    #[default]
    DropAll,
}

impl CapabilityPolicy {
    pub fn dropped(&self) -> Vec<String> {
        match self {
            Self::DropAll => vec!["ALL".to_string()],
        }
    }
}

/// CPU, memory and process ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpus: f64,
    pub memory_bytes: i64,
    pub pids_limit: i64,
}

impl ResourceLimits {
    pub fn nano_cpus(&self) -> i64 {
        (self.cpus * 1_000_000_000.0) as i64
    }
}

/// Everything needed to provision one sandbox.
///
/// Immutable once a session starts: [`crate::Sandbox`] takes its own copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfiguration {
    pub image: String,
    pub resources: ResourceLimits,
    pub network: NetworkMode,
    pub mount_policy: MountPolicy,
    pub uid: u32,
    pub gid: u32,
    pub capabilities: CapabilityPolicy,
    /// Syscall-isolating runtime the container must run under.
    pub runtime: String,
    pub workspace_root: String,
    /// Named volume mounted at `/uv_cache` for package downloads.
    pub cache_volume: Option<String>,
    /// Directories (relative to the workspace root) hidden behind empty
    /// mounts when the workspace is bound from the host.
    pub shadow_dirs: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub extra_hosts: Vec<String>,
    pub default_timeout: Duration,
}

/// Mount point of the package cache volume.
pub const CACHE_MOUNT: &str = "/uv_cache";

impl Default for SandboxConfiguration {
    fn default() -> Self {
        let s = SandboxSettings::default();
        Self {
            image: s.image,
            resources: ResourceLimits {
                cpus: s.cpus,
                memory_bytes: s.memory_bytes,
                pids_limit: s.pids_limit,
            },
            network: NetworkMode::None,
            mount_policy: MountPolicy::NoMounts,
            uid: s.uid,
            gid: s.gid,
            capabilities: CapabilityPolicy::DropAll,
            runtime: s.runtime,
            workspace_root: s.workspace_root,
            cache_volume: s.cache_volume,
            shadow_dirs: s.shadow_dirs,
            env: BTreeMap::new(),
            extra_hosts: Vec::new(),
            default_timeout: Duration::from_secs(s.default_timeout_secs),
        }
    }
}

impl TryFrom<&SandboxSettings> for SandboxConfiguration {
    type Error = Error;

    fn try_from(s: &SandboxSettings) -> Result<Self> {
        let config = Self {
            image: s.image.clone(),
            resources: ResourceLimits {
                cpus: s.cpus,
                memory_bytes: s.memory_bytes,
                pids_limit: s.pids_limit,
            },
            network: NetworkMode::parse(&s.network)?,
            mount_policy: MountPolicy::parse(&s.mount_policy, s.host_workspace.as_deref())?,
            uid: s.uid,
            gid: s.gid,
            capabilities: CapabilityPolicy::DropAll,
            runtime: s.runtime.clone(),
            workspace_root: s.workspace_root.clone(),
            cache_volume: s.cache_volume.clone(),
            shadow_dirs: s.shadow_dirs.clone(),
            env: s.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            extra_hosts: s.extra_hosts.clone(),
            default_timeout: Duration::from_secs(s.default_timeout_secs),
        };
        config.validate()?;
        Ok(config)
    }
}

impl SandboxConfiguration {
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn with_mount_policy(mut self, policy: MountPolicy) -> Self {
        self.mount_policy = policy;
        self
    }

    pub fn with_network(mut self, network: NetworkMode) -> Self {
        self.network = network;
        self
    }

    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = runtime.into();
        self
    }

    pub fn with_cache_volume(mut self, name: impl Into<String>) -> Self {
        self.cache_volume = Some(name.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_extra_host(mut self, entry: impl Into<String>) -> Self {
        self.extra_hosts.push(entry.into());
        self
    }

    pub fn with_resources(mut self, resources: ResourceLimits) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Numeric `uid:gid` the sandbox user runs as.
    pub fn user(&self) -> String {
        format!("{}:{}", self.uid, self.gid)
    }

    /// Check invariants the hardened container relies on.
    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(Error::invalid_request("image must not be empty"));
        }
        if self.uid == 0 || self.gid == 0 {
            return Err(Error::invalid_request(
                "sandbox user must be non-root (uid and gid > 0)",
            ));
        }
        if self.resources.cpus.is_nan() || self.resources.cpus <= 0.0 {
            return Err(Error::invalid_request("cpus must be positive"));
        }
        if self.resources.memory_bytes <= 0 {
            return Err(Error::invalid_request("memory_bytes must be positive"));
        }
        if self.default_timeout.is_zero() {
            return Err(Error::invalid_request(
                "default timeout must be positive (default_timeout_secs > 0)",
            ));
        }
        if self.runtime.trim().is_empty() {
            return Err(Error::invalid_request("isolation runtime must be named"));
        }
        if !self.workspace_root.starts_with('/') || self.workspace_root == "/" {
            return Err(Error::invalid_request(format!(
                "workspace_root '{}' must be an absolute directory below /",
                self.workspace_root
            )));
        }
        for dir in &self.shadow_dirs {
            if dir.starts_with('/') || dir.split('/').any(|p| p == "..") {
                return Err(Error::invalid_request(format!(
                    "shadow dir '{}' must be relative to the workspace root",
                    dir
                )));
            }
        }
        Ok(())
    }
}
