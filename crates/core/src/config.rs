//! Application configuration.
//!
//! Layered the usual way: `config/default` → `config/{AGENTBOX_ENV}` →
//! `config/local` → `AGENTBOX__*` environment variables. Every section has
//! defaults, so an absent file is not an error.

use std::collections::HashMap;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub sandbox: SandboxSettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    /// `sdk` (Docker Engine API) or `cli` (shell out to the docker binary).
    pub backend: String,
    /// Binary used by the `cli` backend.
    pub docker_bin: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: "sdk".into(),
            docker_bin: "docker".into(),
        }
    }
}

/// Raw sandbox settings as they appear in configuration files.
///
/// Enum-like fields stay strings here; the sandbox crate validates them when
/// converting into its typed configuration.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SandboxSettings {
    pub image: String,
    pub cpus: f64,
    pub memory_bytes: i64,
    pub pids_limit: i64,
    pub network: String,
    pub mount_policy: String,
    /// Host directory bound at the workspace root when `mount_policy` is
    /// `workspace-bind`.
    pub host_workspace: Option<String>,
    pub uid: u32,
    pub gid: u32,
    pub runtime: String,
    pub workspace_root: String,
    pub cache_volume: Option<String>,
    pub shadow_dirs: Vec<String>,
    pub env: HashMap<String, String>,
    pub extra_hosts: Vec<String>,
    pub default_timeout_secs: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            image: "agentbox-sandbox:latest".into(),
            cpus: 4.0,
            memory_bytes: 8 * 1024 * 1024 * 1024, // 8GB
            pids_limit: 256,
            network: "none".into(),
            mount_policy: "no-mounts".into(),
            host_workspace: None,
            uid: 1000,
            gid: 1000,
            runtime: "runsc".into(),
            workspace_root: "/workspace".into(),
            cache_volume: None,
            shadow_dirs: vec![".venv".into(), "venv".into()],
            env: HashMap::new(),
            extra_hosts: Vec::new(),
            default_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub json: bool,
    /// Append-only JSON lines file receiving sandbox audit events.
    pub audit_log_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,agentbox=debug".into(),
            json: false,
            audit_log_path: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from the `config/` directory and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory.
    pub fn load_from(dir: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("AGENTBOX_ENV").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name(&format!("{}/default", dir)).required(false))
            .add_source(File::with_name(&format!("{}/{}", dir, env)).required(false))
            .add_source(File::with_name(&format!("{}/local", dir)).required(false))
            // Map AGENTBOX__SANDBOX__IMAGE=foo to sandbox.image
            .add_source(Environment::with_prefix("AGENTBOX").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
