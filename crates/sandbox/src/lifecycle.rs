//! Container lifecycle: create, start and unconditional removal.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use agentbox_core::{Error, Result};

use crate::config::{MountPolicy, SandboxConfiguration, CACHE_MOUNT};
use crate::engine::{
    ContainerEngine, ContainerSpec, MountSpec, MANAGED_BY_LABEL, MANAGED_BY_VALUE,
};
use crate::paths::{join_path, normalize_path};

/// Lifecycle state of a sandbox container.
///
/// `Uncreated → Created → Running → Stopped → Removed`; `Removed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Uncreated,
    Created,
    Running,
    Stopped,
    Removed,
}

impl ContainerState {
    fn can_become(self, next: ContainerState) -> bool {
        use ContainerState::*;
        matches!(
            (self, next),
            (Uncreated, Created)
                | (Created, Running)
                | (Running, Stopped)
                | (Stopped, Running)
                | (_, Removed)
        ) && self != Removed
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uncreated => "uncreated",
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// Exclusive handle to one sandbox container.
///
/// Not `Clone`: the owning sandbox is the only holder.
#[derive(Debug)]
pub struct ContainerHandle {
    id: String,
    name: String,
    state: ContainerState,
}

impl ContainerHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }

    /// Fail with "not running" unless the container is running.
    pub fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::not_running(format!(
                "container '{}' is {}",
                self.name, self.state
            )))
        }
    }

    fn transition(&mut self, next: ContainerState) -> Result<()> {
        if !self.state.can_become(next) {
            return Err(Error::internal(format!(
                "invalid container state transition {} -> {} for '{}'",
                self.state, next, self.name
            )));
        }
        debug!(container = %self.name, from = %self.state, to = %next, "Container state change");
        self.state = next;
        Ok(())
    }
}

/// Fresh, unique container name.
pub fn container_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("agentbox-{}", &id[..12])
}

/// Hardened create-time options for `config`.
pub fn container_spec(config: &SandboxConfiguration) -> ContainerSpec {
    let mut env: Vec<String> = config
        .env
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();

    let mut mounts = Vec::new();
    if let MountPolicy::WorkspaceBind { host_path } = &config.mount_policy {
        mounts.push(MountSpec::Bind {
            source: host_path.clone(),
            target: config.workspace_root.clone(),
            read_only: false,
        });
        for dir in &config.shadow_dirs {
            mounts.push(MountSpec::Shadow {
                target: normalize_path(&join_path(&config.workspace_root, dir)),
            });
        }
    }
    if let Some(volume) = &config.cache_volume {
        mounts.push(MountSpec::Volume {
            name: volume.clone(),
            target: CACHE_MOUNT.to_string(),
        });
        if !config.env.contains_key("UV_CACHE_DIR") {
            env.push(format!("UV_CACHE_DIR={}", CACHE_MOUNT));
        }
    }

    let mut labels = HashMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());

    ContainerSpec {
        image: config.image.clone(),
        cmd: vec!["sleep".into(), "infinity".into()],
        user: config.user(),
        working_dir: config.workspace_root.clone(),
        env,
        labels,
        runtime: Some(config.runtime.clone()),
        cap_drop: config.capabilities.dropped(),
        security_opt: vec!["no-new-privileges:true".into()],
        network_mode: config.network.as_engine_mode().to_string(),
        memory_bytes: Some(config.resources.memory_bytes),
        nano_cpus: Some(config.resources.nano_cpus()),
        pids_limit: (config.resources.pids_limit > 0).then_some(config.resources.pids_limit),
        mounts,
        extra_hosts: config.extra_hosts.clone(),
        init: true,
    }
}

/// Drives a single container through its lifecycle.
pub struct ContainerLifecycleManager {
    engine: Arc<dyn ContainerEngine>,
}

impl ContainerLifecycleManager {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }

    /// Create a hardened container. A failed create is followed by a
    /// best-effort removal of whatever the engine left behind.
    #[instrument(skip(self, config), fields(image = %config.image))]
    pub async fn create(&self, config: &SandboxConfiguration) -> Result<ContainerHandle> {
        let spec = container_spec(config);
        let mut handle = ContainerHandle {
            id: String::new(),
            name: container_name(),
            state: ContainerState::Uncreated,
        };

        match self.engine.container_create(&handle.name, &spec).await {
            Ok(id) => {
                handle.id = id;
                handle.transition(ContainerState::Created)?;
                info!(container = %handle.name, id = %short(&handle.id), "Container created");
                Ok(handle)
            }
            Err(e) => {
                warn!(container = %handle.name, error = %e, "Container create failed");
                if let Err(cleanup) = self.engine.container_remove(&handle.name).await {
                    debug!(
                        container = %handle.name,
                        error = %cleanup,
                        "Cleanup after failed create"
                    );
                }
                Err(Error::container_runtime(format!(
                    "failed to create container '{}': {}",
                    handle.name, e
                )))
            }
        }
    }

    /// Start the container. Starting a running container is a no-op.
    #[instrument(skip(self, handle), fields(container = %handle.name))]
    pub async fn start(&self, handle: &mut ContainerHandle) -> Result<()> {
        match handle.state {
            ContainerState::Running => return Ok(()),
            ContainerState::Uncreated | ContainerState::Removed => {
                return Err(Error::not_running(format!(
                    "container '{}' is {}",
                    handle.name, handle.state
                )))
            }
            ContainerState::Created | ContainerState::Stopped => {}
        }

        if let Err(e) = self.engine.container_start(&handle.id).await {
            warn!(error = %e, "Container start failed");
            if let Err(cleanup) = self.remove(handle).await {
                warn!(error = %cleanup, "Cleanup after failed start also failed");
            }
            return Err(Error::container_runtime(format!(
                "failed to start container '{}': {}",
                handle.name, e
            )));
        }
        handle.transition(ContainerState::Running)?;
        info!("Container running");
        Ok(())
    }

    /// Stop (when running) and force-delete the container.
    ///
    /// Safe to call repeatedly. On an engine failure the state is left as is
    /// so that removal can be retried.
    #[instrument(skip(self, handle), fields(container = %handle.name))]
    pub async fn remove(&self, handle: &mut ContainerHandle) -> Result<()> {
        match handle.state {
            ContainerState::Removed => return Ok(()),
            ContainerState::Uncreated => return handle.transition(ContainerState::Removed),
            ContainerState::Running => {
                if let Err(e) = self.engine.container_stop(&handle.id).await {
                    debug!(error = %e, "Stop before removal failed, forcing removal");
                }
                handle.transition(ContainerState::Stopped)?;
            }
            ContainerState::Created | ContainerState::Stopped => {}
        }

        self.engine.container_remove(&handle.id).await.map_err(|e| {
            Error::container_runtime(format!(
                "failed to remove container '{}': {}",
                handle.name, e
            ))
        })?;
        handle.transition(ContainerState::Removed)?;
        info!("Container removed");
        Ok(())
    }

    /// Names of all containers this crate created that the engine still knows.
    pub async fn list_managed(&self) -> Result<Vec<String>> {
        let label = format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE);
        let containers = self
            .engine
            .list_containers(&label)
            .await
            .map_err(|e| Error::container_runtime(format!("container listing failed: {}", e)))?;
        Ok(containers.into_iter().map(|c| c.name).collect())
    }
}

fn short(id: &str) -> &str {
    &id[..id.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkMode;
    use crate::engine::{MockEngine, MockFailure};

    fn engine() -> Arc<MockEngine> {
        Arc::new(MockEngine::new().with_image("agentbox-sandbox:latest"))
    }

    #[test]
    fn test_spec_is_hardened_without_mounts() {
        let spec = container_spec(&SandboxConfiguration::default());
        assert_eq!(spec.runtime.as_deref(), Some("runsc"));
        assert_eq!(spec.cap_drop, vec!["ALL"]);
        assert_eq!(spec.security_opt, vec!["no-new-privileges:true"]);
        assert_eq!(spec.user, "1000:1000");
        assert_eq!(spec.network_mode, "none");
        assert!(spec.mounts.is_empty());
        assert!(spec.init);
        assert_eq!(spec.labels.get(MANAGED_BY_LABEL).map(String::as_str), Some(MANAGED_BY_VALUE));
    }

    #[test]
    fn test_spec_bind_adds_shadow_mounts() {
        let config = SandboxConfiguration::default()
            .with_mount_policy(MountPolicy::WorkspaceBind {
                host_path: "/home/me/repo".into(),
            })
            .with_network(NetworkMode::Bridge)
            .with_cache_volume("agent_uv_cache");
        let spec = container_spec(&config);

        let host_mounts: Vec<_> = spec.mounts.iter().filter(|m| m.is_host_mount()).collect();
        assert_eq!(host_mounts.len(), 1);
        assert!(spec.mounts.contains(&MountSpec::Shadow {
            target: "/workspace/.venv".into()
        }));
        assert!(spec.mounts.contains(&MountSpec::Shadow {
            target: "/workspace/venv".into()
        }));
        assert!(spec.mounts.contains(&MountSpec::Volume {
            name: "agent_uv_cache".into(),
            target: "/uv_cache".into()
        }));
        assert!(spec.env.contains(&"UV_CACHE_DIR=/uv_cache".to_string()));
        assert_eq!(spec.network_mode, "bridge");
    }

    #[tokio::test]
    async fn test_create_start_remove() {
        let engine = engine();
        let manager = ContainerLifecycleManager::new(engine.clone());

        let mut handle = manager.create(&SandboxConfiguration::default()).await.unwrap();
        assert_eq!(handle.state(), ContainerState::Created);
        assert!(handle.name().starts_with("agentbox-"));

        manager.start(&mut handle).await.unwrap();
        manager.start(&mut handle).await.unwrap();
        assert_eq!(handle.state(), ContainerState::Running);
        assert_eq!(manager.list_managed().await.unwrap(), vec![handle.name().to_string()]);

        manager.remove(&mut handle).await.unwrap();
        manager.remove(&mut handle).await.unwrap();
        assert_eq!(handle.state(), ContainerState::Removed);
        assert!(engine.container_names().is_empty());
        assert!(manager.start(&mut handle).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_start_removes_container() {
        let engine = engine();
        engine.fail(MockFailure::Start);
        let manager = ContainerLifecycleManager::new(engine.clone());

        let mut handle = manager.create(&SandboxConfiguration::default()).await.unwrap();
        let err = manager.start(&mut handle).await.unwrap_err();

        assert!(matches!(err, Error::ContainerRuntime(_)));
        assert_eq!(handle.state(), ContainerState::Removed);
        assert!(engine.container_names().is_empty());
    }

    #[tokio::test]
    async fn test_failed_create_is_runtime_error() {
        let engine = engine();
        engine.fail(MockFailure::Create);
        let manager = ContainerLifecycleManager::new(engine.clone());

        let err = manager.create(&SandboxConfiguration::default()).await.unwrap_err();
        assert!(matches!(err, Error::ContainerRuntime(_)));
        assert_eq!(engine.remove_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_remove_can_be_retried() {
        let engine = engine();
        let manager = ContainerLifecycleManager::new(engine.clone());
        let mut handle = manager.create(&SandboxConfiguration::default()).await.unwrap();
        manager.start(&mut handle).await.unwrap();

        engine.fail(MockFailure::Remove);
        assert!(manager.remove(&mut handle).await.is_err());
        assert_ne!(handle.state(), ContainerState::Removed);

        engine.recover(MockFailure::Remove);
        manager.remove(&mut handle).await.unwrap();
        assert_eq!(handle.state(), ContainerState::Removed);
        assert!(engine.container_names().is_empty());
    }
}
