//! Docker Engine API backend using the `bollard` crate.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
    ListContainersOptions, LogOutput, RemoveContainerOptions, StopContainerOptions,
    UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::BuildImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::volume::CreateVolumeOptions;
use bytes::Bytes;
use futures::StreamExt;
use tracing::{debug, instrument};

use super::{
    ContainerEngine, ContainerSpec, ContainerStatus, ContainerSummary, EngineError, EngineInfo,
    EngineResult, ExecOutput, MountSpec,
};
use crate::archive::{self, Owner};

/// Grace period handed to the daemon when stopping a container.
const STOP_GRACE_SECS: i64 = 5;

/// Docker-based engine talking to the daemon over its local socket.
pub struct DockerEngine {
    docker: bollard::Docker,
}

impl DockerEngine {
    /// Connect to the local Docker daemon (honours `DOCKER_HOST`).
    pub fn new() -> EngineResult<Self> {
        let docker = bollard::Docker::connect_with_local_defaults().map_err(|e| {
            EngineError::Unavailable(format!(
                "Failed to connect to Docker daemon: {}. Is Docker running?",
                e
            ))
        })?;
        Ok(Self { docker })
    }

    /// Create from an existing bollard Docker client.
    pub fn from_client(docker: bollard::Docker) -> Self {
        Self { docker }
    }
}

fn map_err(e: bollard::errors::Error) -> EngineError {
    use bollard::errors::Error as E;
    match e {
        E::DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::NotFound(message),
        E::DockerResponseServerError {
            status_code: 409,
            message,
        } => EngineError::Conflict(message),
        E::DockerResponseServerError {
            status_code,
            message,
        } => EngineError::Api(format!("{} {}", status_code, message)),
        other => EngineError::Api(other.to_string()),
    }
}

fn host_config(spec: &ContainerSpec) -> HostConfig {
    let mut binds = Vec::new();
    let mut mounts = Vec::new();
    let mut tmpfs = HashMap::new();

    for mount in &spec.mounts {
        match mount {
            MountSpec::Bind {
                source,
                target,
                read_only,
            } => {
                let mode = if *read_only { "ro" } else { "rw" };
                binds.push(format!("{}:{}:{}", source, target, mode));
            }
            MountSpec::Volume { name, target } => mounts.push(Mount {
                target: Some(target.clone()),
                source: Some(name.clone()),
                typ: Some(MountTypeEnum::VOLUME),
                ..Default::default()
            }),
            MountSpec::Shadow { target } => {
                tmpfs.insert(target.clone(), String::new());
            }
        }
    }

    HostConfig {
        runtime: spec.runtime.clone(),
        cap_drop: Some(spec.cap_drop.clone()),
        security_opt: Some(spec.security_opt.clone()),
        network_mode: Some(spec.network_mode.clone()),
        memory: spec.memory_bytes,
        nano_cpus: spec.nano_cpus,
        pids_limit: spec.pids_limit,
        binds: (!binds.is_empty()).then_some(binds),
        mounts: (!mounts.is_empty()).then_some(mounts),
        tmpfs: (!tmpfs.is_empty()).then_some(tmpfs),
        extra_hosts: (!spec.extra_hosts.is_empty()).then(|| spec.extra_hosts.clone()),
        init: Some(spec.init),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    fn backend_name(&self) -> &'static str {
        "docker-api"
    }

    async fn info(&self) -> EngineResult<EngineInfo> {
        let info = self.docker.info().await.map_err(|e| {
            EngineError::Unavailable(format!("Failed to query Docker daemon info: {}", e))
        })?;

        let mut runtimes: Vec<String> = info.runtimes.unwrap_or_default().into_keys().collect();
        runtimes.sort();

        Ok(EngineInfo {
            security_options: info.security_options.unwrap_or_default(),
            runtimes,
            server_version: info.server_version,
        })
    }

    async fn image_exists(&self, tag: &str) -> EngineResult<bool> {
        match self.docker.inspect_image(tag).await {
            Ok(_) => Ok(true),
            Err(e) => match map_err(e) {
                EngineError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    #[instrument(skip(self, context_dir), fields(backend = "docker-api"))]
    async fn image_build(&self, context_dir: &Path, tag: &str) -> EngineResult<()> {
        let context = archive::pack_dir(context_dir, Owner { uid: 0, gid: 0 })?;

        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        let mut stream = self.docker.build_image(options, None, Some(Bytes::from(context)));
        while let Some(msg) = stream.next().await {
            let info = msg.map_err(map_err)?;
            if let Some(error) = info.error {
                return Err(EngineError::Api(format!("image build failed: {}", error)));
            }
            if let Some(line) = info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    debug!(tag = %tag, "{}", line);
                }
            }
        }
        Ok(())
    }

    async fn volume_ensure(&self, name: &str) -> EngineResult<()> {
        match self.docker.inspect_volume(name).await {
            Ok(_) => return Ok(()),
            Err(e) => {
                let e = map_err(e);
                if !e.is_not_found() {
                    return Err(e);
                }
            }
        }

        let options = CreateVolumeOptions {
            name: name.to_string(),
            ..Default::default()
        };
        match self.docker.create_volume(options).await {
            Ok(_) => Ok(()),
            Err(e) => match map_err(e) {
                // Lost a creation race: the volume exists, which is all we need.
                EngineError::Conflict(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    #[instrument(skip(self, spec), fields(backend = "docker-api", image = %spec.image))]
    async fn container_create(&self, name: &str, spec: &ContainerSpec) -> EngineResult<String> {
        let container_config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            user: Some(spec.user.clone()),
            working_dir: Some(spec.working_dir.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            tty: Some(false),
            host_config: Some(host_config(spec)),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(map_err)?;

        for warning in &response.warnings {
            debug!(container = %name, warning = %warning, "Docker create warning");
        }
        Ok(response.id)
    }

    async fn container_start(&self, id: &str) -> EngineResult<()> {
        self.docker
            .start_container::<String>(id, None)
            .await
            .map_err(map_err)
    }

    async fn container_exec(
        &self,
        id: &str,
        argv: &[String],
        workdir: &str,
        user: Option<&str>,
    ) -> EngineResult<ExecOutput> {
        let exec_options = CreateExecOptions {
            cmd: Some(argv.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            working_dir: Some(workdir.to_string()),
            user: user.map(str::to_string),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(id, exec_options)
            .await
            .map_err(map_err)?;

        let start_result = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(map_err)?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        if let StartExecResults::Attached { mut output, .. } = start_result {
            while let Some(msg) = output.next().await {
                match msg.map_err(map_err)? {
                    LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
                    LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                    // Without a TTY everything is multiplexed; ignore the rest
                    _ => {}
                }
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await.map_err(map_err)?;

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: inspect.exit_code.unwrap_or(-1),
        })
    }

    async fn container_inspect(&self, id: &str) -> EngineResult<Option<ContainerStatus>> {
        let response = match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                return match map_err(e) {
                    EngineError::NotFound(_) => Ok(None),
                    other => Err(other),
                }
            }
        };

        let state = response.state.unwrap_or_default();
        Ok(Some(ContainerStatus {
            status: state.status.map(|s| s.to_string()).unwrap_or_default(),
            running: state.running.unwrap_or(false),
            oom_killed: state.oom_killed.unwrap_or(false),
            exit_code: state.exit_code,
        }))
    }

    async fn container_stop(&self, id: &str) -> EngineResult<()> {
        match self
            .docker
            .stop_container(id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_err(e)),
        }
    }

    async fn container_remove(&self, id: &str) -> EngineResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) => match map_err(e) {
                EngineError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn archive_inject(&self, id: &str, target_dir: &str, archive: Bytes) -> EngineResult<()> {
        let options = UploadToContainerOptions {
            path: target_dir.to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(id, Some(options), archive)
            .await
            .map_err(map_err)
    }

    async fn archive_extract(&self, id: &str, source_path: &str) -> EngineResult<Bytes> {
        let options = DownloadFromContainerOptions {
            path: source_path.to_string(),
        };
        let mut stream = self.docker.download_from_container(id, Some(options));
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk.map_err(map_err)?);
        }
        Ok(Bytes::from(buf))
    }

    async fn list_containers(&self, label: &str) -> EngineResult<Vec<ContainerSummary>> {
        let options = ListContainersOptions {
            all: true,
            filters: HashMap::from([("label".to_string(), vec![label.to_string()])]),
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(map_err)?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                state: c.state.map(|s| s.to_string()).unwrap_or_default(),
            })
            .collect())
    }
}
