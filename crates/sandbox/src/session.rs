//! Sandbox sessions.
//!
//! A [`Sandbox`] owns exactly one container from creation to removal. The
//! only supported way to guarantee removal on every exit path is to call
//! [`Sandbox::stop`] or to run the session through [`with_sandbox`]; the
//! `Drop` impl is a safety net that logs and schedules a best-effort removal.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use agentbox_core::traits::EventEmitter;
use agentbox_core::{Error, EventEnvelope, EventSeverity, EventType, ExecPayload, FsPayload, Result};

use crate::archive::Owner;
use crate::config::SandboxConfiguration;
use crate::engine::ContainerEngine;
use crate::exec::CommandExecutor;
use crate::image::{ImageProvisioner, ImageRecipe};
use crate::lifecycle::{ContainerHandle, ContainerLifecycleManager, ContainerState};
use crate::paths::split_parent;
use crate::result::{ArtifactLocation, ExecutionRequest, ExecutionResult, ExecutionResultCollector};
use crate::security::{SecurityPosture, SecurityValidator};
use crate::transfer::FileTransferChannel;

const REQUIREMENTS_FILE: &str = "requirements.txt";

/// Options for opening a [`Sandbox`].
pub struct SandboxBuilder {
    engine: Arc<dyn ContainerEngine>,
    config: SandboxConfiguration,
    recipe: Option<ImageRecipe>,
    build_missing_image: bool,
    emitter: Option<Arc<dyn EventEmitter>>,
}

impl SandboxBuilder {
    /// Recipe used when the image is missing. Defaults to
    /// [`ImageRecipe::for_sandbox`].
    pub fn recipe(mut self, recipe: ImageRecipe) -> Self {
        self.recipe = Some(recipe);
        self
    }

    /// Build a missing image instead of failing with
    /// [`Error::ImageMissing`]. On by default.
    pub fn build_missing_image(mut self, build: bool) -> Self {
        self.build_missing_image = build;
        self
    }

    /// Emit audit events for this session.
    pub fn event_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Validate the environment, provision, and bring a container up.
    pub async fn open(self) -> Result<Sandbox> {
        let config = self.config;
        config.validate()?;

        let validator = SecurityValidator::new(self.engine.clone());
        let provisioner = ImageProvisioner::new(self.engine.clone());

        let posture = match validator.validate(&config).await {
            Ok(posture) => posture,
            Err(Error::ImageMissing(tag)) if self.build_missing_image => {
                let recipe = self
                    .recipe
                    .unwrap_or_else(|| ImageRecipe::for_sandbox(&config));
                provisioner.ensure_image(&tag, &recipe).await?;
                validator.validate(&config).await?
            }
            Err(e) => return Err(e),
        };

        if let Some(volume) = &config.cache_volume {
            provisioner.ensure_cache_volume(volume).await?;
        }

        let lifecycle = ContainerLifecycleManager::new(self.engine.clone());
        let mut handle = lifecycle.create(&config).await?;
        lifecycle.start(&mut handle).await?;

        let owner = Owner {
            uid: config.uid,
            gid: config.gid,
        };
        let sandbox = Sandbox {
            transfer: FileTransferChannel::new(self.engine.clone(), owner, &config.workspace_root),
            executor: CommandExecutor::new(self.engine.clone(), &config.workspace_root)
                .with_default_timeout(config.default_timeout),
            name: handle.name().to_string(),
            handle: Mutex::new(handle),
            lifecycle,
            engine: self.engine,
            config,
            posture,
            emitter: self.emitter,
        };

        info!(container = %sandbox.name, image = %sandbox.config.image, "Sandbox ready");
        sandbox
            .emit(
                EventType::SandboxCreated,
                &serde_json::json!({
                    "image": sandbox.config.image,
                    "runtime": sandbox.config.runtime,
                    "mount_policy": sandbox.config.mount_policy,
                }),
                EventSeverity::Info,
            )
            .await;
        Ok(sandbox)
    }

    /// Open a sandbox, run `f` with it and stop it afterwards, whatever `f`
    /// returned.
    pub async fn scoped<F, Fut, T>(self, f: F) -> Result<T>
    where
        F: FnOnce(Arc<Sandbox>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let sandbox = Arc::new(self.open().await?);
        let outcome = f(sandbox.clone()).await;
        let stopped = sandbox.stop().await;
        match (outcome, stopped) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(stop_err)) => {
                error!(error = %stop_err, "Sandbox removal failed while propagating an error");
                Err(e)
            }
        }
    }
}

/// A running, hardened container plus the components that drive it.
pub struct Sandbox {
    engine: Arc<dyn ContainerEngine>,
    config: SandboxConfiguration,
    posture: SecurityPosture,
    name: String,
    handle: Mutex<ContainerHandle>,
    lifecycle: ContainerLifecycleManager,
    transfer: FileTransferChannel,
    executor: CommandExecutor,
    emitter: Option<Arc<dyn EventEmitter>>,
}

impl Sandbox {
    pub fn builder(
        engine: Arc<dyn ContainerEngine>,
        config: SandboxConfiguration,
    ) -> SandboxBuilder {
        SandboxBuilder {
            engine,
            config,
            recipe: None,
            build_missing_image: true,
            emitter: None,
        }
    }

    /// Open a sandbox with default options.
    pub async fn open(
        engine: Arc<dyn ContainerEngine>,
        config: SandboxConfiguration,
    ) -> Result<Self> {
        Self::builder(engine, config).open().await
    }

    /// Container name, stable for the whole session.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &SandboxConfiguration {
        &self.config
    }

    /// Posture observed when the session was opened.
    pub fn posture(&self) -> &SecurityPosture {
        &self.posture
    }

    pub async fn state(&self) -> ContainerState {
        self.handle.lock().await.state()
    }

    async fn emit<P: Serialize>(
        &self,
        event_type: EventType,
        payload: &P,
        severity: EventSeverity,
    ) {
        if let Some(emitter) = &self.emitter {
            let payload = serde_json::to_value(payload).unwrap_or_default();
            emitter
                .emit(
                    EventEnvelope::new(event_type, payload)
                        .with_sandbox(&self.name)
                        .with_severity(severity),
                )
                .await;
        }
    }

    async fn emit_fs(
        &self,
        event_type: EventType,
        path: &str,
        operation: &str,
        size: Option<u64>,
        error: Option<&Error>,
    ) {
        let payload = FsPayload {
            path: path.to_string(),
            operation: operation.to_string(),
            size_bytes: size,
            success: error.is_none(),
            error: error.map(|e| e.to_string()),
        };
        let severity = if error.is_some() {
            EventSeverity::Warning
        } else {
            EventSeverity::Info
        };
        self.emit(event_type, &payload, severity).await;
    }

    async fn emit_exec(
        &self,
        event_type: EventType,
        command: &str,
        workdir: Option<&str>,
        outcome: &Result<ExecutionResult>,
        started: Instant,
    ) {
        let (exit_code, timed_out, severity) = match outcome {
            Ok(r) => (r.exit_code(), r.is_timed_out(), EventSeverity::Info),
            Err(_) => (crate::result::TRANSPORT_FAILURE_EXIT_CODE, false, EventSeverity::Error),
        };
        let payload = ExecPayload {
            command: command.to_string(),
            workdir: workdir.unwrap_or(&self.config.workspace_root).to_string(),
            exit_code,
            timed_out,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        self.emit(event_type, &payload, severity).await;
    }

    /// Write `content` to `path` (relative paths land in the workspace).
    /// Returns the absolute container path.
    pub async fn write(&self, path: &str, content: impl AsRef<[u8]>) -> Result<String> {
        let content = content.as_ref();
        let handle = self.handle.lock().await;
        let outcome = self.transfer.write(&handle, path, content).await;
        self.emit_fs(
            EventType::FileWritten,
            path,
            "write",
            Some(content.len() as u64),
            outcome.as_ref().err(),
        )
        .await;
        outcome
    }

    /// Read the file at `path` byte for byte.
    pub async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let handle = self.handle.lock().await;
        let outcome = self.transfer.read(&handle, path).await;
        let size = outcome.as_ref().ok().map(|b| b.len() as u64);
        self.emit_fs(EventType::FileRead, path, "read", size, outcome.as_ref().err())
            .await;
        outcome
    }

    /// Read a UTF-8 text file.
    pub async fn read_to_string(&self, path: &str) -> Result<String> {
        let bytes = self.read(path).await?;
        String::from_utf8(bytes).map_err(|_| Error::FileUnreadable {
            path: path.to_string(),
            reason: "content is not valid UTF-8".to_string(),
        })
    }

    /// Run a shell command in the workspace root.
    pub async fn run(&self, command: &str) -> Result<ExecutionResult> {
        self.run_in(command, None, None).await
    }

    /// Run a shell command in `workdir` with an optional timeout (the
    /// configured default otherwise).
    pub async fn run_in(
        &self,
        command: &str,
        workdir: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        let handle = self.handle.lock().await;
        let outcome = self.executor.run(&handle, command, workdir, timeout).await;
        drop(handle);
        self.emit_exec(EventType::CommandExecuted, command, workdir, &outcome, started)
            .await;
        outcome
    }

    /// Run a Python script body.
    pub async fn run_script(&self, body: &str) -> Result<ExecutionResult> {
        self.execute(&ExecutionRequest::script(body)).await
    }

    /// Run any [`ExecutionRequest`].
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let started = Instant::now();
        let handle = self.handle.lock().await;
        let collector = ExecutionResultCollector::new(&self.transfer, &self.executor);
        let outcome = collector.collect(&handle, request).await;
        drop(handle);

        let (event_type, command) = match request {
            ExecutionRequest::Command { command, .. } => {
                (EventType::CommandExecuted, command.clone())
            }
            ExecutionRequest::Script { interpreter, .. } => {
                (EventType::ScriptExecuted, format!("{} <script>", interpreter))
            }
        };
        self.emit_exec(event_type, &command, request.workdir(), &outcome, started)
            .await;
        outcome
    }

    /// Stage a host directory into the workspace root.
    pub async fn copy_tree_in(&self, host_dir: &Path) -> Result<()> {
        let handle = self.handle.lock().await;
        let outcome = self
            .transfer
            .copy_tree_in(&handle, host_dir, &self.config.workspace_root)
            .await;
        self.emit_fs(
            EventType::FileWritten,
            &host_dir.display().to_string(),
            "copy_tree_in",
            None,
            outcome.as_ref().err(),
        )
        .await;
        outcome
    }

    /// Copy the whole workspace out under `host_dest`.
    ///
    /// Returns the host directory that mirrors the workspace root.
    pub async fn copy_workspace_out(&self, host_dest: &Path) -> Result<ArtifactLocation> {
        let root = self.config.workspace_root.clone();
        let handle = self.handle.lock().await;
        handle.ensure_running()?;
        let outcome = self.transfer.copy_tree_out(&handle, &root, host_dest).await;
        self.emit_fs(
            EventType::FileRead,
            &root,
            "copy_tree_out",
            outcome.as_ref().ok().map(|n| *n as u64),
            outcome.as_ref().err(),
        )
        .await;
        outcome?;
        let (_, base) = split_parent(&root);
        Ok(ArtifactLocation::Host(host_dest.join(base)))
    }

    /// Install the workspace's `requirements.txt` with `uv`.
    ///
    /// `Ok(None)` when there is no requirements file; a failed install is
    /// returned as data.
    pub async fn install_requirements(&self) -> Result<Option<ExecutionResult>> {
        let found = self.run(&format!("test -f {}", REQUIREMENTS_FILE)).await?;
        if !found.success() {
            return Ok(None);
        }
        info!(container = %self.name, "Installing workspace requirements");
        let result = self
            .run(&format!("uv pip install --system -r {}", REQUIREMENTS_FILE))
            .await?;
        if !result.success() {
            warn!(
                container = %self.name,
                exit_code = result.exit_code(),
                "Requirements install failed"
            );
        }
        Ok(Some(result))
    }

    /// Remove the container. Safe to call more than once; every later
    /// operation fails with "not running".
    pub async fn stop(&self) -> Result<()> {
        let mut handle = self.handle.lock().await;
        if handle.state() == ContainerState::Removed {
            return Ok(());
        }
        self.lifecycle.remove(&mut handle).await?;
        drop(handle);
        self.emit(
            EventType::SandboxDestroyed,
            &serde_json::json!({ "image": self.config.image }),
            EventSeverity::Info,
        )
        .await;
        Ok(())
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        let handle = self.handle.get_mut();
        if handle.state() == ContainerState::Removed {
            return;
        }
        warn!(container = %self.name, "Sandbox dropped without stop(), scheduling removal");
        let engine = self.engine.clone();
        let id = handle.id().to_string();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = engine.container_remove(&id).await {
                        error!(container = %id, error = %e, "Best-effort removal failed");
                    }
                });
            }
            Err(_) => error!(container = %self.name, "No runtime available, container leaked"),
        }
    }
}

/// Open a sandbox, run `f` with it and always stop it afterwards.
///
/// ```ignore
/// let out = with_sandbox(engine, config, |sandbox| async move {
///     sandbox.write("a.txt", "hello\n").await?;
///     sandbox.run("cat a.txt").await
/// })
/// .await?;
/// ```
pub async fn with_sandbox<F, Fut, T>(
    engine: Arc<dyn ContainerEngine>,
    config: SandboxConfiguration,
    f: F,
) -> Result<T>
where
    F: FnOnce(Arc<Sandbox>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    Sandbox::builder(engine, config).scoped(f).await
}

/// One-shot execution: stage `repo` (if any) into a fresh sandbox, run
/// `request`, copy the workspace out to a new `sandbox_artifacts_<id>`
/// directory under `artifacts_parent` and remove the container.
///
/// A non-zero exit is returned as data with the artifacts attached.
pub async fn run_once(
    engine: Arc<dyn ContainerEngine>,
    config: SandboxConfiguration,
    repo: Option<PathBuf>,
    request: ExecutionRequest,
    artifacts_parent: PathBuf,
) -> Result<ExecutionResult> {
    with_sandbox(engine, config, |sandbox| async move {
        if let Some(repo) = &repo {
            sandbox.copy_tree_in(repo).await?;
        }
        let result = sandbox.execute(&request).await?;

        let dest = artifacts_parent.join(format!(
            "sandbox_artifacts_{}",
            uuid::Uuid::new_v4().simple()
        ));
        let location = sandbox.copy_workspace_out(&dest).await?;
        info!(
            container = %sandbox.name(),
            exit_code = result.exit_code(),
            artifacts = %dest.display(),
            "One-shot run finished"
        );
        Ok(result.with_artifacts(location))
    })
    .await
}
