//! Command execution inside a running sandbox container.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, instrument, warn};

use agentbox_core::{Error, Result};

use crate::engine::ContainerEngine;
use crate::lifecycle::ContainerHandle;
use crate::paths::{confine, normalize_path};
use crate::result::ExecutionResult;

/// Exit status of a process killed by SIGKILL.
const SIGKILL_EXIT_CODE: i64 = 137;

/// Runs shell commands in a container and captures their output.
pub struct CommandExecutor {
    engine: Arc<dyn ContainerEngine>,
    workspace_root: String,
    default_timeout: Option<Duration>,
}

impl CommandExecutor {
    pub fn new(engine: Arc<dyn ContainerEngine>, workspace_root: &str) -> Self {
        Self {
            engine,
            workspace_root: normalize_path(workspace_root),
            default_timeout: None,
        }
    }

    /// Timeout applied when a call passes none.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn workspace_root(&self) -> &str {
        &self.workspace_root
    }

    /// Run `command` through `sh -c` in `workdir` (default: the workspace
    /// root, which `workdir` must stay inside).
    ///
    /// A non-zero exit of the command is returned as data. Engine failures
    /// are [`Error::ContainerRuntime`]; a process killed for exceeding the
    /// memory ceiling is [`Error::ResourceLimitExceeded`]. On timeout the
    /// exec is abandoned and a timed-out result is returned; the process may
    /// keep running until the container is removed.
    #[instrument(skip(self, handle), fields(container = %handle.name()))]
    pub async fn run(
        &self,
        handle: &ContainerHandle,
        command: &str,
        workdir: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult> {
        handle.ensure_running()?;
        let workdir = confine(&self.workspace_root, workdir.unwrap_or(&self.workspace_root))?;
        let argv = vec!["sh".to_string(), "-c".to_string(), command.to_string()];

        let started = Instant::now();
        let exec = self.engine.container_exec(handle.id(), &argv, &workdir, None);
        let outcome = match timeout.or(self.default_timeout) {
            Some(limit) => match tokio::time::timeout(limit, exec).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(timeout_secs = limit.as_secs_f64(), "Command timed out");
                    return Ok(ExecutionResult::timed_out(limit));
                }
            },
            None => exec.await,
        };

        let output = outcome.map_err(|e| {
            Error::container_runtime(format!("exec in '{}' failed: {}", handle.name(), e))
        })?;

        if output.exit_code == SIGKILL_EXIT_CODE {
            self.check_oom(handle).await?;
        }

        debug!(
            exit_code = output.exit_code,
            duration_ms = started.elapsed().as_millis() as u64,
            "Command finished"
        );
        Ok(ExecutionResult::from_output(&output))
    }

    async fn check_oom(&self, handle: &ContainerHandle) -> Result<()> {
        match self.engine.container_inspect(handle.id()).await {
            Ok(Some(status)) if status.oom_killed => Err(Error::ResourceLimitExceeded(format!(
                "container '{}' was killed for exceeding its memory limit",
                handle.name()
            ))),
            Ok(_) => Ok(()),
            Err(e) => {
                debug!(error = %e, "Inspect after SIGKILL failed");
                Ok(())
            }
        }
    }
}
