//! Execution requests, results and script collection.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use agentbox_core::Result;

use crate::engine::ExecOutput;
use crate::exec::CommandExecutor;
use crate::lifecycle::ContainerHandle;
use crate::paths::{confine, join_path, shell_quote};
use crate::transfer::FileTransferChannel;

/// Exit code reported when a command exceeded its timeout.
pub const TIMEOUT_EXIT_CODE: i64 = 124;
/// Exit code reported when the engine could not run the command at all.
pub const TRANSPORT_FAILURE_EXIT_CODE: i64 = -1;

/// Where the artifacts of a run can be found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "path")]
pub enum ArtifactLocation {
    /// Copied out to this host directory.
    Host(PathBuf),
    /// Left in place at this path inside the container.
    Container(String),
}

impl std::fmt::Display for ArtifactLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host(path) => write!(f, "{}", path.display()),
            Self::Container(path) => write!(f, "container:{}", path),
        }
    }
}

/// Captured outcome of one command. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    stdout: String,
    stderr: String,
    exit_code: i64,
    timed_out: bool,
    artifacts: Option<ArtifactLocation>,
}

impl ExecutionResult {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>, exit_code: i64) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
            timed_out: false,
            artifacts: None,
        }
    }

    /// Result of a completed exec. Output is decoded lossily.
    pub fn from_output(output: &ExecOutput) -> Self {
        Self::new(output.stdout_lossy(), output.stderr_lossy(), output.exit_code)
    }

    /// Result for a command abandoned after `timeout`.
    pub fn timed_out(timeout: Duration) -> Self {
        Self {
            timed_out: true,
            ..Self::new(
                String::new(),
                format!("command timed out after {}s", timeout.as_secs_f64()),
                TIMEOUT_EXIT_CODE,
            )
        }
    }

    /// Result standing in for a command the engine never ran.
    pub fn transport_failure(diagnostic: impl Into<String>) -> Self {
        Self::new(String::new(), diagnostic, TRANSPORT_FAILURE_EXIT_CODE)
    }

    /// Copy of this result pointing at `location`.
    pub fn with_artifacts(mut self, location: ArtifactLocation) -> Self {
        self.artifacts = Some(location);
        self
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn exit_code(&self) -> i64 {
        self.exit_code
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn artifacts(&self) -> Option<&ArtifactLocation> {
        self.artifacts.as_ref()
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// What to run inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ExecutionRequest {
    /// A shell command line.
    Command {
        command: String,
        workdir: Option<String>,
        timeout_ms: Option<u64>,
    },
    /// A script body run by `interpreter`.
    Script {
        body: String,
        interpreter: String,
        workdir: Option<String>,
        timeout_ms: Option<u64>,
    },
}

impl ExecutionRequest {
    pub fn command(command: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            workdir: None,
            timeout_ms: None,
        }
    }

    /// A Python script.
    pub fn script(body: impl Into<String>) -> Self {
        Self::Script {
            body: body.into(),
            interpreter: "python".into(),
            workdir: None,
            timeout_ms: None,
        }
    }

    pub fn with_interpreter(mut self, name: impl Into<String>) -> Self {
        if let Self::Script { interpreter, .. } = &mut self {
            *interpreter = name.into();
        }
        self
    }

    pub fn in_dir(mut self, dir: impl Into<String>) -> Self {
        match &mut self {
            Self::Command { workdir, .. } | Self::Script { workdir, .. } => {
                *workdir = Some(dir.into())
            }
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        match &mut self {
            Self::Command { timeout_ms, .. } | Self::Script { timeout_ms, .. } => {
                // Round up so a sub-millisecond limit never becomes zero.
                let ms = timeout.as_nanos().div_ceil(1_000_000);
                *timeout_ms = Some(u64::try_from(ms).unwrap_or(u64::MAX))
            }
        }
        self
    }

    pub fn workdir(&self) -> Option<&str> {
        match self {
            Self::Command { workdir, .. } | Self::Script { workdir, .. } => workdir.as_deref(),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        match self {
            Self::Command { timeout_ms, .. } | Self::Script { timeout_ms, .. } => {
                timeout_ms.map(Duration::from_millis)
            }
        }
    }
}

/// Suffix extension for a script file run by `interpreter`.
fn script_extension(interpreter: &str) -> &'static str {
    let name = interpreter.rsplit('/').next().unwrap_or(interpreter);
    if name.starts_with("python") {
        "py"
    } else if matches!(name, "sh" | "bash") {
        "sh"
    } else if name == "node" {
        "js"
    } else {
        "txt"
    }
}

/// Runs requests and folds their output into [`ExecutionResult`]s.
pub struct ExecutionResultCollector<'a> {
    transfer: &'a FileTransferChannel,
    executor: &'a CommandExecutor,
}

impl<'a> ExecutionResultCollector<'a> {
    pub fn new(transfer: &'a FileTransferChannel, executor: &'a CommandExecutor) -> Self {
        Self { transfer, executor }
    }

    /// Run any request.
    pub async fn collect(
        &self,
        handle: &ContainerHandle,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult> {
        match request {
            ExecutionRequest::Command { command, .. } => {
                self.executor
                    .run(handle, command, request.workdir(), request.timeout())
                    .await
            }
            ExecutionRequest::Script {
                body, interpreter, ..
            } => {
                self.run_script(
                    handle,
                    body,
                    interpreter,
                    request.workdir(),
                    request.timeout(),
                )
                .await
            }
        }
    }

    /// Write `body` to a uniquely named file in the workspace, run it with
    /// `interpreter` and delete it again.
    ///
    /// Deleting the file is best effort: a failed cleanup is logged and
    /// never changes the result.
    pub async fn run_script(
        &self,
        handle: &ContainerHandle,
        body: &str,
        interpreter: &str,
        workdir: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult> {
        let name = format!(
            "temp_script_{}.{}",
            uuid::Uuid::new_v4().simple(),
            script_extension(interpreter)
        );
        // Confine before anything is written.
        let root = self.executor.workspace_root();
        let dir = confine(root, workdir.unwrap_or(root))?;
        let path = self
            .transfer
            .write(handle, &join_path(&dir, &name), body.as_bytes())
            .await?;
        debug!(path = %path, interpreter, "Running script");

        let command = format!("{} {}", interpreter, shell_quote(&path));
        let outcome = self.executor.run(handle, &command, workdir, timeout).await;

        let cleanup = format!("rm -f -- {}", shell_quote(&path));
        match self.executor.run(handle, &cleanup, None, None).await {
            Ok(r) if r.success() => {}
            Ok(r) => warn!(path = %path, stderr = %r.stderr(), "Could not delete temporary script"),
            Err(e) => warn!(path = %path, error = %e, "Could not delete temporary script"),
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timed_out_result() {
        let result = ExecutionResult::timed_out(Duration::from_secs(5));
        assert!(result.is_timed_out());
        assert_eq!(result.exit_code(), TIMEOUT_EXIT_CODE);
        assert!(!result.success());
        assert!(result.stderr().contains("timed out"));
    }

    #[test]
    fn test_transport_failure_sentinel() {
        let result = ExecutionResult::transport_failure("engine unreachable");
        assert_eq!(result.stdout(), "");
        assert_eq!(result.stderr(), "engine unreachable");
        assert_eq!(result.exit_code(), -1);
    }

    #[test]
    fn test_request_builders() {
        let request = ExecutionRequest::script("print(1)")
            .with_interpreter("python3")
            .in_dir("/workspace/src")
            .with_timeout(Duration::from_secs(10));
        assert_eq!(request.workdir(), Some("/workspace/src"));
        assert_eq!(request.timeout(), Some(Duration::from_secs(10)));

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["kind"], "script");
        assert_eq!(json["interpreter"], "python3");
    }

    #[test]
    fn test_sub_second_timeout_is_kept() {
        let request = ExecutionRequest::command("make").with_timeout(Duration::from_millis(500));
        assert_eq!(request.timeout(), Some(Duration::from_millis(500)));

        let request = ExecutionRequest::command("make").with_timeout(Duration::from_micros(10));
        assert_eq!(request.timeout(), Some(Duration::from_millis(1)));
    }

    #[test]
    fn test_script_extension() {
        assert_eq!(script_extension("python3"), "py");
        assert_eq!(script_extension("/usr/bin/bash"), "sh");
        assert_eq!(script_extension("ruby"), "txt");
    }
}
