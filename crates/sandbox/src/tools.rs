//! Sandbox tools implementing the `Tool` trait.
//!
//! These tools are registered in a tool registry and let an agent run
//! commands and scripts and read/write files in an isolated sandbox.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use agentbox_core::traits::{EventEmitter, Tool};
use agentbox_core::types::{ToolOutput, ToolRiskLevel};
use agentbox_core::{Error, Result};

use crate::config::SandboxConfiguration;
use crate::engine::ContainerEngine;
use crate::paths::confine;
use crate::result::{ExecutionRequest, ExecutionResult};
use crate::session::Sandbox;

/// Upper bound for a tool-supplied timeout.
const MAX_TIMEOUT_SECS: u64 = 300;

// =============================================================================
// Sandbox Manager
// =============================================================================

/// Owns the agent's sandbox session.
///
/// The sandbox is opened lazily on first use and lives until
/// [`SandboxManager::teardown`]. Access is serialized by a session-scoped
/// lock.
pub struct SandboxManager {
    engine: Arc<dyn ContainerEngine>,
    config: SandboxConfiguration,
    active: tokio::sync::Mutex<Option<Arc<Sandbox>>>,
    event_emitter: Option<Arc<dyn EventEmitter>>,
}

impl SandboxManager {
    /// Create a new sandbox manager.
    pub fn new(engine: Arc<dyn ContainerEngine>, config: SandboxConfiguration) -> Self {
        Self {
            engine,
            config,
            active: tokio::sync::Mutex::new(None),
            event_emitter: None,
        }
    }

    /// Set an event emitter for auditing.
    pub fn with_event_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.event_emitter = Some(emitter);
        self
    }

    pub fn config(&self) -> &SandboxConfiguration {
        &self.config
    }

    /// Get the active sandbox, opening one if needed.
    pub async fn get_or_create(&self) -> Result<Arc<Sandbox>> {
        let mut guard = self.active.lock().await;
        if let Some(sandbox) = guard.as_ref() {
            return Ok(sandbox.clone());
        }

        let mut builder = Sandbox::builder(self.engine.clone(), self.config.clone());
        if let Some(emitter) = &self.event_emitter {
            builder = builder.event_emitter(emitter.clone());
        }
        let sandbox = Arc::new(builder.open().await?);
        *guard = Some(sandbox.clone());
        Ok(sandbox)
    }

    /// Stop and forget the active sandbox.
    pub async fn teardown(&self) -> Result<()> {
        let mut guard = self.active.lock().await;
        if let Some(sandbox) = guard.take() {
            sandbox.stop().await?;
        }
        Ok(())
    }

    /// Whether the container engine answers.
    pub async fn is_available(&self) -> bool {
        self.engine.info().await.is_ok()
    }

    /// Absolute container path for a tool-supplied path.
    fn resolve(&self, path: &str) -> Result<String> {
        confine(&self.config.workspace_root, path)
    }
}

/// All sandbox tools bound to `manager`.
pub fn sandbox_tools(manager: Arc<SandboxManager>) -> Vec<Box<dyn Tool>> {
    vec![
        Box::new(SandboxShellTool::new(manager.clone())),
        Box::new(SandboxWriteFileTool::new(manager.clone())),
        Box::new(SandboxReadFileTool::new(manager.clone())),
        Box::new(SandboxRunScriptTool::new(manager)),
    ]
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::invalid_request(format!("{} is required", key)))
}

fn timeout_arg(args: &Value) -> Option<Duration> {
    args.get("timeout_secs")
        .and_then(|v| v.as_u64())
        .map(|secs| Duration::from_secs(secs.clamp(1, MAX_TIMEOUT_SECS)))
}

/// Execution outcome, with transport failures folded into a sentinel result.
fn fold_transport(outcome: Result<ExecutionResult>) -> Result<ExecutionResult> {
    match outcome {
        Err(Error::ContainerRuntime(msg)) => Ok(ExecutionResult::transport_failure(msg)),
        other => other,
    }
}

/// Render an execution result the way agents read it.
fn render(result: &ExecutionResult) -> ToolOutput {
    let data = json!({
        "exit_code": result.exit_code(),
        "timed_out": result.is_timed_out(),
    });

    if result.is_timed_out() {
        return ToolOutput::error(format!(
            "Command timed out.\nPartial stdout:\n{}\nStderr:\n{}",
            result.stdout(),
            result.stderr()
        ))
        .with_data(data);
    }

    let mut output = String::new();
    if !result.stdout().is_empty() {
        output.push_str(result.stdout());
    }
    if !result.stderr().is_empty() {
        if !output.is_empty() {
            output.push_str("\n--- stderr ---\n");
        }
        output.push_str(result.stderr());
    }
    if output.is_empty() {
        output = format!("Command completed with exit code {}", result.exit_code());
    }

    if result.success() {
        ToolOutput::text(output).with_data(data)
    } else {
        ToolOutput::error(format!(
            "Command failed (exit code {}):\n{}",
            result.exit_code(),
            output
        ))
        .with_data(data)
    }
}

// =============================================================================
// Sandbox Shell Tool
// =============================================================================

/// Runs shell commands inside the sandbox.
pub struct SandboxShellTool {
    manager: Arc<SandboxManager>,
}

impl SandboxShellTool {
    pub fn new(manager: Arc<SandboxManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for SandboxShellTool {
    fn name(&self) -> &str {
        "sandbox_shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command inside an isolated container sandbox. \
         The sandbox has no access to the host system. \
         Commands run as a non-root user in the workspace directory."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "workdir": {
                    "type": "string",
                    "description": "Working directory, relative to the workspace (default: workspace root)"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Timeout in seconds (max: 300)"
                }
            },
            "required": ["command"]
        })
    }

    fn risk_level(&self) -> ToolRiskLevel {
        ToolRiskLevel::High
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput> {
        let command = required_str(&args, "command")?;
        let workdir = args.get("workdir").and_then(|v| v.as_str());
        let timeout = timeout_arg(&args);

        let sandbox = self.manager.get_or_create().await?;
        let result = fold_transport(sandbox.run_in(command, workdir, timeout).await)?;
        Ok(render(&result))
    }
}

// =============================================================================
// Sandbox Write File Tool
// =============================================================================

/// Writes files into the sandbox workspace.
pub struct SandboxWriteFileTool {
    manager: Arc<SandboxManager>,
}

impl SandboxWriteFileTool {
    pub fn new(manager: Arc<SandboxManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for SandboxWriteFileTool {
    fn name(&self) -> &str {
        "sandbox_write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file inside the sandbox workspace. \
         Parent directories are created as needed."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path relative to the workspace (e.g. 'main.py', 'src/app.js')"
                },
                "content": {
                    "type": "string",
                    "description": "The file content to write"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn risk_level(&self) -> ToolRiskLevel {
        ToolRiskLevel::Medium
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput> {
        let path = self.manager.resolve(required_str(&args, "path")?)?;
        let content = required_str(&args, "content")?;

        let sandbox = self.manager.get_or_create().await?;
        let written = sandbox.write(&path, content).await?;

        Ok(ToolOutput::text(format!(
            "File written: {} ({} bytes)",
            written,
            content.len()
        ))
        .with_data(json!({ "path": written, "size_bytes": content.len() })))
    }
}

// =============================================================================
// Sandbox Read File Tool
// =============================================================================

/// Reads files from the sandbox workspace.
pub struct SandboxReadFileTool {
    manager: Arc<SandboxManager>,
}

impl SandboxReadFileTool {
    pub fn new(manager: Arc<SandboxManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for SandboxReadFileTool {
    fn name(&self) -> &str {
        "sandbox_read_file"
    }

    fn description(&self) -> &str {
        "Read the content of a file from the sandbox workspace."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path relative to the workspace"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput> {
        let path = self.manager.resolve(required_str(&args, "path")?)?;

        let sandbox = self.manager.get_or_create().await?;
        match sandbox.read(&path).await {
            Ok(bytes) => Ok(ToolOutput::text(String::from_utf8_lossy(&bytes).into_owned())),
            Err(Error::FileUnreadable { path, reason }) => Ok(ToolOutput::error(format!(
                "Cannot read {}: {}",
                path, reason
            ))),
            Err(e) => Err(e),
        }
    }
}

// =============================================================================
// Sandbox Run Script Tool
// =============================================================================

/// Runs a script body inside the sandbox.
pub struct SandboxRunScriptTool {
    manager: Arc<SandboxManager>,
}

impl SandboxRunScriptTool {
    pub fn new(manager: Arc<SandboxManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for SandboxRunScriptTool {
    fn name(&self) -> &str {
        "sandbox_run_script"
    }

    fn description(&self) -> &str {
        "Run a script (Python by default) inside the sandbox and return its output. \
         The script is written to a temporary file in the workspace and removed afterwards."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "The script body"
                },
                "interpreter": {
                    "type": "string",
                    "description": "Interpreter to run the script with (default: python)",
                    "default": "python"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Timeout in seconds (max: 300)"
                }
            },
            "required": ["code"]
        })
    }

    fn risk_level(&self) -> ToolRiskLevel {
        ToolRiskLevel::High
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput> {
        let code = required_str(&args, "code")?;
        let interpreter = args
            .get("interpreter")
            .and_then(|v| v.as_str())
            .unwrap_or("python");

        let mut request = ExecutionRequest::script(code).with_interpreter(interpreter);
        if let Some(timeout) = timeout_arg(&args) {
            request = request.with_timeout(timeout);
        }

        let sandbox = self.manager.get_or_create().await?;
        let result = fold_transport(sandbox.execute(&request).await)?;
        Ok(render(&result))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MockEngine, MockFailure};

    fn make_manager() -> (Arc<MockEngine>, Arc<SandboxManager>) {
        let engine = Arc::new(MockEngine::new().with_image("agentbox-sandbox:latest"));
        let manager = Arc::new(SandboxManager::new(
            engine.clone(),
            SandboxConfiguration::default(),
        ));
        (engine, manager)
    }

    #[tokio::test]
    async fn test_shell_tool_success() {
        let (_engine, manager) = make_manager();
        let tool = SandboxShellTool::new(manager);
        let result = tool
            .execute(json!({"command": "echo Hello Sandbox"}))
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.content.contains("Hello Sandbox"));
        assert_eq!(result.data.unwrap()["exit_code"], 0);
    }

    #[tokio::test]
    async fn test_shell_tool_failure() {
        let (_engine, manager) = make_manager();
        let tool = SandboxShellTool::new(manager);
        let result = tool
            .execute(json!({"command": "nonexistent_command"}))
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.content.contains("exit code 127"));
    }

    #[tokio::test]
    async fn test_shell_tool_transport_failure_is_sentinel() {
        let (engine, manager) = make_manager();
        manager.get_or_create().await.unwrap();
        engine.fail(MockFailure::Exec);

        let tool = SandboxShellTool::new(manager);
        let result = tool.execute(json!({"command": "echo hi"})).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.data.unwrap()["exit_code"], -1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shell_tool_timeout() {
        let (_engine, manager) = make_manager();
        let tool = SandboxShellTool::new(manager);
        let result = tool
            .execute(json!({"command": "sleep 999", "timeout_secs": 1}))
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.content.contains("timed out"));
        assert_eq!(result.data.unwrap()["timed_out"], true);
    }

    #[tokio::test]
    async fn test_write_file_path_traversal() {
        let (engine, manager) = make_manager();
        let tool = SandboxWriteFileTool::new(manager);

        let result = tool
            .execute(json!({"path": "../../../etc/passwd", "content": "evil"}))
            .await;

        assert!(matches!(result, Err(Error::SecurityViolation(_))));
        assert!(engine.container_names().is_empty());
    }

    #[tokio::test]
    async fn test_write_then_read_tools() {
        let (_engine, manager) = make_manager();
        let write = SandboxWriteFileTool::new(manager.clone());
        let read = SandboxReadFileTool::new(manager.clone());

        let written = write
            .execute(json!({"path": "src/app.py", "content": "print('hi')\n"}))
            .await
            .unwrap();
        assert!(written.content.contains("/workspace/src/app.py"));

        let content = read.execute(json!({"path": "src/app.py"})).await.unwrap();
        assert_eq!(content.content, "print('hi')\n");

        let missing = read.execute(json!({"path": "nope.txt"})).await.unwrap();
        assert!(!missing.success);

        manager.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_script_tool_cleans_up() {
        let (engine, manager) = make_manager();
        let tool = SandboxRunScriptTool::new(manager.clone());

        let result = tool
            .execute(json!({"code": "echo from script\n", "interpreter": "sh"}))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.content, "from script\n");

        let sandbox = manager.get_or_create().await.unwrap();
        let listing = sandbox.run("ls").await.unwrap();
        assert!(!listing.stdout().contains("temp_script_"));
        assert_eq!(engine.container_names().len(), 1);
    }

    #[tokio::test]
    async fn test_teardown_removes_container() {
        let (engine, manager) = make_manager();
        manager.get_or_create().await.unwrap();
        assert_eq!(engine.container_names().len(), 1);

        manager.teardown().await.unwrap();
        assert!(engine.container_names().is_empty());
    }

    #[test]
    fn test_all_tools_have_distinct_names() {
        let (_engine, manager) = make_manager();
        let mut names: Vec<String> = sandbox_tools(manager)
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 4);
    }
}
