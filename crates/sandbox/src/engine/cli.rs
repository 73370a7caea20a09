//! Backend that shells out to the `docker` command line client.
//!
//! Useful where the daemon socket is not directly reachable but the CLI is
//! configured (contexts, remote hosts). Archive transfer goes through
//! `docker cp -`, which reads and writes tar streams on stdin/stdout.

use std::path::Path;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use super::{
    ContainerEngine, ContainerSpec, ContainerStatus, ContainerSummary, EngineError, EngineInfo,
    EngineResult, ExecOutput, MountSpec,
};

/// Docker CLI engine.
pub struct CliEngine {
    bin: String,
}

impl CliEngine {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    async fn run(&self, args: &[String], stdin: Option<&[u8]>) -> EngineResult<Output> {
        debug!(bin = %self.bin, args = ?args, "docker cli");

        let mut child = tokio::process::Command::new(&self.bin)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    EngineError::Unavailable(format!("'{}' not found on PATH", self.bin))
                }
                _ => EngineError::Io(e),
            })?;

        if let Some(data) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(data).await?;
                pipe.shutdown().await?;
            }
        }

        Ok(child.wait_with_output().await?)
    }

    /// Run and map a non-zero exit of the docker client itself to an error.
    async fn run_checked(&self, args: &[String], stdin: Option<&[u8]>) -> EngineResult<Output> {
        let output = self.run(args, stdin).await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(classify(&String::from_utf8_lossy(&output.stderr)))
        }
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Map docker client stderr to an engine error.
fn classify(stderr: &str) -> EngineError {
    let msg = stderr.trim().to_string();
    let lower = msg.to_lowercase();
    if lower.contains("no such") || lower.contains("not found") {
        EngineError::NotFound(msg)
    } else if lower.contains("conflict")
        || lower.contains("already in use")
        || lower.contains("already exists")
    {
        EngineError::Conflict(msg)
    } else if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
    {
        EngineError::Unavailable(msg)
    } else {
        EngineError::Api(msg)
    }
}

/// Whether stderr from `docker exec` came from the client/daemon rather than
/// from the command running inside the container.
fn is_client_failure(stderr: &str) -> bool {
    let first = stderr.lines().next().unwrap_or_default();
    first.starts_with("Error response from daemon") || first.starts_with("Error: No such container")
}

/// Translate a container spec into `docker create` arguments.
fn create_args(name: &str, spec: &ContainerSpec) -> Vec<String> {
    let mut out = args([
        "create",
        "--name",
        name,
        "--user",
        spec.user.as_str(),
        "--workdir",
        spec.working_dir.as_str(),
    ]);

    if let Some(ref runtime) = spec.runtime {
        out.push(format!("--runtime={}", runtime));
    }
    for cap in &spec.cap_drop {
        out.push(format!("--cap-drop={}", cap));
    }
    for opt in &spec.security_opt {
        out.extend(["--security-opt".to_string(), opt.clone()]);
    }
    out.push(format!("--network={}", spec.network_mode));
    if let Some(mem) = spec.memory_bytes {
        out.push(format!("--memory={}", mem));
    }
    if let Some(nano) = spec.nano_cpus {
        out.push(format!("--cpus={}", nano as f64 / 1e9));
    }
    if let Some(pids) = spec.pids_limit {
        out.push(format!("--pids-limit={}", pids));
    }
    if spec.init {
        out.push("--init".to_string());
    }
    for env in &spec.env {
        out.extend(["--env".to_string(), env.clone()]);
    }
    let mut labels: Vec<_> = spec.labels.iter().collect();
    labels.sort();
    for (k, v) in labels {
        out.extend(["--label".to_string(), format!("{}={}", k, v)]);
    }
    for host in &spec.extra_hosts {
        out.push(format!("--add-host={}", host));
    }
    for mount in &spec.mounts {
        match mount {
            MountSpec::Bind {
                source,
                target,
                read_only,
            } => {
                let mode = if *read_only { "ro" } else { "rw" };
                out.extend(["--volume".to_string(), format!("{}:{}:{}", source, target, mode)]);
            }
            MountSpec::Volume { name, target } => {
                out.extend([
                    "--mount".to_string(),
                    format!("type=volume,source={},target={}", name, target),
                ]);
            }
            MountSpec::Shadow { target } => {
                out.extend(["--tmpfs".to_string(), target.clone()]);
            }
        }
    }

    out.push(spec.image.clone());
    out.extend(spec.cmd.iter().cloned());
    out
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CliInfo {
    #[serde(default)]
    security_options: Option<Vec<String>>,
    #[serde(default)]
    runtimes: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    server_version: Option<String>,
}

#[derive(Deserialize)]
struct CliState {
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "Running", default)]
    running: bool,
    #[serde(rename = "OOMKilled", default)]
    oom_killed: bool,
    #[serde(rename = "ExitCode", default)]
    exit_code: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CliPsLine {
    #[serde(rename = "ID")]
    id: String,
    names: String,
    #[serde(default)]
    state: String,
}

#[async_trait]
impl ContainerEngine for CliEngine {
    fn backend_name(&self) -> &'static str {
        "docker-cli"
    }

    async fn info(&self) -> EngineResult<EngineInfo> {
        let output = self
            .run_checked(&args(["info", "--format", "{{json .}}"]), None)
            .await
            .map_err(|e| EngineError::Unavailable(format!("'docker info' failed: {}", e)))?;

        let info: CliInfo = serde_json::from_slice(&output.stdout)
            .map_err(|e| EngineError::Api(format!("unparseable 'docker info' output: {}", e)))?;

        let mut runtimes: Vec<String> = info
            .runtimes
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default();
        runtimes.sort();

        Ok(EngineInfo {
            security_options: info.security_options.unwrap_or_default(),
            runtimes,
            server_version: info.server_version,
        })
    }

    async fn image_exists(&self, tag: &str) -> EngineResult<bool> {
        match self
            .run_checked(&args(["image", "inspect", "--format", "{{.Id}}", tag]), None)
            .await
        {
            Ok(_) => Ok(true),
            Err(EngineError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, context_dir), fields(backend = "docker-cli"))]
    async fn image_build(&self, context_dir: &Path, tag: &str) -> EngineResult<()> {
        let mut cmd = args(["build", "--tag", tag]);
        cmd.push(context_dir.display().to_string());
        self.run_checked(&cmd, None).await?;
        Ok(())
    }

    async fn volume_ensure(&self, name: &str) -> EngineResult<()> {
        if self
            .run_checked(&args(["volume", "inspect", name]), None)
            .await
            .is_ok()
        {
            return Ok(());
        }
        match self.run_checked(&args(["volume", "create", name]), None).await {
            Ok(_) | Err(EngineError::Conflict(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, spec), fields(backend = "docker-cli", image = %spec.image))]
    async fn container_create(&self, name: &str, spec: &ContainerSpec) -> EngineResult<String> {
        let output = self.run_checked(&create_args(name, spec), None).await?;
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Err(EngineError::Api("docker create returned no container id".into()));
        }
        Ok(id)
    }

    async fn container_start(&self, id: &str) -> EngineResult<()> {
        self.run_checked(&args(["start", id]), None).await?;
        Ok(())
    }

    async fn container_exec(
        &self,
        id: &str,
        argv: &[String],
        workdir: &str,
        user: Option<&str>,
    ) -> EngineResult<ExecOutput> {
        let mut cmd = args(["exec", "--workdir", workdir]);
        if let Some(user) = user {
            cmd.extend(["--user".to_string(), user.to_string()]);
        }
        cmd.push(id.to_string());
        cmd.extend(argv.iter().cloned());

        let output = self.run(&cmd, None).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() && is_client_failure(&stderr) {
            return Err(classify(&stderr));
        }

        Ok(ExecOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.status.code().map(i64::from).unwrap_or(-1),
        })
    }

    async fn container_inspect(&self, id: &str) -> EngineResult<Option<ContainerStatus>> {
        let output = match self
            .run_checked(&args(["inspect", "--format", "{{json .State}}", id]), None)
            .await
        {
            Ok(o) => o,
            Err(EngineError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let state: CliState = serde_json::from_slice(&output.stdout)
            .map_err(|e| EngineError::Api(format!("unparseable container state: {}", e)))?;

        Ok(Some(ContainerStatus {
            status: state.status,
            running: state.running,
            oom_killed: state.oom_killed,
            exit_code: state.exit_code,
        }))
    }

    async fn container_stop(&self, id: &str) -> EngineResult<()> {
        self.run_checked(&args(["stop", "--time", "5", id]), None)
            .await?;
        Ok(())
    }

    async fn container_remove(&self, id: &str) -> EngineResult<()> {
        match self.run_checked(&args(["rm", "--force", "--volumes", id]), None).await {
            Ok(_) | Err(EngineError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn archive_inject(&self, id: &str, target_dir: &str, archive: Bytes) -> EngineResult<()> {
        let dest = format!("{}:{}", id, target_dir);
        self.run_checked(&args(["cp", "-", dest.as_str()]), Some(&archive))
            .await?;
        Ok(())
    }

    async fn archive_extract(&self, id: &str, source_path: &str) -> EngineResult<Bytes> {
        let src = format!("{}:{}", id, source_path);
        let output = self.run_checked(&args(["cp", src.as_str(), "-"]), None).await?;
        Ok(Bytes::from(output.stdout))
    }

    async fn list_containers(&self, label: &str) -> EngineResult<Vec<ContainerSummary>> {
        let filter = format!("label={}", label);
        let output = self
            .run_checked(
                &args(["ps", "--all", "--filter", filter.as_str(), "--format", "{{json .}}"]),
                None,
            )
            .await?;

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|line| {
                let ps: CliPsLine = serde_json::from_str(line)
                    .map_err(|e| EngineError::Api(format!("unparseable 'docker ps' line: {}", e)))?;
                Ok(ContainerSummary {
                    id: ps.id,
                    name: ps.names,
                    state: ps.state,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_create_args_carry_hardening() {
        let spec = ContainerSpec {
            image: "agentbox-sandbox:latest".into(),
            cmd: vec!["sleep".into(), "infinity".into()],
            user: "1000:1000".into(),
            working_dir: "/workspace".into(),
            runtime: Some("runsc".into()),
            cap_drop: vec!["ALL".into()],
            security_opt: vec!["no-new-privileges:true".into()],
            network_mode: "none".into(),
            labels: HashMap::from([("managed-by".to_string(), "agentbox".to_string())]),
            mounts: vec![MountSpec::Shadow {
                target: "/workspace/.venv".into(),
            }],
            ..Default::default()
        };

        let a = create_args("agentbox-1", &spec);
        assert!(a.contains(&"--runtime=runsc".to_string()));
        assert!(a.contains(&"--cap-drop=ALL".to_string()));
        assert!(a.contains(&"no-new-privileges:true".to_string()));
        assert!(a.contains(&"--network=none".to_string()));
        assert!(a.contains(&"--tmpfs".to_string()));
        assert!(!a.contains(&"--volume".to_string()));
        // image then command come last
        assert_eq!(&a[a.len() - 3..], &["agentbox-sandbox:latest", "sleep", "infinity"]);
    }

    #[test]
    fn test_classify_stderr() {
        assert!(classify("Error: No such container: abc").is_not_found());
        assert!(classify("Conflict. The container name \"/x\" is already in use").is_conflict());
        assert!(matches!(
            classify("Cannot connect to the Docker daemon at unix:///var/run/docker.sock"),
            EngineError::Unavailable(_)
        ));
    }

    #[test]
    fn test_exec_client_failure_detection() {
        assert!(is_client_failure("Error response from daemon: container abc is not running"));
        assert!(!is_client_failure("sh: 1: nope: not found"));
    }
}
