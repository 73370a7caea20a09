//! Sandbox integration tests.
//!
//! Tests the full pipeline: Sandbox session → components → ContainerEngine
//! (MockEngine). These tests do NOT require Docker.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use agentbox_core::traits::{EventEmitter, Tool};
use agentbox_core::{Error, EventEnvelope, EventType};
use agentbox_sandbox::engine::{ContainerEngine, EngineInfo, MockEngine, MockFailure};
use agentbox_sandbox::{
    run_once, with_sandbox, ArtifactLocation, ContainerState, ExecutionRequest, ImageProvisioner,
    ImageRecipe, MountPolicy, Sandbox, SandboxConfiguration, SandboxManager, SandboxShellTool,
    SecurityValidator,
};

// =============================================================================
// Helpers
// =============================================================================

const IMAGE: &str = "agentbox-sandbox:latest";

fn ready_engine() -> Arc<MockEngine> {
    Arc::new(MockEngine::new().with_image(IMAGE))
}

fn as_engine(engine: &Arc<MockEngine>) -> Arc<dyn ContainerEngine> {
    engine.clone()
}

#[derive(Default)]
struct CapturingEmitter {
    events: Mutex<Vec<EventEnvelope>>,
}

impl CapturingEmitter {
    fn types(&self) -> Vec<EventType> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.event_type)
            .collect()
    }
}

#[async_trait]
impl EventEmitter for CapturingEmitter {
    async fn emit(&self, event: EventEnvelope) {
        self.events.lock().unwrap().push(event);
    }
}

// =============================================================================
// 1. Teardown
// =============================================================================

#[tokio::test]
async fn test_stop_removes_container() {
    let engine = ready_engine();
    let sandbox = Sandbox::open(as_engine(&engine), SandboxConfiguration::default())
        .await
        .unwrap();
    let name = sandbox.name().to_string();
    assert_eq!(engine.container_names(), vec![name.clone()]);

    sandbox.stop().await.unwrap();
    sandbox.stop().await.unwrap();

    assert_eq!(sandbox.state().await, ContainerState::Removed);
    assert!(!engine.container_names().contains(&name));
}

#[tokio::test]
async fn test_scoped_session_removes_container_on_error() {
    let engine = ready_engine();
    let outcome: agentbox_core::Result<()> =
        with_sandbox(as_engine(&engine), SandboxConfiguration::default(), |sandbox| async move {
            sandbox.write("a.txt", "data").await?;
            Err(Error::internal("caller bailed out"))
        })
        .await;

    assert!(matches!(outcome, Err(Error::Internal(_))));
    assert!(engine.container_names().is_empty());
}

#[tokio::test]
async fn test_scoped_session_removes_container_on_infrastructure_error() {
    let engine = ready_engine();
    let outcome = with_sandbox(as_engine(&engine), SandboxConfiguration::default(), |sandbox| {
        let engine = engine.clone();
        async move {
            engine.fail(MockFailure::Inject);
            sandbox.write("a.txt", "data").await
        }
    })
    .await;

    assert!(matches!(outcome, Err(Error::FileTransfer(_))));
    assert!(engine.container_names().is_empty());
}

#[tokio::test]
async fn test_dropped_sandbox_is_removed_in_background() {
    let engine = ready_engine();
    {
        let _sandbox = Sandbox::open(as_engine(&engine), SandboxConfiguration::default())
            .await
            .unwrap();
    }
    // Let the spawned removal run.
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(engine.container_names().is_empty());
}

// =============================================================================
// 2. Write/read round trip
// =============================================================================

#[tokio::test]
async fn test_write_read_round_trip() {
    let engine = ready_engine();
    let sandbox = Sandbox::open(as_engine(&engine), SandboxConfiguration::default())
        .await
        .unwrap();

    let samples: Vec<&[u8]> = vec![
        b"line one\nline two\n\n".as_slice(),
        "unicode: héllo wörld ✓ 日本語\n".as_bytes(),
        b"".as_slice(),
        b"quotes ' \" and $HOME `whoami`".as_slice(),
        [0u8, 159, 146, 150, 255].as_slice(),
    ];
    for (i, content) in samples.iter().enumerate() {
        let path = format!("/workspace/sample_{}.bin", i);
        sandbox.write(&path, *content).await.unwrap();
        assert_eq!(sandbox.read(&path).await.unwrap(), content.to_vec());
    }

    sandbox.stop().await.unwrap();
}

#[tokio::test]
async fn test_no_mounts_cat_scenario() {
    let engine = ready_engine();
    let config = SandboxConfiguration::default();
    assert_eq!(config.mount_policy, MountPolicy::NoMounts);

    let result = with_sandbox(as_engine(&engine), config, |sandbox| async move {
        sandbox.write("/workspace/a.txt", "hello\n").await?;
        sandbox.run("cat /workspace/a.txt").await
    })
    .await
    .unwrap();

    assert_eq!(result.stdout(), "hello\n");
    assert_eq!(result.exit_code(), 0);
}

// =============================================================================
// 3. Security validation
// =============================================================================

#[tokio::test]
async fn test_validation_fails_without_rootless() {
    let engine = Arc::new(
        MockEngine::new()
            .with_image(IMAGE)
            .with_info(EngineInfo {
                security_options: vec!["name=seccomp,profile=builtin".into()],
                runtimes: vec!["runc".into(), "runsc".into()],
                server_version: None,
            }),
    );
    let err = Sandbox::open(as_engine(&engine), SandboxConfiguration::default())
        .await
        .err()
        .unwrap();

    assert!(matches!(err, Error::SecurityEnvironment(_)));
    assert!(engine.container_names().is_empty());
    assert_eq!(engine.remove_count(), 0);
}

#[tokio::test]
async fn test_validation_fails_without_isolation_runtime() {
    let engine = Arc::new(
        MockEngine::new()
            .with_image(IMAGE)
            .with_info(EngineInfo {
                security_options: vec!["name=rootless".into()],
                runtimes: vec!["runc".into()],
                server_version: None,
            }),
    );
    let validator = SecurityValidator::new(as_engine(&engine));
    let err = validator
        .validate(&SandboxConfiguration::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SecurityEnvironment(_)));
}

#[tokio::test]
async fn test_missing_image_without_build_is_distinct() {
    let engine = Arc::new(MockEngine::new());
    let err = Sandbox::builder(as_engine(&engine), SandboxConfiguration::default())
        .build_missing_image(false)
        .open()
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::ImageMissing(_)));
    assert_eq!(engine.build_count(), 0);
}

#[tokio::test]
async fn test_unreachable_engine_fails_closed() {
    let engine = ready_engine();
    engine.fail(MockFailure::Info);
    let err = Sandbox::open(as_engine(&engine), SandboxConfiguration::default())
        .await
        .err()
        .unwrap();
    assert!(err.is_security_environment());
}

// =============================================================================
// 4. Command failures are data
// =============================================================================

#[tokio::test]
async fn test_invalid_executable_is_not_an_error() {
    let engine = ready_engine();
    let config = SandboxConfiguration::default();
    let result = with_sandbox(as_engine(&engine), config, |sandbox| async move {
        sandbox.run("no_such_program_xyz --flag").await
    })
    .await
    .unwrap();

    assert_ne!(result.exit_code(), 0);
    assert!(!result.stderr().is_empty());
}

// =============================================================================
// 5. Operations after stop
// =============================================================================

#[tokio::test]
async fn test_operations_after_stop_fail_not_running() {
    let engine = ready_engine();
    let sandbox = Sandbox::open(as_engine(&engine), SandboxConfiguration::default())
        .await
        .unwrap();
    sandbox.stop().await.unwrap();

    assert!(matches!(sandbox.run("echo hi").await, Err(Error::ContainerNotRunning(_))));
    assert!(matches!(sandbox.write("a.txt", "x").await, Err(Error::ContainerNotRunning(_))));
    assert!(matches!(sandbox.read("a.txt").await, Err(Error::ContainerNotRunning(_))));
    assert!(matches!(
        sandbox.run_script("print(1)").await,
        Err(Error::ContainerNotRunning(_))
    ));
    let dest = tempfile::tempdir().unwrap();
    assert!(matches!(
        sandbox.copy_workspace_out(dest.path()).await,
        Err(Error::ContainerNotRunning(_))
    ));
}

// =============================================================================
// 6. Image provisioning
// =============================================================================

#[tokio::test]
async fn test_ensure_image_builds_once() {
    let engine = Arc::new(MockEngine::new());
    let provisioner = ImageProvisioner::new(as_engine(&engine));
    let recipe = ImageRecipe::python_uv();

    provisioner.ensure_image("custom:1", &recipe).await.unwrap();
    provisioner.ensure_image("custom:1", &recipe).await.unwrap();

    assert_eq!(engine.build_count(), 1);
    assert!(engine.has_image("custom:1"));
}

#[tokio::test]
async fn test_open_builds_missing_image_and_cache_volume() {
    let engine = Arc::new(MockEngine::new());
    let config = SandboxConfiguration::default().with_cache_volume("agent_uv_cache");

    let sandbox = Sandbox::open(as_engine(&engine), config.clone()).await.unwrap();
    sandbox.stop().await.unwrap();
    let sandbox = Sandbox::open(as_engine(&engine), config).await.unwrap();
    sandbox.stop().await.unwrap();

    assert_eq!(engine.build_count(), 1);
    assert_eq!(engine.volume_create_count(), 1);
    assert!(engine.has_volume("agent_uv_cache"));
}

#[tokio::test]
async fn test_failed_build_is_runtime_error() {
    let engine = Arc::new(MockEngine::new());
    engine.fail(MockFailure::Build);
    let err = Sandbox::open(as_engine(&engine), SandboxConfiguration::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::ContainerRuntime(_)));
    assert!(engine.container_names().is_empty());
}

// =============================================================================
// 7. Scripts, requirements and one-shot runs
// =============================================================================

#[tokio::test]
async fn test_script_runs_and_temp_file_is_removed() {
    let engine = ready_engine();
    let sandbox = Sandbox::open(as_engine(&engine), SandboxConfiguration::default())
        .await
        .unwrap();

    let request = ExecutionRequest::script("echo one\necho two\n").with_interpreter("sh");
    let result = sandbox.execute(&request).await.unwrap();
    assert_eq!(result.stdout(), "one\ntwo\n");

    let listing = sandbox.run("ls /workspace").await.unwrap();
    assert_eq!(listing.stdout(), "");

    let scripts: Vec<_> = engine
        .exec_log()
        .into_iter()
        .filter(|(argv, _)| argv.iter().any(|a| a.contains("temp_script_")))
        .collect();
    assert_eq!(scripts.len(), 2);

    sandbox.stop().await.unwrap();
}

#[tokio::test]
async fn test_script_workdir_outside_workspace_touches_nothing() {
    let engine = ready_engine();
    let sandbox = Sandbox::open(as_engine(&engine), SandboxConfiguration::default())
        .await
        .unwrap();
    let before = engine.exec_log().len();

    let request = ExecutionRequest::script("print(1)").in_dir("/tmp/evil");
    let err = sandbox.execute(&request).await.unwrap_err();
    assert!(matches!(err, Error::SecurityViolation(_)));

    // Nothing reached the container before the rejection.
    assert_eq!(engine.exec_log().len(), before);
    let check = sandbox.run("test -d /tmp/evil").await.unwrap();
    assert!(!check.success());

    sandbox.stop().await.unwrap();
}

#[tokio::test]
async fn test_script_in_workspace_subdir() {
    let engine = ready_engine();
    let sandbox = Sandbox::open(as_engine(&engine), SandboxConfiguration::default())
        .await
        .unwrap();

    let request = ExecutionRequest::script("pwd\n")
        .with_interpreter("sh")
        .in_dir("src");
    let result = sandbox.execute(&request).await.unwrap();
    assert_eq!(result.stdout(), "/workspace/src\n");

    sandbox.stop().await.unwrap();
}

#[tokio::test]
async fn test_install_requirements() {
    let engine = ready_engine();
    let sandbox = Sandbox::open(as_engine(&engine), SandboxConfiguration::default())
        .await
        .unwrap();

    assert!(sandbox.install_requirements().await.unwrap().is_none());

    sandbox
        .write("requirements.txt", "requests==2.32.0\n")
        .await
        .unwrap();
    let result = sandbox.install_requirements().await.unwrap().unwrap();
    assert!(result.success());
    assert!(result.stdout().contains("requirements.txt"));

    sandbox.stop().await.unwrap();
}

#[tokio::test]
async fn test_run_once_copies_repository_in_and_artifacts_out() {
    let engine = ready_engine();
    let repo = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(repo.path().join("src")).unwrap();
    std::fs::write(repo.path().join("src/main.sh"), "echo built\n").unwrap();
    let artifacts = tempfile::tempdir().unwrap();

    let result = run_once(
        as_engine(&engine),
        SandboxConfiguration::default(),
        Some(repo.path().to_path_buf()),
        ExecutionRequest::command("sh src/main.sh"),
        artifacts.path().to_path_buf(),
    )
    .await
    .unwrap();

    assert_eq!(result.exit_code(), 0);
    assert_eq!(result.stdout(), "built\n");

    let Some(ArtifactLocation::Host(dir)) = result.artifacts() else {
        panic!("expected host artifacts, got {:?}", result.artifacts());
    };
    assert!(dir.starts_with(artifacts.path()));
    assert!(dir
        .parent()
        .unwrap()
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("sandbox_artifacts_"));
    assert_eq!(
        std::fs::read_to_string(dir.join("src/main.sh")).unwrap(),
        "echo built\n"
    );
    assert!(engine.container_names().is_empty());
}

#[tokio::test]
async fn test_run_once_returns_failures_as_data() {
    let engine = ready_engine();
    let artifacts = tempfile::tempdir().unwrap();

    let result = run_once(
        as_engine(&engine),
        SandboxConfiguration::default(),
        None,
        ExecutionRequest::command("exit 3"),
        artifacts.path().to_path_buf(),
    )
    .await
    .unwrap();

    assert_eq!(result.exit_code(), 3);
    assert!(result.artifacts().is_some());
    assert!(engine.container_names().is_empty());
}

// =============================================================================
// 8. Audit events and tools
// =============================================================================

#[tokio::test]
async fn test_session_emits_audit_events() {
    let engine = ready_engine();
    let emitter = Arc::new(CapturingEmitter::default());

    let sandbox = Sandbox::builder(as_engine(&engine), SandboxConfiguration::default())
        .event_emitter(emitter.clone())
        .open()
        .await
        .unwrap();
    sandbox.write("a.txt", "x").await.unwrap();
    sandbox.read("a.txt").await.unwrap();
    sandbox.run("true").await.unwrap();
    sandbox.stop().await.unwrap();

    assert_eq!(
        emitter.types(),
        vec![
            EventType::SandboxCreated,
            EventType::FileWritten,
            EventType::FileRead,
            EventType::CommandExecuted,
            EventType::SandboxDestroyed,
        ]
    );
    let events = emitter.events.lock().unwrap();
    assert!(events
        .iter()
        .all(|e| e.sandbox.as_deref() == Some(sandbox.name())));
}

#[tokio::test]
async fn test_shell_tool_through_manager() {
    let engine = ready_engine();
    let manager = Arc::new(SandboxManager::new(
        as_engine(&engine),
        SandboxConfiguration::default(),
    ));
    let tool = SandboxShellTool::new(manager.clone());

    let output = tool
        .execute(json!({"command": "mkdir -p src && echo ok", "workdir": "."}))
        .await
        .unwrap();
    assert!(output.success);
    assert_eq!(output.content, "ok\n");

    let escaped = tool
        .execute(json!({"command": "ls", "workdir": "/etc"}))
        .await;
    assert!(matches!(escaped, Err(Error::SecurityViolation(_))));

    manager.teardown().await.unwrap();
    assert!(engine.container_names().is_empty());
}
