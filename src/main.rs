#![deny(unused)]
//! agentbox - run untrusted code in ephemeral hardened containers.
//!
//! Subcommands check the host environment, build the execution image, run a
//! one-shot command or script, or dispatch a single sandbox tool call.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use agentbox_core::config::AppConfig;
use agentbox_core::traits::{EventEmitter, ToolRegistry};
use agentbox_governance::{configure_tracing, JsonlAuditLog};
use agentbox_sandbox::engine::{self, ContainerEngine, EngineBackend};
use agentbox_sandbox::{
    run_once, ExecutionRequest, ExecutionResult, ImageProvisioner, ImageRecipe,
    SandboxConfiguration, SandboxManager, SecurityValidator,
};
use agentbox_skills::{register_sandbox_tools, DefaultToolRegistry};

#[derive(Parser)]
#[command(name = "agentbox", version, about = "Secure ephemeral container execution")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding default.toml and friends.
    #[arg(long, global = true, default_value = "config", env = "AGENTBOX_CONFIG_DIR")]
    config_dir: String,

    /// Override the engine backend (sdk or cli).
    #[arg(long, global = true)]
    engine: Option<EngineBackend>,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify rootless mode, the hardened runtime and the execution image.
    Check,
    /// Build the execution image (and cache volume) if missing.
    BuildImage {
        /// Tag to build; defaults to the configured sandbox image.
        #[arg(long)]
        tag: Option<String>,
        /// Layer extra RUN steps on top of this existing image.
        #[arg(long)]
        derived_from: Option<String>,
        /// RUN step for a derived image (repeatable).
        #[arg(long = "step")]
        steps: Vec<String>,
    },
    /// Run a shell command in a fresh sandbox and copy the workspace out.
    Run {
        command: String,
        #[command(flatten)]
        opts: RunOpts,
    },
    /// Run a script file in a fresh sandbox and copy the workspace out.
    Script {
        file: PathBuf,
        #[arg(long, default_value = "python")]
        interpreter: String,
        #[command(flatten)]
        opts: RunOpts,
    },
    /// Invoke one sandbox tool with JSON arguments.
    Tool {
        name: String,
        #[arg(default_value = "{}")]
        args: String,
    },
    /// List the registered sandbox tools.
    Tools,
}

#[derive(clap::Args)]
struct RunOpts {
    /// Host directory copied into the workspace before running.
    #[arg(long)]
    repo: Option<PathBuf>,
    /// Working directory inside the container.
    #[arg(long)]
    workdir: Option<String>,
    /// Timeout in seconds.
    #[arg(long)]
    timeout: Option<u64>,
    /// Parent directory for the `sandbox_artifacts_<id>` output.
    #[arg(long, default_value = ".")]
    out: PathBuf,
}

impl RunOpts {
    fn apply(&self, mut request: ExecutionRequest) -> ExecutionRequest {
        if let Some(dir) = &self.workdir {
            request = request.in_dir(dir.clone());
        }
        if let Some(secs) = self.timeout {
            request = request.with_timeout(Duration::from_secs(secs));
        }
        request
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let app = AppConfig::load_from(&cli.config_dir)
        .with_context(|| format!("loading configuration from '{}'", cli.config_dir))?;
    configure_tracing(&app.logging)?;

    tracing::info!("Starting agentbox v{}", env!("CARGO_PKG_VERSION"));

    let backend = match cli.engine {
        Some(backend) => backend,
        None => app
            .engine
            .backend
            .parse::<EngineBackend>()
            .map_err(anyhow::Error::msg)?,
    };
    let engine = engine::connect(backend, &app.engine.docker_bin)?;
    let config = SandboxConfiguration::try_from(&app.sandbox)?;

    match cli.command {
        Commands::Check => check(engine, &config).await,
        Commands::BuildImage {
            tag,
            derived_from,
            steps,
        } => {
            let recipe = match derived_from {
                Some(base) => ImageRecipe::derived(base, steps),
                None => ImageRecipe::for_sandbox(&config),
            };
            let tag = tag.unwrap_or_else(|| config.image.clone());
            let provisioner = ImageProvisioner::new(engine);
            let built = provisioner.ensure_image(&tag, &recipe).await?;
            if let Some(volume) = &config.cache_volume {
                provisioner.ensure_cache_volume(volume).await?;
            }
            println!("{}", built);
            Ok(())
        }
        Commands::Run { command, opts } => {
            let request = opts.apply(ExecutionRequest::command(command));
            let result =
                run_once(engine, config, opts.repo.clone(), request, opts.out.clone()).await?;
            finish(&result)
        }
        Commands::Script {
            file,
            interpreter,
            opts,
        } => {
            let body = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading script '{}'", file.display()))?;
            let request = opts.apply(ExecutionRequest::script(body).with_interpreter(interpreter));
            let result =
                run_once(engine, config, opts.repo.clone(), request, opts.out.clone()).await?;
            finish(&result)
        }
        Commands::Tool { name, args } => {
            let args: serde_json::Value =
                serde_json::from_str(&args).context("tool arguments must be JSON")?;
            let (registry, manager) = tool_registry(engine, config, &app).await?;

            let outcome = registry.execute(&name, args).await;
            // The container goes away whatever the tool returned.
            manager.teardown().await?;

            let output = outcome?;
            println!("{}", output.content);
            if let Some(data) = output.data {
                println!("{}", serde_json::to_string_pretty(&data)?);
            }
            if !output.success {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Tools => {
            let (registry, _manager) = tool_registry(engine, config, &app).await?;
            for tool in registry.list().await? {
                println!("{:<20} {:?}\t{}", tool.name, tool.risk_level, tool.description);
            }
            Ok(())
        }
    }
}

async fn check(
    engine: Arc<dyn ContainerEngine>,
    config: &SandboxConfiguration,
) -> anyhow::Result<()> {
    let validator = SecurityValidator::new(engine);
    let posture = validator.posture(&config.image).await?;
    println!("{}", serde_json::to_string_pretty(&posture)?);

    posture.check(&config.runtime)?;
    println!("ok: environment satisfies the isolation requirements");
    Ok(())
}

async fn tool_registry(
    engine: Arc<dyn ContainerEngine>,
    config: SandboxConfiguration,
    app: &AppConfig,
) -> anyhow::Result<(DefaultToolRegistry, Arc<SandboxManager>)> {
    let mut manager = SandboxManager::new(engine, config);
    if let Some(path) = &app.logging.audit_log_path {
        let audit: Arc<dyn EventEmitter> = Arc::new(JsonlAuditLog::open(path).await?);
        manager = manager.with_event_emitter(audit);
    }
    let manager = Arc::new(manager);

    let registry = DefaultToolRegistry::new();
    register_sandbox_tools(&registry, manager.clone()).await?;
    Ok((registry, manager))
}

fn finish(result: &ExecutionResult) -> anyhow::Result<()> {
    print!("{}", result.stdout());
    eprint!("{}", result.stderr());
    if let Some(location) = result.artifacts() {
        eprintln!("artifacts: {}", location);
    }
    if result.is_timed_out() {
        eprintln!("timed out");
    }
    if !result.success() {
        std::process::exit(i32::try_from(result.exit_code()).unwrap_or(1));
    }
    Ok(())
}
