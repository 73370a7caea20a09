//! Execution image and cache volume provisioning.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use agentbox_core::{Error, Result};

use crate::config::{SandboxConfiguration, CACHE_MOUNT};
use crate::engine::ContainerEngine;

/// Default name of the shared package cache volume.
pub const DEFAULT_CACHE_VOLUME: &str = "agent_uv_cache";

const UV_IMAGE: &str = "ghcr.io/astral-sh/uv:latest";

/// Declarative Dockerfile-equivalent for an execution image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecipe {
    pub base_image: String,
    pub system_packages: Vec<String>,
    /// `COPY --from=<image> <src> <dst>` lines.
    pub copy_from: Vec<(String, String, String)>,
    /// Create the non-root user and the workspace directory.
    pub create_user: bool,
    pub uid: u32,
    pub gid: u32,
    pub workspace_root: String,
    pub env: BTreeMap<String, String>,
    /// Extra `RUN` steps, executed as root.
    pub run: Vec<String>,
    pub cmd: Vec<String>,
}

impl ImageRecipe {
    /// Python interpreter image with `uv` bootstrapped.
    pub fn python_uv() -> Self {
        let mut env = BTreeMap::new();
        env.insert("UV_SYSTEM_PYTHON".to_string(), "1".to_string());
        Self {
            base_image: "python:3.11-slim".into(),
            system_packages: ["git", "curl", "ca-certificates", "procps", "build-essential"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            copy_from: vec![(UV_IMAGE.into(), "/uv".into(), "/bin/uv".into())],
            create_user: true,
            uid: 1000,
            gid: 1000,
            workspace_root: "/workspace".into(),
            env,
            run: Vec::new(),
            cmd: vec!["sleep".into(), "infinity".into()],
        }
    }

    /// Layer on top of an already provisioned image, e.g. to add a tool.
    pub fn derived(base_tag: impl Into<String>, run: Vec<String>) -> Self {
        Self {
            base_image: base_tag.into(),
            system_packages: Vec::new(),
            copy_from: Vec::new(),
            create_user: false,
            uid: 1000,
            gid: 1000,
            workspace_root: "/workspace".into(),
            env: BTreeMap::new(),
            run,
            cmd: Vec::new(),
        }
    }

    /// The `uv` image matched to a sandbox configuration.
    pub fn for_sandbox(config: &SandboxConfiguration) -> Self {
        let mut recipe = Self::python_uv().with_user(config.uid, config.gid);
        recipe.workspace_root = config.workspace_root.clone();
        if config.cache_volume.is_some() {
            recipe = recipe.with_env("UV_CACHE_DIR", CACHE_MOUNT);
        }
        recipe
    }

    pub fn with_user(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_run(mut self, step: impl Into<String>) -> Self {
        self.run.push(step.into());
        self
    }

    /// Render the recipe as a Dockerfile.
    pub fn render(&self) -> String {
        let mut lines = vec![format!("FROM {}", self.base_image)];

        if !self.system_packages.is_empty() {
            lines.push(format!(
                "RUN apt-get update && apt-get install -y --no-install-recommends {} \\\n    && rm -rf /var/lib/apt/lists/*",
                self.system_packages.join(" ")
            ));
        }
        for (image, src, dst) in &self.copy_from {
            lines.push(format!("COPY --from={} {} {}", image, src, dst));
        }
        for (key, value) in &self.env {
            lines.push(format!("ENV {}={:?}", key, value));
        }

        let user = format!("{}:{}", self.uid, self.gid);
        if self.create_user {
            lines.push(format!(
                "RUN groupadd -g {gid} sandbox && useradd -m -u {uid} -g {gid} sandbox",
                uid = self.uid,
                gid = self.gid
            ));
            let mut dirs = vec![self.workspace_root.clone()];
            if self.env.contains_key("UV_CACHE_DIR") {
                dirs.push(CACHE_MOUNT.to_string());
            }
            lines.push(format!(
                "RUN mkdir -p {dirs} && chown {user} {dirs}",
                dirs = dirs.join(" "),
                user = user
            ));
        } else if !self.run.is_empty() {
            lines.push("USER root".to_string());
        }

        for step in &self.run {
            lines.push(format!("RUN {}", step));
        }

        lines.push(format!("WORKDIR {}", self.workspace_root));
        lines.push(format!("USER {}", user));
        if !self.cmd.is_empty() {
            let quoted: Vec<String> = self.cmd.iter().map(|c| format!("{:?}", c)).collect();
            lines.push(format!("CMD [{}]", quoted.join(", ")));
        }

        let mut out = lines.join("\n");
        out.push('\n');
        out
    }
}

/// Makes sure images and volumes exist before a container is created.
pub struct ImageProvisioner {
    engine: Arc<dyn ContainerEngine>,
}

impl ImageProvisioner {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }

    /// Build `tag` from `recipe` unless it is already present.
    ///
    /// The build context lives in a temporary directory removed when this
    /// returns, whether the build succeeded or not.
    #[instrument(skip(self, recipe), fields(image = %tag))]
    pub async fn ensure_image(&self, tag: &str, recipe: &ImageRecipe) -> Result<String> {
        let exists = self
            .engine
            .image_exists(tag)
            .await
            .map_err(|e| Error::container_runtime(format!("image lookup failed: {}", e)))?;
        if exists {
            debug!("Image already present");
            return Ok(tag.to_string());
        }

        info!(base = %recipe.base_image, "Building execution image");
        let context = tempfile::Builder::new().prefix("agentbox-build-").tempdir()?;
        std::fs::write(context.path().join("Dockerfile"), recipe.render())?;

        self.engine
            .image_build(context.path(), tag)
            .await
            .map_err(|e| Error::container_runtime(format!("image build failed: {}", e)))?;

        info!("Image built");
        Ok(tag.to_string())
    }

    /// Create the named volume if it does not exist yet.
    #[instrument(skip(self))]
    pub async fn ensure_cache_volume(&self, name: &str) -> Result<()> {
        match self.engine.volume_ensure(name).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_conflict() => {
                debug!("Volume already exists");
                Ok(())
            }
            Err(e) => Err(Error::container_runtime(format!(
                "volume '{}' could not be created: {}",
                name, e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_python_uv_recipe() {
        let dockerfile = ImageRecipe::python_uv().render();
        assert!(dockerfile.starts_with("FROM python:3.11-slim\n"));
        assert!(dockerfile.contains("COPY --from=ghcr.io/astral-sh/uv:latest /uv /bin/uv"));
        assert!(dockerfile.contains("ENV UV_SYSTEM_PYTHON=\"1\""));
        assert!(dockerfile.contains("useradd -m -u 1000 -g 1000 sandbox"));
        assert!(dockerfile.contains("chown 1000:1000 /workspace"));
        assert!(dockerfile.contains("USER 1000:1000"));
        assert!(dockerfile.ends_with("CMD [\"sleep\", \"infinity\"]\n"));
    }

    #[test]
    fn test_recipe_for_sandbox_with_cache() {
        let config = SandboxConfiguration::default().with_cache_volume(DEFAULT_CACHE_VOLUME);
        let dockerfile = ImageRecipe::for_sandbox(&config).render();
        assert!(dockerfile.contains("ENV UV_CACHE_DIR=\"/uv_cache\""));
        assert!(dockerfile.contains("mkdir -p /workspace /uv_cache"));
    }

    #[test]
    fn test_derived_recipe_runs_as_root_then_drops() {
        let run = vec!["uv pip install aider-chat".to_string()];
        let dockerfile = ImageRecipe::derived("agentbox-sandbox:latest", run).render();
        let lines: Vec<&str> = dockerfile.lines().collect();
        assert_eq!(lines[0], "FROM agentbox-sandbox:latest");
        assert_eq!(lines[1], "USER root");
        assert_eq!(lines[2], "RUN uv pip install aider-chat");
        assert_eq!(*lines.last().unwrap(), "USER 1000:1000");
    }
}
