//! Security environment validation.
//!
//! The validator is the trust boundary gate: it reads the engine's daemon
//! configuration and fails closed before any container exists.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};

use agentbox_core::{Error, Result};

use crate::config::SandboxConfiguration;
use crate::engine::{ContainerEngine, EngineInfo};

/// Isolation facts read from the engine. Computed per validation call.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityPosture {
    pub rootless: bool,
    pub runtimes: BTreeSet<String>,
    /// Image checked for presence.
    pub image: String,
    pub image_present: bool,
    pub server_version: Option<String>,
}

impl SecurityPosture {
    /// Derive the posture from raw daemon info.
    pub fn from_info(info: &EngineInfo, image: &str, image_present: bool) -> Self {
        Self {
            rootless: info
                .security_options
                .iter()
                .any(|opt| opt.contains("rootless")),
            runtimes: info.runtimes.iter().cloned().collect(),
            image: image.to_string(),
            image_present,
            server_version: info.server_version.clone(),
        }
    }

    /// Apply the checks in order: rootless, runtime, image.
    pub fn check(&self, runtime: &str) -> Result<()> {
        if !self.rootless {
            return Err(Error::security_environment(
                "container engine is not running in rootless mode",
            ));
        }
        if !self.runtimes.contains(runtime) {
            return Err(Error::security_environment(format!(
                "isolation runtime '{}' is not registered (available: {})",
                runtime,
                self.runtimes.iter().cloned().collect::<Vec<_>>().join(", ")
            )));
        }
        if !self.image_present {
            return Err(Error::ImageMissing(self.image.clone()));
        }
        Ok(())
    }
}

/// Gatekeeper run before any container is created.
pub struct SecurityValidator {
    engine: Arc<dyn ContainerEngine>,
}

impl SecurityValidator {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }

    /// Read the current posture for `image`.
    pub async fn posture(&self, image: &str) -> Result<SecurityPosture> {
        let info = self.engine.info().await.map_err(|e| {
            Error::security_environment(format!("container engine unreachable: {}", e))
        })?;
        let present = self.engine.image_exists(image).await.map_err(|e| {
            Error::security_environment(format!("cannot query image '{}': {}", image, e))
        })?;
        Ok(SecurityPosture::from_info(&info, image, present))
    }

    /// Fail with a security-environment error on the first unmet prerequisite.
    #[instrument(skip(self, config), fields(image = %config.image, runtime = %config.runtime))]
    pub async fn validate(&self, config: &SandboxConfiguration) -> Result<SecurityPosture> {
        let posture = self.posture(&config.image).await?;
        match posture.check(&config.runtime) {
            Ok(()) => {
                info!(
                    backend = self.engine.backend_name(),
                    server_version = posture.server_version.as_deref().unwrap_or("unknown"),
                    "Security environment verified"
                );
                Ok(posture)
            }
            Err(e) => {
                warn!(error = %e, "Security environment check failed");
                Err(e)
            }
        }
    }
}
