//! Logging configuration.

use agentbox_core::{config::LoggingConfig, Error, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Build the filter: `RUST_LOG` wins over the configured level.
fn build_filter(env_directive: Option<String>, level: &str) -> Result<EnvFilter> {
    let directive = env_directive
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| level.to_string());

    EnvFilter::try_new(&directive)
        .map_err(|e| Error::internal(format!("Invalid log filter '{}': {}", directive, e)))
}

/// Install the global subscriber with plain or JSON stdout logging.
pub fn configure_tracing(config: &LoggingConfig) -> Result<()> {
    let env_filter = build_filter(std::env::var("RUST_LOG").ok(), &config.level)?;

    // Exactly one of the two fmt layers is active.
    let (plain, json) = if config.json {
        (None, Some(tracing_subscriber::fmt::layer().json()))
    } else {
        (Some(tracing_subscriber::fmt::layer()), None)
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(plain)
        .with(json)
        .try_init()
        .map_err(|e| Error::internal(format!("Failed to install tracing subscriber: {}", e)))?;

    tracing::debug!(json = config.json, "Tracing configured");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_level_used_without_env() {
        let filter = build_filter(None, "info,agentbox=debug").unwrap();
        assert!(filter.to_string().contains("agentbox=debug"));
    }

    #[test]
    fn test_env_directive_takes_precedence() {
        let filter = build_filter(Some("warn".into()), "info").unwrap();
        assert_eq!(filter.to_string(), "warn");
    }

    #[test]
    fn test_blank_env_falls_back_to_level() {
        let filter = build_filter(Some("  ".into()), "error").unwrap();
        assert_eq!(filter.to_string(), "error");
    }

    #[test]
    fn test_invalid_directive_rejected() {
        assert!(build_filter(None, "agentbox=loudest").is_err());
    }
}
