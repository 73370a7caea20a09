//! Error types for agentbox.

use thiserror::Error;

/// Result type alias using agentbox's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for agentbox.
///
/// Infrastructure failures (security environment, container lifecycle, file
/// transfer) are always reported through this type. A target command exiting
/// non-zero is *not* an error; it is carried as data in an execution result.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Security Environment
    // =========================================================================
    #[error("Security environment check failed: {0}")]
    SecurityEnvironment(String),

    #[error("Execution image '{0}' not found")]
    ImageMissing(String),

    #[error("Security violation: {0}")]
    SecurityViolation(String),

    // =========================================================================
    // Container Lifecycle
    // =========================================================================
    #[error("Container runtime error: {0}")]
    ContainerRuntime(String),

    #[error("Container not running: {0}")]
    ContainerNotRunning(String),

    #[error("Resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    // =========================================================================
    // File Transfer
    // =========================================================================
    #[error("File transfer failed: {0}")]
    FileTransfer(String),

    #[error("File '{path}' not found or unreadable: {reason}")]
    FileUnreadable { path: String, reason: String },

    // =========================================================================
    // Tools
    // =========================================================================
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    // =========================================================================
    // Generic Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a security environment error.
    pub fn security_environment(msg: impl Into<String>) -> Self {
        Self::SecurityEnvironment(msg.into())
    }

    /// Create a security violation error.
    pub fn security_violation(msg: impl Into<String>) -> Self {
        Self::SecurityViolation(msg.into())
    }

    /// Create a container runtime error.
    pub fn container_runtime(msg: impl Into<String>) -> Self {
        Self::ContainerRuntime(msg.into())
    }

    /// Create a "container not running" error.
    pub fn not_running(msg: impl Into<String>) -> Self {
        Self::ContainerNotRunning(msg.into())
    }

    /// Create a file transfer error.
    pub fn file_transfer(msg: impl Into<String>) -> Self {
        Self::FileTransfer(msg.into())
    }

    /// Create an invalid request error.
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a tool not found error.
    pub fn tool_not_found(name: impl Into<String>) -> Self {
        Self::ToolNotFound(name.into())
    }

    /// Create a tool execution error.
    pub fn tool_execution(msg: impl Into<String>) -> Self {
        Self::ToolExecution(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error means the host environment does not meet the
    /// isolation prerequisites. A missing image counts as one.
    pub fn is_security_environment(&self) -> bool {
        matches!(self, Self::SecurityEnvironment(_) | Self::ImageMissing(_))
    }

    /// Whether this error originates from sandbox infrastructure rather than
    /// from the caller's request.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::SecurityEnvironment(_)
                | Self::ImageMissing(_)
                | Self::ContainerRuntime(_)
                | Self::ContainerNotRunning(_)
                | Self::ResourceLimitExceeded(_)
                | Self::FileTransfer(_)
                | Self::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_missing_is_security_environment() {
        assert!(Error::ImageMissing("agentbox-sandbox:latest".into()).is_security_environment());
        assert!(Error::security_environment("no rootless").is_security_environment());
        assert!(!Error::container_runtime("boom").is_security_environment());
    }

    #[test]
    fn test_unreadable_is_not_transfer_failure() {
        let err = Error::FileUnreadable {
            path: "/workspace/missing.txt".into(),
            reason: "No such file or directory".into(),
        };
        assert!(!matches!(err, Error::FileTransfer(_)));
        assert!(!err.is_infrastructure());
        assert!(err.to_string().contains("/workspace/missing.txt"));
    }
}
