use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Structured audit event envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: String,
    /// Sandbox container name (if applicable)
    pub sandbox: Option<String>,
    /// Actor who triggered the event (tool name or 'system')
    pub actor: String,
    /// Timestamp of the event
    pub timestamp: DateTime<Utc>,
    /// Event type category
    pub event_type: EventType,
    /// Event severity level
    pub severity: EventSeverity,
    /// Structured payload (event-specific data)
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn new(event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sandbox: None,
            actor: "system".to_string(),
            timestamp: Utc::now(),
            event_type,
            severity: EventSeverity::Info,
            payload,
        }
    }

    pub fn with_sandbox(mut self, name: &str) -> Self {
        self.sandbox = Some(name.to_string());
        self
    }

    pub fn with_actor(mut self, actor: &str) -> Self {
        self.actor = actor.to_string();
        self
    }

    pub fn with_severity(mut self, severity: EventSeverity) -> Self {
        self.severity = severity;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// Container created and started
    SandboxCreated,
    /// Container force-removed
    SandboxDestroyed,
    /// Shell command executed inside a sandbox
    CommandExecuted,
    /// Script written, executed and cleaned up
    ScriptExecuted,
    /// File injected into a sandbox
    FileWritten,
    /// File read back from a sandbox
    FileRead,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Info,
    Warning,
    Error,
}

/// Payload for [`EventType::CommandExecuted`] and [`EventType::ScriptExecuted`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecPayload {
    pub command: String,
    pub workdir: String,
    pub exit_code: i64,
    pub timed_out: bool,
    pub duration_ms: u64,
}

/// Payload for file transfer events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsPayload {
    pub path: String,
    pub operation: String,
    pub size_bytes: Option<u64>,
    pub success: bool,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_serializes_event_type() {
        let event = EventEnvelope::new(EventType::SandboxCreated, serde_json::json!({}))
            .with_sandbox("agentbox-1234")
            .with_actor("sandbox_shell");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "SANDBOX_CREATED");
        assert_eq!(json["sandbox"], "agentbox-1234");
        assert_eq!(json["severity"], "info");
    }
}
