//! Audit sinks for sandbox events.

use std::path::{Path, PathBuf};

use agentbox_core::{
    events::{EventEnvelope, EventType},
    traits::EventEmitter,
    Result,
};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// In-memory audit log for tests and short-lived tools.
pub struct InMemoryAuditLog {
    entries: Mutex<Vec<EventEnvelope>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of all recorded events, oldest first.
    pub async fn entries(&self) -> Vec<EventEnvelope> {
        self.entries.lock().await.clone()
    }

    /// Recorded events of one type.
    pub async fn of_type(&self, event_type: EventType) -> Vec<EventEnvelope> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Events recorded for a single sandbox.
    pub async fn for_sandbox(&self, name: &str) -> Vec<EventEnvelope> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|e| e.sandbox.as_deref() == Some(name))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

impl Default for InMemoryAuditLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventEmitter for InMemoryAuditLog {
    async fn emit(&self, event: EventEnvelope) {
        self.entries.lock().await.push(event);
    }
}

/// Append-only JSON lines audit file.
///
/// One serialized [`EventEnvelope`] per line. Write failures are logged and
/// never surface to the sandbox operation that produced the event.
pub struct JsonlAuditLog {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl JsonlAuditLog {
    /// Open (or create) the audit file for appending.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        tracing::info!(path = %path.display(), "Audit log opened");
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every event back from an audit file.
    pub async fn read_all(path: impl AsRef<Path>) -> Result<Vec<EventEnvelope>> {
        let content = tokio::fs::read_to_string(path).await?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(Into::into))
            .collect()
    }

    async fn append(&self, event: &EventEnvelope) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl EventEmitter for JsonlAuditLog {
    async fn emit(&self, event: EventEnvelope) {
        if let Err(e) = self.append(&event).await {
            tracing::warn!(
                path = %self.path.display(),
                event_id = %event.id,
                error = %e,
                "Failed to append audit event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentbox_core::events::EventSeverity;
    use serde_json::json;

    #[tokio::test]
    async fn test_in_memory_filters() {
        let log = InMemoryAuditLog::new();
        assert!(log.is_empty().await);
        log.emit(EventEnvelope::new(EventType::SandboxCreated, json!({})).with_sandbox("a"))
            .await;
        log.emit(EventEnvelope::new(EventType::CommandExecuted, json!({})).with_sandbox("a"))
            .await;
        log.emit(EventEnvelope::new(EventType::SandboxCreated, json!({})).with_sandbox("b"))
            .await;

        assert_eq!(log.len().await, 3);
        assert_eq!(log.of_type(EventType::SandboxCreated).await.len(), 2);
        assert_eq!(log.for_sandbox("a").await.len(), 2);
    }

    #[tokio::test]
    async fn test_jsonl_appends_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("events.jsonl");

        let log = JsonlAuditLog::open(&path).await.unwrap();
        log.emit(EventEnvelope::new(EventType::FileWritten, json!({"path": "/workspace/a"})))
            .await;
        drop(log);

        let log = JsonlAuditLog::open(&path).await.unwrap();
        log.emit(
            EventEnvelope::new(EventType::SandboxDestroyed, json!({}))
                .with_severity(EventSeverity::Warning),
        )
        .await;

        let events = JsonlAuditLog::read_all(&path).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::FileWritten);
        assert_eq!(events[0].payload["path"], "/workspace/a");
        assert_eq!(events[1].severity, EventSeverity::Warning);
    }
}
