//! Audit log seam.
//!
//! Session enter/exit records are fire-and-forget: delivery failures are
//! logged and never affect session lifecycle outcomes.

use async_trait::async_trait;
use tracing::warn;

/// One audit record.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    /// Human-readable actor name.
    pub actor: String,
    /// Actor role ("chatter", "admin", "monitor").
    pub role: String,
    /// Human-readable action, e.g. "saiu do chat de Luna".
    pub message: String,
}

/// External audit/log collaborator.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> anyhow::Result<()>;
}

/// Sink that drops every record. Default for embedders without auditing.
#[derive(Default)]
pub struct NoopAudit;

#[async_trait]
impl AuditSink for NoopAudit {
    async fn record(&self, _entry: AuditEntry) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Deliver an entry on a detached task, swallowing failures.
pub(crate) fn emit(sink: std::sync::Arc<dyn AuditSink>, entry: AuditEntry) {
    tokio::spawn(async move {
        if let Err(e) = sink.record(entry).await {
            warn!("Failed to deliver audit record: {}", e);
        }
    });
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::sync::Mutex;

    /// Collects records for assertions.
    #[derive(Default)]
    pub struct MemoryAudit {
        pub entries: Mutex<Vec<AuditEntry>>,
    }

    #[async_trait]
    impl AuditSink for MemoryAudit {
        async fn record(&self, entry: AuditEntry) -> anyhow::Result<()> {
            self.entries.lock().await.push(entry);
            Ok(())
        }
    }
}
