//! Ordered audit stream.
//!
//! Every step transition is reported to an [`AuditSink`] supplied at engine
//! construction. Emission goes through [`AuditLog`], which serializes calls
//! so concurrent parallel children never interleave inside a single record,
//! and each child's own started/completed pair stays in order.

use std::sync::{Arc, Mutex};

use phaseflow_types::audit::{AuditEntry, AuditStatus};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Error)]
#[error("audit sink failed: {message}")]
pub struct AuditError {
    pub message: String,
}

impl AuditError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Receives audit entries, synchronously and in emission order.
///
/// An error returned here fails the run.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry) -> Result<(), AuditError>;
}

impl<F> AuditSink for F
where
    F: Fn(&AuditEntry) -> Result<(), AuditError> + Send + Sync,
{
    fn record(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        self(entry)
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Discards every entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _entry: &AuditEntry) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Keeps every entry in memory. Intended for tests and short runs.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        self.entries
            .lock()
            .map_err(|_| AuditError::new("memory sink poisoned"))?
            .push(entry.clone());
        Ok(())
    }
}

/// Streams entries into an unbounded channel drained by a collaborator.
#[derive(Debug, Clone)]
pub struct ChannelAuditSink {
    tx: mpsc::UnboundedSender<AuditEntry>,
}

impl ChannelAuditSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AuditEntry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AuditSink for ChannelAuditSink {
    fn record(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        self.tx
            .send(entry.clone())
            .map_err(|_| AuditError::new("audit receiver dropped"))
    }
}

/// Forwards entries to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let metadata = entry
            .metadata
            .as_ref()
            .map(|m| serde_json::Value::Object(m.clone()).to_string())
            .unwrap_or_default();
        match entry.status {
            AuditStatus::Failed => tracing::warn!(
                step = %entry.step,
                status = %entry.status,
                metadata = %metadata,
                "audit"
            ),
            _ => tracing::info!(
                step = %entry.step,
                status = %entry.status,
                metadata = %metadata,
                "audit"
            ),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AuditLog
// ---------------------------------------------------------------------------

/// Single-writer front for an [`AuditSink`].
#[derive(Clone)]
pub struct AuditLog {
    sink: Arc<dyn AuditSink>,
    writer: Arc<Mutex<()>>,
}

impl AuditLog {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            sink,
            writer: Arc::new(Mutex::new(())),
        }
    }

    pub fn emit(&self, entry: AuditEntry) -> Result<(), AuditError> {
        let _guard = self
            .writer
            .lock()
            .map_err(|_| AuditError::new("audit writer poisoned"))?;
        self.sink.record(&entry)
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog").finish_non_exhaustive()
    }
}
