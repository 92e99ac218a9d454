//! Audit stream entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle status of a step in the audit stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Started,
    Completed,
    Failed,
    Skipped,
    Paused,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Started => "started",
            AuditStatus::Completed => "completed",
            AuditStatus::Failed => "failed",
            AuditStatus::Skipped => "skipped",
            AuditStatus::Paused => "paused",
        }
    }
}

impl std::fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record in the audit stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Step (or phase) name.
    pub step: String,
    pub status: AuditStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl AuditEntry {
    pub fn new(step: impl Into<String>, status: AuditStatus) -> Self {
        Self {
            step: step.into(),
            status,
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    /// Attach a metadata field, creating the map on first use.
    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value.into());
        self
    }

    /// The `reason` metadata field, present on skipped and failed entries.
    pub fn reason(&self) -> Option<&str> {
        self.metadata.as_ref()?.get("reason")?.as_str()
    }
}
