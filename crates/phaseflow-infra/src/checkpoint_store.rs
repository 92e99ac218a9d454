//! JSON checkpoint files for paused runs.
//!
//! When a run pauses, the caller saves a [`SavedCheckpoint`] and later hands
//! its `checkpoint` back to the engine's `resume`. Files are named
//! `{workflow}-{run_id}.json` so runs of one workflow sort by time (run ids
//! are UUID v7).

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use phaseflow_types::run::{Checkpoint, RunResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A paused run, as written to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedCheckpoint {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub paused_at_phase: String,
    #[serde(default)]
    pub blocker: Option<String>,
    pub checkpoint: Checkpoint,
    pub saved_at: DateTime<Utc>,
}

impl SavedCheckpoint {
    /// Build from a paused run. Returns `None` for completed or failed runs.
    pub fn from_result(result: &RunResult) -> Option<Self> {
        if !result.is_paused() {
            return None;
        }
        Some(Self {
            run_id: result.run_id,
            workflow_name: result.workflow_name.clone(),
            paused_at_phase: result.paused_at_phase.clone()?,
            blocker: result.blocker_details.clone(),
            checkpoint: result.checkpoint.clone()?,
            saved_at: Utc::now(),
        })
    }
}

/// Directory of checkpoint files.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, workflow_name: &str, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{workflow_name}-{run_id}.json"))
    }

    /// Write `saved` and return the file path.
    pub async fn save(&self, saved: &SavedCheckpoint) -> anyhow::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        let path = self.path_for(&saved.workflow_name, saved.run_id);
        let json = serde_json::to_string_pretty(saved).context("failed to serialize checkpoint")?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;

        tracing::info!(
            workflow = %saved.workflow_name,
            phase = %saved.paused_at_phase,
            path = %path.display(),
            "checkpoint saved"
        );
        Ok(path)
    }

    /// Read a checkpoint file.
    ///
    /// Accepts either a full [`SavedCheckpoint`] or a bare [`Checkpoint`]
    /// record, so hand-written checkpoints work too.
    pub async fn load(path: &Path) -> anyhow::Result<LoadedCheckpoint> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read checkpoint {}", path.display()))?;

        if let Ok(saved) = serde_json::from_str::<SavedCheckpoint>(&content) {
            return Ok(LoadedCheckpoint::Saved(saved));
        }
        let checkpoint = serde_json::from_str::<Checkpoint>(&content)
            .with_context(|| format!("{} is not a checkpoint file", path.display()))?;
        Ok(LoadedCheckpoint::Bare(checkpoint))
    }

    /// Most recently saved checkpoint for a workflow, if any.
    pub async fn latest(&self, workflow_name: &str) -> anyhow::Result<Option<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to list {}", self.dir.display()));
            }
        };

        let prefix = format!("{workflow_name}-");
        let mut latest: Option<PathBuf> = None;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(id) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".json"))
            else {
                continue;
            };
            // Skip files that belong to a workflow whose name extends this one.
            if Uuid::parse_str(id).is_err() {
                continue;
            }
            let path = entry.path();
            if latest.as_ref().is_none_or(|current| path > *current) {
                latest = Some(path);
            }
        }
        Ok(latest)
    }
}

/// Result of [`FileCheckpointStore::load`].
#[derive(Debug, Clone, PartialEq)]
pub enum LoadedCheckpoint {
    Saved(SavedCheckpoint),
    Bare(Checkpoint),
}

impl LoadedCheckpoint {
    pub fn checkpoint(&self) -> &Checkpoint {
        match self {
            LoadedCheckpoint::Saved(saved) => &saved.checkpoint,
            LoadedCheckpoint::Bare(checkpoint) => checkpoint,
        }
    }

    /// Phase the run paused at, when the file recorded it.
    pub fn paused_at_phase(&self) -> Option<&str> {
        match self {
            LoadedCheckpoint::Saved(saved) => Some(&saved.paused_at_phase),
            LoadedCheckpoint::Bare(_) => None,
        }
    }
}
