//! Application state shared by every command.
//!
//! Resolves the project root, loads `phaseflow.toml`, and anchors the project
//! layout. Engines are built per command from this state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use phaseflow_core::workflow::dispatch::TaskExecutor;
use phaseflow_core::workflow::executor::{RunOptions, WorkflowEngine};
use phaseflow_infra::checkpoint_store::FileCheckpointStore;
use phaseflow_infra::config::load_engine_config;
use phaseflow_infra::filesystem::{ProjectLayout, resolve_data_dir};
use phaseflow_types::config::EngineConfig;

pub struct AppState {
    pub config: EngineConfig,
    pub layout: ProjectLayout,
}

impl AppState {
    /// Initialize from `root`, or the current directory when unset.
    pub async fn init(root: Option<PathBuf>) -> anyhow::Result<Self> {
        let root = match root {
            Some(root) => root,
            None => std::env::current_dir().context("failed to determine current directory")?,
        };
        let data_dir = resolve_data_dir();
        let config = load_engine_config(&root).await?;
        let layout = ProjectLayout::from_config(&root, &config, &data_dir);
        tracing::debug!(
            root = %root.display(),
            project_dir = %layout.project_dir.display(),
            builtin_dir = %layout.builtin_dir.display(),
            "project layout resolved"
        );

        Ok(Self { config, layout })
    }

    /// Engine over this project's resolver with run options filled from config.
    pub fn engine(&self, executor: Arc<dyn TaskExecutor>, mut options: RunOptions) -> WorkflowEngine {
        if options.worktree.is_none() {
            options.worktree = self.config.worktree.clone();
        }
        if options.default_step_timeout.is_none() {
            options.default_step_timeout = self.config.default_step_timeout_ms.map(Duration::from_millis);
        }
        WorkflowEngine::new(self.layout.resolver(), executor).with_options(options)
    }

    pub fn checkpoint_store(&self) -> FileCheckpointStore {
        FileCheckpointStore::new(&self.layout.checkpoint_dir)
    }
}
