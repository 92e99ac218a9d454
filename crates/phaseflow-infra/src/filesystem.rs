//! Data directory and project layout.
//!
//! A project keeps its own `workflows/`, `agents/` and `prompts/` under the
//! project directory (`.phaseflow` by default). Built-in artifacts ship under
//! `<data_dir>/builtin` and are shadowed by project artifacts of the same name.

use std::path::{Path, PathBuf};

use phaseflow_core::workflow::resolver::NameResolver;
use phaseflow_types::config::EngineConfig;

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `PHASEFLOW_DATA_DIR` environment variable
/// 2. `~/.phaseflow`
/// 3. `./.phaseflow`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PHASEFLOW_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".phaseflow");
    }

    PathBuf::from(".phaseflow")
}

/// Built-in tier under a data directory: `{data_dir}/builtin`.
pub fn builtin_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("builtin")
}

/// Resolved directories for one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    pub project_dir: PathBuf,
    pub builtin_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
}

impl ProjectLayout {
    /// Anchor the configured directories at `root`. Absolute paths in the
    /// config are kept as they are.
    pub fn from_config(root: &Path, config: &EngineConfig, data_dir: &Path) -> Self {
        let anchor = |p: &Path| if p.is_absolute() { p.to_path_buf() } else { root.join(p) };
        Self {
            project_dir: anchor(&config.project_dir),
            builtin_dir: config
                .builtin_dir
                .as_deref()
                .map(anchor)
                .unwrap_or_else(|| builtin_dir(data_dir)),
            checkpoint_dir: anchor(&config.checkpoint_dir),
        }
    }

    pub fn resolver(&self) -> NameResolver {
        NameResolver::new(&self.project_dir, Some(self.builtin_dir.clone()))
    }
}
