//! Two-tier artifact resolution.
//!
//! Workflows, agents and prompts are looked up by name in the project tier
//! first and the builtin tier second. The first match wins, so a project
//! overrides a builtin artifact simply by reusing its name.

use std::path::{Path, PathBuf};

use phaseflow_types::artifact::{ArtifactKind, ArtifactSource, Resolution};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("{kind} '{name}' not found (searched: {})", format_searched(searched))]
    NotFound {
        kind: ArtifactKind,
        name: String,
        searched: Vec<PathBuf>,
    },

    #[error("invalid {kind} name '{name}'")]
    InvalidName { kind: ArtifactKind, name: String },
}

fn format_searched(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Resolves artifact names against a project directory and an optional
/// builtin directory. Each tier holds `workflows/`, `agents/` and `prompts/`.
#[derive(Debug, Clone)]
pub struct NameResolver {
    project_dir: PathBuf,
    builtin_dir: Option<PathBuf>,
}

impl NameResolver {
    pub fn new(project_dir: impl Into<PathBuf>, builtin_dir: Option<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            builtin_dir,
        }
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn builtin_dir(&self) -> Option<&Path> {
        self.builtin_dir.as_deref()
    }

    /// Find `name` of `kind`, project tier first.
    pub fn resolve(&self, kind: ArtifactKind, name: &str) -> Result<Resolution, ResolutionError> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(ResolutionError::InvalidName {
                kind,
                name: name.to_string(),
            });
        }

        let tiers = std::iter::once((ArtifactSource::Project, self.project_dir.as_path())).chain(
            self.builtin_dir
                .as_deref()
                .map(|dir| (ArtifactSource::Builtin, dir)),
        );

        let mut searched = Vec::new();
        for (source, root) in tiers {
            for candidate in candidates(root, kind, name) {
                if candidate.is_file() {
                    let path = std::path::absolute(&candidate).unwrap_or(candidate);
                    tracing::debug!(%kind, name, %source, path = %path.display(), "resolved artifact");
                    return Ok(Resolution { path, source });
                }
                searched.push(candidate);
            }
        }

        Err(ResolutionError::NotFound {
            kind,
            name: name.to_string(),
            searched,
        })
    }
}

fn candidates(root: &Path, kind: ArtifactKind, name: &str) -> Vec<PathBuf> {
    let dir = root.join(kind.dir_name());
    kind.extensions()
        .iter()
        .map(|ext| dir.join(format!("{name}.{ext}")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_project_overrides_builtin() {
        let project = tempfile::tempdir().unwrap();
        let builtin = tempfile::tempdir().unwrap();
        write(builtin.path(), "agents/developer.md", "builtin");
        write(project.path(), "agents/developer.md", "project");

        let resolver = NameResolver::new(project.path(), Some(builtin.path().to_path_buf()));
        let found = resolver.resolve(ArtifactKind::Agent, "developer").unwrap();
        assert_eq!(found.source, ArtifactSource::Project);
        assert_eq!(std::fs::read_to_string(found.path).unwrap(), "project");
    }

    #[test]
    fn test_falls_back_to_builtin() {
        let project = tempfile::tempdir().unwrap();
        let builtin = tempfile::tempdir().unwrap();
        write(builtin.path(), "prompts/review.md", "builtin");

        let resolver = NameResolver::new(project.path(), Some(builtin.path().to_path_buf()));
        let found = resolver.resolve(ArtifactKind::Prompt, "review").unwrap();
        assert_eq!(found.source, ArtifactSource::Builtin);
        assert!(found.path.is_absolute());
    }

    #[test]
    fn test_workflow_accepts_yml_extension() {
        let project = tempfile::tempdir().unwrap();
        write(project.path(), "workflows/ship.yml", "name: ship");

        let resolver = NameResolver::new(project.path(), None);
        let found = resolver.resolve(ArtifactKind::Workflow, "ship").unwrap();
        assert!(found.path.ends_with("workflows/ship.yml"));
    }

    #[test]
    fn test_not_found_lists_searched_locations() {
        let project = tempfile::tempdir().unwrap();
        let builtin = tempfile::tempdir().unwrap();
        let resolver = NameResolver::new(project.path(), Some(builtin.path().to_path_buf()));

        let err = resolver.resolve(ArtifactKind::Workflow, "ghost").unwrap_err();
        let ResolutionError::NotFound { kind, searched, .. } = &err else {
            panic!("expected NotFound, got {err:?}");
        };
        assert_eq!(*kind, ArtifactKind::Workflow);
        // yaml + yml in each of the two tiers
        assert_eq!(searched.len(), 4);
        let msg = err.to_string();
        assert!(msg.contains("workflow 'ghost' not found"));
        assert!(msg.contains(&project.path().display().to_string()));
        assert!(msg.contains(&builtin.path().display().to_string()));
    }

    #[test]
    fn test_path_like_names_rejected() {
        let project = tempfile::tempdir().unwrap();
        let resolver = NameResolver::new(project.path(), None);
        assert!(matches!(
            resolver.resolve(ArtifactKind::Agent, "../secrets"),
            Err(ResolutionError::InvalidName { .. })
        ));
    }
}
