//! Named artifacts resolved from the project and built-in tiers.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Kind of artifact the resolver can look up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Workflow,
    Agent,
    Prompt,
}

impl ArtifactKind {
    /// Sub-directory holding this kind within a tier.
    pub fn dir_name(&self) -> &'static str {
        match self {
            ArtifactKind::Workflow => "workflows",
            ArtifactKind::Agent => "agents",
            ArtifactKind::Prompt => "prompts",
        }
    }

    /// File extensions tried, in order.
    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            ArtifactKind::Workflow => &["yaml", "yml"],
            ArtifactKind::Agent | ArtifactKind::Prompt => &["md"],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Workflow => "workflow",
            ArtifactKind::Agent => "agent",
            ArtifactKind::Prompt => "prompt",
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tier an artifact was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactSource {
    Project,
    Builtin,
}

impl std::fmt::Display for ArtifactSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactSource::Project => f.write_str("project"),
            ArtifactSource::Builtin => f.write_str("builtin"),
        }
    }
}

/// Where a name resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub path: PathBuf,
    pub source: ArtifactSource,
}
