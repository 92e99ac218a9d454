//! Agent and prompt loading, and dispatch composition.
//!
//! Agents and prompts are markdown files with a YAML frontmatter header:
//!
//! ```markdown
//! ---
//! name: reviewer
//! description: Reviews diffs for actionable issues
//! tools: [Read, Grep, Glob]
//! model: opus
//! ---
//! You are a meticulous code reviewer...
//! ```
//!
//! Composition turns an agent step plus its loaded agent and prompt into a
//! [`DispatchRequest`]. It is a pure function of its inputs.

use std::path::{Path, PathBuf};

use phaseflow_types::agent::{AgentDefinition, DispatchOptions, DispatchRequest, PromptDefinition};
use phaseflow_types::artifact::ArtifactKind;
use phaseflow_types::workflow::{AgentPromptStep, StepInput, WorkflowDefaults};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use thiserror::Error;

use super::context::{ExecutionContext, lookup_segments, render_template, value_to_string};
use super::resolver::{NameResolver, ResolutionError};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} must start with YAML frontmatter delimited by '---'", path.display())]
    MissingFrontmatter { path: PathBuf },

    #[error("invalid frontmatter in {}: {message}", path.display())]
    Frontmatter { path: PathBuf, message: String },

    #[error(transparent)]
    Resolution(#[from] ResolutionError),
}

// ---------------------------------------------------------------------------
// Frontmatter parsing
// ---------------------------------------------------------------------------

/// Split a document into `(yaml, body)`. Returns `None` without a header.
pub fn extract_frontmatter(content: &str) -> Option<(&str, &str)> {
    let after_open = content.strip_prefix("---")?;
    let after_open = after_open
        .strip_prefix("\r\n")
        .or_else(|| after_open.strip_prefix('\n'))?;

    let closing_pos = if after_open.starts_with("---") {
        0
    } else {
        after_open.find("\n---")? + 1
    };
    let yaml_str = &after_open[..closing_pos];
    let remainder = &after_open[closing_pos + 3..];

    let body_str = remainder
        .split_once('\n')
        .map_or("", |(_, body)| body)
        .trim_start_matches(['\n', '\r']);

    Some((yaml_str, body_str))
}

#[derive(Debug, Default, Deserialize)]
struct AgentFrontmatter {
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    tools: Option<ToolList>,
    #[serde(default)]
    model: Option<String>,
}

/// Tools may be written as a YAML list or a comma-separated string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ToolList {
    List(Vec<String>),
    Csv(String),
}

impl ToolList {
    fn into_vec(self) -> Vec<String> {
        match self {
            ToolList::List(tools) => tools,
            ToolList::Csv(s) => s
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PromptFrontmatter {
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

fn parse_yaml<T: for<'de> Deserialize<'de> + Default>(
    yaml: &str,
    path: &Path,
) -> Result<T, LoaderError> {
    if yaml.trim().is_empty() {
        return Ok(T::default());
    }
    serde_yaml_ng::from_str(yaml).map_err(|e| LoaderError::Frontmatter {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Parse an agent document. The file stem names the agent when the header
/// does not.
pub fn parse_agent(path: &Path, content: &str) -> Result<AgentDefinition, LoaderError> {
    let (yaml, body) = extract_frontmatter(content).ok_or_else(|| {
        LoaderError::MissingFrontmatter {
            path: path.to_path_buf(),
        }
    })?;
    let meta: AgentFrontmatter = parse_yaml(yaml, path)?;

    Ok(AgentDefinition {
        name: meta.name.unwrap_or_else(|| file_stem(path)),
        description: meta.description.unwrap_or_default(),
        tools: meta.tools.map(ToolList::into_vec).unwrap_or_default(),
        model: meta.model,
        system_prompt: body.trim_end().to_string(),
    })
}

/// Parse a prompt document. The header is optional for prompts.
pub fn parse_prompt(path: &Path, content: &str) -> Result<PromptDefinition, LoaderError> {
    let (meta, body) = match extract_frontmatter(content) {
        Some((yaml, body)) => (parse_yaml::<PromptFrontmatter>(yaml, path)?, body),
        None => (PromptFrontmatter::default(), content),
    };

    Ok(PromptDefinition {
        name: meta.name.unwrap_or_else(|| file_stem(path)),
        description: meta.description.unwrap_or_default(),
        body: body.trim_end().to_string(),
    })
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn read(path: &Path) -> Result<String, LoaderError> {
    std::fs::read_to_string(path).map_err(|source| LoaderError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolve and parse an agent by name.
pub fn load_agent(resolver: &NameResolver, name: &str) -> Result<AgentDefinition, LoaderError> {
    let resolution = resolver.resolve(ArtifactKind::Agent, name)?;
    parse_agent(&resolution.path, &read(&resolution.path)?)
}

/// Resolve and parse a prompt by name.
pub fn load_prompt(resolver: &NameResolver, name: &str) -> Result<PromptDefinition, LoaderError> {
    let resolution = resolver.resolve(ArtifactKind::Prompt, name)?;
    parse_prompt(&resolution.path, &read(&resolution.path)?)
}

// ---------------------------------------------------------------------------
// Composition
// ---------------------------------------------------------------------------

/// The spec document a run was started for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecDocument {
    pub path: PathBuf,
    pub name: String,
    pub content: String,
}

impl SpecDocument {
    pub fn load(path: &Path) -> Result<Self, LoaderError> {
        Ok(Self {
            path: path.to_path_buf(),
            name: file_stem(path),
            content: read(path)?,
        })
    }
}

/// Run-wide values exposed to every prompt template.
#[derive(Debug, Clone, Default)]
pub struct RunBuiltins {
    pub spec: Option<SpecDocument>,
    pub worktree: Option<PathBuf>,
    pub session_id: String,
    pub branch: Option<String>,
}

/// Names the template scope defines itself. They shadow context keys of the
/// same name, so workflows may not use them as output keys.
pub const BUILTIN_NAMES: &[&str] = &[
    "spec",
    "worktree",
    "sessionId",
    "branch",
    "input",
    "task",
    "taskId",
    "taskIndex",
    "taskCount",
];

/// Variables visible to a template.
///
/// A path whose first segment names a built-in present in this scope resolves
/// against the built-in only; every other path is looked up in the context.
/// Task built-ins exist only while a per-task step is running.
pub struct TemplateScope<'a> {
    builtins: Map<String, Value>,
    ctx: &'a ExecutionContext,
}

impl<'a> TemplateScope<'a> {
    pub fn new(run: &RunBuiltins, ctx: &'a ExecutionContext) -> Self {
        let mut builtins = Map::new();
        if let Some(spec) = &run.spec {
            builtins.insert(
                "spec".to_string(),
                json!({
                    "path": spec.path.display().to_string(),
                    "name": spec.name,
                    "content": spec.content,
                }),
            );
        }
        if let Some(worktree) = &run.worktree {
            builtins.insert("worktree".to_string(), json!(worktree.display().to_string()));
        }
        builtins.insert("sessionId".to_string(), json!(run.session_id));
        if let Some(branch) = &run.branch {
            builtins.insert("branch".to_string(), json!(branch));
        }
        if let Some(cursor) = ctx.current_task() {
            builtins.insert(
                "task".to_string(),
                ctx.current_task_record()
                    .cloned()
                    .unwrap_or_else(|| json!({ "id": cursor.id })),
            );
            builtins.insert("taskId".to_string(), json!(cursor.id));
            builtins.insert("taskIndex".to_string(), json!(cursor.index));
            builtins.insert("taskCount".to_string(), json!(cursor.count));
        }
        Self { builtins, ctx }
    }

    fn with_input(mut self, input: Value) -> Self {
        self.builtins.insert("input".to_string(), input);
        self
    }

    pub fn lookup(&self, path: &str) -> Option<Value> {
        let mut segments = path.split('.');
        let head = segments.next()?;
        match self.builtins.get(head) {
            Some(root) => lookup_segments(root, segments).cloned(),
            None => self.ctx.get(path).cloned(),
        }
    }

    pub fn render(&self, template: &str) -> String {
        render_template(template, |path| self.lookup(path))
    }

    fn render_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.render(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.render_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.render_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

/// The agent a step dispatches to: its own, else the workflow default.
pub fn agent_name_for<'a>(step: &'a AgentPromptStep, defaults: &'a WorkflowDefaults) -> Option<&'a str> {
    step.agent.as_deref().or(defaults.agent.as_deref())
}

/// Build the dispatch request for an agent step.
///
/// The user prompt is the rendered prompt body. Step input is exposed as
/// `{{ input }}` and, when the body does not reference it, appended after a
/// blank line. A step without a prompt sends its rendered input alone.
pub fn compose_dispatch(
    step: &AgentPromptStep,
    agent: &AgentDefinition,
    prompt: Option<&PromptDefinition>,
    defaults: &WorkflowDefaults,
    run: &RunBuiltins,
    ctx: &ExecutionContext,
) -> DispatchRequest {
    let scope = TemplateScope::new(run, ctx);
    let input = step.input.as_ref().map(|input| match input {
        StepInput::Text(text) => Value::String(scope.render(text)),
        StepInput::Structured(map) => scope.render_value(&Value::Object(map.clone())),
    });
    let input_text = input.as_ref().map(|v| match v {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| value_to_string(other)),
    });

    let user_prompt = match prompt {
        Some(prompt) => {
            let references_input = prompt.body.contains("{{ input") || prompt.body.contains("{{input");
            let scope = match &input {
                Some(v) => scope.with_input(v.clone()),
                None => scope,
            };
            let body = scope.render(&prompt.body);
            match input_text {
                Some(text) if !references_input => format!("{body}\n\n{text}"),
                _ => body,
            }
        }
        None => input_text.unwrap_or_default(),
    };

    DispatchRequest {
        prompt: user_prompt,
        options: DispatchOptions {
            system_prompt: agent.system_prompt.clone(),
            tools: agent.tools.clone(),
            model: step
                .model
                .clone()
                .or_else(|| agent.model.clone())
                .or_else(|| defaults.model.clone()),
            working_directory: run.worktree.clone(),
            permission_mode: defaults.permission_mode.clone(),
            setting_sources: defaults.setting_sources.clone(),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
