//! Workflow definition validation, parsing, and filesystem operations.
//!
//! Raw documents (YAML or JSON, always handled as `serde_json::Value`) are
//! validated into the typed [`Step`] tree in one pass. Every structural rule
//! and every condition expression is checked here, so nothing malformed ever
//! reaches the engine.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use phaseflow_types::workflow::{
    AgentPromptStep, CodeStep, LoopStep, OnExhausted, ParallelStep, PerTaskStep, SafetyConfig,
    Step, StepKind, WorkflowDefaults, WorkflowDefinition,
};
use serde_json::{Map, Value};
use thiserror::Error;

use super::condition::Condition;
use super::loader::BUILTIN_NAMES;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// A structural problem in a workflow document.
///
/// `path` locates the offending node, e.g. `phases[2].steps[0].maxRetries`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{path}: {message}")]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Errors that can occur while loading a workflow definition.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Structural validation failure.
    #[error("invalid workflow definition: {0}")]
    Invalid(#[from] ValidationError),

    /// Filesystem I/O failure.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a single raw step into a typed [`Step`].
///
/// Nested steps of parallel, loop and per-task steps are validated recursively
/// through the same rules.
pub fn validate_step(raw: &Value) -> Result<Step, ValidationError> {
    validate_step_at(raw, "step")
}

/// Validate a raw workflow document into a [`WorkflowDefinition`].
///
/// Checks:
/// - `name` is a non-empty string and `version` is a string or number
/// - `defaults` and `safety`, when present, have the documented shape
/// - `phases` is a non-empty list of valid steps with unique names
pub fn validate_workflow_definition(raw: &Value) -> Result<WorkflowDefinition, ValidationError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| ValidationError::new("workflow", "expected a mapping"))?;

    let name = required_str(obj, "name", "workflow")?;
    let version = match obj.get("version") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(_) => {
            return Err(ValidationError::new(
                "version",
                "must be a non-empty string or a number",
            ));
        }
        None => return Err(ValidationError::new("version", "is required")),
    };

    let defaults: WorkflowDefaults = match obj.get("defaults") {
        None | Some(Value::Null) => WorkflowDefaults::default(),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| ValidationError::new("defaults", e.to_string()))?,
    };

    let safety: Option<SafetyConfig> = match obj.get("safety") {
        None | Some(Value::Null) => None,
        Some(v) => Some(
            serde_json::from_value(v.clone())
                .map_err(|e| ValidationError::new("safety", e.to_string()))?,
        ),
    };
    if let Some(safety) = &safety {
        if safety.max_loop_retries == Some(0) {
            return Err(ValidationError::new(
                "safety.maxLoopRetries",
                "must be at least 1",
            ));
        }
        if safety.max_step_timeout_ms == Some(0) {
            return Err(ValidationError::new(
                "safety.maxStepTimeoutMs",
                "must be greater than 0",
            ));
        }
        if safety.max_workflow_duration_ms == Some(0) {
            return Err(ValidationError::new(
                "safety.maxWorkflowDurationMs",
                "must be greater than 0",
            ));
        }
    }

    let raw_phases = obj
        .get("phases")
        .and_then(Value::as_array)
        .ok_or_else(|| ValidationError::new("phases", "must be a list of steps"))?;
    if raw_phases.is_empty() {
        return Err(ValidationError::new(
            "phases",
            "workflow must have at least one phase",
        ));
    }

    let mut phases = Vec::with_capacity(raw_phases.len());
    let mut seen = HashSet::new();
    for (i, raw_phase) in raw_phases.iter().enumerate() {
        let path = format!("phases[{i}]");
        let phase = validate_step_at(raw_phase, &path)?;
        if !seen.insert(phase.name().to_string()) {
            return Err(ValidationError::new(
                path,
                format!("duplicate phase name '{}'", phase.name()),
            ));
        }
        phases.push(phase);
    }

    Ok(WorkflowDefinition {
        name: name.to_string(),
        version,
        defaults,
        safety,
        phases,
    })
}

fn validate_step_at(raw: &Value, path: &str) -> Result<Step, ValidationError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| ValidationError::new(path, "expected a step mapping"))?;
    let name = required_str(obj, "name", path)?.to_string();

    let kind = match obj.get("type") {
        None | Some(Value::Null) => None,
        Some(Value::String(tag)) => Some(StepKind::from_tag(tag).ok_or_else(|| {
            ValidationError::new(
                format!("{path}.type"),
                format!(
                    "unknown step type '{tag}' (expected one of: code, parallel, loop, per-task)"
                ),
            )
        })?),
        Some(other) => {
            return Err(ValidationError::new(
                format!("{path}.type"),
                format!("step type must be a string, got {other}"),
            ));
        }
    };

    match kind {
        None | Some(StepKind::Agent) => validate_agent_step(obj, raw, path),
        Some(StepKind::Code) => {
            let handler = required_str(obj, "handler", path)?.to_string();
            Ok(Step::Code(CodeStep {
                name,
                handler,
                input: optional_str(obj, "input", path)?,
                output: output_key(obj, path)?,
            }))
        }
        Some(StepKind::Parallel) => Ok(Step::Parallel(ParallelStep {
            name,
            steps: validate_children(obj, path)?,
            output: output_key(obj, path)?,
        })),
        Some(StepKind::Loop) => {
            let condition = required_str(obj, "condition", path)?;
            check_condition(condition, &format!("{path}.condition"))?;
            let max_retries = match obj.get("maxRetries") {
                Some(Value::Number(n)) => n
                    .as_u64()
                    .filter(|n| *n >= 1)
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| {
                        ValidationError::new(
                            format!("{path}.maxRetries"),
                            format!("must be an integer >= 1, got {n}"),
                        )
                    })?,
                Some(other) => {
                    return Err(ValidationError::new(
                        format!("{path}.maxRetries"),
                        format!("must be an integer >= 1, got {other}"),
                    ));
                }
                None => {
                    return Err(ValidationError::new(
                        format!("{path}.maxRetries"),
                        "is required for loop steps",
                    ));
                }
            };
            let on_exhausted: OnExhausted = match obj.get("onExhausted") {
                None | Some(Value::Null) => OnExhausted::default(),
                Some(v) => serde_json::from_value(v.clone()).map_err(|_| {
                    ValidationError::new(
                        format!("{path}.onExhausted"),
                        format!("must be one of escalate, warn, fail; got {v}"),
                    )
                })?,
            };
            Ok(Step::Loop(LoopStep {
                name,
                condition: condition.to_string(),
                max_retries,
                on_exhausted,
                steps: validate_children(obj, path)?,
            }))
        }
        Some(StepKind::PerTask) => {
            let source = required_str(obj, "source", path)?.to_string();
            Ok(Step::PerTask(PerTaskStep {
                name,
                source,
                steps: validate_children(obj, path)?,
            }))
        }
    }
}

fn validate_agent_step(
    obj: &Map<String, Value>,
    raw: &Value,
    path: &str,
) -> Result<Step, ValidationError> {
    let has_agent = obj.get("agent").is_some_and(|v| !v.is_null());
    let has_prompt = obj.get("prompt").is_some_and(|v| !v.is_null());
    if !has_agent && !has_prompt {
        return Err(ValidationError::new(
            path,
            "step has no type and neither an 'agent' nor a 'prompt' field",
        ));
    }

    let step: AgentPromptStep =
        serde_json::from_value(raw.clone()).map_err(|e| ValidationError::new(path, e.to_string()))?;
    if let Some(condition) = &step.condition {
        check_condition(condition, &format!("{path}.condition"))?;
    }
    if let Some(output) = &step.output {
        check_output_key(output, path)?;
    }
    Ok(Step::Agent(step))
}

fn output_key(obj: &Map<String, Value>, path: &str) -> Result<Option<String>, ValidationError> {
    let output = optional_str(obj, "output", path)?;
    if let Some(key) = &output {
        check_output_key(key, path)?;
    }
    Ok(output)
}

/// Template built-ins shadow context keys, so a value stored under one of
/// their names could never be read back.
fn check_output_key(key: &str, path: &str) -> Result<(), ValidationError> {
    let head = key.split('.').next().unwrap_or(key);
    if BUILTIN_NAMES.contains(&head) {
        return Err(ValidationError::new(
            format!("{path}.output"),
            format!("'{key}' is a reserved template variable"),
        ));
    }
    Ok(())
}

fn validate_children(obj: &Map<String, Value>, path: &str) -> Result<Vec<Step>, ValidationError> {
    let raw_steps = obj
        .get("steps")
        .and_then(Value::as_array)
        .ok_or_else(|| ValidationError::new(format!("{path}.steps"), "must be a list of steps"))?;
    raw_steps
        .iter()
        .enumerate()
        .map(|(i, child)| validate_step_at(child, &format!("{path}.steps[{i}]")))
        .collect()
}

fn check_condition(expr: &str, path: &str) -> Result<(), ValidationError> {
    Condition::parse(expr)
        .map(|_| ())
        .map_err(|e| ValidationError::new(path, format!("invalid condition '{expr}': {e}")))
}

fn required_str<'a>(
    obj: &'a Map<String, Value>,
    key: &str,
    path: &str,
) -> Result<&'a str, ValidationError> {
    match obj.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s),
        Some(Value::String(_)) => Err(ValidationError::new(
            format!("{path}.{key}"),
            "must not be empty",
        )),
        Some(other) => Err(ValidationError::new(
            format!("{path}.{key}"),
            format!("must be a string, got {other}"),
        )),
        None => Err(ValidationError::new(format!("{path}.{key}"), "is required")),
    }
}

fn optional_str(
    obj: &Map<String, Value>,
    key: &str,
    path: &str,
) -> Result<Option<String>, ValidationError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => required_str(obj, key, path).map(|s| Some(s.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Parsing and filesystem operations
// ---------------------------------------------------------------------------

/// Parse a YAML (or JSON) string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let raw: Value =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    Ok(validate_workflow_definition(&raw)?)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::Parse(e.to_string()))
}

/// Load and validate a workflow definition file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path).map_err(|source| DefinitionError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let def = parse_workflow_yaml(&content)?;
    tracing::debug!(
        path = %path.display(),
        workflow = %def.name,
        phases = def.phases.len(),
        "loaded workflow definition"
    );
    Ok(def)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
