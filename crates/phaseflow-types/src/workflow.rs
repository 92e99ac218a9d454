//! Workflow definition types.
//!
//! A workflow is an ordered list of phases, each of which is a [`Step`]. Steps
//! form a tree: parallel, loop and per-task steps own nested step lists that
//! use the same grammar. The YAML shape is:
//!
//! ```yaml
//! name: feature-pipeline
//! version: "1.0"
//! defaults:
//!   agent: developer
//!   model: sonnet
//! safety:
//!   maxLoopRetries: 3
//!   maxStepTimeoutMs: 600000
//! phases:
//!   - name: analyze
//!     prompt: analyze-spec
//!   - name: review-loop
//!     type: loop
//!     condition: review.hasActionableIssues
//!     maxRetries: 2
//!     onExhausted: escalate
//!     steps:
//!       - name: fix
//!         prompt: fix-issues
//!       - name: review
//!         agent: reviewer
//!         prompt: review-changes
//! ```
//!
//! Agent steps carry no `type`; every other kind is tagged explicitly.
//! Construction from raw documents (and all validation) lives in
//! `phaseflow-core::workflow::definition`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A validated workflow definition. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Workflow name.
    pub name: String,
    /// Version string as written in the document.
    pub version: String,
    /// Defaults applied to agent steps that do not override them.
    pub defaults: WorkflowDefaults,
    /// Optional safety limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety: Option<SafetyConfig>,
    /// Top-level phases, run strictly in order. Never empty.
    pub phases: Vec<Step>,
}

impl WorkflowDefinition {
    /// Index of the phase with the given name.
    pub fn phase_index(&self, name: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name() == name)
    }

    /// Whether a failing phase aborts the run (the default).
    pub fn fail_fast(&self) -> bool {
        self.safety.as_ref().is_none_or(|s| s.fail_on_step_error)
    }
}

/// Run-wide defaults for agent dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefaults {
    /// Agent used when a step names none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Model used when neither the step nor the agent names one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Permission mode forwarded to the task executor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    /// Setting sources forwarded to the task executor.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub setting_sources: Vec<String>,
}

/// Safety limits for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyConfig {
    /// Upper bound applied to every loop's `maxRetries`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_loop_retries: Option<u32>,
    /// Timeout for each individual dispatch or handler call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_step_timeout_ms: Option<u64>,
    /// Timeout for the whole run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workflow_duration_ms: Option<u64>,
    /// Abort the run on the first failing phase.
    #[serde(default = "default_fail_on_step_error")]
    pub fail_on_step_error: bool,
}

fn default_fail_on_step_error() -> bool {
    true
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_loop_retries: None,
            max_step_timeout_ms: None,
            max_workflow_duration_ms: None,
            fail_on_step_error: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// One unit of executable work. Phases are steps too.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Agent(AgentPromptStep),
    Code(CodeStep),
    Parallel(ParallelStep),
    Loop(LoopStep),
    PerTask(PerTaskStep),
}

/// Discriminant of a [`Step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    Agent,
    Code,
    Parallel,
    Loop,
    PerTask,
}

impl StepKind {
    /// The `type` tag used in documents. Agent steps have no tag of their own.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Agent => "agent",
            StepKind::Code => "code",
            StepKind::Parallel => "parallel",
            StepKind::Loop => "loop",
            StepKind::PerTask => "per-task",
        }
    }

    /// Parse an explicit `type` tag. `agent` is not an explicit kind.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "code" => Some(StepKind::Code),
            "parallel" => Some(StepKind::Parallel),
            "loop" => Some(StepKind::Loop),
            "per-task" => Some(StepKind::PerTask),
            _ => None,
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Step {
    pub fn name(&self) -> &str {
        match self {
            Step::Agent(s) => &s.name,
            Step::Code(s) => &s.name,
            Step::Parallel(s) => &s.name,
            Step::Loop(s) => &s.name,
            Step::PerTask(s) => &s.name,
        }
    }

    pub fn kind(&self) -> StepKind {
        match self {
            Step::Agent(_) => StepKind::Agent,
            Step::Code(_) => StepKind::Code,
            Step::Parallel(_) => StepKind::Parallel,
            Step::Loop(_) => StepKind::Loop,
            Step::PerTask(_) => StepKind::PerTask,
        }
    }

    /// Context key this step writes its result to, if any.
    ///
    /// Agent steps fall back to their own name. Code and parallel steps only
    /// write when `output` is declared; loop and per-task steps never write.
    pub fn output_key(&self) -> Option<&str> {
        match self {
            Step::Agent(s) => Some(s.output.as_deref().unwrap_or(&s.name)),
            Step::Code(s) => s.output.as_deref(),
            Step::Parallel(s) => s.output.as_deref(),
            Step::Loop(_) | Step::PerTask(_) => None,
        }
    }

    /// Nested steps (empty for leaf kinds).
    pub fn children(&self) -> &[Step] {
        match self {
            Step::Parallel(s) => &s.steps,
            Step::Loop(s) => &s.steps,
            Step::PerTask(s) => &s.steps,
            Step::Agent(_) | Step::Code(_) => &[],
        }
    }
}

#[derive(Serialize)]
struct Tagged<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(flatten)]
    step: &'a T,
}

impl Serialize for Step {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let kind = self.kind().as_str();
        match self {
            Step::Agent(s) => s.serialize(serializer),
            Step::Code(s) => Tagged { kind, step: s }.serialize(serializer),
            Step::Parallel(s) => Tagged { kind, step: s }.serialize(serializer),
            Step::Loop(s) => Tagged { kind, step: s }.serialize(serializer),
            Step::PerTask(s) => Tagged { kind, step: s }.serialize(serializer),
        }
    }
}

/// Dispatch a composed prompt to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPromptStep {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Model override for this step only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Context key for the structured result (defaults to the step name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<StepInput>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Skip the step unless this condition holds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// Free-form step input: a template string or a structured map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepInput {
    Text(String),
    Structured(Map<String, Value>),
}

/// Invoke a host-registered handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeStep {
    pub name: String,
    /// Handler identifier in the host's registry.
    pub handler: String,
    /// Context key whose value is passed to the handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    /// Context key for the handler's return value (defaults to the step name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Run child steps concurrently.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelStep {
    pub name: String,
    pub steps: Vec<Step>,
    /// Context key for the aggregate of all child outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Re-run child steps while a condition holds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopStep {
    pub name: String,
    pub condition: String,
    /// Maximum number of iterations, at least 1.
    pub max_retries: u32,
    pub on_exhausted: OnExhausted,
    pub steps: Vec<Step>,
}

/// What a loop does when it runs out of attempts with its condition still true.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnExhausted {
    /// Pause the run for a human.
    #[default]
    Escalate,
    /// Log and carry on as if the condition were satisfied.
    Warn,
    /// Fail the run.
    Fail,
}

/// Run child steps once per element of a context-held array.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerTaskStep {
    pub name: String,
    /// Dotted context path of the task array.
    pub source: String,
    pub steps: Vec<Step>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
