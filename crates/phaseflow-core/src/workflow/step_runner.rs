//! Step interpreter.
//!
//! [`run_step`] is the single recursive entry point for every step kind. It
//! applies skip rules, emits the step's audit entries, and dispatches to the
//! per-kind executor, which in turn calls `run_step` for nested steps.
//!
//! Sequential steps run strictly in order. Children of a parallel step are
//! polled concurrently on the current task and awaited jointly; their context
//! writes are serialized through the shared context mutex.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use phaseflow_types::audit::{AuditEntry, AuditStatus};
use phaseflow_types::run::TaskCursor;
use phaseflow_types::workflow::{
    AgentPromptStep, CodeStep, LoopStep, OnExhausted, ParallelStep, PerTaskStep, Step,
    WorkflowDefaults,
};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::audit::{AuditError, AuditLog};
use super::condition::evaluate_condition;
use super::context::{ExecutionContext, SharedContext};
use super::dispatch::{DispatchError, TaskExecutor, collect_messages};
use super::handler::{HandlerError, HandlerRegistry};
use super::loader::{LoaderError, RunBuiltins, agent_name_for, compose_dispatch, load_agent, load_prompt};
use super::resolver::NameResolver;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Skip reason for agent steps with `enabled: false`.
pub const DISABLED_REASON: &str = "disabled in workflow definition";

/// Skip reason for steps matched by the checks predicate.
pub const SKIP_CHECKS_REASON: &str = "--skip-checks";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Failure (or pause) raised while executing a step.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("step '{step}': {source}")]
    Dispatch {
        step: String,
        #[source]
        source: DispatchError,
    },

    #[error("step '{step}': handler '{handler}' failed: {source}")]
    Handler {
        step: String,
        handler: String,
        #[source]
        source: HandlerError,
    },

    #[error("step '{step}': no handler registered for '{handler}'")]
    UnknownHandler { step: String, handler: String },

    #[error("step '{step}': no agent named and the workflow has no default agent")]
    MissingAgent { step: String },

    #[error("step '{step}': {source}")]
    Loader {
        step: String,
        #[source]
        source: LoaderError,
    },

    #[error("step '{step}': per-task source '{source_path}' {reason}")]
    InvalidTaskSource {
        step: String,
        source_path: String,
        reason: String,
    },

    #[error("step '{step}' timed out after {timeout_ms}ms")]
    Timeout { step: String, timeout_ms: u64 },

    #[error("{blocker}")]
    LoopExhausted { step: String, blocker: String },

    /// Escalation from an exhausted loop. Not a failure.
    #[error("paused at '{step}': {blocker}")]
    Paused { step: String, blocker: String },

    #[error("step '{step}' cancelled")]
    Cancelled { step: String },

    #[error(transparent)]
    Audit(#[from] AuditError),
}

impl StepError {
    pub fn is_paused(&self) -> bool {
        matches!(self, StepError::Paused { .. })
    }

    /// Timeouts are safety-limit breaches, distinct from ordinary failures.
    pub fn is_safety_limit(&self) -> bool {
        matches!(self, StepError::Timeout { .. })
    }

    /// Errors that abort a run even when `failOnStepError` is off. A loop
    /// exhausted under `onExhausted: fail` is terminal.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StepError::Timeout { .. }
                | StepError::Cancelled { .. }
                | StepError::LoopExhausted { .. }
                | StepError::Audit(_)
        )
    }

    /// Blocker description of a paused or exhausted loop.
    pub fn blocker(&self) -> Option<&str> {
        match self {
            StepError::Paused { blocker, .. } | StepError::LoopExhausted { blocker, .. } => {
                Some(blocker)
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// Everything a step needs besides the context. Built once per run.
pub struct StepEnvironment {
    pub defaults: WorkflowDefaults,
    pub resolver: Arc<NameResolver>,
    pub executor: Arc<dyn TaskExecutor>,
    pub handlers: Arc<HandlerRegistry>,
    pub audit: AuditLog,
    pub builtins: RunBuiltins,
    pub skip_step_names: HashSet<String>,
    pub skip_checks: bool,
    /// Bound on each dispatch and handler call.
    pub step_timeout: Option<Duration>,
    /// Cap applied to every loop's `maxRetries`.
    pub max_loop_retries: Option<u32>,
    pub cancel: CancellationToken,
}

/// How a step ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Completed,
    Skipped,
}

/// Whether a step name carries a `review` or `check(s)` word.
pub fn is_check_step(name: &str) -> bool {
    name.split(|c: char| !c.is_ascii_alphanumeric())
        .map(str::to_ascii_lowercase)
        .any(|token| matches!(token.as_str(), "review" | "check" | "checks"))
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run one step (and, recursively, its children) against `ctx`.
pub fn run_step<'a>(
    env: &'a StepEnvironment,
    step: &'a Step,
    ctx: &'a SharedContext,
) -> BoxFuture<'a, Result<StepStatus, StepError>> {
    Box::pin(async move {
        let name = step.name();

        if let Some(reason) = skip_reason(env, step, ctx).await {
            tracing::debug!(step = name, reason = %reason, "step skipped");
            env.audit
                .emit(AuditEntry::new(name, AuditStatus::Skipped).with_metadata("reason", reason))?;
            return Ok(StepStatus::Skipped);
        }

        env.audit.emit(
            AuditEntry::new(name, AuditStatus::Started).with_metadata("type", step.kind().as_str()),
        )?;
        tracing::debug!(step = name, kind = %step.kind(), "step started");
        let started = Instant::now();

        let result = match step {
            Step::Agent(s) => run_agent_step(env, s, ctx).await,
            Step::Code(s) => run_code_step(env, s, ctx).await,
            Step::Parallel(s) => run_parallel_step(env, s, ctx).await,
            Step::Loop(s) => run_loop_step(env, s, ctx).await,
            Step::PerTask(s) => run_per_task_step(env, s, ctx).await,
        };
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(()) => {
                let mut entry = AuditEntry::new(name, AuditStatus::Completed)
                    .with_metadata("durationMs", duration_ms);
                if let Some(key) = step.output_key() {
                    let stored = ctx.lock().await.contains_key(key);
                    entry = entry
                        .with_metadata("outputKey", key)
                        .with_metadata("outputStored", stored);
                }
                env.audit.emit(entry)?;
                tracing::debug!(step = name, duration_ms, "step completed");
                Ok(StepStatus::Completed)
            }
            Err(e) if e.is_paused() => {
                env.audit.emit(
                    AuditEntry::new(name, AuditStatus::Paused)
                        .with_metadata("blocker", e.blocker().unwrap_or_default())
                        .with_metadata("durationMs", duration_ms),
                )?;
                Err(e)
            }
            Err(e) => {
                tracing::debug!(step = name, error = %e, "step failed");
                env.audit.emit(
                    AuditEntry::new(name, AuditStatus::Failed)
                        .with_metadata("error", e.to_string())
                        .with_metadata("durationMs", duration_ms),
                )?;
                Err(e)
            }
        }
    })
}

async fn skip_reason(env: &StepEnvironment, step: &Step, ctx: &SharedContext) -> Option<String> {
    let Step::Agent(agent) = step else {
        return None;
    };
    if !agent.enabled {
        return Some(DISABLED_REASON.to_string());
    }
    if env.skip_step_names.contains(&agent.name) {
        return Some(format!("--skip-step={}", agent.name));
    }
    if env.skip_checks && is_check_step(&agent.name) {
        return Some(SKIP_CHECKS_REASON.to_string());
    }
    if let Some(condition) = &agent.condition {
        let ctx = ctx.lock().await;
        if !evaluate_condition(condition, &ctx) {
            return Some(format!("condition not met: {condition}"));
        }
    }
    None
}

/// Apply the per-step timeout and the run's cancellation token to `fut`.
async fn guarded<T, F>(env: &StepEnvironment, step: &str, fut: F) -> Result<T, StepError>
where
    F: Future<Output = Result<T, StepError>>,
{
    let limited = async {
        match env.step_timeout {
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                StepError::Timeout {
                    step: step.to_string(),
                    timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                }
            })?,
            None => fut.await,
        }
    };

    tokio::select! {
        biased;
        _ = env.cancel.cancelled() => Err(StepError::Cancelled { step: step.to_string() }),
        result = limited => result,
    }
}

fn record_output_files(ctx: &mut ExecutionContext, output: &Value) {
    for key in ["changedFiles", "filesChanged"] {
        if let Some(Value::Array(files)) = output.get(key) {
            for file in files.iter().filter_map(Value::as_str) {
                ctx.add_changed_file(file);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Agent steps
// ---------------------------------------------------------------------------

async fn run_agent_step(
    env: &StepEnvironment,
    step: &AgentPromptStep,
    ctx: &SharedContext,
) -> Result<(), StepError> {
    let agent_name = agent_name_for(step, &env.defaults).ok_or_else(|| StepError::MissingAgent {
        step: step.name.clone(),
    })?;
    let loader_error = |source| StepError::Loader {
        step: step.name.clone(),
        source,
    };
    let agent = load_agent(&env.resolver, agent_name).map_err(loader_error)?;
    let prompt = step
        .prompt
        .as_deref()
        .map(|name| load_prompt(&env.resolver, name))
        .transpose()
        .map_err(loader_error)?;

    let request = {
        let ctx = ctx.lock().await;
        compose_dispatch(step, &agent, prompt.as_ref(), &env.defaults, &env.builtins, &ctx)
    };
    tracing::debug!(
        step = %step.name,
        agent = %agent.name,
        model = ?request.options.model,
        "dispatching agent step"
    );

    let stream = env.executor.execute(request);
    let outcome = guarded(env, &step.name, async {
        collect_messages(stream)
            .await
            .map_err(|source| StepError::Dispatch {
                step: step.name.clone(),
                source,
            })
    })
    .await?;

    let output_key = step.output.as_deref().unwrap_or(&step.name);
    let mut ctx = ctx.lock().await;
    for file in outcome.changed_files {
        ctx.add_changed_file(file);
    }
    match outcome.output {
        Some(output) => {
            record_output_files(&mut ctx, &output);
            ctx.set(output_key, output);
        }
        None => tracing::debug!(
            step = %step.name,
            messages = outcome.message_count,
            "no structured result; output left unset"
        ),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Code steps
// ---------------------------------------------------------------------------

async fn run_code_step(
    env: &StepEnvironment,
    step: &CodeStep,
    ctx: &SharedContext,
) -> Result<(), StepError> {
    let handler = env
        .handlers
        .get(&step.handler)
        .ok_or_else(|| StepError::UnknownHandler {
            step: step.name.clone(),
            handler: step.handler.clone(),
        })?;

    let (snapshot, input) = {
        let ctx = ctx.lock().await;
        let input = step.input.as_deref().and_then(|key| ctx.get(key).cloned());
        (ctx.clone(), input)
    };

    let output = guarded(env, &step.name, async {
        handler
            .call(snapshot, input)
            .await
            .map_err(|source| StepError::Handler {
                step: step.name.clone(),
                handler: step.handler.clone(),
                source,
            })
    })
    .await?;

    if output.is_null() {
        return Ok(());
    }
    let mut ctx = ctx.lock().await;
    record_output_files(&mut ctx, &output);
    // Handlers write nothing unless the step declares where.
    if let Some(key) = &step.output {
        ctx.set(key.as_str(), output);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Parallel steps
// ---------------------------------------------------------------------------

async fn run_parallel_step(
    env: &StepEnvironment,
    step: &ParallelStep,
    ctx: &SharedContext,
) -> Result<(), StepError> {
    let mut pending: FuturesUnordered<_> = step
        .steps
        .iter()
        .map(|child| run_step(env, child, ctx))
        .collect();

    // Wait for every child to settle; the first error to arrive wins.
    let mut first_error = None;
    while let Some(result) = pending.next().await {
        if let Err(e) = result {
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    if let Some(output_key) = &step.output {
        let mut ctx = ctx.lock().await;
        let aggregate: Map<String, Value> = step
            .steps
            .iter()
            .filter_map(Step::output_key)
            .filter_map(|key| ctx.get(key).map(|v| (key.to_string(), v.clone())))
            .collect();
        ctx.set(output_key.as_str(), Value::Object(aggregate));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Loop steps
// ---------------------------------------------------------------------------

async fn condition_holds(condition: &str, ctx: &SharedContext) -> bool {
    let ctx = ctx.lock().await;
    evaluate_condition(condition, &ctx)
}

async fn run_loop_step(
    env: &StepEnvironment,
    step: &LoopStep,
    ctx: &SharedContext,
) -> Result<(), StepError> {
    let max = env
        .max_loop_retries
        .map_or(step.max_retries, |cap| step.max_retries.min(cap))
        .max(1);
    if max < step.max_retries {
        tracing::debug!(step = %step.name, declared = step.max_retries, max, "loop retries capped by safety limit");
    }

    for attempt in 0..max {
        if attempt > 0 && !condition_holds(&step.condition, ctx).await {
            return Ok(());
        }
        tracing::debug!(step = %step.name, attempt = attempt + 1, max, "loop iteration");

        for child in &step.steps {
            run_step(env, child, ctx).await?;
        }

        if !condition_holds(&step.condition, ctx).await {
            tracing::debug!(step = %step.name, attempt = attempt + 1, "loop condition cleared");
            return Ok(());
        }
    }

    let blocker = format!(
        "loop '{}' exhausted {max} retries with condition '{}' still true",
        step.name, step.condition
    );
    match step.on_exhausted {
        OnExhausted::Escalate => Err(StepError::Paused {
            step: step.name.clone(),
            blocker,
        }),
        OnExhausted::Fail => Err(StepError::LoopExhausted {
            step: step.name.clone(),
            blocker,
        }),
        OnExhausted::Warn => {
            tracing::warn!(step = %step.name, %blocker, "loop exhausted; continuing");
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Per-task steps
// ---------------------------------------------------------------------------

fn task_id(task: &Value, index: usize) -> String {
    match task.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => format!("task-{}", index + 1),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

async fn run_per_task_step(
    env: &StepEnvironment,
    step: &PerTaskStep,
    ctx: &SharedContext,
) -> Result<(), StepError> {
    let invalid = |reason: String| StepError::InvalidTaskSource {
        step: step.name.clone(),
        source_path: step.source.clone(),
        reason,
    };
    let tasks = match ctx.lock().await.get(&step.source) {
        Some(Value::Array(items)) => items.clone(),
        Some(other) => return Err(invalid(format!("is {}, not an array", json_type(other)))),
        None => return Err(invalid("is not set".to_string())),
    };

    let count = tasks.len();
    for (index, task) in tasks.into_iter().enumerate() {
        let cursor = TaskCursor {
            id: task_id(&task, index),
            index,
            count,
        };
        tracing::debug!(step = %step.name, task = %cursor.id, index, count, "per-task iteration");
        let child = ctx
            .lock()
            .await
            .child_for_task(cursor.clone(), task)
            .into_shared();

        let mut result = Ok(());
        for nested in &step.steps {
            if let Err(e) = run_step(env, nested, &child).await {
                result = Err(e);
                break;
            }
        }

        let child_state = child.lock().await.clone();
        let mut parent = ctx.lock().await;
        parent.merge_child(child_state);
        if let Err(e) = result {
            if e.is_paused() {
                parent.mark_task_paused(cursor.id);
            }
            return Err(e);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::audit::MemoryAuditSink;
    use crate::workflow::dispatch::MessageStream;
    use phaseflow_types::agent::{AgentMessage, DispatchRequest};
    use phaseflow_types::workflow::StepInput;
    use serde_json::json;
    use std::sync::Mutex;

    /// Returns `{ "prompt": <prompt> }` for every dispatch and records prompts.
    #[derive(Default)]
    struct EchoExecutor {
        prompts: Mutex<Vec<String>>,
    }

    impl TaskExecutor for EchoExecutor {
        fn execute(&self, request: DispatchRequest) -> MessageStream {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            let output = json!({ "prompt": request.prompt });
            Box::pin(async_stream::stream! {
                yield Ok(AgentMessage::Result { structured_output: Some(output) });
            })
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        env: StepEnvironment,
        executor: Arc<EchoExecutor>,
        sink: Arc<MemoryAuditSink>,
    }

    fn fixture(handlers: HandlerRegistry) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("agents")).unwrap();
        std::fs::create_dir_all(dir.path().join("prompts")).unwrap();
        std::fs::write(dir.path().join("agents/dev.md"), "---\nname: dev\n---\nYou build.\n")
            .unwrap();
        std::fs::write(dir.path().join("prompts/task.md"), "Do {{ task.title }}").unwrap();

        let executor = Arc::new(EchoExecutor::default());
        let sink = Arc::new(MemoryAuditSink::new());
        let env = StepEnvironment {
            defaults: WorkflowDefaults {
                agent: Some("dev".to_string()),
                ..Default::default()
            },
            resolver: Arc::new(NameResolver::new(dir.path(), None)),
            executor: executor.clone(),
            handlers: Arc::new(handlers),
            audit: AuditLog::new(sink.clone()),
            builtins: RunBuiltins::default(),
            skip_step_names: HashSet::new(),
            skip_checks: false,
            step_timeout: None,
            max_loop_retries: None,
            cancel: CancellationToken::new(),
        };
        Fixture {
            _dir: dir,
            env,
            executor,
            sink,
        }
    }

    fn agent_step(name: &str, input: &str) -> Step {
        Step::Agent(AgentPromptStep {
            name: name.to_string(),
            agent: None,
            prompt: None,
            model: None,
            output: None,
            input: Some(StepInput::Text(input.to_string())),
            enabled: true,
            condition: None,
        })
    }

    fn code_step(name: &str, handler: &str) -> Step {
        Step::Code(CodeStep {
            name: name.to_string(),
            handler: handler.to_string(),
            input: None,
            output: None,
        })
    }

    fn code_step_into(name: &str, handler: &str, output: &str) -> Step {
        Step::Code(CodeStep {
            name: name.to_string(),
            handler: handler.to_string(),
            input: None,
            output: Some(output.to_string()),
        })
    }

    // -----------------------------------------------------------------------
    // Skip rules
    // -----------------------------------------------------------------------

    #[test]
    fn test_is_check_step() {
        assert!(is_check_step("review"));
        assert!(is_check_step("code-review"));
        assert!(is_check_step("Run_Checks"));
        assert!(is_check_step("check"));
        assert!(!is_check_step("reviewer"));
        assert!(!is_check_step("implement"));
    }

    #[tokio::test]
    async fn test_condition_skip_reason() {
        let f = fixture(HandlerRegistry::new());
        let mut step = agent_step("polish", "x");
        if let Step::Agent(s) = &mut step {
            s.condition = Some("review.needsPolish".to_string());
        }
        let ctx = ExecutionContext::new().into_shared();

        let status = run_step(&f.env, &step, &ctx).await.unwrap();
        assert_eq!(status, StepStatus::Skipped);
        let entries = f.sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason(), Some("condition not met: review.needsPolish"));
        assert!(f.executor.prompts.lock().unwrap().is_empty());
    }

    // -----------------------------------------------------------------------
    // Code steps
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_code_step_stores_output_and_files() {
        let mut handlers = HandlerRegistry::new();
        handlers.register_fn("diff", |_, input| {
            Ok(json!({ "base": input, "changedFiles": ["src/lib.rs"] }))
        });
        let f = fixture(handlers);
        let step = Step::Code(CodeStep {
            name: "collect".to_string(),
            handler: "diff".to_string(),
            input: Some("branch".to_string()),
            output: Some("diff".to_string()),
        });
        let ctx = ExecutionContext::new().into_shared();
        ctx.lock().await.set("branch", json!("main"));

        run_step(&f.env, &step, &ctx).await.unwrap();
        let ctx = ctx.lock().await;
        assert_eq!(ctx.get("diff.base"), Some(&json!("main")));
        assert_eq!(ctx.changed_files(), ["src/lib.rs"]);
    }

    #[tokio::test]
    async fn test_code_step_without_output_writes_nothing() {
        let mut handlers = HandlerRegistry::new();
        handlers.register_fn("notify", |_, _| Ok(json!({ "sent": true })));
        let f = fixture(handlers);
        let ctx = ExecutionContext::new().into_shared();
        ctx.lock().await.set("notify", json!("user value"));

        run_step(&f.env, &code_step("notify", "notify"), &ctx)
            .await
            .unwrap();

        let ctx = ctx.lock().await;
        assert_eq!(ctx.get("notify"), Some(&json!("user value")));
        assert_eq!(ctx.variables().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_handler_fails_step() {
        let f = fixture(HandlerRegistry::new());
        let ctx = ExecutionContext::new().into_shared();
        let err = run_step(&f.env, &code_step("lint", "nope"), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::UnknownHandler { .. }));
        let entries = f.sink.entries();
        assert_eq!(entries.last().unwrap().status, AuditStatus::Failed);
    }

    #[tokio::test]
    async fn test_handler_timeout_is_safety_limit() {
        let mut handlers = HandlerRegistry::new();
        handlers.register_async("hang", |_, _| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        });
        let mut f = fixture(handlers);
        f.env.step_timeout = Some(Duration::from_millis(20));
        let ctx = ExecutionContext::new().into_shared();

        let err = run_step(&f.env, &code_step("slow", "hang"), &ctx)
            .await
            .unwrap_err();
        assert!(err.is_safety_limit());
    }

    #[tokio::test]
    async fn test_cancellation_aborts_step() {
        let mut handlers = HandlerRegistry::new();
        handlers.register_async("hang", |_, _| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        });
        let f = fixture(handlers);
        f.env.cancel.cancel();
        let ctx = ExecutionContext::new().into_shared();

        let err = run_step(&f.env, &code_step("slow", "hang"), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Cancelled { .. }));
    }

    // -----------------------------------------------------------------------
    // Parallel steps
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_parallel_aggregate_output() {
        let f = fixture(HandlerRegistry::new());
        let step = Step::Parallel(ParallelStep {
            name: "fan".to_string(),
            steps: vec![agent_step("a", "one"), agent_step("b", "two")],
            output: Some("both".to_string()),
        });
        let ctx = ExecutionContext::new().into_shared();

        run_step(&f.env, &step, &ctx).await.unwrap();
        let ctx = ctx.lock().await;
        assert_eq!(ctx.get("a.prompt"), Some(&json!("one")));
        assert_eq!(ctx.get("both.b.prompt"), Some(&json!("two")));

        let entries = f.sink.entries();
        // group started + 2×(started, completed) + group completed
        assert_eq!(entries.len(), 6);
        assert_eq!(entries.first().unwrap().step, "fan");
        assert_eq!(entries.last().unwrap().step, "fan");
    }

    #[tokio::test]
    async fn test_parallel_waits_for_all_then_fails() {
        let mut handlers = HandlerRegistry::new();
        handlers.register_fn("boom", |_, _| Err(HandlerError::new("boom")));
        let f = fixture(handlers);
        let step = Step::Parallel(ParallelStep {
            name: "fan".to_string(),
            steps: vec![code_step("bad", "boom"), agent_step("good", "still runs")],
            output: None,
        });
        let ctx = ExecutionContext::new().into_shared();

        let err = run_step(&f.env, &step, &ctx).await.unwrap_err();
        assert!(matches!(err, StepError::Handler { .. }));
        assert!(ctx.lock().await.contains_key("good"));
        assert_eq!(f.sink.entries().last().unwrap().status, AuditStatus::Failed);
    }

    // -----------------------------------------------------------------------
    // Loop steps
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_loop_stops_when_condition_clears() {
        let mut handlers = HandlerRegistry::new();
        handlers.register_fn("tick", |ctx, _| {
            let n = ctx.get("tick.n").and_then(Value::as_u64).unwrap_or(0) + 1;
            Ok(json!({ "n": n, "again": n < 2 }))
        });
        let f = fixture(handlers);
        let step = Step::Loop(LoopStep {
            name: "retry".to_string(),
            condition: "tick.again".to_string(),
            max_retries: 5,
            on_exhausted: OnExhausted::Fail,
            steps: vec![code_step_into("tick", "tick", "tick")],
        });
        let ctx = ExecutionContext::new().into_shared();

        run_step(&f.env, &step, &ctx).await.unwrap();
        assert_eq!(ctx.lock().await.get("tick.n"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_loop_exhaustion_policies() {
        let mut handlers = HandlerRegistry::new();
        handlers.register_fn("dirty", |_, _| Ok(json!({ "dirty": true })));
        let mut f = fixture(handlers);
        let make = |policy| {
            Step::Loop(LoopStep {
                name: "fix".to_string(),
                condition: "dirty.dirty".to_string(),
                max_retries: 3,
                on_exhausted: policy,
                steps: vec![code_step_into("dirty", "dirty", "dirty")],
            })
        };

        let ctx = ExecutionContext::new().into_shared();
        run_step(&f.env, &make(OnExhausted::Warn), &ctx).await.unwrap();

        let err = run_step(&f.env, &make(OnExhausted::Fail), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::LoopExhausted { .. }));
        assert!(err.to_string().contains("3 retries"));

        f.env.max_loop_retries = Some(1);
        let err = run_step(&f.env, &make(OnExhausted::Escalate), &ctx)
            .await
            .unwrap_err();
        assert!(err.is_paused());
        assert!(err.blocker().unwrap().contains("1 retries"));
        assert_eq!(f.sink.entries().last().unwrap().status, AuditStatus::Paused);
    }

    // -----------------------------------------------------------------------
    // Per-task steps
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_per_task_runs_each_task_and_merges_new_keys() {
        let f = fixture(HandlerRegistry::new());
        let step = Step::PerTask(PerTaskStep {
            name: "each".to_string(),
            source: "plan.tasks".to_string(),
            steps: vec![Step::Agent(AgentPromptStep {
                name: "implement".to_string(),
                agent: None,
                prompt: Some("task".to_string()),
                model: None,
                output: None,
                input: None,
                enabled: true,
                condition: None,
            })],
        });
        let ctx = ExecutionContext::new().into_shared();
        ctx.lock().await.set(
            "plan",
            json!({ "tasks": [{ "id": "a", "title": "login" }, { "id": "b", "title": "logout" }] }),
        );

        run_step(&f.env, &step, &ctx).await.unwrap();

        let prompts = f.executor.prompts.lock().unwrap().clone();
        assert_eq!(prompts, ["Do login", "Do logout"]);
        // The second task's write to an already-merged key is dropped.
        let ctx = ctx.lock().await;
        assert_eq!(ctx.get("implement.prompt"), Some(&json!("Do login")));
        assert!(ctx.current_task().is_none());
    }

    #[tokio::test]
    async fn test_per_task_invalid_source() {
        let f = fixture(HandlerRegistry::new());
        let step = Step::PerTask(PerTaskStep {
            name: "each".to_string(),
            source: "plan.tasks".to_string(),
            steps: vec![],
        });
        let ctx = ExecutionContext::new().into_shared();

        let err = run_step(&f.env, &step, &ctx).await.unwrap_err();
        assert!(err.to_string().contains("is not set"));

        ctx.lock().await.set("plan", json!({ "tasks": "nope" }));
        let err = run_step(&f.env, &step, &ctx).await.unwrap_err();
        assert!(err.to_string().contains("a string, not an array"));
    }
}
