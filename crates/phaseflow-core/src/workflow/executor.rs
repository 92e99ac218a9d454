//! Workflow engine: phase-by-phase execution with pause and resume.
//!
//! # Execution flow
//!
//! 1. Load and validate the definition (by path or by resolved name).
//! 2. Build a fresh `ExecutionContext`, or restore one from a checkpoint.
//! 3. Walk phases in declaration order, skipping phases already completed.
//! 4. Each phase runs through [`run_step`], which emits its audit entries.
//! 5. A completed phase is marked in the context, then the phase hook fires.
//! 6. A loop escalation stops the walk and returns a `paused` result carrying
//!    a checkpoint; any other failure aborts the run (unless the workflow
//!    turned off `failOnStepError`).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use phaseflow_types::artifact::ArtifactKind;
use phaseflow_types::audit::{AuditEntry, AuditStatus};
use phaseflow_types::run::{Checkpoint, RunResult, RunStatus};
use phaseflow_types::workflow::WorkflowDefinition;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::audit::{AuditError, AuditLog, AuditSink, NullAuditSink};
use super::context::{ExecutionContext, SharedContext};
use super::definition::{DefinitionError, load_workflow_file};
use super::dispatch::TaskExecutor;
use super::handler::HandlerRegistry;
use super::loader::{LoaderError, RunBuiltins, SpecDocument};
use super::resolver::{NameResolver, ResolutionError};
use super::step_runner::{StepEnvironment, StepError, StepStatus, run_step};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Skip reason recorded for phases already completed before a resume.
pub const RESUMED_REASON: &str = "completed in previous run";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("failed to load spec: {0}")]
    Spec(#[source] LoaderError),

    #[error("phase '{phase}' failed: {source}")]
    Step {
        phase: String,
        #[source]
        source: StepError,
    },

    #[error("workflow '{workflow}' exceeded its {timeout_ms}ms duration limit")]
    WorkflowTimeout { workflow: String, timeout_ms: u64 },

    #[error("phase hook failed after '{phase}': {message}")]
    PhaseHook { phase: String, message: String },

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error("phase '{0}' not found in workflow")]
    UnknownPhase(String),
}

impl EngineError {
    /// Whether a timeout (per-step or whole-run) ended the run.
    pub fn is_safety_limit(&self) -> bool {
        match self {
            EngineError::WorkflowTimeout { .. } => true,
            EngineError::Step { source, .. } => source.is_safety_limit(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            EngineError::Step {
                source: StepError::Cancelled { .. },
                ..
            }
        )
    }
}

// ---------------------------------------------------------------------------
// Options and hooks
// ---------------------------------------------------------------------------

/// Runtime knobs that do not belong in the workflow document.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Agent steps with these names are skipped with `--skip-step=<name>`.
    pub skip_step_names: Vec<String>,
    /// Skip agent steps named like reviews or checks.
    pub skip_checks: bool,
    pub worktree: Option<PathBuf>,
    /// Defaults to the run id.
    pub session_id: Option<String>,
    pub branch: Option<String>,
    /// Spec document exposed to templates on resume.
    pub spec_path: Option<PathBuf>,
    /// Per-step timeout used when the workflow declares none.
    pub default_step_timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

/// Called after each completed phase, with the phase already marked.
pub type PhaseHook = Arc<dyn Fn(&str, &ExecutionContext) -> anyhow::Result<()> + Send + Sync>;

enum PhaseWalk {
    Finished { failed: Vec<(String, String)> },
    Paused { phase: String, blocker: String },
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

pub struct WorkflowEngine {
    resolver: Arc<NameResolver>,
    executor: Arc<dyn TaskExecutor>,
    handlers: Arc<HandlerRegistry>,
    audit_sink: Arc<dyn AuditSink>,
    phase_hook: Option<PhaseHook>,
    options: RunOptions,
}

impl WorkflowEngine {
    pub fn new(resolver: NameResolver, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            resolver: Arc::new(resolver),
            executor,
            handlers: Arc::new(HandlerRegistry::new()),
            audit_sink: Arc::new(NullAuditSink),
            phase_hook: None,
            options: RunOptions::default(),
        }
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = Arc::new(handlers);
        self
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = sink;
        self
    }

    pub fn with_phase_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, &ExecutionContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.phase_hook = Some(Arc::new(hook));
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn resolver(&self) -> &NameResolver {
        &self.resolver
    }

    /// Load a workflow given either a file path or a bare name.
    pub fn load_workflow(&self, reference: &str) -> Result<WorkflowDefinition, EngineError> {
        let path = Path::new(reference);
        let is_path = reference.contains(['/', '\\'])
            || path
                .extension()
                .is_some_and(|ext| ext == "yaml" || ext == "yml" || ext == "json")
            || path.is_file();
        if is_path {
            return Ok(load_workflow_file(path)?);
        }
        let resolution = self.resolver.resolve(ArtifactKind::Workflow, reference)?;
        tracing::debug!(
            workflow = reference,
            source = %resolution.source,
            path = %resolution.path.display(),
            "resolved workflow by name"
        );
        Ok(load_workflow_file(&resolution.path)?)
    }

    /// Run a workflow from its first phase.
    pub async fn run(&self, workflow: &str, spec: Option<&Path>) -> Result<RunResult, EngineError> {
        let def = self.load_workflow(workflow)?;
        self.run_definition(def, spec).await
    }

    /// Run an already-loaded definition from its first phase.
    pub async fn run_definition(
        &self,
        def: WorkflowDefinition,
        spec: Option<&Path>,
    ) -> Result<RunResult, EngineError> {
        let spec = spec.map(SpecDocument::load).transpose().map_err(EngineError::Spec)?;
        self.execute(def, ExecutionContext::new(), 0, spec).await
    }

    /// Continue a paused run from a checkpoint.
    ///
    /// Iteration starts at `from_phase` (or the first phase); phases recorded
    /// as completed in the checkpoint are skipped, never re-executed.
    pub async fn resume(
        &self,
        workflow: &str,
        checkpoint: &Checkpoint,
        from_phase: Option<&str>,
    ) -> Result<RunResult, EngineError> {
        let def = self.load_workflow(workflow)?;
        self.resume_definition(def, checkpoint, from_phase).await
    }

    pub async fn resume_definition(
        &self,
        def: WorkflowDefinition,
        checkpoint: &Checkpoint,
        from_phase: Option<&str>,
    ) -> Result<RunResult, EngineError> {
        let start = match from_phase {
            Some(phase) => def
                .phase_index(phase)
                .ok_or_else(|| EngineError::UnknownPhase(phase.to_string()))?,
            None => 0,
        };
        let spec = self
            .options
            .spec_path
            .as_deref()
            .map(SpecDocument::load)
            .transpose()
            .map_err(EngineError::Spec)?;
        tracing::info!(
            workflow = %def.name,
            from_phase = ?from_phase,
            completed = checkpoint.completed_phases.len(),
            "resuming workflow from checkpoint"
        );
        self.execute(def, ExecutionContext::from_checkpoint(checkpoint), start, spec)
            .await
    }

    async fn execute(
        &self,
        def: WorkflowDefinition,
        ctx: ExecutionContext,
        start: usize,
        spec: Option<SpecDocument>,
    ) -> Result<RunResult, EngineError> {
        let run_id = Uuid::now_v7();
        let safety = def.safety.clone().unwrap_or_default();
        let cancel = self
            .options
            .cancel
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();

        let env = StepEnvironment {
            defaults: def.defaults.clone(),
            resolver: self.resolver.clone(),
            executor: self.executor.clone(),
            handlers: self.handlers.clone(),
            audit: AuditLog::new(self.audit_sink.clone()),
            builtins: RunBuiltins {
                spec,
                worktree: self.options.worktree.clone(),
                session_id: self
                    .options
                    .session_id
                    .clone()
                    .unwrap_or_else(|| run_id.to_string()),
                branch: self.options.branch.clone(),
            },
            skip_step_names: self.options.skip_step_names.iter().cloned().collect::<HashSet<_>>(),
            skip_checks: self.options.skip_checks,
            step_timeout: safety
                .max_step_timeout_ms
                .map(Duration::from_millis)
                .or(self.options.default_step_timeout),
            max_loop_retries: safety.max_loop_retries,
            cancel,
        };
        let shared = ctx.into_shared();

        tracing::info!(
            workflow = %def.name,
            %run_id,
            phases = def.phases.len(),
            start,
            "workflow run started"
        );

        let walk = self.walk_phases(&env, &def, &shared, start);
        let walk = match safety.max_workflow_duration_ms {
            Some(timeout_ms) => {
                match tokio::time::timeout(Duration::from_millis(timeout_ms), walk).await {
                    Ok(result) => result,
                    Err(_) => {
                        env.cancel.cancel();
                        tracing::warn!(workflow = %def.name, %run_id, timeout_ms, "workflow duration limit exceeded");
                        return Err(EngineError::WorkflowTimeout {
                            workflow: def.name.clone(),
                            timeout_ms,
                        });
                    }
                }
            }
            None => walk.await,
        };
        let walk = match walk {
            Ok(walk) => walk,
            Err(e) => {
                tracing::warn!(workflow = %def.name, %run_id, error = %e, "workflow run failed");
                return Err(e);
            }
        };

        let ctx = shared.lock().await;
        let mut result = RunResult {
            run_id,
            workflow_name: def.name.clone(),
            status: RunStatus::Completed,
            completed_phases: ctx.completed_phases().to_vec(),
            outputs: ctx.variables().clone(),
            changed_files: ctx.changed_files(),
            failed_phases: Vec::new(),
            paused_at_phase: None,
            blocker_details: None,
            error: None,
            checkpoint: None,
        };

        match walk {
            PhaseWalk::Finished { failed } if failed.is_empty() => {
                tracing::info!(workflow = %def.name, %run_id, "workflow run completed");
            }
            PhaseWalk::Finished { failed } => {
                result.status = RunStatus::Failed;
                result.error = Some(
                    failed
                        .iter()
                        .map(|(phase, error)| format!("phase '{phase}' failed: {error}"))
                        .collect::<Vec<_>>()
                        .join("; "),
                );
                result.failed_phases = failed.into_iter().map(|(phase, _)| phase).collect();
                tracing::warn!(
                    workflow = %def.name,
                    %run_id,
                    failed = ?result.failed_phases,
                    "workflow run finished with failed phases"
                );
            }
            PhaseWalk::Paused { phase, blocker } => {
                tracing::info!(workflow = %def.name, %run_id, phase = %phase, "workflow run paused");
                result.status = RunStatus::Paused;
                result.paused_at_phase = Some(phase);
                result.blocker_details = Some(blocker);
                result.checkpoint = Some(ctx.to_checkpoint());
            }
        }
        Ok(result)
    }

    async fn walk_phases(
        &self,
        env: &StepEnvironment,
        def: &WorkflowDefinition,
        shared: &SharedContext,
        start: usize,
    ) -> Result<PhaseWalk, EngineError> {
        let fail_fast = def.fail_fast();
        let mut failed = Vec::new();

        for phase in def.phases.iter().skip(start) {
            let name = phase.name();

            if shared.lock().await.is_phase_completed(name) {
                tracing::info!(phase = name, "phase completed in previous run; skipping");
                env.audit.emit(
                    AuditEntry::new(name, AuditStatus::Skipped).with_metadata("reason", RESUMED_REASON),
                )?;
                continue;
            }

            tracing::info!(workflow = %def.name, phase = name, "phase started");
            match run_step(env, phase, shared).await {
                Ok(StepStatus::Completed) => {
                    let snapshot = {
                        let mut ctx = shared.lock().await;
                        ctx.mark_phase_completed(name);
                        ctx.clone()
                    };
                    if let Some(hook) = &self.phase_hook {
                        hook(name, &snapshot).map_err(|e| EngineError::PhaseHook {
                            phase: name.to_string(),
                            message: format!("{e:#}"),
                        })?;
                    }
                }
                Ok(StepStatus::Skipped) => {}
                Err(e) if e.is_paused() => {
                    return Ok(PhaseWalk::Paused {
                        phase: name.to_string(),
                        blocker: e.blocker().unwrap_or_default().to_string(),
                    });
                }
                Err(StepError::Audit(e)) => return Err(EngineError::Audit(e)),
                Err(e) if fail_fast || e.is_fatal() => {
                    return Err(EngineError::Step {
                        phase: name.to_string(),
                        source: e,
                    });
                }
                Err(e) => {
                    tracing::warn!(phase = name, error = %e, "phase failed; continuing");
                    failed.push((name.to_string(), e.to_string()));
                }
            }
        }

        Ok(PhaseWalk::Finished { failed })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::dispatch::MessageStream;
    use phaseflow_types::agent::{AgentMessage, DispatchRequest};
    use serde_json::json;

    struct OkExecutor;

    impl TaskExecutor for OkExecutor {
        fn execute(&self, _request: DispatchRequest) -> MessageStream {
            Box::pin(futures_util::stream::iter(vec![Ok(AgentMessage::Result {
                structured_output: Some(json!({ "ok": true })),
            })]))
        }
    }

    fn project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for sub in ["agents", "prompts", "workflows"] {
            std::fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        std::fs::write(dir.path().join("agents/dev.md"), "---\nname: dev\n---\nBuild.\n").unwrap();
        std::fs::write(dir.path().join("prompts/go.md"), "Go").unwrap();
        std::fs::write(
            dir.path().join("workflows/two.yaml"),
            "name: two\nversion: '1'\ndefaults:\n  agent: dev\nphases:\n  - name: first\n    prompt: go\n  - name: second\n    prompt: go\n",
        )
        .unwrap();
        dir
    }

    fn engine(dir: &tempfile::TempDir) -> WorkflowEngine {
        WorkflowEngine::new(NameResolver::new(dir.path(), None), Arc::new(OkExecutor))
    }

    #[test]
    fn test_load_workflow_by_name_or_path() {
        let dir = project();
        let engine = engine(&dir);
        assert_eq!(engine.load_workflow("two").unwrap().name, "two");

        let path = dir.path().join("workflows/two.yaml");
        assert_eq!(engine.load_workflow(path.to_str().unwrap()).unwrap().name, "two");

        assert!(matches!(
            engine.load_workflow("ghost"),
            Err(EngineError::Resolution(_))
        ));
    }

    #[tokio::test]
    async fn test_phase_hook_sees_phase_marked_and_error_fails_run() {
        let dir = project();
        let engine = engine(&dir).with_phase_hook(|phase, ctx| {
            assert!(ctx.is_phase_completed(phase));
            if phase == "first" {
                anyhow::bail!("notifier offline");
            }
            Ok(())
        });

        let err = engine.run("two", None).await.unwrap_err();
        let EngineError::PhaseHook { phase, message } = err else {
            panic!("expected PhaseHook error, got {err:?}");
        };
        assert_eq!(phase, "first");
        assert_eq!(message, "notifier offline");
    }

    #[tokio::test]
    async fn test_resume_unknown_phase() {
        let dir = project();
        let err = engine(&dir)
            .resume("two", &Checkpoint::default(), Some("third"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownPhase(p) if p == "third"));
    }

    #[tokio::test]
    async fn test_missing_spec_file_is_error() {
        let dir = project();
        let err = engine(&dir)
            .run("two", Some(&dir.path().join("nope.md")))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Spec(_)));
    }
}
