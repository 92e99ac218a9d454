//! Execution context: the mutable state of one workflow run.
//!
//! `ExecutionContext` holds named variables (step outputs), the ordered set of
//! completed phases, the set of changed files, and the per-task cursor. It is
//! the only state that flows between steps and the only state that is
//! checkpointed.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use phaseflow_types::run::{Checkpoint, TaskCursor};
use serde_json::Value;
use tokio::sync::Mutex;

/// Context shared by concurrently running steps. All writes go through the
/// mutex, so concurrent children of a parallel step never interleave a write.
pub type SharedContext = Arc<Mutex<ExecutionContext>>;

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionContext {
    variables: HashMap<String, Value>,
    completed_phases: Vec<String>,
    changed_files: BTreeSet<String>,
    current_task: Option<TaskCursor>,
    // The task record itself is only needed for prompt rendering and is not
    // part of a checkpoint.
    current_task_record: Option<Value>,
    // Task a paused run stopped in. Round-trips through checkpoints only;
    // templates never see it.
    paused_task_id: Option<String>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a context from a checkpoint. `completedPhases` is kept intact.
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        let mut ctx = Self::new();
        ctx.restore(checkpoint);
        ctx
    }

    pub fn into_shared(self) -> SharedContext {
        Arc::new(Mutex::new(self))
    }

    /// Look up a dotted path such as `review.issues.0.severity`.
    ///
    /// A key that literally contains dots wins over descent. Numeric segments
    /// index into arrays. Anything absent yields `None`.
    pub fn get(&self, path: &str) -> Option<&Value> {
        if let Some(v) = self.variables.get(path) {
            return Some(v);
        }
        let mut segments = path.split('.');
        let root = self.variables.get(segments.next()?)?;
        lookup_segments(root, segments)
    }

    /// Set a variable. Last write wins.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.variables.insert(key.into(), value);
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.variables.contains_key(key)
    }

    pub fn variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    /// Record a top-level phase as completed. Re-marking is a no-op.
    pub fn mark_phase_completed(&mut self, name: &str) {
        if !self.is_phase_completed(name) {
            self.completed_phases.push(name.to_string());
        }
    }

    pub fn is_phase_completed(&self, name: &str) -> bool {
        self.completed_phases.iter().any(|p| p == name)
    }

    pub fn completed_phases(&self) -> &[String] {
        &self.completed_phases
    }

    pub fn add_changed_file(&mut self, path: impl Into<String>) {
        self.changed_files.insert(path.into());
    }

    pub fn changed_files(&self) -> Vec<String> {
        self.changed_files.iter().cloned().collect()
    }

    pub fn current_task(&self) -> Option<&TaskCursor> {
        self.current_task.as_ref()
    }

    pub fn current_task_record(&self) -> Option<&Value> {
        self.current_task_record.as_ref()
    }

    /// Remember the task a pause happened in, for the checkpoint.
    pub fn mark_task_paused(&mut self, id: impl Into<String>) {
        self.paused_task_id = Some(id.into());
    }

    pub fn paused_task_id(&self) -> Option<&str> {
        self.paused_task_id.as_deref()
    }

    pub fn to_checkpoint(&self) -> Checkpoint {
        Checkpoint {
            variables: self.variables.clone(),
            completed_phases: self.completed_phases.clone(),
            changed_files: self.changed_files(),
            current_task_id: self
                .current_task
                .as_ref()
                .map(|t| t.id.clone())
                .or_else(|| self.paused_task_id.clone()),
        }
    }

    /// Replace this context's state with a checkpoint's.
    ///
    /// A checkpoint's task id is kept for the next checkpoint only. No task
    /// cursor is live after a restore, so top-level steps see no task built-ins.
    pub fn restore(&mut self, checkpoint: &Checkpoint) {
        self.variables = checkpoint.variables.clone();
        self.completed_phases.clear();
        for phase in &checkpoint.completed_phases {
            self.mark_phase_completed(phase);
        }
        self.changed_files = checkpoint.changed_files.iter().cloned().collect();
        self.current_task = None;
        self.current_task_record = None;
        self.paused_task_id = checkpoint.current_task_id.clone();
    }

    /// Fork a child context for one per-task iteration.
    pub fn child_for_task(&self, cursor: TaskCursor, record: Value) -> Self {
        Self {
            variables: self.variables.clone(),
            completed_phases: self.completed_phases.clone(),
            changed_files: self.changed_files.clone(),
            current_task: Some(cursor),
            current_task_record: Some(record),
            paused_task_id: None,
        }
    }

    /// Fold a child context back into this one.
    ///
    /// Only keys the parent does not already hold are copied; a child's write
    /// to an existing key is dropped and the parent's value stays. Changed
    /// files are unioned.
    pub fn merge_child(&mut self, child: ExecutionContext) {
        for (key, value) in child.variables {
            self.variables.entry(key).or_insert(value);
        }
        self.changed_files.extend(child.changed_files);
    }
}

// ---------------------------------------------------------------------------
// Path and template helpers
// ---------------------------------------------------------------------------

/// Walk `segments` into `root`, indexing arrays by numeric segment.
pub fn lookup_segments<'a, 'b>(
    root: &'a Value,
    segments: impl Iterator<Item = &'b str>,
) -> Option<&'a Value> {
    let mut current = root;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Look up a dotted path inside a single value.
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    lookup_segments(root, path.split('.'))
}

/// Render `{{ path }}` placeholders using `lookup`.
///
/// Strings are inserted raw, other values as compact JSON. Placeholders that
/// do not resolve are left verbatim.
pub fn render_template<F>(template: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<Value>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let key = after[..end].trim();
        let whole = &rest[start..start + 2 + end + 2];
        match (!key.is_empty() && !key.contains(char::is_whitespace))
            .then(|| lookup(key))
            .flatten()
        {
            Some(value) => out.push_str(&value_to_string(&value)),
            None => out.push_str(whole),
        }
        rest = &rest[start + 2 + end + 2..];
    }
    out.push_str(rest);
    out
}

/// Convert a JSON value to a string for template substitution.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
