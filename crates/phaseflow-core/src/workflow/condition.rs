//! JEXL conditions for loop and step gating.
//!
//! Expressions use JEXL syntax (`review.issueCount > 2 && branch|startsWith('feature/')`)
//! and are parsed once when a workflow is loaded, so syntax errors never
//! surface at evaluation time. Evaluation is falsy-on-missing: if any path the
//! expression reads is absent from the context, the whole condition is `false`
//! and the evaluator is never invoked.

use jexl_parser::ast::Expression;
use serde_json::{Number, Value, json};
use thiserror::Error;

use super::context::{ExecutionContext, lookup_segments};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// A syntax error in a condition expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ConditionError {
    pub message: String,
}

impl ConditionError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Condition
// ---------------------------------------------------------------------------

/// A parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    /// Every context path the expression reads, as segments.
    paths: Vec<Vec<String>>,
}

impl Condition {
    /// Parse an expression, rejecting malformed syntax.
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        if source.trim().is_empty() {
            return Err(ConditionError::new("empty condition"));
        }
        let ast = jexl_parser::Parser::parse(source)
            .map_err(|e| ConditionError::new(e.to_string()))?;
        let mut paths = Vec::new();
        collect_paths(&ast, &mut paths);
        Ok(Self {
            source: source.to_string(),
            paths,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a context. Missing data yields `false`, never an error.
    pub fn evaluate(&self, ctx: &ExecutionContext) -> bool {
        if let Some(missing) = self.paths.iter().find(|p| !path_present(ctx, p)) {
            tracing::debug!(
                condition = %self.source,
                path = %missing.join("."),
                "condition reads a missing path; treating as false"
            );
            return false;
        }

        let scope = Value::Object(
            ctx.variables()
                .iter()
                .map(|(k, v)| (k.clone(), float_numbers(v)))
                .collect(),
        );
        match evaluator().eval_in_context(&self.source, &scope) {
            Ok(result) => truthy(&result),
            Err(e) => {
                tracing::warn!(condition = %self.source, error = %e, "condition evaluation failed; treating as false");
                false
            }
        }
    }
}

/// Parse and evaluate in one go.
///
/// Conditions are validated when a workflow is loaded, so a parse failure here
/// only happens for hand-built steps; it is logged and treated as `false`.
pub fn evaluate_condition(source: &str, ctx: &ExecutionContext) -> bool {
    match Condition::parse(source) {
        Ok(condition) => condition.evaluate(ctx),
        Err(e) => {
            tracing::warn!(condition = source, error = %e, "unparseable condition treated as false");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

fn str_arg(args: &[Value], i: usize) -> &str {
    args.get(i).and_then(Value::as_str).unwrap_or("")
}

/// A JEXL evaluator with the string predicate transforms registered.
fn evaluator() -> jexl_eval::Evaluator<'static> {
    jexl_eval::Evaluator::new()
        .with_transform("not", |args: &[Value]| {
            Ok(json!(!truthy(args.first().unwrap_or(&Value::Null))))
        })
        .with_transform("contains", |args: &[Value]| {
            let found = match args.first() {
                Some(Value::Array(items)) => {
                    let needle = args.get(1).map(float_numbers).unwrap_or(Value::Null);
                    items.iter().any(|item| float_numbers(item) == needle)
                }
                Some(Value::Object(map)) => map.contains_key(str_arg(args, 1)),
                _ => str_arg(args, 0).contains(str_arg(args, 1)),
            };
            Ok(json!(found))
        })
        .with_transform("startsWith", |args: &[Value]| {
            Ok(json!(str_arg(args, 0).starts_with(str_arg(args, 1))))
        })
        .with_transform("endsWith", |args: &[Value]| {
            Ok(json!(str_arg(args, 0).ends_with(str_arg(args, 1))))
        })
        .with_transform("length", |args: &[Value]| {
            let len = match args.first() {
                Some(Value::String(s)) => s.len(),
                Some(Value::Array(a)) => a.len(),
                Some(Value::Object(o)) => o.len(),
                _ => 0,
            };
            Ok(json!(len as f64))
        })
}

/// JavaScript-like truthiness.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// JEXL number literals are floats; integer context values are widened so
// `count == 3` compares equal to a stored `3`.
fn float_numbers(value: &Value) -> Value {
    match value {
        Value::Number(n) => n
            .as_f64()
            .and_then(Number::from_f64)
            .map_or_else(|| value.clone(), Value::Number),
        Value::Array(items) => Value::Array(items.iter().map(float_numbers).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), float_numbers(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// Path collection
// ---------------------------------------------------------------------------

fn path_present(ctx: &ExecutionContext, segments: &[String]) -> bool {
    let Some((root, rest)) = segments.split_first() else {
        return true;
    };
    ctx.variables()
        .get(root)
        .and_then(|v| lookup_segments(v, rest.iter().map(String::as_str)))
        .is_some()
}

/// Segments of a pure access chain such as `a.b[0]['c']`.
fn access_path(expr: &Expression) -> Option<Vec<String>> {
    match expr {
        Expression::Identifier(name) => Some(vec![name.clone()]),
        Expression::DotOperation { subject, ident } => {
            let mut path = access_path(subject)?;
            path.push(ident.clone());
            Some(path)
        }
        Expression::IndexOperation { subject, index } => {
            let segment = match index.as_ref() {
                Expression::Number(n) if n.fract() == 0.0 && *n >= 0.0 => format!("{}", *n as u64),
                Expression::String(s) => s.clone(),
                _ => return None,
            };
            let mut path = access_path(subject)?;
            path.push(segment);
            Some(path)
        }
        _ => None,
    }
}

fn collect_paths(expr: &Expression, out: &mut Vec<Vec<String>>) {
    if let Some(path) = access_path(expr) {
        out.push(path);
        return;
    }
    match expr {
        Expression::DotOperation { subject, .. } => collect_paths(subject, out),
        Expression::IndexOperation { subject, index } => {
            collect_paths(subject, out);
            collect_paths(index, out);
        }
        Expression::BinaryOperation { left, right, .. } => {
            collect_paths(left, out);
            collect_paths(right, out);
        }
        Expression::Transform { subject, args, .. } => {
            collect_paths(subject, out);
            for arg in args.iter().flatten() {
                collect_paths(arg, out);
            }
        }
        Expression::Conditional {
            left,
            truthy,
            falsy,
        } => {
            collect_paths(left, out);
            collect_paths(truthy, out);
            collect_paths(falsy, out);
        }
        Expression::Array(items) => {
            for item in items {
                collect_paths(item, out);
            }
        }
        // Literals; filter predicates read fields of the filtered items.
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ExecutionContext {
        let mut ctx = ExecutionContext::new();
        ctx.set(
            "review",
            json!({
                "hasActionableIssues": true,
                "issueCount": 3,
                "summary": "needs work on error handling",
                "labels": ["bug", "style"]
            }),
        );
        ctx.set("plan", json!({ "tasks": [{ "id": "t1", "status": "done" }] }));
        ctx.set("branch", json!("feature/login"));
        ctx
    }

    fn eval(src: &str) -> bool {
        Condition::parse(src).unwrap().evaluate(&ctx())
    }

    // -----------------------------------------------------------------------
    // Paths and comparisons
    // -----------------------------------------------------------------------

    #[test]
    fn test_bare_path_truthiness() {
        assert!(eval("review.hasActionableIssues"));
        assert!(eval("review"));
        assert!(!eval("review.nothing"));
    }

    #[test]
    fn test_comparisons() {
        assert!(eval("review.issueCount == 3"));
        assert!(eval("review.issueCount == 3.0"));
        assert!(eval("review.issueCount > 2"));
        assert!(eval("review.issueCount >= 3"));
        assert!(!eval("review.issueCount < 3"));
        assert!(eval("review.issueCount <= 3"));
        assert!(eval("review.issueCount != 4"));
        assert!(eval("review.hasActionableIssues == true"));
        assert!(eval("plan.tasks[0].status == 'done'"));
        assert!(eval("plan.tasks[0].id == \"t1\""));
    }

    #[test]
    fn test_string_predicates() {
        assert!(eval("review.summary|contains('error')"));
        assert!(eval("review.labels|contains('bug')"));
        assert!(!eval("review.labels|contains('perf')"));
        assert!(eval("'style' in review.labels"));
        assert!(eval("branch|startsWith('feature/')"));
        assert!(eval("branch|endsWith('login')"));
        assert!(!eval("review.issueCount|startsWith('3')"));
        assert!(eval("review.labels|length == 2"));
    }

    #[test]
    fn test_boolean_combinators() {
        assert!(eval("review.hasActionableIssues && review.issueCount > 1"));
        assert!(eval("review.issueCount > 10 || branch|contains('login')"));
        assert!(eval("(review.issueCount > 10)|not"));
        assert!(!eval("review.hasActionableIssues && review.issueCount == 0"));
    }

    // -----------------------------------------------------------------------
    // Falsy on missing
    // -----------------------------------------------------------------------

    #[test]
    fn test_missing_paths_are_false() {
        assert!(!eval("missing"));
        assert!(!eval("missing.deeply.nested.value"));
        assert!(!eval("missing == null"));
        assert!(!eval("missing != 'x'"));
        assert!(!eval("missing.count > 0"));
        assert!(!eval("missing|contains('a')"));
        assert!(!eval("plan.tasks[5].id == 't6'"));
        assert!(!eval("review.summary.length > 0"));
    }

    #[test]
    fn test_negating_missing_stays_false() {
        assert!(!eval("(missing)|not"));
        assert!(!eval("missing.flag|not"));
    }

    #[test]
    fn test_missing_anywhere_makes_condition_false() {
        assert!(!eval("missing && review"));
        assert!(!eval("missing || review"));
        assert!(!eval("review.issueCount > 1 ? missing : true"));
        assert!(!eval("branch|startsWith(missing.prefix)"));
    }

    #[test]
    fn test_evaluate_condition_on_empty_context() {
        let empty = ExecutionContext::new();
        assert!(!evaluate_condition("review.hasActionableIssues", &empty));
        assert!(!evaluate_condition("a.b ==", &empty));
    }

    #[test]
    fn test_literal_only_condition() {
        let empty = ExecutionContext::new();
        assert!(evaluate_condition("1 < 2", &empty));
        assert!(!evaluate_condition("''", &empty));
    }

    // -----------------------------------------------------------------------
    // Parse errors
    // -----------------------------------------------------------------------

    #[test]
    fn test_malformed_expressions_rejected() {
        for src in [
            "",
            "   ",
            "a ==",
            "== a",
            "a && ",
            "(a || b",
            "a || b)",
            "a = b",
            "a..b",
            "a.",
            "'unterminated",
            "a b",
            "a # b",
        ] {
            assert!(Condition::parse(src).is_err(), "expected parse error for {src:?}");
        }
    }

    #[test]
    fn test_collected_paths() {
        let cond = Condition::parse("plan.tasks[0].id == 'x' && branch|contains(review.label)").unwrap();
        assert_eq!(
            cond.paths,
            vec![
                vec!["plan".to_string(), "tasks".to_string(), "0".to_string(), "id".to_string()],
                vec!["branch".to_string()],
                vec!["review".to_string(), "label".to_string()],
            ]
        );
    }

    #[test]
    fn test_source_preserved() {
        let cond = Condition::parse("review.ok == true").unwrap();
        assert_eq!(cond.source(), "review.ok == true");
    }
}
