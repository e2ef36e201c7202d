//! JEXL guard evaluation for node guards, condition nodes, and edge guards.
//!
//! Wraps `jexl_eval::Evaluator` with a small set of transforms. Guards are
//! evaluated against `VariableStore::to_expression_context()`, so variables
//! are top-level identifiers: `x == 1`, `fetch_result.rows|length > 0`.
//!
//! Variable values are always passed as context, never interpolated into
//! expression strings.

use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression '{expression}' failed: {reason}")]
    EvalFailed { expression: String, reason: String },

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// GuardEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator with the guard transforms pre-registered.
///
/// Cheap to build; callers construct one per evaluation pass and drop it
/// before awaiting.
pub struct GuardEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl GuardEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match (args.first(), args.get(1)) {
                    (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
                    (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                    (Some(Value::Object(map)), Some(Value::String(key))) => map.contains_key(key),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate a single guard to a boolean.
    ///
    /// Non-boolean results are coerced with JavaScript-like truthiness.
    /// Malformed expressions are errors, never `false`.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        let result = self
            .evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed {
                expression: expression.to_string(),
                reason: e.to_string(),
            })?;

        Ok(value_to_bool(&result))
    }

    /// Evaluate a guard list in order; `true` iff every guard holds.
    ///
    /// Stops at the first `false`. An empty list is vacuously `true`.
    pub fn evaluate_all<S: AsRef<str>>(
        &self,
        guards: &[S],
        context: &Value,
    ) -> Result<bool, ExpressionError> {
        for guard in guards {
            if !self.evaluate_bool(guard.as_ref(), context)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl Default for GuardEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Coerce a JSON value to boolean using JavaScript-like truthiness.
fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Evaluate `guards` against `context` with a fresh evaluator.
pub fn evaluate_guards<S: AsRef<str>>(guards: &[S], context: &Value) -> Result<bool, ExpressionError> {
    GuardEvaluator::new().evaluate_all(guards, context)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
