//! Per-run variable store with parameter substitution.
//!
//! `VariableStore` is the shared key/value map of one workflow run. Completed
//! nodes write `"{node_id}_result"` (plus any declared output bindings);
//! guards and downstream parameters read from it.
//!
//! Writers touch disjoint keys by convention, so a plain `RwLock` is enough.
//! Readers that need a consistent view (guard evaluation, parameter
//! resolution) take a `snapshot()` instead of holding the lock.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::{Map, Value};

/// Key under which a completed node's result is stored.
pub fn result_key(node_id: &str) -> String {
    format!("{node_id}_result")
}

/// Thread-safe variable map scoped to a single workflow run.
#[derive(Debug, Default)]
pub struct VariableStore {
    vars: RwLock<HashMap<String, Value>>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with the workflow's submitted inputs.
    pub fn with_inputs(inputs: Map<String, Value>) -> Self {
        Self {
            vars: RwLock::new(inputs.into_iter().collect()),
        }
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.write().insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.read().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Point-in-time copy of every variable.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.read().clone()
    }

    /// The store as a JSON object (used for persistence).
    pub fn to_json(&self) -> Value {
        Value::Object(self.read().iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    /// The JSON context guard expressions evaluate against.
    ///
    /// Variables are top-level identifiers (`x == 1`, `fetch_result.count > 3`).
    /// Integers are widened to floats because expression literals are floats.
    pub fn to_expression_context(&self) -> Value {
        let vars = self.read();
        Value::Object(
            vars.iter()
                .map(|(k, v)| (k.clone(), normalize_numbers(v)))
                .collect(),
        )
    }

    /// Apply `{{ key }}` substitution to a node's parameters against a
    /// snapshot of the store.
    pub fn resolve_parameters(&self, parameters: &Map<String, Value>) -> Map<String, Value> {
        let vars = self.snapshot();
        parameters
            .iter()
            .map(|(k, v)| (k.clone(), resolve_value(v, &vars)))
            .collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Value>> {
        self.vars.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Value>> {
        self.vars.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Template resolution
// ---------------------------------------------------------------------------

/// Substitute `{{ key }}` references in `value`.
///
/// - A string that is exactly one `{{ key }}` becomes the variable's value,
///   keeping its JSON type.
/// - References embedded in longer strings are interpolated as text.
/// - Unknown keys are left untouched.
/// - Arrays and objects are resolved recursively.
pub fn resolve_value(value: &Value, vars: &HashMap<String, Value>) -> Value {
    match value {
        Value::String(s) => {
            if let Some(key) = whole_reference(s) {
                if let Some(found) = vars.get(key) {
                    return found.clone();
                }
            }
            Value::String(interpolate(s, vars))
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, vars)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// If `s` is a single `{{ key }}` reference, return the trimmed key.
fn whole_reference(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    let key = inner.trim();
    (!key.is_empty()).then_some(key)
}

fn interpolate(template: &str, vars: &HashMap<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        let end = start + 2 + len + 2;
        let key = rest[start + 2..end - 2].trim();

        out.push_str(&rest[..start]);
        match vars.get(key) {
            Some(value) => out.push_str(&value_to_string(value)),
            None => out.push_str(&rest[start..end]),
        }
        rest = &rest[end..];
    }

    out.push_str(rest);
    out
}

/// Convert a JSON value to a display string for template interpolation.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // For objects/arrays, return compact JSON
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

/// Widen every integer in `value` to `f64`.
pub fn normalize_numbers(value: &Value) -> Value {
    match value {
        Value::Number(n) if !n.is_f64() => n
            .as_f64()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| value.clone()),
        Value::Array(items) => Value::Array(items.iter().map(normalize_numbers).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), normalize_numbers(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn store() -> VariableStore {
        let store = VariableStore::new();
        store.set("name", json!("Ada"));
        store.set("count", json!(3));
        store.set("fetch_result", json!({ "rows": [1, 2] }));
        store
    }

    fn params(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("params must be an object"),
        }
    }

    #[test]
    fn test_set_get_and_snapshot_isolation() {
        let store = VariableStore::new();
        store.set("x", json!(1));
        let snapshot = store.snapshot();
        store.set("x", json!(2));

        assert_eq!(snapshot.get("x"), Some(&json!(1)));
        assert_eq!(store.get("x"), Some(json!(2)));
        assert_eq!(store.get("missing"), None);
    }

    #[test]
    fn test_with_inputs_seeds_store() {
        let store = VariableStore::with_inputs(params(json!({ "region": "eu" })));
        assert_eq!(store.get("region"), Some(json!("eu")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_result_key_format() {
        assert_eq!(result_key("fetch"), "fetch_result");
    }

    #[test]
    fn test_whole_reference_keeps_type() {
        let resolved = store().resolve_parameters(&params(json!({
            "n": "{{ count }}",
            "data": "{{fetch_result}}",
        })));
        assert_eq!(resolved["n"], json!(3));
        assert_eq!(resolved["data"], json!({ "rows": [1, 2] }));
    }

    #[test]
    fn test_embedded_reference_interpolates() {
        let resolved = store().resolve_parameters(&params(json!({
            "greeting": "hello {{ name }}, you have {{ count }} items",
        })));
        assert_eq!(resolved["greeting"], json!("hello Ada, you have 3 items"));
    }

    #[test]
    fn test_unknown_reference_left_as_is() {
        let resolved = store().resolve_parameters(&params(json!({
            "a": "{{ nope }}",
            "b": "x {{ nope }} y",
            "c": "unterminated {{ name",
        })));
        assert_eq!(resolved["a"], json!("{{ nope }}"));
        assert_eq!(resolved["b"], json!("x {{ nope }} y"));
        assert_eq!(resolved["c"], json!("unterminated {{ name"));
    }

    #[test]
    fn test_nested_values_resolved() {
        let resolved = store().resolve_parameters(&params(json!({
            "list": ["{{ name }}", 7, { "deep": "{{ count }}" }],
        })));
        assert_eq!(resolved["list"], json!(["Ada", 7, { "deep": 3 }]));
    }

    #[test]
    fn test_expression_context_widens_integers() {
        let ctx = store().to_expression_context();
        assert_eq!(ctx["count"], json!(3.0));
        assert_eq!(ctx["fetch_result"]["rows"], json!([1.0, 2.0]));
        assert_eq!(ctx["name"], json!("Ada"));
    }

    #[test]
    fn test_concurrent_disjoint_writes() {
        let store = Arc::new(VariableStore::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.set(result_key(&format!("n{i}")), json!(i)))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.len(), 8);
        assert_eq!(store.get("n5_result"), Some(json!(5)));
    }
}
