//! Typed, JSON-safe, dirty-tracked key/value bag attached to a workflow.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Maximum length, in bytes, of a string value stored in the context.
pub const MAX_STRING_BYTES: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("value for key {0:?} exceeds the {MAX_STRING_BYTES}-byte string limit")]
    StringTooLarge(String),

    #[error("value for key {0:?} could not be represented as JSON: {1}")]
    NotJsonSafe(String, serde_json::Error),

    #[error("value for key {0:?} could not be deserialized into the requested type: {1}")]
    TypeMismatch(String, serde_json::Error),
}

/// The durable, per-workflow state bag. Values are serialized to JSON on
/// write (so aliasing from the caller's own types cannot leak back in) and
/// the whole map is persisted in one call when dirty.
#[derive(Debug, Clone, Default)]
pub struct Context {
    values: HashMap<String, Value>,
    dirty: bool,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rehydrate from a workflow row's persisted `context` JSON object.
    pub fn from_value(value: Value) -> Self {
        let values = match value {
            Value::Object(map) => map.into_iter().collect(),
            _ => HashMap::new(),
        };
        Self { values, dirty: false }
    }

    /// Serialize the whole bag back to a JSON object for persistence.
    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone().into_iter().collect())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Store `value` under `key`, validating size and JSON-safety.
    pub fn set<T: Serialize>(&mut self, key: impl Into<String>, value: T) -> Result<(), ContextError> {
        let key = key.into();
        let json = serde_json::to_value(value).map_err(|e| ContextError::NotJsonSafe(key.clone(), e))?;
        validate_size(&key, &json)?;
        self.values.insert(key, json);
        self.dirty = true;
        Ok(())
    }

    /// Store `value` under `key` only if the key is not already present.
    /// Returns whether a write happened.
    pub fn set_once<T: Serialize>(&mut self, key: impl Into<String>, value: T) -> Result<bool, ContextError> {
        let key = key.into();
        if self.values.contains_key(&key) {
            return Ok(false);
        }
        self.set(key, value)?;
        Ok(true)
    }

    /// Fetch and deserialize the value stored at `key`, if any.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ContextError> {
        match self.values.get(key) {
            None => Ok(None),
            Some(v) => serde_json::from_value(v.clone())
                .map(Some)
                .map_err(|e| ContextError::TypeMismatch(key.to_string(), e)),
        }
    }

    /// Like `get`, but returns `default` instead of `None` without writing.
    pub fn fetch<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T, ContextError> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Raw JSON value access, used internally when snapshotting the
    /// context for an error log.
    pub fn raw(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}

fn validate_size(key: &str, value: &Value) -> Result<(), ContextError> {
    match value {
        Value::String(s) if s.len() > MAX_STRING_BYTES => Err(ContextError::StringTooLarge(key.to_string())),
        Value::Array(items) => {
            for item in items {
                validate_size(key, item)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for v in map.values() {
                validate_size(key, v)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get_round_trips() {
        let mut ctx = Context::new();
        ctx.set("n", 42).unwrap();
        assert_eq!(ctx.get::<i64>("n").unwrap(), Some(42));
        assert!(ctx.is_dirty());
    }

    #[test]
    fn set_once_does_not_overwrite() {
        let mut ctx = Context::new();
        assert!(ctx.set_once("k", "first").unwrap());
        assert!(!ctx.set_once("k", "second").unwrap());
        assert_eq!(ctx.get::<String>("k").unwrap(), Some("first".to_string()));
    }

    #[test]
    fn fetch_returns_default_without_writing() {
        let ctx = Context::new();
        assert_eq!(ctx.fetch("missing", 7).unwrap(), 7);
        assert!(!ctx.contains_key("missing"));
    }

    #[test]
    fn oversized_string_is_rejected() {
        let mut ctx = Context::new();
        let huge = "a".repeat(MAX_STRING_BYTES + 1);
        let err = ctx.set("big", huge).unwrap_err();
        assert!(matches!(err, ContextError::StringTooLarge(_)));
    }

    #[test]
    fn context_value_round_trip_through_json() {
        let mut ctx = Context::new();
        ctx.set("obj", serde_json::json!({"a": 1, "b": [1, 2, 3]})).unwrap();
        let value = ctx.to_value();
        let reloaded = Context::from_value(value);
        assert_eq!(
            reloaded.get::<Value>("obj").unwrap(),
            Some(serde_json::json!({"a": 1, "b": [1, 2, 3]}))
        );
    }

    #[test]
    fn dirty_flag_clears() {
        let mut ctx = Context::new();
        ctx.set("k", 1).unwrap();
        assert!(ctx.is_dirty());
        ctx.clear_dirty();
        assert!(!ctx.is_dirty());
    }
}
