//! Per-socket key-value scratchpad.
//!
//! Middleware and handlers use it to share state through the lifetime of the
//! socket (auth flags, user profiles, session data). It is backed by a
//! [`DashMap`](dashmap::DashMap) so it is thread safe, but be careful about
//! deadlocks when holding references across calls back into the runtime.

use dashmap::DashMap;
use serde_json::Value;

#[derive(Debug, Default)]
pub struct Extensions(DashMap<String, Value>);

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value, returning the previous one if any.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// A clone of the value under `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.get(key).map(|v| v.clone())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.0.remove(key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn insert_get_remove() {
        let ext = Extensions::new();
        assert!(ext.insert("authenticated", true).is_none());
        assert_eq!(ext.get("authenticated"), Some(json!(true)));
        assert_eq!(ext.insert("authenticated", false), Some(json!(true)));
        assert_eq!(ext.remove("authenticated"), Some(json!(false)));
        assert!(ext.is_empty());
    }
}
