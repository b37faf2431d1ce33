//! Per-environment override sets
//!
//! Read-only access to the key/value data that fills a template for one
//! environment. A missing set is always an explicit error; nothing here ever
//! substitutes an empty set.

pub mod env;
pub mod file;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use crate::error::NotFoundError;
use crate::types::Environment;

pub use env::EnvOverrideStore;
pub use file::FileOverrideStore;
pub use memory::MemoryOverrideStore;

/// Source of override sets, one per environment.
pub trait OverrideStore: Send + Sync {
    fn get(&self, environment: &Environment) -> Result<OverrideSet, NotFoundError>;
}

/// Key/value overrides for one environment. Values are secrets.
#[derive(Clone, PartialEq, Eq)]
pub struct OverrideSet {
    environment: String,
    values: BTreeMap<String, String>,
}

impl OverrideSet {
    pub fn new(environment: impl Into<String>, values: BTreeMap<String, String>) -> Self {
        Self {
            environment: environment.into(),
            values,
        }
    }

    /// Parse the JSON object stored under an environment's secret key.
    ///
    /// Strings are taken as-is, numbers and booleans are stringified; null,
    /// arrays and nested objects are rejected.
    pub fn from_json(environment: impl Into<String>, raw: &str) -> Result<Self, String> {
        let value: Value = serde_json::from_str(raw).map_err(|e| e.to_string())?;
        let Value::Object(map) = value else {
            return Err("expected a JSON object".to_string());
        };

        let mut values = BTreeMap::new();
        for (key, value) in map {
            let text = match value {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                Value::Null | Value::Array(_) | Value::Object(_) => {
                    return Err(format!("value for '{key}' must be a string"));
                }
            };
            values.insert(key, text);
        }

        Ok(Self::new(environment, values))
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Digest of the full key/value content. Changes whenever any secret changes.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for (key, value) in &self.values {
            hasher.update(&(key.len() as u64).to_le_bytes());
            hasher.update(key.as_bytes());
            hasher.update(&(value.len() as u64).to_le_bytes());
            hasher.update(value.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }
}

impl fmt::Debug for OverrideSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverrideSet")
            .field("environment", &self.environment)
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}
