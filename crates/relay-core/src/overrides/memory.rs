//! In-memory override sets keyed by secret key.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::error::{LookupFailure, NotFoundError};
use crate::types::Environment;

use super::{OverrideSet, OverrideStore};

#[derive(Debug, Default)]
pub struct MemoryOverrideStore {
    sets: RwLock<HashMap<String, BTreeMap<String, String>>>,
}

impl MemoryOverrideStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the set stored under `secret_key`.
    pub fn insert<K, V>(&self, secret_key: &str, values: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<String>,
    {
        let values = values
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        if let Ok(mut sets) = self.sets.write() {
            sets.insert(secret_key.to_string(), values);
        }
    }

    pub fn remove(&self, secret_key: &str) {
        if let Ok(mut sets) = self.sets.write() {
            sets.remove(secret_key);
        }
    }
}

impl OverrideStore for MemoryOverrideStore {
    fn get(&self, environment: &Environment) -> Result<OverrideSet, NotFoundError> {
        let sets = self.sets.read().map_err(|_| NotFoundError {
            environment: environment.name.clone(),
            secret_key: environment.override_secret_key.clone(),
            failure: LookupFailure::Unreadable("override store lock poisoned".to_string()),
        })?;

        sets.get(&environment.override_secret_key)
            .map(|values| OverrideSet::new(&environment.name, values.clone()))
            .ok_or_else(|| NotFoundError {
                environment: environment.name.clone(),
                secret_key: environment.override_secret_key.clone(),
                failure: LookupFailure::Missing,
            })
    }
}
