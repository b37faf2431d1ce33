//! Shared core types used across configuration, state and tracking layers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Configuration scope levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigScope {
    /// Operator-wide defaults (~/.config/relay/relay.toml).
    Global,
    /// Repository configuration (./relay.toml).
    Project,
}

/// A deployment target. Statically configured, never mutated at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    pub requires_approval: bool,
    /// Name under which the environment's override set is stored externally.
    pub override_secret_key: String,
}

impl Environment {
    pub fn new(
        name: impl Into<String>,
        requires_approval: bool,
        override_secret_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            requires_approval,
            override_secret_key: override_secret_key.into(),
        }
    }
}

/// A named, ordered sequence of environments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    pub environments: Vec<Environment>,
}

impl Plan {
    pub fn new(name: impl Into<String>, environments: Vec<Environment>) -> Self {
        Self {
            name: name.into(),
            environments,
        }
    }

    pub fn environment_names(&self) -> Vec<String> {
        self.environments.iter().map(|e| e.name.clone()).collect()
    }
}

/// Identity of a promotion chain: one artifact promoted along one plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChainKey {
    pub plan: String,
    pub artifact_name: String,
}

impl ChainKey {
    pub fn new(plan: impl Into<String>, artifact_name: impl Into<String>) -> Self {
        Self {
            plan: plan.into(),
            artifact_name: artifact_name.into(),
        }
    }

    /// Stable hex digest, used to key state files and locks.
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.plan.as_bytes());
        hasher.update(&[0x00]);
        hasher.update(self.artifact_name.as_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

impl fmt::Display for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.plan, self.artifact_name)
    }
}

/// Digest for an (artifact, environment) pair.
pub fn pair_digest(artifact_name: &str, environment: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(artifact_name.as_bytes());
    hasher.update(&[0x00]);
    hasher.update(environment.as_bytes());
    hasher.finalize().to_hex().to_string()
}
