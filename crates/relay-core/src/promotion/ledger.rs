//! Completed imports per (artifact, environment) pair.
//!
//! The ledger outlives individual requests, so a rerun skips environments
//! that already received this exact artifact.

use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fs::{read_json, write_json_atomic};
use crate::types::pair_digest;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRecord {
    pub artifact_name: String,
    pub environment: String,
    pub content_hash: String,
    pub config_fingerprint: String,
    pub request_id: String,
    pub receipt: String,
    pub imported_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ImportLedger {
    dir: PathBuf,
}

impl ImportLedger {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, artifact_name: &str, environment: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", pair_digest(artifact_name, environment)))
    }

    pub fn get(&self, artifact_name: &str, environment: &str) -> anyhow::Result<Option<ImportRecord>> {
        read_json(&self.path_for(artifact_name, environment)).with_context(|| {
            format!("Failed to read import record for '{artifact_name}' in '{environment}'")
        })
    }

    /// Whether `content_hash` was already imported into `environment`.
    pub fn contains(
        &self,
        artifact_name: &str,
        environment: &str,
        content_hash: &str,
    ) -> anyhow::Result<bool> {
        Ok(self
            .get(artifact_name, environment)?
            .is_some_and(|record| record.content_hash == content_hash))
    }

    pub fn record(&self, record: &ImportRecord) -> anyhow::Result<()> {
        write_json_atomic(&self.path_for(&record.artifact_name, &record.environment), record)
    }
}
