//! Lock files that keep promotions from overlapping.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConcurrentPromotionError, PromotionError};
use crate::fs::LockFile;
use crate::types::{ChainKey, pair_digest};

const CHAIN_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct PromotionLocks {
    dir: PathBuf,
}

impl PromotionLocks {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Serialize request creation for a chain. Waits briefly.
    pub fn chain(&self, chain: &ChainKey) -> Result<LockFile, PromotionError> {
        let path = self.dir.join(format!("chain-{}.lock", chain.digest()));
        Ok(LockFile::acquire(
            &path,
            &format!("chain {chain}"),
            CHAIN_LOCK_TIMEOUT,
        )?)
    }

    /// Exclusive use of one request. Fails fast.
    pub fn request(&self, artifact_name: &str, request_id: &str) -> Result<LockFile, PromotionError> {
        let path = self.request_path(request_id);
        exclusive(
            &path,
            &format!("request {request_id}"),
            artifact_name,
            format!("request '{request_id}'"),
        )
    }

    /// At most one in-flight import per (artifact, environment). Fails fast.
    pub fn import(&self, artifact_name: &str, environment: &str) -> Result<LockFile, PromotionError> {
        let path = self.import_path(artifact_name, environment);
        exclusive(
            &path,
            &format!("import {artifact_name} -> {environment}"),
            artifact_name,
            format!("environment '{environment}'"),
        )
    }

    pub fn request_path(&self, request_id: &str) -> PathBuf {
        self.dir.join(format!("request-{request_id}.lock"))
    }

    pub fn import_path(&self, artifact_name: &str, environment: &str) -> PathBuf {
        self.dir
            .join(format!("import-{}.lock", pair_digest(artifact_name, environment)))
    }
}

fn exclusive(
    path: &Path,
    holder: &str,
    artifact_name: &str,
    scope: String,
) -> Result<LockFile, PromotionError> {
    LockFile::try_acquire(path, holder)?.ok_or_else(|| {
        ConcurrentPromotionError {
            artifact_name: artifact_name.to_string(),
            scope,
            holder: LockFile::holder(path).map(|h| h.to_string()),
        }
        .into()
    })
}
