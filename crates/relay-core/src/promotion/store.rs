//! Persisted promotion requests, one JSON file each.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::fs::{read_json, write_json_atomic};
use crate::types::ChainKey;

use super::state::PromotionRequest;

#[derive(Debug, Clone)]
pub struct RequestStore {
    dir: PathBuf,
}

impl RequestStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> anyhow::Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            anyhow::bail!("Invalid request id '{}'", id);
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    pub fn load(&self, id: &str) -> anyhow::Result<Option<PromotionRequest>> {
        let path = self.path_for(id)?;
        read_json(&path).with_context(|| format!("Failed to load promotion request '{id}'"))
    }

    pub fn save(&self, request: &PromotionRequest) -> anyhow::Result<()> {
        let path = self.path_for(&request.id)?;
        write_json_atomic(&path, request)
            .with_context(|| format!("Failed to save promotion request '{}'", request.id))
    }

    /// Every request, newest first.
    pub fn list(&self) -> anyhow::Result<Vec<PromotionRequest>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read request directory {}", self.dir.display())
                });
            }
        };

        let mut requests = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(request) = read_json::<PromotionRequest>(&path)? {
                requests.push(request);
            }
        }
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(requests)
    }

    /// Requests for one chain, oldest generation first.
    pub fn for_chain(&self, chain: &ChainKey) -> anyhow::Result<Vec<PromotionRequest>> {
        let mut requests: Vec<_> = self
            .list()?
            .into_iter()
            .filter(|r| &r.chain == chain)
            .collect();
        requests.sort_by_key(|r| r.generation);
        Ok(requests)
    }
}
