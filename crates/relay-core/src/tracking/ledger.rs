//! Persisted chain -> issue mapping.
//!
//! One JSON file per chain, keyed by the chain digest. Callers hold the
//! chain lock from [`IssueLedger::lock_path`] around read-modify-write.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fs::{read_json, write_json_atomic};
use crate::types::ChainKey;

use super::TrackingIssue;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub chain: ChainKey,
    /// The canonical issue; open unless every issue for the chain is closed.
    pub issue: TrackingIssue,
    /// Digest of the last rendered title and body.
    pub body_digest: String,
    /// Earlier issues for the chain, oldest first.
    #[serde(default)]
    pub superseded: Vec<TrackingIssue>,
    pub updated_at: DateTime<Utc>,
}

pub struct IssueLedger {
    dir: PathBuf,
    locks_dir: PathBuf,
}

impl IssueLedger {
    pub fn new(dir: PathBuf, locks_dir: PathBuf) -> Self {
        Self { dir, locks_dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, chain: &ChainKey) -> PathBuf {
        self.dir.join(format!("{}.json", chain.digest()))
    }

    pub fn lock_path(&self, chain: &ChainKey) -> PathBuf {
        self.locks_dir.join(format!("issue-{}.lock", chain.digest()))
    }

    pub fn load(&self, chain: &ChainKey) -> anyhow::Result<Option<LedgerEntry>> {
        read_json(&self.entry_path(chain))
    }

    pub fn save(&self, entry: &LedgerEntry) -> anyhow::Result<()> {
        write_json_atomic(&self.entry_path(&entry.chain), entry)
    }

    /// All entries, ordered by chain.
    pub fn entries(&self) -> anyhow::Result<Vec<LedgerEntry>> {
        let dir_entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read issue ledger {}", self.dir.display()));
            }
        };

        let mut entries = Vec::new();
        for dir_entry in dir_entries {
            let path = dir_entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(entry) = read_json::<LedgerEntry>(&path)? {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| a.chain.cmp(&b.chain));
        Ok(entries)
    }

    /// The entry whose canonical issue has `issue_id`.
    pub fn find_by_issue(&self, issue_id: &str) -> anyhow::Result<Option<LedgerEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .find(|entry| entry.issue.id == issue_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::IssueStatus;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn entry(chain: ChainKey, id: &str) -> LedgerEntry {
        LedgerEntry {
            chain,
            issue: TrackingIssue {
                id: id.to_string(),
                url: None,
                run_url: "local://run".to_string(),
                target_environments: BTreeSet::from(["qa".to_string()]),
                status: IssueStatus::Open,
                opened_at: Utc::now(),
            },
            body_digest: "d".to_string(),
            superseded: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn save_and_load() {
        let temp = TempDir::new().unwrap();
        let ledger = IssueLedger::new(temp.path().join("issues"), temp.path().join("locks"));
        let chain = ChainKey::new("qa-to-prod", "nightly-042");

        assert!(ledger.load(&chain).unwrap().is_none());
        ledger.save(&entry(chain.clone(), "5")).unwrap();

        let loaded = ledger.load(&chain).unwrap().unwrap();
        assert_eq!(loaded.issue.id, "5");
    }

    #[test]
    fn find_by_issue_scans_entries() {
        let temp = TempDir::new().unwrap();
        let ledger = IssueLedger::new(temp.path().join("issues"), temp.path().join("locks"));
        ledger.save(&entry(ChainKey::new("p", "a"), "1")).unwrap();
        ledger.save(&entry(ChainKey::new("p", "b"), "2")).unwrap();

        let found = ledger.find_by_issue("2").unwrap().unwrap();
        assert_eq!(found.chain, ChainKey::new("p", "b"));
        assert!(ledger.find_by_issue("3").unwrap().is_none());
        assert_eq!(ledger.entries().unwrap().len(), 2);
    }

    #[test]
    fn entries_of_missing_dir_is_empty() {
        let temp = TempDir::new().unwrap();
        let ledger = IssueLedger::new(temp.path().join("none"), temp.path().join("locks"));
        assert!(ledger.entries().unwrap().is_empty());
    }
}
