//! Canonical issue per chain.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use crate::error::TrackingError;
use crate::fs::LockFile;
use crate::types::ChainKey;

use super::backend::{IssueBackend, IssueDraft};
use super::body::{self, DEFAULT_TEMPLATE};
use super::ledger::{IssueLedger, LedgerEntry};
use super::{IssueContext, IssueStatus, TrackingIssue};

const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

pub struct IssueTracker {
    backend: Arc<dyn IssueBackend>,
    ledger: IssueLedger,
    body_template: String,
    labels: Vec<String>,
    lock_timeout: Duration,
}

impl IssueTracker {
    pub fn new(backend: Arc<dyn IssueBackend>, ledger: IssueLedger) -> Self {
        Self {
            backend,
            ledger,
            body_template: DEFAULT_TEMPLATE.to_string(),
            labels: Vec::new(),
            lock_timeout: LOCK_TIMEOUT,
        }
    }

    /// Use a custom body template. It must reference every field.
    pub fn with_body_template(mut self, template: String) -> Result<Self, TrackingError> {
        body::validate_template(&template)?;
        self.body_template = template;
        Ok(self)
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Return the chain's open issue, creating one if none is open.
    ///
    /// An open issue whose rendered body changed is updated in place and
    /// keeps its id. An issue closed outside relay is recorded as closed and
    /// replaced.
    pub fn ensure_open(
        &self,
        chain: &ChainKey,
        context: &IssueContext,
    ) -> Result<TrackingIssue, TrackingError> {
        let draft = IssueDraft {
            title: body::title(context),
            body: body::render(&self.body_template, context)?,
            labels: self.labels.clone(),
        };
        let digest = draft_digest(&draft);

        let _lock = self.lock(chain)?;

        let Some(mut entry) = self.ledger.load(chain).map_err(state)? else {
            let issue = self.open_or_adopt(&draft, context)?;
            let entry = LedgerEntry {
                chain: chain.clone(),
                issue: issue.clone(),
                body_digest: digest,
                superseded: Vec::new(),
                updated_at: Utc::now(),
            };
            self.ledger.save(&entry).map_err(state)?;
            info!(chain = %chain, issue = %issue.id, "Opened tracking issue");
            return Ok(issue);
        };

        if entry.issue.is_open() {
            if self.backend.is_open(&entry.issue.id)? {
                if entry.body_digest != digest {
                    self.backend.update(&entry.issue.id, &draft)?;
                    entry.body_digest = digest;
                    entry.issue.run_url = context.run_url.clone();
                    entry.issue.target_environments = context.target_environments();
                    entry.updated_at = Utc::now();
                    self.ledger.save(&entry).map_err(state)?;
                    debug!(chain = %chain, issue = %entry.issue.id, "Refreshed tracking issue");
                }
                return Ok(entry.issue);
            }
            info!(chain = %chain, issue = %entry.issue.id, "Tracking issue was closed outside relay");
            entry.issue.status = IssueStatus::Closed;
        }

        let issue = self.open_or_adopt(&draft, context)?;
        let previous = std::mem::replace(&mut entry.issue, issue.clone());
        entry.superseded.push(previous);
        entry.body_digest = digest;
        entry.updated_at = Utc::now();
        self.ledger.save(&entry).map_err(state)?;
        info!(chain = %chain, issue = %issue.id, "Opened replacement tracking issue");

        Ok(issue)
    }

    /// Close a tracked issue. Closing an already closed issue is a no-op.
    pub fn close(&self, issue_id: &str) -> Result<TrackingIssue, TrackingError> {
        let entry = self
            .ledger
            .find_by_issue(issue_id)
            .map_err(state)?
            .ok_or_else(|| TrackingError::UnknownIssue(issue_id.to_string()))?;

        let _lock = self.lock(&entry.chain)?;

        // Re-read under the lock; the chain may have moved on
        let mut entry = self
            .ledger
            .load(&entry.chain)
            .map_err(state)?
            .filter(|e| e.issue.id == issue_id)
            .ok_or_else(|| TrackingError::UnknownIssue(issue_id.to_string()))?;

        if entry.issue.is_open() {
            self.backend.close(issue_id)?;
            entry.issue.status = IssueStatus::Closed;
            entry.updated_at = Utc::now();
            self.ledger.save(&entry).map_err(state)?;
            info!(chain = %entry.chain, issue = %issue_id, "Closed tracking issue");
        }

        Ok(entry.issue)
    }

    /// The chain's currently open issue, as recorded.
    pub fn open_issue(&self, chain: &ChainKey) -> Result<Option<TrackingIssue>, TrackingError> {
        Ok(self
            .ledger
            .load(chain)
            .map_err(state)?
            .map(|entry| entry.issue)
            .filter(TrackingIssue::is_open))
    }

    /// Every chain with an issue, ordered by chain.
    pub fn entries(&self) -> Result<Vec<LedgerEntry>, TrackingError> {
        self.ledger.entries().map_err(state)
    }

    /// Create the chain's issue, unless one with its title is already open.
    ///
    /// An issue created by a run that died before recording it in the
    /// ledger is found by title and reused.
    fn open_or_adopt(
        &self,
        draft: &IssueDraft,
        context: &IssueContext,
    ) -> Result<TrackingIssue, TrackingError> {
        let handle = match self.backend.find_open(&draft.title)? {
            Some(handle) => {
                self.backend.update(&handle.id, draft)?;
                info!(issue = %handle.id, "Reusing open tracking issue missing from the ledger");
                handle
            }
            None => self.backend.create(draft)?,
        };
        Ok(TrackingIssue {
            id: handle.id,
            url: handle.url,
            run_url: context.run_url.clone(),
            target_environments: context.target_environments(),
            status: IssueStatus::Open,
            opened_at: Utc::now(),
        })
    }

    fn lock(&self, chain: &ChainKey) -> Result<LockFile, TrackingError> {
        LockFile::acquire(
            &self.ledger.lock_path(chain),
            &format!("issue {chain}"),
            self.lock_timeout,
        )
        .map_err(state)
    }
}

fn draft_digest(draft: &IssueDraft) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(draft.title.as_bytes());
    hasher.update(&[0x00]);
    hasher.update(draft.body.as_bytes());
    hasher.update(&[0x00]);
    hasher.update(draft.labels.join(",").as_bytes());
    hasher.finalize().to_hex().to_string()
}

fn state(err: anyhow::Error) -> TrackingError {
    TrackingError::State(format!("{err:#}"))
}
