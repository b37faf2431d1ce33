//! Tracking issues
//!
//! Exactly one open issue per promotion chain tells the operator which
//! overrides to edit and which environments are waiting. The chain identity
//! to issue mapping is an explicit ledger with serialized access per chain.

pub mod backend;
pub mod body;
pub mod github;
pub mod ledger;
pub mod tracker;

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::template::TemplateStatus;

pub use backend::{FileIssueBackend, IssueBackend, IssueDraft, IssueHandle};
pub use github::GithubIssueBackend;
pub use ledger::{IssueLedger, LedgerEntry};
pub use tracker::IssueTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueStatus {
    Open,
    Closed,
}

/// The canonical record for one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingIssue {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
    pub run_url: String,
    pub target_environments: BTreeSet<String>,
    pub status: IssueStatus,
    pub opened_at: DateTime<Utc>,
}

impl TrackingIssue {
    pub fn is_open(&self) -> bool {
        self.status == IssueStatus::Open
    }
}

/// Everything rendered into an issue body.
#[derive(Debug, Clone)]
pub struct IssueContext {
    pub plan: String,
    pub artifact_name: String,
    pub artifact_dir: PathBuf,
    pub metadata_path: PathBuf,
    pub run_url: String,
    pub required_keys: BTreeSet<String>,
    pub template_status: TemplateStatus,
    /// Where the template was found.
    pub template_source: Option<String>,
    /// Body of a properties template, quoted in the issue.
    pub template_excerpt: Option<String>,
    /// Plan order.
    pub environments: Vec<EnvironmentNotice>,
}

impl IssueContext {
    pub fn target_environments(&self) -> BTreeSet<String> {
        self.environments.iter().map(|e| e.name.clone()).collect()
    }
}

/// Per-environment section of an issue.
#[derive(Debug, Clone)]
pub struct EnvironmentNotice {
    pub name: String,
    pub override_secret_key: String,
    pub requires_approval: bool,
    pub state: NoticeState,
    /// Required keys paired with placeholder instructions.
    pub suggested_overrides: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeState {
    Pending,
    OverridesMissing(String),
    KeysMissing(Vec<String>),
    AwaitingApproval,
    Imported,
    Failed(String),
}
