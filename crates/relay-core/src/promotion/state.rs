//! Request and stage state.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::Artifact;
use crate::error::PromotionError;
use crate::types::{ChainKey, Environment, Plan};

use super::approval::ApprovalDecision;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionStatus {
    Pending,
    AwaitingOverrides,
    AwaitingApproval,
    Merging,
    Importing,
    Succeeded,
    Failed,
}

impl PromotionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PromotionStatus::Succeeded | PromotionStatus::Failed)
    }

    /// Whether an operator may abandon a stage in this state.
    pub fn is_abandonable(self) -> bool {
        matches!(
            self,
            PromotionStatus::Pending
                | PromotionStatus::AwaitingOverrides
                | PromotionStatus::AwaitingApproval
        )
    }

    pub fn can_transition_to(self, next: PromotionStatus) -> bool {
        use PromotionStatus::*;
        matches!(
            (self, next),
            (Pending, AwaitingOverrides)
                // already imported by an earlier chain
                | (Pending, Succeeded)
                | (Pending, Failed)
                | (AwaitingOverrides, AwaitingApproval)
                | (AwaitingOverrides, Merging)
                | (AwaitingOverrides, Failed)
                | (AwaitingApproval, Merging)
                | (AwaitingApproval, Failed)
                // approval invalidated before the import started
                | (Merging, AwaitingApproval)
                | (Merging, Importing)
                | (Merging, Failed)
                | (Importing, Succeeded)
                | (Importing, Failed)
                // re-entry after a rejection
                | (Failed, AwaitingApproval)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PromotionStatus::Pending => "pending",
            PromotionStatus::AwaitingOverrides => "awaiting_overrides",
            PromotionStatus::AwaitingApproval => "awaiting_approval",
            PromotionStatus::Merging => "merging",
            PromotionStatus::Importing => "importing",
            PromotionStatus::Succeeded => "succeeded",
            PromotionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for PromotionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a stage failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageFailure {
    MissingOverrides { reason: String },
    MissingKeys { keys: Vec<String> },
    Rejected { reviewer: String, reason: Option<String> },
    ImportFailed { reason: String },
    Abandoned { reason: String },
    ArtifactUnusable { reason: String },
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageFailure::MissingOverrides { reason } => write!(f, "override set unavailable: {reason}"),
            StageFailure::MissingKeys { keys } => {
                write!(f, "missing override keys: {}", keys.join(", "))
            }
            StageFailure::Rejected { reviewer, reason } => match reason {
                Some(reason) => write!(f, "rejected by {reviewer}: {reason}"),
                None => write!(f, "rejected by {reviewer}"),
            },
            StageFailure::ImportFailed { reason } => write!(f, "import failed: {reason}"),
            StageFailure::Abandoned { reason } => write!(f, "abandoned: {reason}"),
            StageFailure::ArtifactUnusable { reason } => write!(f, "artifact unusable: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: PromotionStatus,
    pub to: PromotionStatus,
    pub at: DateTime<Utc>,
}

/// One environment's progress within a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub environment: String,
    pub status: PromotionStatus,
    /// Fingerprint of the override set last fetched for this stage.
    #[serde(default)]
    pub override_fingerprint: Option<String>,
    #[serde(default)]
    pub approval: Option<ApprovalDecision>,
    #[serde(default)]
    pub failure: Option<StageFailure>,
    /// Fingerprint of the resolved configuration handed to the importer.
    #[serde(default)]
    pub config_fingerprint: Option<String>,
    #[serde(default)]
    pub receipt: Option<String>,
    /// Satisfied by an earlier chain's import instead of importing again.
    #[serde(default)]
    pub skipped: bool,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub history: Vec<Transition>,
}

impl StageRecord {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            status: PromotionStatus::Pending,
            override_fingerprint: None,
            approval: None,
            failure: None,
            config_fingerprint: None,
            receipt: None,
            skipped: false,
            updated_at: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Move to `next`, rejecting transitions the state machine forbids.
    pub fn transition(&mut self, next: PromotionStatus) -> Result<(), PromotionError> {
        if !self.status.can_transition_to(next) {
            return Err(PromotionError::InvalidState(format!(
                "stage '{}' cannot move from {} to {}",
                self.environment, self.status, next
            )));
        }
        let now = Utc::now();
        self.history.push(Transition {
            from: self.status,
            to: next,
            at: now,
        });
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Like [`StageRecord::transition`], but staying put is allowed.
    pub fn enter(&mut self, next: PromotionStatus) -> Result<(), PromotionError> {
        if self.status == next {
            return Ok(());
        }
        self.transition(next)
    }

    pub fn fail(&mut self, failure: StageFailure) -> Result<(), PromotionError> {
        self.transition(PromotionStatus::Failed)?;
        self.failure = Some(failure);
        Ok(())
    }
}

/// One promotion chain run, persisted as `requests/<id>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionRequest {
    pub id: String,
    pub chain: ChainKey,
    /// Increments each time the chain is started afresh.
    pub generation: u32,
    /// Plan snapshot taken when the request was created.
    pub environments: Vec<Environment>,
    pub artifact_name: String,
    pub content_hash: String,
    pub current_index: usize,
    pub status: PromotionStatus,
    pub stages: Vec<StageRecord>,
    #[serde(default)]
    pub force: bool,
    pub run_url: String,
    #[serde(default)]
    pub issue_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PromotionRequest {
    pub fn new(plan: &Plan, artifact: &Artifact, generation: u32, force: bool, run_url: &str) -> Self {
        let now = Utc::now();
        Self {
            id: format!("{}.{}.{}", artifact.artifact_name, plan.name, generation),
            chain: ChainKey::new(&plan.name, &artifact.artifact_name),
            generation,
            environments: plan.environments.clone(),
            artifact_name: artifact.artifact_name.clone(),
            content_hash: artifact.content_hash.clone(),
            current_index: 0,
            status: PromotionStatus::Pending,
            stages: plan
                .environments
                .iter()
                .map(|env| StageRecord::new(&env.name))
                .collect(),
            force,
            run_url: run_url.to_string(),
            issue_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn plan_name(&self) -> &str {
        &self.chain.plan
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn current_stage(&self) -> Option<&StageRecord> {
        self.stages.get(self.current_index)
    }

    pub fn current_stage_mut(&mut self) -> Option<&mut StageRecord> {
        self.stages.get_mut(self.current_index)
    }

    pub fn current_environment(&self) -> Option<&Environment> {
        self.environments.get(self.current_index)
    }

    /// Recompute the request status from its stages.
    pub fn sync_status(&mut self) {
        self.status = if self
            .stages
            .iter()
            .all(|stage| stage.status == PromotionStatus::Succeeded)
        {
            PromotionStatus::Succeeded
        } else {
            self.current_stage()
                .map(|stage| stage.status)
                .unwrap_or(PromotionStatus::Failed)
        };
        self.updated_at = Utc::now();
    }
}
