//! Approval signals and the rejection policy.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approved,
    Rejected,
}

/// A reviewer's signal for one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub decision: Decision,
    pub reviewer: String,
    #[serde(default)]
    pub reason: Option<String>,
    /// Override data the reviewer was shown. An approval only holds while
    /// the stage still sees the same fingerprint.
    #[serde(default)]
    pub override_fingerprint: Option<String>,
    pub decided_at: DateTime<Utc>,
}

impl ApprovalDecision {
    pub fn approved(reviewer: impl Into<String>, override_fingerprint: Option<String>) -> Self {
        Self {
            decision: Decision::Approved,
            reviewer: reviewer.into(),
            reason: None,
            override_fingerprint,
            decided_at: Utc::now(),
        }
    }

    pub fn rejected(
        reviewer: impl Into<String>,
        reason: Option<String>,
        override_fingerprint: Option<String>,
    ) -> Self {
        Self {
            decision: Decision::Rejected,
            reviewer: reviewer.into(),
            reason,
            override_fingerprint,
            decided_at: Utc::now(),
        }
    }

    /// Whether this is an approval of exactly `fingerprint`.
    pub fn approves(&self, fingerprint: &str) -> bool {
        self.decision == Decision::Approved
            && self.override_fingerprint.as_deref() == Some(fingerprint)
    }
}

/// What a rejection means for the chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectionPolicy {
    /// Rejection ends the chain; promote again to start a new one.
    #[default]
    FreshChain,
    /// `retry` returns the rejected stage to awaiting approval.
    AllowReentry,
}

impl fmt::Display for RejectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionPolicy::FreshChain => write!(f, "fresh-chain"),
            RejectionPolicy::AllowReentry => write!(f, "allow-reentry"),
        }
    }
}

impl FromStr for RejectionPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fresh-chain" => Ok(RejectionPolicy::FreshChain),
            "allow-reentry" => Ok(RejectionPolicy::AllowReentry),
            other => anyhow::bail!(
                "Unknown rejection policy '{}'. Use 'fresh-chain' or 'allow-reentry'",
                other
            ),
        }
    }
}
