//! Relay Core Library
//!
//! Promotes an exported application artifact through an ordered plan of
//! deployment environments, merging per-environment override sets into the
//! artifact's integration-configuration template, gating on approval, and
//! keeping one canonical tracking issue per promotion chain.

pub mod artifact;
pub mod config;
pub mod context;
pub mod error;
pub mod fs;
pub mod overrides;
pub mod promotion;
pub mod template;
pub mod tracking;
pub mod types;

/// Re-exports of commonly used types
pub mod prelude {
    // Configuration
    pub use crate::config::{ConfigStore, RelayConfig};
    pub use crate::context::AppContext;

    // Errors
    pub use crate::error::{
        ConcurrentPromotionError, ExportError, ImportError, MergeError, NotFoundError,
        PromotionError, TrackingError,
    };

    // Domain
    pub use crate::artifact::{Artifact, ArtifactExporter, ArtifactRegistry, SourceRef};
    pub use crate::overrides::{OverrideSet, OverrideStore};
    pub use crate::promotion::{
        Importer, PromotionController, PromotionReport, PromotionRequest, PromotionStatus,
        RejectionPolicy,
    };
    pub use crate::template::{IcfTemplate, ResolvedConfig, TemplateStatus};
    pub use crate::tracking::{IssueContext, IssueTracker, TrackingIssue};
    pub use crate::types::{ChainKey, ConfigScope, Environment, Plan};
}
