//! Error taxonomy for the promotion pipeline.
//!
//! Each stage failure has its own type so callers can match on what went
//! wrong; `PromotionError` wraps all of them for the controller surface.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// No artifact could be produced or the published one is unusable. Fatal to the run.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("export produced no output in {}", .path.display())]
    NoOutput { path: PathBuf },

    #[error("export metadata is unreadable at {}: {reason}", .path.display())]
    MetadataUnreadable { path: PathBuf, reason: String },

    #[error("integration configuration template is unreadable at {}: {reason}", .path.display())]
    TemplateUnreadable { path: PathBuf, reason: String },

    #[error("artifact name '{name}' is already published with different content")]
    NameReused { name: String },

    #[error("artifact '{name}' has not been published")]
    UnknownArtifact { name: String },

    #[error("'{name}' is not a valid artifact name")]
    InvalidName { name: String },

    #[error("published artifact '{name}' no longer matches its recorded content hash")]
    ContentMismatch { name: String },

    #[error("failed to publish artifact '{name}': {reason}")]
    Publish { name: String, reason: String },
}

/// Why an override set could not be produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupFailure {
    Missing,
    Unreadable(String),
    Malformed(String),
}

impl fmt::Display for LookupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LookupFailure::Missing => write!(f, "is not set"),
            LookupFailure::Unreadable(reason) => write!(f, "could not be read: {reason}"),
            LookupFailure::Malformed(reason) => {
                write!(f, "is not a JSON object of string values: {reason}")
            }
        }
    }
}

/// Override set for an environment is unavailable. Fatal to the chain.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("override set for environment '{environment}' (secret '{secret_key}') {failure}")]
pub struct NotFoundError {
    pub environment: String,
    pub secret_key: String,
    pub failure: LookupFailure,
}

/// Required template keys have no override value. Lists every gap, sorted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error(
    "environment '{environment}' is missing required override keys: {}",
    .missing_keys.join(", ")
)]
pub struct MergeError {
    pub environment: String,
    pub missing_keys: Vec<String>,
}

/// The import target rejected the configuration. Never retried automatically.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("import of '{artifact_name}' into '{environment}' failed: {reason}")]
pub struct ImportError {
    pub artifact_name: String,
    pub environment: String,
    pub reason: String,
}

/// Another promotion holds the same artifact/environment pair or request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error(
    "promotion of '{artifact_name}' is already in flight for {scope}{}; retry later",
    .holder.as_ref().map(|h| format!(" (held by {h})")).unwrap_or_default()
)]
pub struct ConcurrentPromotionError {
    pub artifact_name: String,
    /// What is held, e.g. `environment 'qa'` or `request 'r-1'`.
    pub scope: String,
    /// Lock holder as recorded on disk, when readable.
    pub holder: Option<String>,
}

/// The issue system could not be reached or refused the change.
#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("issue backend unavailable: {0}")]
    Unavailable(String),

    #[error("issue backend rejected the request: {0}")]
    Rejected(String),

    #[error("issue '{0}' is not tracked")]
    UnknownIssue(String),

    #[error("issue body template does not reference field {{{0}}}")]
    IncompleteTemplate(String),

    #[error("tracking state error: {0}")]
    State(String),
}

impl TrackingError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TrackingError::Unavailable(_) | TrackingError::State(_))
    }
}

/// Umbrella error for controller operations.
#[derive(Debug, Error)]
pub enum PromotionError {
    #[error(transparent)]
    Export(#[from] ExportError),

    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Import(#[from] ImportError),

    #[error(transparent)]
    Concurrent(#[from] ConcurrentPromotionError),

    #[error(transparent)]
    Tracking(#[from] TrackingError),

    #[error("invalid promotion state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PromotionError {
    /// Whether the caller may simply back off and run the same command again.
    pub fn is_retryable(&self) -> bool {
        match self {
            PromotionError::Concurrent(_) => true,
            PromotionError::Tracking(err) => err.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_error_lists_every_key() {
        let err = MergeError {
            environment: "prod".to_string(),
            missing_keys: vec!["API_KEY".to_string(), "DB_URL".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "environment 'prod' is missing required override keys: API_KEY, DB_URL"
        );
    }

    #[test]
    fn not_found_describes_failure() {
        let err = NotFoundError {
            environment: "qa".to_string(),
            secret_key: "QA_OVERRIDES".to_string(),
            failure: LookupFailure::Missing,
        };
        assert_eq!(
            err.to_string(),
            "override set for environment 'qa' (secret 'QA_OVERRIDES') is not set"
        );
    }

    #[test]
    fn retryable_errors() {
        let concurrent = PromotionError::from(ConcurrentPromotionError {
            artifact_name: "a".to_string(),
            scope: "environment 'qa'".to_string(),
            holder: Some("import a -> qa (pid 7, since 2026-01-01T00:00:00+00:00)".to_string()),
        });
        assert!(concurrent.is_retryable());
        assert!(concurrent.to_string().contains("held by import a -> qa (pid 7"));

        let tracking = PromotionError::from(TrackingError::Unavailable("down".to_string()));
        assert!(tracking.is_retryable());

        let rejected = PromotionError::from(TrackingError::Rejected("403".to_string()));
        assert!(!rejected.is_retryable());
    }

    #[test]
    fn incomplete_template_names_field() {
        let err = TrackingError::IncompleteTemplate("RUN_URL".to_string());
        assert_eq!(
            err.to_string(),
            "issue body template does not reference field {RUN_URL}"
        );
    }
}
