//! Exported artifacts
//!
//! An artifact is an immutable, published copy of one export run's output,
//! named by content so a name is never reused for a different payload.

pub mod db_scripts;
pub mod exporter;
pub mod registry;

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ExportError;
use crate::template::{IcfTemplate, TemplateFormat, TemplateStatus};

pub use db_scripts::{DbScripts, ScriptEntry};
pub use exporter::{ArtifactExporter, SourceRef};
pub use registry::ArtifactRegistry;

/// Published export record. Never modified after publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_name: String,
    /// Export metadata inside the published directory.
    pub metadata_path: PathBuf,
    pub source_run_id: String,
    pub plan: String,
    #[serde(default)]
    pub package_name: Option<String>,
    pub artifact_dir: PathBuf,
    /// Base template: inside the published directory, or the registry's copy
    /// of a template taken from an archive or the fallback. `None` when the
    /// export had no template.
    #[serde(default)]
    pub template_path: Option<PathBuf>,
    #[serde(default)]
    pub template_format: TemplateFormat,
    #[serde(default)]
    pub template_status: TemplateStatus,
    /// Where the template was found, for people.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_source: Option<String>,
    /// Keys extracted from the template at export time.
    pub required_keys: BTreeSet<String>,
    #[serde(default)]
    pub db_scripts: DbScripts,
    pub content_hash: String,
    pub exported_at: DateTime<Utc>,
}

impl Artifact {
    /// Re-read and re-extract the published template.
    pub fn load_template(&self) -> Result<IcfTemplate, ExportError> {
        let Some(path) = &self.template_path else {
            return Ok(IcfTemplate::empty());
        };
        let raw = std::fs::read_to_string(path).map_err(|e| ExportError::TemplateUnreadable {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        Ok(IcfTemplate::parse(&raw, self.template_format))
    }
}
