//! Publish export output as an immutable artifact.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::info;

use crate::error::ExportError;
use crate::fs::{LockFile, TreeDigest, copy_tree, digest_tree, remove_path_if_exists};
use crate::template::{TemplateOrigin, TemplateSearch, discover};

use super::{Artifact, ArtifactRegistry, DbScripts};

const HASH_PREFIX_LEN: usize = 12;
const PUBLISH_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// What an export run produced, as handed over by the job runner.
#[derive(Debug, Clone)]
pub struct SourceRef {
    /// Plan the artifact is exported for, e.g. `dev-to-qa`.
    pub plan: String,
    pub package_name: Option<String>,
    /// Directory holding the export output.
    pub output_dir: PathBuf,
    pub run_id: String,
    /// Explicit artifact name; derived from content when absent.
    pub artifact_name: Option<String>,
}

impl SourceRef {
    pub fn new(plan: impl Into<String>, output_dir: PathBuf, run_id: impl Into<String>) -> Self {
        Self {
            plan: plan.into(),
            package_name: None,
            output_dir,
            run_id: run_id.into(),
            artifact_name: None,
        }
    }

    pub fn with_package_name(mut self, package_name: impl Into<String>) -> Self {
        self.package_name = Some(package_name.into());
        self
    }

    pub fn with_artifact_name(mut self, artifact_name: impl Into<String>) -> Self {
        self.artifact_name = Some(artifact_name.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactExporter {
    registry: ArtifactRegistry,
    metadata_file: String,
    template_file: String,
    fallback_template: Option<PathBuf>,
}

impl ArtifactExporter {
    pub fn new(
        registry: ArtifactRegistry,
        metadata_file: impl Into<String>,
        template_file: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            metadata_file: metadata_file.into(),
            template_file: template_file.into(),
            fallback_template: None,
        }
    }

    /// Template used for outputs that carry none.
    pub fn with_fallback_template(mut self, path: PathBuf) -> Self {
        self.fallback_template = Some(path);
        self
    }

    pub fn registry(&self) -> &ArtifactRegistry {
        &self.registry
    }

    /// Validate the export output, extract its template and publish it.
    ///
    /// An output without a template is published with
    /// [`TemplateStatus::Missing`](crate::template::TemplateStatus) and no
    /// required keys. Exporting identical content under an existing name returns the
    /// existing record; different content under that name is refused.
    pub fn export(&self, source: &SourceRef) -> Result<Artifact, ExportError> {
        let output = &source.output_dir;
        let no_output = || ExportError::NoOutput {
            path: output.clone(),
        };

        if !output.is_dir() {
            return Err(no_output());
        }
        let digest = digest_tree(output).map_err(|_| no_output())?;
        if digest.files == 0 {
            return Err(no_output());
        }

        let metadata_src = output.join(&self.metadata_file);
        read_metadata(&metadata_src)?;

        let discovered = discover(
            output,
            TemplateSearch {
                template_file: &self.template_file,
                fallback: self.fallback_template.as_deref(),
            },
        )?;
        let db_scripts = DbScripts::collect(output);

        let name = match &source.artifact_name {
            Some(name) => slug(name),
            None => derive_name(source, &digest),
        };
        let publish_err = |reason: String| ExportError::Publish {
            name: name.clone(),
            reason,
        };

        let _lock = LockFile::acquire(
            &self.registry.root().join(format!(".{name}.lock")),
            &format!("export {}", source.run_id),
            PUBLISH_LOCK_TIMEOUT,
        )
        .map_err(|e| publish_err(e.to_string()))?;

        if let Some(existing) = self
            .registry
            .find(&name)
            .map_err(|e| publish_err(e.to_string()))?
        {
            if existing.content_hash == digest.hash {
                info!(artifact = %name, "artifact already published with identical content");
                return Ok(existing);
            }
            return Err(ExportError::NameReused { name: name.clone() });
        }

        let artifact_dir = self.registry.dir_for(&name);
        self.publish_dir(output, &artifact_dir, &name, &digest)
            .map_err(|e| publish_err(e.to_string()))?;

        let template_path = match &discovered.origin {
            None => None,
            Some(TemplateOrigin::Output(relative)) => Some(artifact_dir.join(relative)),
            Some(_) => Some(
                self.registry
                    .write_template(&name, discovered.template.base_content())
                    .map_err(|e| publish_err(e.to_string()))?,
            ),
        };

        let artifact = Artifact {
            artifact_name: name.clone(),
            metadata_path: artifact_dir.join(&self.metadata_file),
            source_run_id: source.run_id.clone(),
            plan: source.plan.clone(),
            package_name: source.package_name.clone(),
            template_path,
            template_format: discovered.template.format(),
            template_status: discovered.status,
            template_source: discovered.origin.as_ref().map(ToString::to_string),
            artifact_dir,
            required_keys: discovered.template.required_keys().clone(),
            db_scripts,
            content_hash: digest.hash.clone(),
            exported_at: chrono::Utc::now(),
        };
        self.registry
            .record(&artifact)
            .map_err(|e| publish_err(e.to_string()))?;

        info!(
            artifact = %artifact.artifact_name,
            files = digest.files,
            template = %artifact.template_status,
            required_keys = artifact.required_keys.len(),
            "published artifact"
        );
        Ok(artifact)
    }

    fn publish_dir(
        &self,
        output: &Path,
        artifact_dir: &Path,
        name: &str,
        digest: &TreeDigest,
    ) -> anyhow::Result<()> {
        let tmp_dir = self
            .registry
            .root()
            .join(format!(".{}.tmp-{}", name, std::process::id()));
        remove_path_if_exists(&tmp_dir)?;
        copy_tree(output, &tmp_dir)?;

        // The output may have changed while it was copied
        let copied = digest_tree(&tmp_dir)?;
        if copied.hash != digest.hash {
            remove_path_if_exists(&tmp_dir)?;
            anyhow::bail!("export output changed while it was being published");
        }

        // A directory without a record is left over from an interrupted publish
        remove_path_if_exists(artifact_dir)?;
        std::fs::rename(&tmp_dir, artifact_dir)?;
        Ok(())
    }
}

fn read_metadata(path: &Path) -> Result<(), ExportError> {
    let unreadable = |reason: String| ExportError::MetadataUnreadable {
        path: path.to_path_buf(),
        reason,
    };
    let bytes = std::fs::read(path).map_err(|e| unreadable(e.to_string()))?;
    serde_json::from_slice::<serde_json::Value>(&bytes).map_err(|e| unreadable(e.to_string()))?;
    Ok(())
}

fn derive_name(source: &SourceRef, digest: &TreeDigest) -> String {
    let base = source.package_name.as_deref().unwrap_or(&source.plan);
    format!(
        "{}-{}-{}",
        slug(base),
        slug(&source.run_id),
        digest.short(HASH_PREFIX_LEN)
    )
}

/// Lowercase, with anything outside `[a-z0-9._-]` replaced by `-`.
fn slug(input: &str) -> String {
    let slug: String = input
        .trim()
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let slug = slug.trim_matches(|c| c == '-' || c == '.').to_string();
    if slug.is_empty() {
        "artifact".to_string()
    } else {
        slug
    }
}
