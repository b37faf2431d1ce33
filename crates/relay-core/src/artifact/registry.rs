//! Published artifact storage under `<state_dir>/artifacts`.

use std::path::{Component, Path, PathBuf};

use anyhow::Context;

use crate::error::ExportError;
use crate::fs::{digest_tree, read_json, write_atomic, write_json_atomic};

use super::Artifact;

#[derive(Debug, Clone)]
pub struct ArtifactRegistry {
    root: PathBuf,
}

impl ArtifactRegistry {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the published copy of `name`.
    pub fn dir_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.json"))
    }

    /// Load a published record, if any.
    pub fn find(&self, name: &str) -> anyhow::Result<Option<Artifact>> {
        check_name(name)?;
        read_json(&self.record_path(name))
            .with_context(|| format!("Failed to load artifact record '{name}'"))
    }

    /// Load a published record, failing if it was never published.
    pub fn get(&self, name: &str) -> Result<Artifact, crate::error::PromotionError> {
        check_name(name)?;
        self.find(name)?.ok_or_else(|| {
            ExportError::UnknownArtifact {
                name: name.to_string(),
            }
            .into()
        })
    }

    /// Copy of a template that did not come from a plain file in the output.
    fn template_copy_path(&self, name: &str) -> PathBuf {
        self.root.join(".templates").join(name)
    }

    pub(crate) fn write_template(&self, name: &str, content: &str) -> anyhow::Result<PathBuf> {
        let path = self.template_copy_path(name);
        write_atomic(&path, content.as_bytes())?;
        Ok(path)
    }

    /// Persist the record of an artifact whose directory is already in place.
    pub(crate) fn record(&self, artifact: &Artifact) -> anyhow::Result<()> {
        write_json_atomic(&self.record_path(&artifact.artifact_name), artifact)
    }

    /// All published artifacts, oldest first.
    pub fn list(&self) -> anyhow::Result<Vec<Artifact>> {
        let mut artifacts = Vec::new();
        if !self.root.exists() {
            return Ok(artifacts);
        }
        for entry in std::fs::read_dir(&self.root)
            .with_context(|| format!("Failed to read artifact directory: {}", self.root.display()))?
        {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json")
                && let Some(artifact) = read_json::<Artifact>(&path)?
            {
                artifacts.push(artifact);
            }
        }
        artifacts.sort_by_key(|a| a.exported_at);
        Ok(artifacts)
    }

    /// Check that the published directory still matches its recorded hash.
    pub fn verify(&self, artifact: &Artifact) -> Result<(), ExportError> {
        let mismatch = || ExportError::ContentMismatch {
            name: artifact.artifact_name.clone(),
        };
        let digest = digest_tree(&artifact.artifact_dir).map_err(|_| mismatch())?;
        if digest.hash != artifact.content_hash {
            return Err(mismatch());
        }
        Ok(())
    }
}

/// Artifact names are single path components; anything else could escape the registry.
fn check_name(name: &str) -> Result<(), ExportError> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !name.starts_with('.') => Ok(()),
        _ => Err(ExportError::InvalidName {
            name: name.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn names_outside_the_registry_are_refused() {
        let temp = TempDir::new().unwrap();
        let registry = ArtifactRegistry::new(temp.path().join("artifacts"));
        std::fs::write(temp.path().join("x.json"), "{}").unwrap();

        for name in ["../x", "a/b", "/etc/passwd", "..", ".hidden", ""] {
            let err = registry.get(name).unwrap_err();
            assert!(
                matches!(
                    err,
                    crate::error::PromotionError::Export(ExportError::InvalidName { .. })
                ),
                "{name}: {err}"
            );
            assert!(registry.find(name).is_err(), "{name}");
        }
    }

    #[test]
    fn unpublished_name_is_unknown() {
        let temp = TempDir::new().unwrap();
        let registry = ArtifactRegistry::new(temp.path().join("artifacts"));

        assert!(registry.find("nightly-042").unwrap().is_none());
        assert!(matches!(
            registry.get("nightly-042").unwrap_err(),
            crate::error::PromotionError::Export(ExportError::UnknownArtifact { .. })
        ));
    }
}
