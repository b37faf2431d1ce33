//! Reading and writing one relay.toml layer.

use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::fs::write_atomic;
use crate::types::ConfigScope;

use super::paths::config_path_for_scope;
use super::{RelayConfig, parser};

/// One configuration layer on disk. A missing file loads as an empty layer.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    scope: ConfigScope,
    config_path: PathBuf,
    project_root: PathBuf,
}

impl ConfigStore {
    pub fn from_paths(scope: ConfigScope, global_dir: PathBuf, project_root: PathBuf) -> Self {
        Self {
            config_path: config_path_for_scope(scope, &global_dir, &project_root),
            scope,
            project_root,
        }
    }

    /// A project layer read from an explicit file, e.g. `--config ci/relay.toml`.
    pub fn at_path(config_path: PathBuf, project_root: PathBuf) -> Self {
        Self {
            scope: ConfigScope::Project,
            config_path,
            project_root,
        }
    }

    pub fn scope(&self) -> ConfigScope {
        self.scope
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn exists(&self) -> bool {
        self.config_path.is_file()
    }

    pub fn load(&self) -> anyhow::Result<RelayConfig> {
        if !self.exists() {
            return Ok(RelayConfig::new());
        }
        parser::parse_relay_toml(&self.config_path)
    }

    /// Validate the layer, then replace the file atomically.
    pub fn save(&self, config: &RelayConfig) -> anyhow::Result<()> {
        config
            .validate_layer()
            .with_context(|| format!("Refusing to write {}", self.config_path.display()))?;
        let content = parser::to_toml(config).context("Failed to serialize config to TOML")?;
        write_atomic(&self.config_path, content.as_bytes()).with_context(|| {
            format!("Failed to write config file: {}", self.config_path.display())
        })
    }
}
