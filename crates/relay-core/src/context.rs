//! Application context for unified dependency injection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use crate::artifact::{ArtifactExporter, ArtifactRegistry};
use crate::config::schema::resolve_path;
use crate::config::{self, ConfigStore, OverrideSource, RelayConfig, TrackingBackend};
use crate::overrides::{EnvOverrideStore, FileOverrideStore, OverrideStore};
use crate::promotion::{
    CommandImporter, ControllerParts, ImportLedger, Importer, PromotionController, PromotionLocks,
    RequestStore,
};
use crate::tracking::{
    FileIssueBackend, GithubIssueBackend, IssueBackend, IssueLedger, IssueTracker,
};
use crate::types::ConfigScope;

/// Unified application context for dependency injection.
///
/// Provides access to configuration paths and builds the services each
/// command needs. The CLI creates this once per invocation.
#[derive(Debug, Clone)]
pub struct AppContext {
    project_root: PathBuf,
    global_config_dir: PathBuf,
    config_path: Option<PathBuf>,
    run_url: String,
}

impl AppContext {
    /// Create a new context rooted at `project_root`.
    pub fn new(project_root: PathBuf, run_url: impl Into<String>) -> Self {
        let global_config_dir = config::default_global_dir()
            .unwrap_or_else(|_| project_root.join(".config").join("relay"));

        Self {
            project_root,
            global_config_dir,
            config_path: None,
            run_url: run_url.into(),
        }
    }

    /// Create context with custom global config directory (for testing).
    pub fn with_global_config_dir(
        project_root: PathBuf,
        global_config_dir: PathBuf,
        run_url: impl Into<String>,
    ) -> Self {
        Self {
            project_root,
            global_config_dir,
            config_path: None,
            run_url: run_url.into(),
        }
    }

    /// Read the project layer from `path` instead of `./relay.toml`.
    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn global_config_dir(&self) -> &Path {
        &self.global_config_dir
    }

    pub fn run_url(&self) -> &str {
        &self.run_url
    }

    /// Get a ConfigStore for the given scope.
    pub fn config_store(&self, scope: ConfigScope) -> ConfigStore {
        match (scope, &self.config_path) {
            (ConfigScope::Project, Some(path)) => {
                ConfigStore::at_path(path.clone(), self.project_root.clone())
            }
            _ => ConfigStore::from_paths(
                scope,
                self.global_config_dir.clone(),
                self.project_root.clone(),
            ),
        }
    }

    /// Load and validate the merged configuration.
    pub fn load_config(&self) -> anyhow::Result<RelayConfig> {
        config::load_layered(
            &self.config_store(ConfigScope::Global),
            &self.config_store(ConfigScope::Project),
        )
    }

    pub fn state_dir(&self, config: &RelayConfig) -> PathBuf {
        config.state_dir(&self.project_root)
    }

    pub fn artifact_registry(&self, config: &RelayConfig) -> ArtifactRegistry {
        ArtifactRegistry::new(self.state_dir(config).join("artifacts"))
    }

    pub fn exporter(&self, config: &RelayConfig) -> ArtifactExporter {
        let exporter = ArtifactExporter::new(
            self.artifact_registry(config),
            config.settings.metadata_file(),
            config.settings.template_file(),
        );
        match &config.settings.fallback_template {
            Some(path) => exporter.with_fallback_template(resolve_path(&self.project_root, path)),
            None => exporter,
        }
    }

    pub fn override_store(&self, config: &RelayConfig) -> Arc<dyn OverrideStore> {
        match config.overrides.source.unwrap_or_default() {
            OverrideSource::File => {
                let dir = config
                    .overrides
                    .dir
                    .as_deref()
                    .map(|dir| resolve_path(&self.project_root, dir))
                    .unwrap_or_else(|| self.state_dir(config).join("overrides"));
                Arc::new(FileOverrideStore::new(dir))
            }
            OverrideSource::Env => Arc::new(EnvOverrideStore::new()),
        }
    }

    pub fn importer(&self, config: &RelayConfig) -> anyhow::Result<Arc<dyn Importer>> {
        let command = config.importer.command.clone().ok_or_else(|| {
            anyhow::anyhow!("No importer configured. Set [importer] command in relay.toml")
        })?;
        Ok(Arc::new(CommandImporter::new(
            command,
            self.project_root.clone(),
        )?))
    }

    pub fn issue_backend(&self, config: &RelayConfig) -> anyhow::Result<Arc<dyn IssueBackend>> {
        let tracking = &config.tracking;
        match tracking.backend() {
            TrackingBackend::File => {
                let dir = tracking
                    .dir
                    .as_deref()
                    .map(|dir| resolve_path(&self.project_root, dir))
                    .unwrap_or_else(|| self.state_dir(config).join("tracker"));
                Ok(Arc::new(FileIssueBackend::new(dir)))
            }
            TrackingBackend::Github => {
                let repository = tracking.repository.as_deref().ok_or_else(|| {
                    anyhow::anyhow!("[tracking] backend = \"github\" requires repository")
                })?;
                let token = std::env::var(tracking.token_env())
                    .ok()
                    .filter(|token| !token.is_empty());
                if token.is_none() {
                    tracing::warn!(
                        token_env = tracking.token_env(),
                        "No GitHub token set; issue requests will be unauthenticated"
                    );
                }
                Ok(Arc::new(GithubIssueBackend::new(
                    tracking.api_url(),
                    repository,
                    token,
                )?))
            }
        }
    }

    pub fn issue_tracker(&self, config: &RelayConfig) -> anyhow::Result<IssueTracker> {
        let state_dir = self.state_dir(config);
        let ledger = IssueLedger::new(state_dir.join("issues"), state_dir.join("locks"));
        let mut tracker = IssueTracker::new(self.issue_backend(config)?, ledger)
            .with_labels(config.tracking.labels());

        if let Some(path) = &config.settings.issue_template {
            let path = resolve_path(&self.project_root, path);
            let template = std::fs::read_to_string(&path).with_context(|| {
                format!("Failed to read issue template: {}", path.display())
            })?;
            tracker = tracker
                .with_body_template(template)
                .with_context(|| format!("Invalid issue template: {}", path.display()))?;
        }

        Ok(tracker)
    }

    /// Build a controller with the configured importer.
    pub fn controller(&self, config: &RelayConfig) -> anyhow::Result<PromotionController> {
        self.controller_with_importer(config, self.importer(config)?)
    }

    /// Build a controller around a caller-supplied importer.
    pub fn controller_with_importer(
        &self,
        config: &RelayConfig,
        importer: Arc<dyn Importer>,
    ) -> anyhow::Result<PromotionController> {
        let state_dir = self.state_dir(config);
        Ok(PromotionController::new(ControllerParts {
            plans: config.plans()?,
            registry: self.artifact_registry(config),
            overrides: self.override_store(config),
            importer,
            tracker: self.issue_tracker(config)?,
            requests: RequestStore::new(state_dir.join("requests")),
            imports: ImportLedger::new(state_dir.join("imports")),
            locks: PromotionLocks::new(state_dir.join("locks")),
            policy: config.settings.rejection_policy(),
            run_url: self.run_url.clone(),
        }))
    }
}

/// Link to the current pipeline run.
///
/// An explicit URL wins; then the GitHub Actions variables; otherwise a
/// `local://` URL naming this process.
pub fn detect_run_url(explicit: Option<&str>) -> String {
    run_url_from(explicit, |key| std::env::var(key).ok())
}

fn run_url_from(explicit: Option<&str>, lookup: impl Fn(&str) -> Option<String>) -> String {
    if let Some(url) = explicit.filter(|url| !url.trim().is_empty()) {
        return url.to_string();
    }

    let var = |key: &str| lookup(key).filter(|value| !value.is_empty());
    if let (Some(server), Some(repository), Some(run_id)) = (
        var("GITHUB_SERVER_URL"),
        var("GITHUB_REPOSITORY"),
        var("GITHUB_RUN_ID"),
    ) {
        return format!(
            "{}/{}/actions/runs/{}",
            server.trim_end_matches('/'),
            repository,
            run_id
        );
    }

    format!(
        "local://{}-{}",
        std::process::id(),
        chrono::Utc::now().format("%Y%m%dT%H%M%SZ")
    )
}
