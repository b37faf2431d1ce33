//! Configuration schema for relay.toml
//!
//! Two layers share this schema:
//! - Global: ~/.config/relay/relay.toml (operator-wide defaults)
//! - Project: ./relay.toml
//!
//! Every field is optional at the layer level so that layers can be merged
//! field by field; [`RelayConfig::validate`] checks the merged result.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::promotion::RejectionPolicy;
use crate::types::{Environment, Plan};

pub const DEFAULT_STATE_DIR: &str = ".relay";
pub const DEFAULT_METADATA_FILE: &str = "metadata.json";
pub const DEFAULT_TEMPLATE_FILE: &str = "icf.json";
pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
pub const DEFAULT_TOKEN_ENV: &str = "GITHUB_TOKEN";

/// Root configuration structure for relay.toml
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub settings: Settings,

    /// Deployment targets by name
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentEntry>,

    /// Ordered environment lists by name
    #[serde(default)]
    pub plans: BTreeMap<String, PlanEntry>,

    #[serde(default)]
    pub overrides: OverridesConfig,

    #[serde(default)]
    pub importer: ImporterConfig,

    #[serde(default)]
    pub tracking: TrackingConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Root for artifacts, requests, ledgers and locks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,

    /// Export metadata file name inside an export output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_file: Option<String>,

    /// Base template file name inside an export output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_file: Option<String>,

    /// Template used when an export output carries none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_template: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_policy: Option<RejectionPolicy>,

    /// Custom tracking issue body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_template: Option<PathBuf>,
}

impl Settings {
    pub fn metadata_file(&self) -> &str {
        self.metadata_file.as_deref().unwrap_or(DEFAULT_METADATA_FILE)
    }

    pub fn template_file(&self) -> &str {
        self.template_file.as_deref().unwrap_or(DEFAULT_TEMPLATE_FILE)
    }

    pub fn rejection_policy(&self) -> RejectionPolicy {
        self.rejection_policy.unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_approval: Option<bool>,

    /// Name of the secret holding this environment's override set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_secret_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    #[serde(default)]
    pub environments: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrideSource {
    /// `<dir>/<override_secret_key>.json`
    #[default]
    File,
    /// Environment variable named by `override_secret_key`
    Env,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverridesConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<OverrideSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImporterConfig {
    /// Program and arguments run once per import
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingBackend {
    #[default]
    File,
    Github,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackingConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<TrackingBackend>,

    /// File backend directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,

    /// GitHub `owner/repo`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    /// Environment variable holding the API token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
}

impl TrackingConfig {
    pub fn backend(&self) -> TrackingBackend {
        self.backend.unwrap_or_default()
    }

    pub fn api_url(&self) -> &str {
        self.api_url.as_deref().unwrap_or(DEFAULT_GITHUB_API_URL)
    }

    pub fn token_env(&self) -> &str {
        self.token_env.as_deref().unwrap_or(DEFAULT_TOKEN_ENV)
    }

    pub fn labels(&self) -> Vec<String> {
        self.labels.clone().unwrap_or_default()
    }
}

impl RelayConfig {
    /// Create a new empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration written by `relay init`.
    pub fn starter() -> Self {
        let mut config = Self::new();
        config.environments.insert(
            "qa".to_string(),
            EnvironmentEntry {
                requires_approval: Some(false),
                override_secret_key: Some("QA_OVERRIDES".to_string()),
            },
        );
        config.environments.insert(
            "prod".to_string(),
            EnvironmentEntry {
                requires_approval: Some(true),
                override_secret_key: Some("PROD_OVERRIDES".to_string()),
            },
        );
        config.plans.insert(
            "qa-to-prod".to_string(),
            PlanEntry {
                environments: vec!["qa".to_string(), "prod".to_string()],
            },
        );
        config
    }

    /// Checks that hold for any single layer.
    pub fn validate_layer(&self) -> anyhow::Result<()> {
        for (name, entry) in &self.environments {
            validate_name("environment", name)?;
            if let Some(key) = &entry.override_secret_key
                && key.trim().is_empty()
            {
                anyhow::bail!("Environment '{}' has an empty override_secret_key", name);
            }
        }

        for (name, plan) in &self.plans {
            validate_name("plan", name)?;
            let mut seen = HashSet::new();
            for env in &plan.environments {
                if !seen.insert(env.as_str()) {
                    anyhow::bail!("Plan '{}' lists environment '{}' more than once", name, env);
                }
            }
        }

        if let Some(command) = &self.importer.command
            && command.first().is_none_or(|program| program.trim().is_empty())
        {
            anyhow::bail!("[importer] command must name a program");
        }

        if let Some(api_url) = &self.tracking.api_url {
            Url::parse(api_url)
                .with_context(|| format!("Invalid [tracking] api_url: {}", api_url))?;
        }

        if let Some(repository) = &self.tracking.repository {
            let parts: Vec<&str> = repository.split('/').collect();
            if parts.len() != 2 || parts.iter().any(|p| p.is_empty()) {
                anyhow::bail!(
                    "Invalid [tracking] repository '{}': expected owner/repo",
                    repository
                );
            }
        }

        Ok(())
    }

    /// Validate the merged configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.validate_layer()?;

        for (name, entry) in &self.environments {
            if entry.override_secret_key.is_none() {
                anyhow::bail!("Environment '{}' needs an override_secret_key", name);
            }
        }

        for (name, plan) in &self.plans {
            if plan.environments.is_empty() {
                anyhow::bail!("Plan '{}' has no environments", name);
            }
            for env in &plan.environments {
                if !self.environments.contains_key(env) {
                    anyhow::bail!("Plan '{}' references unknown environment '{}'", name, env);
                }
            }
        }

        if self.tracking.backend() == TrackingBackend::Github && self.tracking.repository.is_none()
        {
            anyhow::bail!("[tracking] backend = \"github\" requires repository");
        }

        Ok(())
    }

    pub fn environment(&self, name: &str) -> anyhow::Result<Environment> {
        let entry = self
            .environments
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown environment '{}'", name))?;
        let key = entry
            .override_secret_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Environment '{}' needs an override_secret_key", name))?;
        Ok(Environment::new(
            name,
            entry.requires_approval.unwrap_or(false),
            key,
        ))
    }

    pub fn resolve_plan(&self, name: &str) -> anyhow::Result<Plan> {
        let entry = self.plans.get(name).ok_or_else(|| {
            anyhow::anyhow!(
                "Unknown plan '{}'. Defined plans: {}",
                name,
                self.plans.keys().cloned().collect::<Vec<_>>().join(", ")
            )
        })?;
        let environments = entry
            .environments
            .iter()
            .map(|env| self.environment(env))
            .collect::<anyhow::Result<Vec<_>>>()
            .with_context(|| format!("Invalid plan '{}'", name))?;
        Ok(Plan::new(name, environments))
    }

    pub fn plans(&self) -> anyhow::Result<BTreeMap<String, Plan>> {
        self.plans
            .keys()
            .map(|name| Ok((name.clone(), self.resolve_plan(name)?)))
            .collect()
    }

    /// State directory, relative paths taken from `project_root`.
    pub fn state_dir(&self, project_root: &Path) -> PathBuf {
        let dir = self
            .settings
            .state_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR));
        resolve_path(project_root, &dir)
    }
}

pub fn resolve_path(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

fn validate_name(kind: &str, name: &str) -> anyhow::Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        anyhow::bail!(
            "Invalid {} name '{}': use letters, digits, '-' and '_'",
            kind,
            name
        );
    }
    Ok(())
}
