//! Configuration for relay
//!
//! Supports two configuration scopes:
//! - Global: operator-wide defaults
//! - Project: the repository's relay.toml
//!
//! Relative paths in the merged config are resolved against the project root.

pub mod merge;
pub mod parser;
pub mod paths;
pub mod schema;
pub mod store;

pub use merge::merge_configs;
pub use parser::{parse_relay_toml, parse_relay_toml_str, to_toml};
pub use paths::{config_path_for_scope, default_global_dir};
pub use schema::{
    EnvironmentEntry, ImporterConfig, OverrideSource, OverridesConfig, PlanEntry, RelayConfig,
    Settings, TrackingBackend, TrackingConfig,
};
pub use store::ConfigStore;

use anyhow::Context;

/// Load both layers, merge and validate.
pub fn load_layered(global: &ConfigStore, project: &ConfigStore) -> anyhow::Result<RelayConfig> {
    let global_config = if global.exists() {
        Some(global.load()?)
    } else {
        None
    };
    let project_config = if project.exists() {
        Some(project.load()?)
    } else {
        None
    };

    let merged = merge_configs(global_config, project_config);
    merged.validate().with_context(|| {
        format!(
            "Invalid configuration (from {} and {})",
            global.config_path().display(),
            project.config_path().display()
        )
    })?;
    Ok(merged)
}
