//! Configuration layer merging logic
//!
//! Global -> Project. The project layer wins field by field; tables are
//! unioned. A plan is replaced as a whole, since its order is its meaning.

use super::schema::{
    EnvironmentEntry, ImporterConfig, OverridesConfig, RelayConfig, Settings, TrackingConfig,
};

/// Merge configuration layers
///
/// # Arguments
/// * `global` - Global configuration from ~/.config/relay/relay.toml
/// * `project` - Project configuration from ./relay.toml
pub fn merge_configs(global: Option<RelayConfig>, project: Option<RelayConfig>) -> RelayConfig {
    let mut merged = global.unwrap_or_default();

    if let Some(layer) = project {
        merge_relay_config(&mut merged, layer);
    }

    merged
}

fn merge_relay_config(base: &mut RelayConfig, layer: RelayConfig) {
    merge_settings(&mut base.settings, layer.settings);

    for (name, entry) in layer.environments {
        match base.environments.get_mut(&name) {
            Some(existing) => merge_environment(existing, entry),
            None => {
                base.environments.insert(name, entry);
            }
        }
    }

    for (name, plan) in layer.plans {
        base.plans.insert(name, plan);
    }

    merge_overrides(&mut base.overrides, layer.overrides);
    merge_importer(&mut base.importer, layer.importer);
    merge_tracking(&mut base.tracking, layer.tracking);
}

fn merge_settings(base: &mut Settings, overlay: Settings) {
    if overlay.state_dir.is_some() {
        base.state_dir = overlay.state_dir;
    }
    if overlay.metadata_file.is_some() {
        base.metadata_file = overlay.metadata_file;
    }
    if overlay.template_file.is_some() {
        base.template_file = overlay.template_file;
    }
    if overlay.fallback_template.is_some() {
        base.fallback_template = overlay.fallback_template;
    }
    if overlay.rejection_policy.is_some() {
        base.rejection_policy = overlay.rejection_policy;
    }
    if overlay.issue_template.is_some() {
        base.issue_template = overlay.issue_template;
    }
}

fn merge_environment(base: &mut EnvironmentEntry, overlay: EnvironmentEntry) {
    if overlay.requires_approval.is_some() {
        base.requires_approval = overlay.requires_approval;
    }
    if overlay.override_secret_key.is_some() {
        base.override_secret_key = overlay.override_secret_key;
    }
}

fn merge_overrides(base: &mut OverridesConfig, overlay: OverridesConfig) {
    if overlay.source.is_some() {
        base.source = overlay.source;
    }
    if overlay.dir.is_some() {
        base.dir = overlay.dir;
    }
}

fn merge_importer(base: &mut ImporterConfig, overlay: ImporterConfig) {
    if overlay.command.is_some() {
        base.command = overlay.command;
    }
}

fn merge_tracking(base: &mut TrackingConfig, overlay: TrackingConfig) {
    if overlay.backend.is_some() {
        base.backend = overlay.backend;
    }
    if overlay.dir.is_some() {
        base.dir = overlay.dir;
    }
    if overlay.repository.is_some() {
        base.repository = overlay.repository;
    }
    if overlay.api_url.is_some() {
        base.api_url = overlay.api_url;
    }
    if overlay.token_env.is_some() {
        base.token_env = overlay.token_env;
    }
    if overlay.labels.is_some() {
        base.labels = overlay.labels;
    }
}
