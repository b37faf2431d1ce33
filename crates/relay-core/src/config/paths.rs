//! Config path resolution helpers.

use std::path::{Path, PathBuf};

use crate::types::ConfigScope;

pub const CONFIG_FILE_NAME: &str = "relay.toml";

pub fn config_path_for_scope(scope: ConfigScope, global_dir: &Path, project_root: &Path) -> PathBuf {
    match scope {
        ConfigScope::Global => global_dir.join(CONFIG_FILE_NAME),
        ConfigScope::Project => project_root.join(CONFIG_FILE_NAME),
    }
}

/// `~/.config/relay` or the platform equivalent.
pub fn default_global_dir() -> anyhow::Result<PathBuf> {
    Ok(dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
        .join("relay"))
}
