//! Database scripts shipped with an export.
//!
//! Nothing here is required: an export without scripts or metadata files
//! yields an empty [`DbScripts`], and unreadable metadata is skipped.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

const SCRIPT_EXTENSIONS: &[&str] = &["sql", "ddl"];
const EXPORT_RESPONSE_FILE: &str = "export-response.json";
const EXPORT_MANIFEST_FILE: &str = "export-manifest.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbScripts {
    /// `.sql` and `.ddl` files, relative to the artifact directory.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scripts: Vec<PathBuf>,
    /// Data source named in the export response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source: Option<String>,
    /// Script entries listed in the export manifest, in manifest order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manifest: Vec<ScriptEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_name: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<Value>,
}

impl ScriptEntry {
    fn is_empty(&self) -> bool {
        self.stored_name.is_none() && self.file_name.is_none() && self.order_id.is_none()
    }
}

impl DbScripts {
    /// Scan an export output.
    pub fn collect(output: &Path) -> Self {
        let mut scripts = Vec::new();
        collect_scripts(output, output, &mut scripts);
        scripts.sort();

        Self {
            scripts,
            data_source: data_source(&output.join(EXPORT_RESPONSE_FILE)),
            manifest: manifest(&output.join(EXPORT_MANIFEST_FILE)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty() && self.data_source.is_none() && self.manifest.is_empty()
    }
}

fn collect_scripts(root: &Path, dir: &Path, scripts: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            collect_scripts(root, &path, scripts);
        } else if file_type.is_file()
            && path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| SCRIPT_EXTENSIONS.iter().any(|s| s.eq_ignore_ascii_case(ext)))
            && let Ok(relative) = path.strip_prefix(root)
        {
            scripts.push(relative.to_path_buf());
        }
    }
}

fn load_json(path: &Path) -> Option<Value> {
    let bytes = fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(file = %path.display(), error = %err, "Ignoring unparsable export metadata");
            None
        }
    }
}

fn data_source(path: &Path) -> Option<String> {
    load_json(path)?
        .get("dataSource")?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn manifest(path: &Path) -> Vec<ScriptEntry> {
    let Some(Value::Array(items)) = load_json(path).and_then(|v| v.get("databaseScripts").cloned())
    else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(Value::as_object)
        .map(|item| ScriptEntry {
            stored_name: item.get("storedName").cloned(),
            file_name: item.get("fileName").cloned(),
            order_id: item.get("orderId").cloned(),
        })
        .filter(|entry| !entry.is_empty())
        .collect()
}
