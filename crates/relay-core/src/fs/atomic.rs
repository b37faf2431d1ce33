//! State and config files written atomically (tmp + rename).

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use serde::Serialize;
use serde::de::DeserializeOwned;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Load a JSON document. Returns `None` if the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("Failed to read state file: {}", path.display()));
        }
    };
    let value = serde_json::from_slice(&bytes)
        .with_context(|| format!("Failed to parse state file: {}", path.display()))?;
    Ok(Some(value))
}

/// Serialize `value` and replace `path` atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    // Serialize first so a failure never leaves a partial file behind
    let bytes = serde_json::to_vec_pretty(value).context("Failed to serialize state")?;
    write_atomic(path, &bytes)
}

/// Replace `path` with `bytes` via a sibling tmp file and a rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("File has no parent directory: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create directory: {}", parent.display()))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "state".to_string());
    let tmp_path = parent.join(format!(
        ".{}.{}.{}.tmp",
        file_name,
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    fs::write(&tmp_path, bytes)
        .with_context(|| format!("Failed to write tmp file: {}", tmp_path.display()))?;

    if cfg!(windows) && path.exists() {
        fs::remove_file(path)
            .with_context(|| format!("Failed to remove existing file: {}", path.display()))?;
    }
    fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to rename tmp file: {}", tmp_path.display()))?;

    Ok(())
}
