//! Recursive directory copy used to publish artifacts.

use std::fs;
use std::path::Path;

use anyhow::Context;

/// Copy `src` into `dst`, creating `dst`. Symlinks are rejected.
pub fn copy_tree(src: &Path, dst: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(dst)
        .with_context(|| format!("Failed to create directory: {}", dst.display()))?;

    for entry in
        fs::read_dir(src).with_context(|| format!("Failed to read directory: {}", src.display()))?
    {
        let entry =
            entry.with_context(|| format!("Failed to read directory entry: {}", src.display()))?;
        let ty = entry
            .file_type()
            .with_context(|| format!("Failed to stat file: {}", entry.path().display()))?;
        let target = dst.join(entry.file_name());

        if ty.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if ty.is_file() {
            fs::copy(entry.path(), &target).with_context(|| {
                format!(
                    "Failed to copy {} to {}",
                    entry.path().display(),
                    target.display()
                )
            })?;
        } else {
            anyhow::bail!("Symlinks are not supported: {}", entry.path().display());
        }
    }

    Ok(())
}

/// Remove a file or directory if it exists. Returns true if something was removed.
pub fn remove_path_if_exists(path: &Path) -> anyhow::Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            fs::remove_dir_all(path)
                .with_context(|| format!("Failed to remove directory: {}", path.display()))?;
            Ok(true)
        }
        Ok(_) => {
            fs::remove_file(path)
                .with_context(|| format!("Failed to remove file: {}", path.display()))?;
            Ok(true)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => {
            Err(err).with_context(|| format!("Failed to inspect path: {}", path.display()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::digest_tree;
    use tempfile::TempDir;

    #[test]
    fn copy_preserves_tree_digest() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("metadata.json"), "{}").unwrap();
        fs::write(src.join("nested").join("icf.json"), "{}").unwrap();

        let dst = tmp.path().join("dst");
        copy_tree(&src, &dst).unwrap();

        assert_eq!(digest_tree(&src).unwrap(), digest_tree(&dst).unwrap());
    }

    #[test]
    fn remove_missing_path_is_noop() {
        let tmp = TempDir::new().unwrap();
        assert!(!remove_path_if_exists(&tmp.path().join("missing")).unwrap());
    }
}
