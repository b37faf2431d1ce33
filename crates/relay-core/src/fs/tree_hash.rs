//! Deterministic tree hashing for published artifacts
//!
//! The digest names and verifies an export: identical trees hash identically
//! regardless of creation order, and any change to a path or byte changes it.

use anyhow::Context;
use std::fs;
use std::path::Path;

/// Content digest of a directory tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeDigest {
    /// blake3 hex digest
    pub hash: String,
    /// Number of regular files hashed
    pub files: usize,
}

impl TreeDigest {
    /// Leading characters of the hash, for use in names.
    pub fn short(&self, len: usize) -> &str {
        &self.hash[..len.min(self.hash.len())]
    }
}

/// Compute deterministic tree digest of a directory
///
/// # Algorithm
/// - Recursive traversal, entries sorted by file name
/// - Directories contribute `relative_path || 0xFF`
/// - Files contribute `relative_path || 0x00 || len || content`
/// - Symlinks are rejected
///
/// # Example
/// ```no_run
/// use relay_core::fs::tree_hash::digest_tree;
/// use std::path::Path;
///
/// let digest = digest_tree(Path::new("/path/to/export"))?;
/// assert_eq!(digest.hash.len(), 64);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn digest_tree(path: &Path) -> anyhow::Result<TreeDigest> {
    let mut hasher = blake3::Hasher::new();
    let mut files = 0;
    walk(&mut hasher, path, "", &mut files)?;
    Ok(TreeDigest {
        hash: hasher.finalize().to_hex().to_string(),
        files,
    })
}

fn walk(
    hasher: &mut blake3::Hasher,
    dir: &Path,
    base: &str,
    files: &mut usize,
) -> anyhow::Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to read directory entries: {}", dir.display()))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        let rel_path = if base.is_empty() {
            name.to_string_lossy().to_string()
        } else {
            format!("{}/{}", base, name.to_string_lossy())
        };

        let ty = entry
            .file_type()
            .with_context(|| format!("Failed to stat file: {}", entry.path().display()))?;

        if ty.is_dir() {
            hasher.update(rel_path.as_bytes());
            hasher.update(&[0xFF]);
            walk(hasher, &entry.path(), &rel_path, files)?;
        } else if ty.is_file() {
            let content = fs::read(entry.path())
                .with_context(|| format!("Failed to read file: {}", entry.path().display()))?;
            hasher.update(rel_path.as_bytes());
            hasher.update(&[0x00]);
            hasher.update(&(content.len() as u64).to_le_bytes());
            hasher.update(&content);
            *files += 1;
        } else {
            anyhow::bail!(
                "Unsupported entry in export output (symlinks are not allowed): {}",
                entry.path().display()
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_file(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create_dir_all should succeed in test temp dirs");
        }
        fs::write(path, content).expect("write should succeed in test temp dirs");
    }

    #[test]
    fn empty_directory_has_no_files() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let digest = digest_tree(tmp.path()).expect("digest should succeed");
        assert_eq!(digest.files, 0);
        assert_eq!(digest.hash.len(), 64);
    }

    #[test]
    fn creation_order_does_not_matter() {
        let tmp1 = TempDir::new().expect("tempdir should succeed");
        write_file(&tmp1.path().join("metadata.json"), "{}");
        write_file(&tmp1.path().join("icf.json"), "{\"a\":\"${A}\"}");

        let tmp2 = TempDir::new().expect("tempdir should succeed");
        write_file(&tmp2.path().join("icf.json"), "{\"a\":\"${A}\"}");
        write_file(&tmp2.path().join("metadata.json"), "{}");

        let d1 = digest_tree(tmp1.path()).expect("digest should succeed");
        let d2 = digest_tree(tmp2.path()).expect("digest should succeed");
        assert_eq!(d1, d2);
        assert_eq!(d1.files, 2);
    }

    #[test]
    fn content_and_names_change_the_hash() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        write_file(&tmp.path().join("a.txt"), "original");
        let first = digest_tree(tmp.path()).expect("digest should succeed");

        write_file(&tmp.path().join("a.txt"), "modified");
        let second = digest_tree(tmp.path()).expect("digest should succeed");
        assert_ne!(first.hash, second.hash);

        fs::rename(tmp.path().join("a.txt"), tmp.path().join("b.txt")).expect("rename");
        let third = digest_tree(tmp.path()).expect("digest should succeed");
        assert_ne!(second.hash, third.hash);
    }

    #[test]
    fn nested_files_are_counted() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        write_file(&tmp.path().join("top.txt"), "1");
        write_file(&tmp.path().join("dir").join("inner").join("deep.txt"), "2");
        let digest = digest_tree(tmp.path()).expect("digest should succeed");
        assert_eq!(digest.files, 2);
        assert_eq!(digest.short(12).len(), 12);
    }

    #[test]
    fn missing_path_fails() {
        assert!(digest_tree(Path::new("/nonexistent/relay/export")).is_err());
    }
}
