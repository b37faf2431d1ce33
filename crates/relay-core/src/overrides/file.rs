//! Override sets stored as `<dir>/<override_secret_key>.json`.

use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::{LookupFailure, NotFoundError};
use crate::types::Environment;

use super::{OverrideSet, OverrideStore};

#[derive(Debug, Clone)]
pub struct FileOverrideStore {
    dir: PathBuf,
}

impl FileOverrideStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, secret_key: &str) -> Option<PathBuf> {
        let file_name = format!("{secret_key}.json");
        let mut components = Path::new(&file_name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Some(self.dir.join(file_name)),
            _ => None,
        }
    }
}

impl OverrideStore for FileOverrideStore {
    fn get(&self, environment: &Environment) -> Result<OverrideSet, NotFoundError> {
        let not_found = |failure| NotFoundError {
            environment: environment.name.clone(),
            secret_key: environment.override_secret_key.clone(),
            failure,
        };

        let path = self
            .path_for(&environment.override_secret_key)
            .ok_or_else(|| {
                not_found(LookupFailure::Unreadable(
                    "secret key is not a plain file name".to_string(),
                ))
            })?;

        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(not_found(LookupFailure::Missing));
            }
            Err(err) => {
                return Err(not_found(LookupFailure::Unreadable(format!(
                    "{}: {}",
                    path.display(),
                    err
                ))));
            }
        };

        debug!(environment = %environment.name, path = %path.display(), "loaded override set");
        OverrideSet::from_json(&environment.name, &raw)
            .map_err(|reason| not_found(LookupFailure::Malformed(reason)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn env(name: &str, key: &str) -> Environment {
        Environment::new(name, false, key)
    }

    #[test]
    fn reads_override_file() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("QA_OVERRIDES.json"), r#"{"DB_URL": "x"}"#).unwrap();
        let store = FileOverrideStore::new(tmp.path().to_path_buf());

        let set = store.get(&env("qa", "QA_OVERRIDES")).unwrap();
        assert_eq!(set.environment(), "qa");
        assert_eq!(set.get("DB_URL"), Some("x"));
    }

    #[test]
    fn missing_file_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = FileOverrideStore::new(tmp.path().to_path_buf());

        let err = store.get(&env("prod", "PROD_OVERRIDES")).unwrap_err();
        assert_eq!(err.failure, LookupFailure::Missing);
        assert_eq!(err.secret_key, "PROD_OVERRIDES");
    }

    #[test]
    fn malformed_file_is_reported() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("QA.json"), "[]").unwrap();
        let store = FileOverrideStore::new(tmp.path().to_path_buf());

        let err = store.get(&env("qa", "QA")).unwrap_err();
        assert!(matches!(err.failure, LookupFailure::Malformed(_)));
    }

    #[test]
    fn path_like_secret_keys_are_refused() {
        let tmp = TempDir::new().unwrap();
        let store = FileOverrideStore::new(tmp.path().to_path_buf());

        let err = store.get(&env("qa", "../escape")).unwrap_err();
        assert!(matches!(err.failure, LookupFailure::Unreadable(_)));
    }
}
