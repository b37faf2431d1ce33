//! Override sets passed as environment variables, the CI secret convention.
//!
//! The variable named by `override_secret_key` holds the JSON object.

use std::fmt;

use crate::error::{LookupFailure, NotFoundError};
use crate::types::Environment;

use super::{OverrideSet, OverrideStore};

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

pub struct EnvOverrideStore {
    lookup: Lookup,
}

impl EnvOverrideStore {
    /// Read from the process environment.
    pub fn new() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read through a custom lookup function.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            lookup: Box::new(lookup),
        }
    }
}

impl Default for EnvOverrideStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EnvOverrideStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvOverrideStore").finish_non_exhaustive()
    }
}

impl OverrideStore for EnvOverrideStore {
    fn get(&self, environment: &Environment) -> Result<OverrideSet, NotFoundError> {
        let not_found = |failure| NotFoundError {
            environment: environment.name.clone(),
            secret_key: environment.override_secret_key.clone(),
            failure,
        };

        // An empty variable is how CI renders an unset secret
        let raw = (self.lookup)(&environment.override_secret_key)
            .filter(|raw| !raw.trim().is_empty())
            .ok_or_else(|| not_found(LookupFailure::Missing))?;

        OverrideSet::from_json(&environment.name, &raw)
            .map_err(|reason| not_found(LookupFailure::Malformed(reason)))
    }
}
