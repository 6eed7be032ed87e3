//! Credential source: the externally supplied values the publisher writes.

use std::collections::BTreeMap;

/// Environment variables read into a [`CredentialSource`].
pub const SOURCE_ENV_VARS: &[&str] =
    &["DB_USER", "DB_PASSWORD", "DB_NAME", "DB_HOST", "DB_PORT", "KAFKA_BOOTSTRAP_SERVERS"];

/// Snapshot of named bootstrap values, taken once per invocation.
///
/// Empty values count as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialSource {
    values: BTreeMap<String, String>,
}

impl CredentialSource {
    /// Capture the known variables from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Capture the known variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let values = SOURCE_ENV_VARS
            .iter()
            .filter_map(|name| lookup(name).map(|value| (name.to_string(), value)))
            .filter(|(_, value)| !value.trim().is_empty())
            .collect();
        Self { values }
    }

    /// Build a source from explicit pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let values = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(_, v): &(String, String)| !v.trim().is_empty())
            .collect();
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Names present in the source. Values are not exposed here.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}
