//! # Stack Configuration
//!
//! Merges plain config, legacy clear-text secrets and resolved `secretsRef`
//! values into the single map handed to the automation engine.

use crate::crd::{SpecError, StackSpec};
use std::collections::{BTreeMap, BTreeSet};

/// One configuration entry and whether the engine must encrypt it
#[derive(Clone, PartialEq, Eq)]
pub struct ConfigValue {
    pub value: String,
    pub secret: bool,
}

impl ConfigValue {
    pub fn plain(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            secret: false,
        }
    }

    pub fn secret(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            secret: true,
        }
    }
}

impl std::fmt::Debug for ConfigValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = if self.secret { "***" } else { self.value.as_str() };
        f.debug_struct("ConfigValue")
            .field("value", &value)
            .field("secret", &self.secret)
            .finish()
    }
}

pub type StackConfig = BTreeMap<String, ConfigValue>;

/// Keys defined by more than one of `config`, `secrets` and `secretsRef`, sorted
pub fn duplicate_config_keys(spec: &StackSpec) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut duplicates = BTreeSet::new();
    let keys = spec
        .config
        .keys()
        .chain(spec.secrets.keys())
        .chain(spec.secret_refs.keys());
    for key in keys {
        if !seen.insert(key) {
            duplicates.insert(key.clone());
        }
    }
    duplicates.into_iter().collect()
}

/// Reject specs whose config sources overlap
pub fn validate_config_keys(spec: &StackSpec) -> Result<(), SpecError> {
    let duplicates = duplicate_config_keys(spec);
    if duplicates.is_empty() {
        Ok(())
    } else {
        Err(SpecError::DuplicateConfigKeys(duplicates))
    }
}

/// Build the config map from the spec and the already-resolved `secretsRef` values
///
/// Everything from `secrets` and `secretsRef` is marked secret.
pub fn assemble(spec: &StackSpec, resolved_secret_refs: BTreeMap<String, String>) -> StackConfig {
    let mut config = StackConfig::new();
    for (key, value) in &spec.config {
        config.insert(key.clone(), ConfigValue::plain(value.clone()));
    }
    for (key, value) in &spec.secrets {
        config.insert(key.clone(), ConfigValue::secret(value.clone()));
    }
    for (key, value) in resolved_secret_refs {
        config.insert(key, ConfigValue::secret(value));
    }
    config
}
