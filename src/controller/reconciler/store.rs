//! # Resource Store
//!
//! Read/write access to Stacks and the objects they reference, behind a trait
//! so the reconciliation algorithm can run against an in-memory store in tests.
//!
//! All Stack writes carry the `resourceVersion` that was read, so a racing
//! writer surfaces as [`StoreError::Conflict`]. [`update_stack_with_retry`]
//! turns that into a bounded re-read/re-apply loop.

use crate::constants::{
    CONFLICT_RETRY_ATTEMPTS, CONFLICT_RETRY_FACTOR, CONFLICT_RETRY_INITIAL_DELAY_MS,
};
use crate::crd::{SourceReference, Stack};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, ApiResource, DynamicObject, Patch, PatchParams, PostParams};
use kube::core::GroupVersionKind;
use kube::Client;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Identity of a Stack in the cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StackKey {
    pub namespace: String,
    pub name: String,
}

impl StackKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_stack(stack: &Stack) -> Self {
        Self::new(stack.namespace_or_default(), stack.name_any_or_unknown())
    }
}

impl fmt::Display for StackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },
    #[error("write to {key} conflicted with a concurrent update: {message}")]
    Conflict { key: String, message: String },
    #[error("API request failed: {0}")]
    Api(String),
    #[error("invalid object: {0}")]
    Invalid(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Which part of the Stack a write replaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget {
    /// Metadata and spec (finalizers live here)
    Object,
    /// The `/status` subresource
    Status,
}

#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_stack(&self, key: &StackKey) -> Result<Stack, StoreError>;

    /// Replace metadata and spec. Fails with `Conflict` when the stored
    /// `resourceVersion` differs from the one carried by `stack`.
    async fn update_stack(&self, stack: &Stack) -> Result<Stack, StoreError>;

    /// Replace the status subresource, same concurrency rules as `update_stack`
    async fn update_stack_status(&self, stack: &Stack) -> Result<Stack, StoreError>;

    /// `None` when the Secret does not exist
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, StoreError>;

    /// `None` when the ConfigMap does not exist
    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, StoreError>;

    /// Fetch the object a `sourceRef` points to as untyped JSON
    async fn get_source_object(
        &self,
        namespace: &str,
        source: &SourceReference,
    ) -> Result<Option<serde_json::Value>, StoreError>;
}

/// Re-read the Stack, apply `mutate`, and write it back, retrying on conflicts
///
/// Only conflicts are retried; any other error is returned immediately. The
/// delay starts at 10ms and grows by a factor of 5 between attempts.
pub async fn update_stack_with_retry<F>(
    store: &dyn ResourceStore,
    key: &StackKey,
    target: WriteTarget,
    mut mutate: F,
) -> Result<Stack, StoreError>
where
    F: FnMut(&mut Stack) + Send,
{
    let mut delay = Duration::from_millis(CONFLICT_RETRY_INITIAL_DELAY_MS);
    let mut attempt = 1;
    loop {
        let mut stack = store.get_stack(key).await?;
        mutate(&mut stack);
        let result = match target {
            WriteTarget::Object => store.update_stack(&stack).await,
            WriteTarget::Status => store.update_stack_status(&stack).await,
        };
        match result {
            Err(e) if e.is_conflict() && attempt < CONFLICT_RETRY_ATTEMPTS => {
                debug!(
                    stack = %key,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Write conflicted, re-reading before retry"
                );
                tokio::time::sleep(delay).await;
                delay *= CONFLICT_RETRY_FACTOR;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// [`ResourceStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeResourceStore {
    client: Client,
}

impl fmt::Debug for KubeResourceStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeResourceStore").finish_non_exhaustive()
    }
}

impl KubeResourceStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn stacks(&self, namespace: &str) -> Api<Stack> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ResourceStore for KubeResourceStore {
    async fn get_stack(&self, key: &StackKey) -> Result<Stack, StoreError> {
        self.stacks(&key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| map_kube_error(e, "Stack", &key.to_string()))
    }

    async fn update_stack(&self, stack: &Stack) -> Result<Stack, StoreError> {
        let key = StackKey::from_stack(stack);
        self.stacks(&key.namespace)
            .replace(&key.name, &PostParams::default(), stack)
            .await
            .map_err(|e| map_kube_error(e, "Stack", &key.to_string()))
    }

    async fn update_stack_status(&self, stack: &Stack) -> Result<Stack, StoreError> {
        let key = StackKey::from_stack(stack);
        let api = self.stacks(&key.namespace);
        let resource_version = stack
            .metadata
            .resource_version
            .clone()
            .ok_or_else(|| StoreError::Invalid(format!("Stack {key} has no resourceVersion")))?;

        // A merge patch only adds and overwrites keys, so keys dropped from the
        // desired status (e.g. outputs that no longer exist) are nulled explicitly.
        let current = api
            .get_status(&key.name)
            .await
            .map_err(|e| map_kube_error(e, "Stack", &key.to_string()))?;
        let previous = serde_json::to_value(&current.status)
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        let desired = serde_json::to_value(&stack.status)
            .map_err(|e| StoreError::Invalid(e.to_string()))?;

        let patch = serde_json::json!({
            "metadata": { "resourceVersion": resource_version },
            "status": merge_patch(&previous, &desired),
        });
        api.patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_kube_error(e, "Stack", &key.to_string()))
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, StoreError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api
            .get_opt(name)
            .await
            .map_err(|e| map_kube_error(e, "Secret", &format!("{namespace}/{name}")))?;
        Ok(secret.map(|s| {
            s.data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, v.0))
                .collect()
        }))
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, StoreError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let config_map = api
            .get_opt(name)
            .await
            .map_err(|e| map_kube_error(e, "ConfigMap", &format!("{namespace}/{name}")))?;
        Ok(config_map.map(|cm| cm.data.unwrap_or_default()))
    }

    async fn get_source_object(
        &self,
        namespace: &str,
        source: &SourceReference,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let (group, version) = split_api_version(&source.api_version);
        let ar = ApiResource::from_gvk(&GroupVersionKind {
            group: group.to_string(),
            version: version.to_string(),
            kind: source.kind.clone(),
        });
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        let object = api.get_opt(&source.name).await.map_err(|e| {
            map_kube_error(e, "source object", &format!("{namespace}/{}", source.name))
        })?;
        object
            .map(|o| serde_json::to_value(o).map_err(|e| StoreError::Invalid(e.to_string())))
            .transpose()
    }
}

/// `group/version` or a bare core-group `version`
fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

fn map_kube_error(error: kube::Error, kind: &'static str, key: &str) -> StoreError {
    match error {
        kube::Error::Api(api_err) if api_err.code == 404 => StoreError::NotFound {
            kind,
            key: key.to_string(),
        },
        kube::Error::Api(api_err) if api_err.code == 409 => StoreError::Conflict {
            key: key.to_string(),
            message: api_err.message.clone(),
        },
        other => {
            warn!(kind, key, error = %other, "Kubernetes API request failed");
            StoreError::Api(other.to_string())
        }
    }
}

/// JSON merge patch (RFC 7386) turning `previous` into `desired`
fn merge_patch(previous: &serde_json::Value, desired: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;

    match (previous, desired) {
        (Value::Object(prev), Value::Object(next)) => {
            let mut patch = serde_json::Map::new();
            for (key, value) in next {
                match prev.get(key) {
                    Some(old) if old == value => {}
                    Some(old) => {
                        patch.insert(key.clone(), merge_patch(old, value));
                    }
                    None => {
                        patch.insert(key.clone(), value.clone());
                    }
                }
            }
            for key in prev.keys() {
                if !next.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ => desired.clone(),
    }
}
