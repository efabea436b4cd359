//! # Stack Spec
//!
//! Main CRD specification and the helpers the reconciler needs on top of it.

use crate::constants::STACK_FINALIZER;
use crate::crd::{GitRepo, ResourceRef, SourceReference, SpecError, StackSource};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Stack Custom Resource Definition
///
/// Describes one deployable infrastructure program instance: where its source
/// lives, how it is configured, and what should happen on deletion.
///
/// # Example
///
/// ```yaml
/// apiVersion: pulumi.com/v1
/// kind: Stack
/// metadata:
///   name: network
///   namespace: infra
/// spec:
///   stack: acme/network/prod
///   gitRepo:
///     projectRepo: https://github.com/acme/network
///     branch: main
///   config:
///     aws:region: us-west-2
///   secretsRef:
///     dbPassword:
///       type: Secret
///       secret:
///         name: db
///         key: password
///   destroyOnFinalize: true
/// ```
#[derive(
    kube::CustomResource, Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema,
)]
#[kube(
    kind = "Stack",
    group = "pulumi.com",
    version = "v1",
    namespaced,
    status = "crate::crd::StackStatus",
    printcolumn = r#"{"name":"Stack", "type":"string", "jsonPath":".spec.stack"}, {"name":"State", "type":"string", "jsonPath":".status.lastUpdate.state"}, {"name":"Commit", "type":"string", "jsonPath":".status.lastUpdate.lastSuccessfulCommit"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StackSpec {
    /// Fully qualified stack name (`org/project/stack`)
    pub stack: String,
    /// Deprecated: Secret in the Stack's namespace holding an `accessToken` key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token_secret: Option<String>,
    /// Deprecated: ConfigMaps whose data is exported as environment variables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub envs: Vec<String>,
    /// Deprecated: Secrets whose data is exported as environment variables
    #[serde(default, rename = "envSecrets", skip_serializing_if = "Vec::is_empty")]
    pub secret_envs: Vec<String>,
    /// Environment variables resolved from resource references
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env_refs: BTreeMap<String, ResourceRef>,
    /// Backend URL exported as `PULUMI_BACKEND_URL`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    /// Plain stack configuration
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
    /// Deprecated: secret stack configuration given in clear text
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secrets: BTreeMap<String, String>,
    /// Secret stack configuration resolved from resource references
    #[serde(default, rename = "secretsRef", skip_serializing_if = "BTreeMap::is_empty")]
    pub secret_refs: BTreeMap<String, ResourceRef>,
    /// Secrets provider URI written into the stack settings file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets_provider: Option<String>,
    /// Git source, mutually exclusive with `sourceRef`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_repo: Option<GitRepo>,
    /// Externally produced artifact source, mutually exclusive with `gitRepo`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<SourceReference>,
    /// Directory of the program inside the fetched source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_dir: Option<String>,
    /// Run a refresh before every update
    #[serde(default)]
    pub refresh: bool,
    /// Fail the refresh if it detects changes
    #[serde(default)]
    pub expect_no_refresh_changes: bool,
    /// Destroy managed infrastructure when the Stack is deleted
    #[serde(default)]
    pub destroy_on_finalize: bool,
    /// Requeue shortly after an update conflict instead of giving up
    #[serde(default)]
    pub retry_on_update_conflict: bool,
    /// Select an existing stack only, never create one
    #[serde(default)]
    pub use_local_stack_only: bool,
    /// Resync period for branch tracking and continuous resync (seconds)
    #[serde(default)]
    pub resync_frequency_seconds: i64,
}

impl StackSpec {
    /// Validate the source descriptor and return the single populated variant
    pub fn source(&self) -> Result<StackSource<'_>, SpecError> {
        match (&self.git_repo, &self.source_ref) {
            (Some(repo), None) => {
                if repo.branch().is_none() && repo.commit().is_none() {
                    return Err(SpecError::MissingGitRevision);
                }
                Ok(StackSource::Git(repo))
            }
            (None, Some(source_ref)) => Ok(StackSource::Artifact(source_ref)),
            (Some(_), Some(_)) => Err(SpecError::MultipleSources),
            (None, None) => Err(SpecError::NoSource),
        }
    }

    /// Short stack name, the last segment of `org/project/stack`
    pub fn stack_short_name(&self) -> &str {
        self.stack.rsplit('/').next().unwrap_or(&self.stack)
    }
}

impl Stack {
    pub fn name_any_or_unknown(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    pub fn namespace_or_default(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("default")
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|name| name == STACK_FINALIZER))
    }

    /// Add the controller finalizer. Returns false when it was already present.
    pub fn add_finalizer(&mut self) -> bool {
        if self.has_finalizer() {
            return false;
        }
        self.metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(STACK_FINALIZER.to_string());
        true
    }

    /// Remove the controller finalizer. Returns false when it was absent.
    pub fn remove_finalizer(&mut self) -> bool {
        let Some(finalizers) = self.metadata.finalizers.as_mut() else {
            return false;
        };
        let before = finalizers.len();
        finalizers.retain(|name| name != STACK_FINALIZER);
        before != finalizers.len()
    }

    pub fn last_successful_commit(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.last_update.as_ref())
            .and_then(|u| u.last_successful_commit.as_deref())
    }

    pub fn has_last_update(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.last_update.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git_repo(branch: Option<&str>, commit: Option<&str>) -> GitRepo {
        GitRepo {
            project_repo: "https://github.com/acme/network".to_string(),
            branch: branch.map(str::to_string),
            commit: commit.map(str::to_string),
            ..GitRepo::default()
        }
    }

    #[test]
    fn test_source_requires_exactly_one_variant() {
        let mut spec = StackSpec::default();
        assert_eq!(spec.source().unwrap_err(), SpecError::NoSource);

        spec.git_repo = Some(git_repo(Some("main"), None));
        spec.source_ref = Some(SourceReference {
            api_version: "source.toolkit.fluxcd.io/v1".to_string(),
            kind: "GitRepository".to_string(),
            name: "network".to_string(),
        });
        assert_eq!(spec.source().unwrap_err(), SpecError::MultipleSources);

        spec.git_repo = None;
        assert!(matches!(spec.source(), Ok(StackSource::Artifact(_))));
    }

    #[test]
    fn test_git_source_needs_branch_or_commit() {
        let spec = StackSpec {
            git_repo: Some(git_repo(None, None)),
            ..StackSpec::default()
        };
        assert_eq!(spec.source().unwrap_err(), SpecError::MissingGitRevision);

        let spec = StackSpec {
            git_repo: Some(git_repo(None, Some("abc123"))),
            ..StackSpec::default()
        };
        assert!(matches!(spec.source(), Ok(StackSource::Git(_))));
    }

    #[test]
    fn test_finalizer_membership() {
        let mut stack = Stack::new("network", StackSpec::default());
        assert!(!stack.has_finalizer());
        assert!(stack.add_finalizer());
        assert!(!stack.add_finalizer());
        assert!(stack.has_finalizer());
        assert!(stack.remove_finalizer());
        assert!(!stack.remove_finalizer());
    }

    #[test]
    fn test_stack_short_name() {
        let spec = StackSpec {
            stack: "acme/network/prod".to_string(),
            ..StackSpec::default()
        };
        assert_eq!(spec.stack_short_name(), "prod");
    }

    #[test]
    fn test_deserialize_camel_case_fields() {
        let spec: StackSpec = serde_json::from_value(serde_json::json!({
            "stack": "acme/network/prod",
            "envSecrets": ["cloud-creds"],
            "secretsRef": {
                "password": {"type": "Literal", "literal": {"value": "hunter2"}}
            },
            "resyncFrequencySeconds": 120,
            "destroyOnFinalize": true
        }))
        .unwrap();
        assert_eq!(spec.secret_envs, vec!["cloud-creds".to_string()]);
        assert_eq!(
            spec.secret_refs.get("password"),
            Some(&ResourceRef::literal("hunter2"))
        );
        assert_eq!(spec.resync_frequency_seconds, 120);
        assert!(spec.destroy_on_finalize);
    }
}
