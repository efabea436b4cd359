//! # Source Descriptors
//!
//! Git and artifact source types, and the validated view over them.

use crate::crd::ResourceRef;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Git repository holding the infrastructure program
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitRepo {
    /// Clone URL (https or ssh)
    pub project_repo: String,
    /// Deprecated: Secret holding `sshPrivateKey`, `accessToken` or `username`/`password`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_auth_secret: Option<String>,
    /// Authentication resolved from resource references
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_auth: Option<GitAuthConfig>,
    /// Pin to a commit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    /// Track a branch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Keep running updates on resync even when the commit has not moved
    #[serde(default)]
    pub continue_resync_on_commit_match: bool,
}

impl GitRepo {
    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref().filter(|b| !b.is_empty())
    }

    pub fn commit(&self) -> Option<&str> {
        self.commit.as_deref().filter(|c| !c.is_empty())
    }

    /// A branch is tracked whenever one is named
    pub fn tracks_branch(&self) -> bool {
        self.branch().is_some()
    }
}

/// Git authentication given as resource references
///
/// Exactly one of the three fields must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitAuthConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_auth: Option<SshAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<ResourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<BasicAuth>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SshAuth {
    pub ssh_private_key: ResourceRef,
    /// Passphrase for the private key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<ResourceRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BasicAuth {
    pub user_name: ResourceRef,
    pub password: ResourceRef,
}

/// Reference to an object in the Stack's namespace that publishes an artifact
/// in `status.artifact`, e.g. a FluxCD GitRepository
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceReference {
    /// e.g. `source.toolkit.fluxcd.io/v1`
    pub api_version: String,
    /// e.g. `GitRepository`
    pub kind: String,
    pub name: String,
}

/// The single source variant a valid Stack carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackSource<'a> {
    Git(&'a GitRepo),
    Artifact(&'a SourceReference),
}

/// Spec validation failures surfaced as config-invalid
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
    #[error("exactly one of .spec.gitRepo and .spec.sourceRef should be supplied, found neither")]
    NoSource,
    #[error("exactly one of .spec.gitRepo and .spec.sourceRef should be supplied, found both")]
    MultipleSources,
    #[error("Stack needs to specify either 'branch' or 'commit' for the tracking repo")]
    MissingGitRevision,
    #[error("config key(s) defined by more than one of config, secrets and secretsRef: {}", .0.join(", "))]
    DuplicateConfigKeys(Vec<String>),
}
