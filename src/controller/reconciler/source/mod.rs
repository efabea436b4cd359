//! # Source Acquisition
//!
//! Produces a workspace holding the Stack's program and the revision it was
//! taken from. Two strategies sit behind [`SourceProvider`]:
//!
//! - **git**: clone with optional credentials, revision read back from HEAD
//! - **artifact**: download a published tarball, verify its digest, unpack it

pub mod artifact;
pub mod extract;
pub mod git;
pub mod workspace;

pub use artifact::{ArtifactDescriptor, ArtifactSource};
pub use git::GitSource;
pub use workspace::Workspace;

use crate::controller::reconciler::resolver::GitAuth;
use crate::crd::GitRepo;
use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("git {operation} failed: {message}")]
    Git { operation: String, message: String },
    #[error("invalid source object: {0}")]
    InvalidSourceObject(String),
    #[error("HTTP request failed: {0}")]
    Http(#[source] reqwest::Error),
    #[error("fetching {url}: expected status 200, got {status}")]
    HttpStatus { url: String, status: u16 },
    #[error("artifact checksum mismatch: expected {expected}, computed {computed}")]
    ChecksumMismatch { expected: String, computed: String },
    #[error("extracting artifact: {0}")]
    Archive(String),
}

/// What to fetch
#[derive(Debug, Clone, Copy)]
pub enum SourceSpec<'a> {
    Git {
        repo: &'a GitRepo,
        auth: Option<&'a GitAuth>,
    },
    /// The referenced object, as read from the cluster
    Artifact { object: &'a serde_json::Value },
}

/// A populated workspace and the revision it holds
#[derive(Debug)]
pub struct AcquiredSource {
    pub workspace: Workspace,
    pub revision: String,
}

#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Fetch `source` into a fresh workspace whose work dir is `repo_dir`
    async fn acquire(
        &self,
        source: SourceSpec<'_>,
        repo_dir: Option<&str>,
    ) -> Result<AcquiredSource, SourceError>;
}

/// Dispatches to the git or artifact strategy
#[derive(Debug, Clone)]
pub struct DefaultSourceProvider {
    git: GitSource,
    artifact: ArtifactSource,
}

impl DefaultSourceProvider {
    pub fn new() -> Result<Self, SourceError> {
        Ok(Self {
            git: GitSource::default(),
            artifact: ArtifactSource::new()?,
        })
    }
}

#[async_trait]
impl SourceProvider for DefaultSourceProvider {
    async fn acquire(
        &self,
        source: SourceSpec<'_>,
        repo_dir: Option<&str>,
    ) -> Result<AcquiredSource, SourceError> {
        let mut workspace = Workspace::create("stack-").map_err(|source| SourceError::Io {
            context: "creating workspace".to_string(),
            source,
        })?;

        // On error the workspace is dropped, which removes the directory
        let revision = match source {
            SourceSpec::Git { repo, auth } => self.git.fetch(repo, auth, &workspace).await?,
            SourceSpec::Artifact { object } => {
                let descriptor = ArtifactDescriptor::from_source_object(object)?;
                self.artifact.fetch(&descriptor, &workspace).await?
            }
        };

        workspace.set_repo_dir(repo_dir);
        debug!(
            work_dir = %workspace.work_dir().display(),
            revision = %revision,
            "Source acquired"
        );
        Ok(AcquiredSource {
            workspace,
            revision,
        })
    }
}
