//! # Artifact Source
//!
//! Fetches a program published by an external source object (e.g. a FluxCD
//! `GitRepository`) through its `status.artifact` block: download the
//! tarball, verify its digest, and unpack it into a fresh workspace.

use super::{extract::extract_tar_gz, SourceError, Workspace};
use crate::constants::LEGACY_CHECKSUM_HEX_LEN;
use futures::StreamExt;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};
use tracing::{info, info_span, warn, Instrument};

/// `status.artifact` of the referenced source object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDescriptor {
    pub url: String,
    pub revision: String,
    pub checksum: String,
}

impl ArtifactDescriptor {
    /// Read the descriptor from an untyped source object
    pub fn from_source_object(object: &serde_json::Value) -> Result<Self, SourceError> {
        let artifact = object
            .pointer("/status/artifact")
            .ok_or_else(|| {
                SourceError::InvalidSourceObject(
                    "source object has no .status.artifact".to_string(),
                )
            })?;
        let field = |name: &str| {
            artifact
                .get(name)
                .and_then(serde_json::Value::as_str)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or_else(|| {
                    SourceError::InvalidSourceObject(format!(
                        "expected .status.artifact.{name} to be a non-empty string"
                    ))
                })
        };
        Ok(Self {
            url: field("url")?,
            revision: field("revision")?,
            checksum: field("checksum")?,
        })
    }
}

/// Streaming digest picked from the expected checksum's length
enum ArtifactHasher {
    Sha1(Sha1),
    Sha256(Sha256),
}

impl ArtifactHasher {
    fn for_checksum(checksum: &str) -> Self {
        if checksum.len() == LEGACY_CHECKSUM_HEX_LEN {
            Self::Sha1(Sha1::new())
        } else {
            Self::Sha256(Sha256::new())
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Self::Sha1(h) => format!("{:x}", h.finalize()),
            Self::Sha256(h) => format!("{:x}", h.finalize()),
        }
    }
}

/// Downloads and unpacks artifacts
#[derive(Debug, Clone)]
pub struct ArtifactSource {
    client: reqwest::Client,
}

impl ArtifactSource {
    pub fn new() -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(SourceError::Http)?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Fetch the artifact into `workspace`, returning the producer's revision
    pub async fn fetch(
        &self,
        descriptor: &ArtifactDescriptor,
        workspace: &Workspace,
    ) -> Result<String, SourceError> {
        let span = info_span!(
            "artifact.download",
            artifact.url = %descriptor.url,
            artifact.revision = %descriptor.revision
        );
        let start = Instant::now();
        crate::observability::metrics::increment_artifact_downloads_total();

        let result = self
            .download_and_extract(descriptor, workspace)
            .instrument(span)
            .await;
        match &result {
            Ok(()) => {
                crate::observability::metrics::observe_artifact_download_duration(
                    start.elapsed().as_secs_f64(),
                );
            }
            Err(e) => {
                crate::observability::metrics::increment_artifact_download_errors_total();
                warn!(url = %descriptor.url, error = %e, "Artifact fetch failed");
            }
        }
        result.map(|()| descriptor.revision.clone())
    }

    async fn download_and_extract(
        &self,
        descriptor: &ArtifactDescriptor,
        workspace: &Workspace,
    ) -> Result<(), SourceError> {
        info!("Downloading artifact from {}", descriptor.url);
        let response = self
            .client
            .get(&descriptor.url)
            .send()
            .await
            .map_err(SourceError::Http)?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(SourceError::HttpStatus {
                url: descriptor.url.clone(),
                status: response.status().as_u16(),
            });
        }

        let mut hasher = ArtifactHasher::for_checksum(&descriptor.checksum);
        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(SourceError::Http)?;
            hasher.update(&chunk);
            body.extend_from_slice(&chunk);
        }

        let computed = hasher.finalize_hex();
        if !computed.eq_ignore_ascii_case(&descriptor.checksum) {
            return Err(SourceError::ChecksumMismatch {
                expected: descriptor.checksum.clone(),
                computed,
            });
        }

        let dest = workspace.root().to_path_buf();
        let size = body.len();
        tokio::task::spawn_blocking(move || extract_tar_gz(body.as_slice(), &dest))
            .await
            .map_err(|e| SourceError::Archive(format!("extraction task failed: {e}")))??;
        info!(bytes = size, "Artifact verified and extracted");
        Ok(())
    }
}
