//! Artifact download tests against a mock source server

use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use stack_controller::controller::reconciler::source::{
    ArtifactDescriptor, ArtifactSource, SourceError, Workspace,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PROGRAM: &str = "name: network\nruntime: nodejs\n";

fn tarball() -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(PROGRAM.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "Pulumi.yaml", PROGRAM.as_bytes())
        .unwrap();
    builder.into_inner().unwrap().finish().unwrap()
}

fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

async fn serve(body: Vec<u8>, status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gitrepository/infra/network/latest.tar.gz"))
        .respond_with(ResponseTemplate::new(status).set_body_bytes(body))
        .mount(&server)
        .await;
    server
}

fn descriptor(server: &MockServer, checksum: String) -> ArtifactDescriptor {
    ArtifactDescriptor {
        url: format!("{}/gitrepository/infra/network/latest.tar.gz", server.uri()),
        revision: "main@sha1:0f1e2d".to_string(),
        checksum,
    }
}

#[tokio::test]
async fn test_verified_artifact_is_extracted() {
    let body = tarball();
    let checksum = sha256_hex(&body);
    let server = serve(body, 200).await;
    let workspace = Workspace::create("artifact-test-").unwrap();

    let revision = ArtifactSource::new()
        .unwrap()
        .fetch(&descriptor(&server, checksum), &workspace)
        .await
        .unwrap();

    assert_eq!(revision, "main@sha1:0f1e2d");
    let program = std::fs::read_to_string(workspace.root().join("Pulumi.yaml")).unwrap();
    assert_eq!(program, PROGRAM);
}

#[tokio::test]
async fn test_checksum_mismatch_is_rejected() {
    let server = serve(tarball(), 200).await;
    let workspace = Workspace::create("artifact-test-").unwrap();

    let err = ArtifactSource::new()
        .unwrap()
        .fetch(&descriptor(&server, "0".repeat(64)), &workspace)
        .await
        .unwrap_err();

    assert!(matches!(err, SourceError::ChecksumMismatch { .. }));
    assert!(!workspace.root().join("Pulumi.yaml").exists());
}

#[tokio::test]
async fn test_non_200_status_is_an_error() {
    let server = serve(Vec::new(), 404).await;
    let workspace = Workspace::create("artifact-test-").unwrap();

    let err = ArtifactSource::new()
        .unwrap()
        .fetch(&descriptor(&server, "0".repeat(64)), &workspace)
        .await
        .unwrap_err();

    assert!(matches!(err, SourceError::HttpStatus { status: 404, .. }));
}
