//! # Git Source
//!
//! Clones the Stack's repository into a workspace with the `git` CLI and
//! reports the commit actually checked out.
//!
//! - Token and basic credentials are placed in the clone URL and removed from
//!   the remote configuration once the clone completes.
//! - SSH keys are written to a private temporary directory, used through
//!   `GIT_SSH_COMMAND`, and the host key is added to `known_hosts`.

use super::{SourceError, Workspace};
use crate::controller::reconciler::resolver::GitAuth;
use crate::crd::GitRepo;
use std::collections::BTreeMap;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tempfile::TempDir;
use tracing::{debug, info, info_span, warn, Instrument};

const PASSPHRASE_ENV: &str = "STACK_CONTROLLER_SSH_PASSPHRASE";

#[derive(Debug, Clone)]
pub struct GitSource {
    git_binary: String,
}

impl Default for GitSource {
    fn default() -> Self {
        Self {
            git_binary: "git".to_string(),
        }
    }
}

/// Clone URL and environment for one fetch. Holds the SSH key directory alive.
struct CloneSetup {
    url: String,
    plain_url: String,
    env: BTreeMap<String, String>,
    secrets: Vec<String>,
    _key_dir: Option<TempDir>,
}

impl GitSource {
    pub fn new(git_binary: impl Into<String>) -> Self {
        Self {
            git_binary: git_binary.into(),
        }
    }

    /// Clone `repo` into the workspace root and return the HEAD commit
    pub async fn fetch(
        &self,
        repo: &GitRepo,
        auth: Option<&GitAuth>,
        workspace: &Workspace,
    ) -> Result<String, SourceError> {
        let span = info_span!(
            "git.clone",
            git.repo = %repo.project_repo,
            git.branch = repo.branch().unwrap_or(""),
            git.commit = repo.commit().unwrap_or("")
        );
        let start = Instant::now();
        crate::observability::metrics::increment_git_clone_total();

        let result = self.clone_repo(repo, auth, workspace.root()).instrument(span).await;
        match &result {
            Ok(revision) => {
                crate::observability::metrics::observe_git_clone_duration(
                    start.elapsed().as_secs_f64(),
                );
                info!(repo = %repo.project_repo, revision = %revision, "Cloned repository");
            }
            Err(e) => {
                crate::observability::metrics::increment_git_clone_errors_total();
                warn!(repo = %repo.project_repo, error = %e, "Git clone failed");
            }
        }
        result
    }

    async fn clone_repo(
        &self,
        repo: &GitRepo,
        auth: Option<&GitAuth>,
        dest: &Path,
    ) -> Result<String, SourceError> {
        let setup = prepare_clone(&repo.project_repo, auth).await?;
        let dest_arg = dest.display().to_string();

        let mut args: Vec<&str> = vec!["clone"];
        let branch = repo.branch().map(|b| b.strip_prefix("refs/heads/").unwrap_or(b));
        if repo.commit().is_none() {
            if let Some(branch) = branch {
                args.extend(["--branch", branch, "--single-branch"]);
            }
        }
        args.extend([setup.url.as_str(), dest_arg.as_str()]);
        self.run("clone", &args, None, &setup).await?;

        if setup.url != setup.plain_url {
            self.run(
                "remote set-url",
                &["remote", "set-url", "origin", &setup.plain_url],
                Some(dest),
                &setup,
            )
            .await?;
        }

        if let Some(commit) = repo.commit() {
            self.run("checkout", &["checkout", commit], Some(dest), &setup)
                .await?;
        }

        let head = self
            .run("rev-parse", &["rev-parse", "HEAD"], Some(dest), &setup)
            .await?;
        Ok(head.trim().to_string())
    }

    async fn run(
        &self,
        operation: &str,
        args: &[&str],
        cwd: Option<&Path>,
        setup: &CloneSetup,
    ) -> Result<String, SourceError> {
        let mut cmd = tokio::process::Command::new(&self.git_binary);
        if let Some(dir) = cwd {
            cmd.arg("-C").arg(dir);
        }
        cmd.args(args)
            .envs(&setup.env)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(std::process::Stdio::null());

        debug!(operation, "Running git");
        let output = cmd.output().await.map_err(|source| SourceError::Io {
            context: format!("spawning {} {operation}", self.git_binary),
            source,
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SourceError::Git {
                operation: operation.to_string(),
                message: redact(stderr.trim(), &setup.secrets),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

async fn prepare_clone(repo_url: &str, auth: Option<&GitAuth>) -> Result<CloneSetup, SourceError> {
    let mut setup = CloneSetup {
        url: repo_url.to_string(),
        plain_url: repo_url.to_string(),
        env: BTreeMap::new(),
        secrets: Vec::new(),
        _key_dir: None,
    };

    match auth {
        None => {}
        Some(GitAuth::Token(token)) => {
            setup.url = url_with_credentials(repo_url, "git", token)?;
            setup.secrets.push(token.as_str().to_string());
        }
        Some(GitAuth::Basic { username, password }) => {
            setup.url = url_with_credentials(repo_url, username, password)?;
            setup.secrets.push(password.as_str().to_string());
        }
        Some(GitAuth::Ssh {
            private_key,
            passphrase,
        }) => {
            let key_dir = tempfile::Builder::new()
                .prefix("stack-ssh-")
                .tempdir()
                .map_err(|source| SourceError::Io {
                    context: "creating SSH key directory".to_string(),
                    source,
                })?;
            let key_path = key_dir.path().join("id_key");
            let mut key = zeroize::Zeroizing::new(private_key.as_str().to_string());
            if !key.ends_with('\n') {
                key.push('\n');
            }
            write_private_file(&key_path, key.as_bytes(), 0o600)?;

            setup.env.insert(
                "GIT_SSH_COMMAND".to_string(),
                format!("ssh -i {} -o IdentitiesOnly=yes", key_path.display()),
            );
            if let Some(passphrase) = passphrase {
                let askpass = key_dir.path().join("askpass.sh");
                let script = format!("#!/bin/sh\nprintf '%s\\n' \"${PASSPHRASE_ENV}\"\n");
                write_private_file(&askpass, script.as_bytes(), 0o700)?;
                setup
                    .env
                    .insert("SSH_ASKPASS".to_string(), askpass.display().to_string());
                setup
                    .env
                    .insert("SSH_ASKPASS_REQUIRE".to_string(), "force".to_string());
                setup
                    .env
                    .insert(PASSPHRASE_ENV.to_string(), passphrase.as_str().to_string());
                setup.secrets.push(passphrase.as_str().to_string());
            }
            setup._key_dir = Some(key_dir);

            if let Some((host, port)) = ssh_host(repo_url) {
                if let Err(e) = add_known_host(&host, port).await {
                    warn!(host = %host, error = %e, "Failed to add SSH host key to known_hosts");
                }
            }
        }
    }
    Ok(setup)
}

/// Embed credentials into an http(s) clone URL
fn url_with_credentials(repo_url: &str, username: &str, password: &str) -> Result<String, SourceError> {
    let credentials_error = |message: &str| SourceError::Git {
        operation: "configure credentials".to_string(),
        message: message.to_string(),
    };
    let mut url = reqwest::Url::parse(repo_url)
        .map_err(|_| credentials_error("token and basic auth need an http(s) repository URL"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(credentials_error(
            "token and basic auth need an http(s) repository URL",
        ));
    }
    url.set_username(username)
        .map_err(|()| credentials_error("repository URL cannot carry a username"))?;
    url.set_password(Some(password))
        .map_err(|()| credentials_error("repository URL cannot carry a password"))?;
    Ok(url.to_string())
}

/// Host and optional port of an SSH clone URL (`ssh://` or scp-like `user@host:path`)
fn ssh_host(repo_url: &str) -> Option<(String, Option<u16>)> {
    if repo_url.contains("://") {
        let url = reqwest::Url::parse(repo_url).ok()?;
        if url.scheme() != "ssh" {
            return None;
        }
        return Some((url.host_str()?.to_string(), url.port()));
    }
    let (user_host, _path) = repo_url.split_once(':')?;
    let host = user_host.rsplit('@').next()?;
    (!host.is_empty()).then(|| (host.to_string(), None))
}

async fn add_known_host(host: &str, port: Option<u16>) -> Result<(), SourceError> {
    let keyscan = which::which("ssh-keyscan").map_err(|e| SourceError::Io {
        context: "locating ssh-keyscan".to_string(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string()),
    })?;

    let mut cmd = tokio::process::Command::new(keyscan);
    cmd.arg("-H");
    if let Some(port) = port {
        cmd.arg("-p").arg(port.to_string());
    }
    cmd.arg(host);
    let output = cmd.output().await.map_err(|source| SourceError::Io {
        context: "running ssh-keyscan".to_string(),
        source,
    })?;
    if !output.status.success() || output.stdout.is_empty() {
        return Err(SourceError::Git {
            operation: "ssh-keyscan".to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let home = std::env::var("HOME").map_err(|_| SourceError::Git {
        operation: "ssh-keyscan".to_string(),
        message: "HOME is not set".to_string(),
    })?;
    let ssh_dir = PathBuf::from(home).join(".ssh");
    std::fs::create_dir_all(&ssh_dir).map_err(|source| SourceError::Io {
        context: format!("creating {}", ssh_dir.display()),
        source,
    })?;
    let known_hosts = ssh_dir.join("known_hosts");
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(&known_hosts)
        .map_err(|source| SourceError::Io {
            context: format!("opening {}", known_hosts.display()),
            source,
        })?;
    file.write_all(&output.stdout)
        .map_err(|source| SourceError::Io {
            context: format!("writing {}", known_hosts.display()),
            source,
        })?;
    debug!(host, "Added SSH host key to known_hosts");
    Ok(())
}

fn write_private_file(path: &Path, contents: &[u8], mode: u32) -> Result<(), SourceError> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .map_err(|source| SourceError::Io {
            context: format!("creating {}", path.display()),
            source,
        })?;
    file.write_all(contents).map_err(|source| SourceError::Io {
        context: format!("writing {}", path.display()),
        source,
    })
}

/// Replace every secret, raw or percent-encoded, with `***`
fn redact(message: &str, secrets: &[String]) -> String {
    let mut out = message.to_string();
    for secret in secrets.iter().filter(|s| !s.is_empty()) {
        out = out.replace(secret.as_str(), "***");
        let mut probe = reqwest::Url::parse("https://host").ok();
        if let Some(url) = probe.as_mut() {
            if url.set_password(Some(secret)).is_ok() {
                if let Some(encoded) = url.password() {
                    out = out.replace(encoded, "***");
                }
            }
        }
    }
    out
}
