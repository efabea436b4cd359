//! # Workspace
//!
//! A temporary directory holding the fetched program plus the environment
//! every automation command runs with. Dropping the workspace deletes the
//! directory; [`Workspace::cleanup`] does the same and logs failures.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

pub struct Workspace {
    root: TempDir,
    work_dir: PathBuf,
    env: BTreeMap<String, String>,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Values may be credentials
        f.debug_struct("Workspace")
            .field("root", &self.root.path())
            .field("work_dir", &self.work_dir)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Workspace {
    /// Create an empty workspace under the system temp dir
    pub fn create(prefix: &str) -> std::io::Result<Self> {
        let root = tempfile::Builder::new().prefix(prefix).tempdir()?;
        let work_dir = root.path().to_path_buf();
        Ok(Self {
            root,
            work_dir,
            env: BTreeMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Directory the automation engine runs in
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Point the work dir at `repo_dir` inside the root; empty keeps the root
    pub fn set_repo_dir(&mut self, repo_dir: Option<&str>) {
        self.work_dir = match repo_dir.map(|d| d.trim_matches('/')).filter(|d| !d.is_empty()) {
            Some(dir) => self.root.path().join(dir),
            None => self.root.path().to_path_buf(),
        };
    }

    pub fn set_env_var(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.env.insert(name.into(), value.into());
    }

    pub fn set_env_vars(&mut self, vars: impl IntoIterator<Item = (String, String)>) {
        self.env.extend(vars);
    }

    pub fn env_var(&self, name: &str) -> Option<&str> {
        self.env.get(name).map(String::as_str)
    }

    pub fn env_vars(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Remove the directory tree now
    pub fn cleanup(self) {
        let path = self.root.path().to_path_buf();
        match self.root.close() {
            Ok(()) => debug!(path = %path.display(), "Removed workspace"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove workspace"),
        }
    }
}
