//! # Automation Driver
//!
//! Narrow contract over the infrastructure-as-code automation engine. The
//! reconciler only ever talks to the engine through [`AutomationDriver`],
//! and only branches on [`UpdateOutcome`].
//!
//! The production implementation ([`PulumiCliDriver`]) shells out to the
//! engine's CLI inside the Stack's workspace.

pub mod cli;
pub mod dependencies;
pub mod process;

pub use cli::PulumiCliDriver;

use crate::constants::SECRET_OUTPUT_SENTINEL;
use crate::controller::reconciler::source::Workspace;
use crate::controller::reconciler::stack_config::StackConfig;
use crate::crd::Permalink;
use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use thiserror::Error;

const CONFLICT_MARKER: &str = "[409] Conflict: Another update is currently in progress";
const NOT_FOUND_MARKER: &str = "error: [404] Not found";

static PERMALINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)(?:View Live|View in Browser(?: \(Ctrl\+O\))?|Permalink): (\S+)")
        .expect("permalink pattern is valid")
});

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` failed (exit code {}): {}", .code.map_or_else(|| "none".to_string(), |c| c.to_string()), .stderr.trim())]
    Command {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("parsing {what}: {message}")]
    Parse { what: String, message: String },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("required tool not found on PATH: {0}")]
    MissingTool(String),
}

impl DriverError {
    /// Captured standard error of a failed command
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::Command { stderr, .. } => Some(stderr),
            _ => None,
        }
    }

    /// Permalink printed by a command before it failed, if any
    pub fn permalink(&self) -> Option<Permalink> {
        match self {
            Self::Command { stdout, .. } => parse_permalink(stdout),
            _ => None,
        }
    }
}

/// Classified result of an update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Succeeded,
    /// Another update holds the stack lock
    Conflict,
    /// The backend does not know the stack
    NotFound,
    Failed,
}

impl UpdateOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug)]
pub enum UpdateResult {
    Succeeded { permalink: Option<Permalink> },
    Conflict(DriverError),
    NotFound(DriverError),
    Failed(DriverError),
}

impl UpdateResult {
    pub fn outcome(&self) -> UpdateOutcome {
        match self {
            Self::Succeeded { .. } => UpdateOutcome::Succeeded,
            Self::Conflict(_) => UpdateOutcome::Conflict,
            Self::NotFound(_) => UpdateOutcome::NotFound,
            Self::Failed(_) => UpdateOutcome::Failed,
        }
    }
}

/// Map a failed update to its outcome from the engine's error output
pub fn classify_update_failure(error: DriverError) -> UpdateResult {
    let stderr = error.stderr().unwrap_or_default();
    if stderr.contains(CONFLICT_MARKER) {
        UpdateResult::Conflict(error)
    } else if stderr.contains(NOT_FOUND_MARKER) {
        UpdateResult::NotFound(error)
    } else {
        UpdateResult::Failed(error)
    }
}

/// Last permalink line in an operation's standard output
pub fn parse_permalink(stdout: &str) -> Option<Permalink> {
    PERMALINK_RE
        .captures_iter(stdout)
        .last()
        .and_then(|c| c.get(1))
        .map(|m| Permalink(m.as_str().to_string()))
}

/// One stack output and whether the engine flags it secret
#[derive(Debug, Clone, PartialEq)]
pub struct OutputValue {
    pub value: serde_json::Value,
    pub secret: bool,
}

pub type StackOutputs = BTreeMap<String, OutputValue>;

/// Outputs as persisted in status; secret values never leave the engine
pub fn outputs_to_status(outputs: &StackOutputs) -> BTreeMap<String, serde_json::Value> {
    outputs
        .iter()
        .map(|(name, output)| {
            let value = if output.secret {
                serde_json::Value::String(SECRET_OUTPUT_SENTINEL.to_string())
            } else {
                output.value.clone()
            };
            (name.clone(), value)
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackInfo {
    pub name: String,
    /// Console URL of the stack; not every backend has one
    pub url: Option<String>,
}

/// Operations on one engine-managed stack inside a workspace
///
/// `stack` is always the fully qualified name from the Stack spec.
#[async_trait]
pub trait AutomationDriver: Send + Sync {
    /// Select the stack, creating it first when `create` is set
    async fn select_stack(&self, ws: &Workspace, stack: &str, create: bool)
        -> Result<(), DriverError>;

    async fn get_all_config(&self, ws: &Workspace, stack: &str)
        -> Result<StackConfig, DriverError>;

    async fn set_all_config(
        &self,
        ws: &Workspace,
        stack: &str,
        config: &StackConfig,
    ) -> Result<(), DriverError>;

    /// Write the stack settings file, keeping any checked-in content
    async fn save_stack_settings(
        &self,
        ws: &Workspace,
        stack: &str,
        secrets_provider: Option<&str>,
    ) -> Result<(), DriverError>;

    /// Install the program's language dependencies
    async fn install_dependencies(&self, ws: &Workspace) -> Result<(), DriverError>;

    async fn refresh(
        &self,
        ws: &Workspace,
        stack: &str,
        expect_no_changes: bool,
    ) -> Result<Option<Permalink>, DriverError>;

    async fn up(&self, ws: &Workspace, stack: &str) -> UpdateResult;

    async fn outputs(&self, ws: &Workspace, stack: &str) -> Result<StackOutputs, DriverError>;

    async fn destroy(&self, ws: &Workspace, stack: &str) -> Result<(), DriverError>;

    /// Remove the stack from the backend
    async fn remove_stack(&self, ws: &Workspace, stack: &str) -> Result<(), DriverError>;

    async fn info(&self, ws: &Workspace, stack: &str) -> Result<StackInfo, DriverError>;
}
