//! # CLI Driver
//!
//! [`AutomationDriver`] backed by the `pulumi` command line. Every command
//! runs in the workspace work dir with the workspace environment and
//! `--non-interactive`.

use super::process::{run_command, CommandOutput};
use super::{
    classify_update_failure, dependencies, parse_permalink, AutomationDriver, DriverError,
    OutputValue, StackInfo, StackOutputs, UpdateResult,
};
use crate::constants::SECRET_OUTPUT_SENTINEL;
use crate::controller::reconciler::source::Workspace;
use crate::controller::reconciler::stack_config::{ConfigValue, StackConfig};
use crate::crd::Permalink;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct PulumiCliDriver {
    binary: String,
}

impl PulumiCliDriver {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self, ws: &Workspace, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .arg("--non-interactive")
            .current_dir(ws.work_dir())
            .envs(ws.env_vars())
            .env("PULUMI_SKIP_UPDATE_CHECK", "true");
        cmd
    }

    /// Command line for logs and errors; `key=value` config pairs are left out
    fn title(&self, args: &[&str]) -> String {
        let shown: Vec<&str> = args.iter().copied().filter(|a| !a.contains('=')).collect();
        format!("{} {}", self.binary, shown.join(" "))
    }

    /// Run and fail on a non-zero exit, recording the operation
    async fn exec(
        &self,
        operation: &str,
        ws: &Workspace,
        args: &[&str],
    ) -> Result<CommandOutput, DriverError> {
        let title = self.title(args);
        let start = Instant::now();
        let result = run_command(&title, self.command(ws, args))
            .await
            .and_then(CommandOutput::into_result);
        let outcome = if result.is_ok() { "succeeded" } else { "failed" };
        crate::observability::metrics::record_automation_operation(
            operation,
            outcome,
            start.elapsed().as_secs_f64(),
        );
        result
    }
}

#[derive(Debug, Deserialize)]
struct ConfigEntry {
    #[serde(default)]
    value: Option<serde_json::Value>,
    #[serde(default)]
    secret: bool,
}

#[derive(Debug, Deserialize)]
struct StackSummary {
    name: String,
    #[serde(default)]
    url: Option<String>,
}

fn parse_json<T: serde::de::DeserializeOwned>(what: &str, text: &str) -> Result<T, DriverError> {
    serde_json::from_str(text).map_err(|e| DriverError::Parse {
        what: what.to_string(),
        message: e.to_string(),
    })
}

fn short_name(stack: &str) -> &str {
    stack.rsplit('/').next().unwrap_or(stack)
}

/// Combine masked and revealed `stack output --json` results
fn merge_outputs(
    masked: &BTreeMap<String, serde_json::Value>,
    revealed: BTreeMap<String, serde_json::Value>,
) -> StackOutputs {
    revealed
        .into_iter()
        .map(|(name, value)| {
            let secret = masked
                .get(&name)
                .is_some_and(|m| m.as_str() == Some(SECRET_OUTPUT_SENTINEL));
            (name, OutputValue { value, secret })
        })
        .collect()
}

/// Merge the secrets provider into an existing settings document
fn stack_settings(existing: Option<&str>, secrets_provider: Option<&str>) -> Result<String, DriverError> {
    let mut settings = match existing {
        Some(text) if !text.trim().is_empty() => {
            serde_yaml::from_str::<serde_yaml::Mapping>(text).map_err(|e| DriverError::Parse {
                what: "stack settings".to_string(),
                message: e.to_string(),
            })?
        }
        _ => serde_yaml::Mapping::new(),
    };
    if let Some(provider) = secrets_provider.filter(|p| !p.is_empty()) {
        settings.insert(
            serde_yaml::Value::String("secretsprovider".to_string()),
            serde_yaml::Value::String(provider.to_string()),
        );
    }
    serde_yaml::to_string(&settings).map_err(|e| DriverError::Parse {
        what: "stack settings".to_string(),
        message: e.to_string(),
    })
}

#[async_trait]
impl AutomationDriver for PulumiCliDriver {
    async fn select_stack(
        &self,
        ws: &Workspace,
        stack: &str,
        create: bool,
    ) -> Result<(), DriverError> {
        let mut args = vec!["stack", "select", stack];
        if create {
            args.push("--create");
        }
        self.exec("select", ws, &args).await?;
        Ok(())
    }

    async fn get_all_config(
        &self,
        ws: &Workspace,
        stack: &str,
    ) -> Result<StackConfig, DriverError> {
        let output = self
            .exec(
                "get_config",
                ws,
                &["config", "--json", "--show-secrets", "--stack", stack],
            )
            .await?;
        let entries: BTreeMap<String, ConfigEntry> = parse_json("stack config", &output.stdout)?;
        Ok(entries
            .into_iter()
            .map(|(key, entry)| {
                let value = match entry.value {
                    Some(serde_json::Value::String(s)) => s,
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                (
                    key,
                    ConfigValue {
                        value,
                        secret: entry.secret,
                    },
                )
            })
            .collect())
    }

    async fn set_all_config(
        &self,
        ws: &Workspace,
        stack: &str,
        config: &StackConfig,
    ) -> Result<(), DriverError> {
        if config.is_empty() {
            return Ok(());
        }
        let pairs: Vec<(bool, String)> = config
            .iter()
            .map(|(key, entry)| (entry.secret, format!("{key}={}", entry.value)))
            .collect();
        let mut args = vec!["config", "set-all", "--stack", stack];
        for (secret, pair) in &pairs {
            args.push(if *secret { "--secret" } else { "--plaintext" });
            args.push(pair);
        }
        self.exec("set_config", ws, &args).await?;
        debug!(keys = config.len(), "Applied stack config");
        Ok(())
    }

    async fn save_stack_settings(
        &self,
        ws: &Workspace,
        stack: &str,
        secrets_provider: Option<&str>,
    ) -> Result<(), DriverError> {
        let path = ws.work_dir().join(format!("Pulumi.{}.yaml", short_name(stack)));
        let existing = match tokio::fs::read_to_string(&path).await {
            Ok(text) => Some(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => {
                return Err(DriverError::Io {
                    context: format!("reading {}", path.display()),
                    source,
                })
            }
        };
        let settings = stack_settings(existing.as_deref(), secrets_provider)?;
        tokio::fs::write(&path, settings)
            .await
            .map_err(|source| DriverError::Io {
                context: format!("writing {}", path.display()),
                source,
            })
    }

    async fn install_dependencies(&self, ws: &Workspace) -> Result<(), DriverError> {
        dependencies::install(ws.work_dir(), ws.env_vars()).await
    }

    async fn refresh(
        &self,
        ws: &Workspace,
        stack: &str,
        expect_no_changes: bool,
    ) -> Result<Option<Permalink>, DriverError> {
        let mut args = vec!["refresh", "--yes", "--skip-preview", "--stack", stack];
        if expect_no_changes {
            args.push("--expect-no-changes");
        }
        let output = self.exec("refresh", ws, &args).await?;
        Ok(parse_permalink(&output.stdout))
    }

    async fn up(&self, ws: &Workspace, stack: &str) -> UpdateResult {
        let args = ["up", "--yes", "--skip-preview", "--stack", stack];
        let title = self.title(&args);
        let start = Instant::now();
        let result = match run_command(&title, self.command(ws, &args)).await {
            Ok(output) => match output.into_result() {
                Ok(output) => UpdateResult::Succeeded {
                    permalink: parse_permalink(&output.stdout),
                },
                Err(e) => classify_update_failure(e),
            },
            Err(e) => UpdateResult::Failed(e),
        };
        crate::observability::metrics::record_automation_operation(
            "up",
            result.outcome().as_str(),
            start.elapsed().as_secs_f64(),
        );
        result
    }

    async fn outputs(&self, ws: &Workspace, stack: &str) -> Result<StackOutputs, DriverError> {
        let masked = self
            .exec("outputs", ws, &["stack", "output", "--json", "--stack", stack])
            .await?;
        let revealed = self
            .exec(
                "outputs",
                ws,
                &["stack", "output", "--json", "--show-secrets", "--stack", stack],
            )
            .await?;
        let masked: BTreeMap<String, serde_json::Value> =
            parse_json("stack outputs", &masked.stdout)?;
        let revealed: BTreeMap<String, serde_json::Value> =
            parse_json("stack outputs", &revealed.stdout)?;
        Ok(merge_outputs(&masked, revealed))
    }

    async fn destroy(&self, ws: &Workspace, stack: &str) -> Result<(), DriverError> {
        self.exec(
            "destroy",
            ws,
            &["destroy", "--yes", "--skip-preview", "--stack", stack],
        )
        .await?;
        info!(stack, "Destroyed stack resources");
        Ok(())
    }

    async fn remove_stack(&self, ws: &Workspace, stack: &str) -> Result<(), DriverError> {
        self.exec("remove", ws, &["stack", "rm", "--yes", stack])
            .await?;
        Ok(())
    }

    async fn info(&self, ws: &Workspace, stack: &str) -> Result<StackInfo, DriverError> {
        let output = self.exec("info", ws, &["stack", "ls", "--json"]).await?;
        let stacks: Vec<StackSummary> = parse_json("stack list", &output.stdout)?;
        let summary = stacks
            .iter()
            .find(|s| s.name == stack || s.name == short_name(stack))
            .ok_or_else(|| DriverError::Parse {
                what: "stack list".to_string(),
                message: format!("stack {stack} not listed"),
            })?;
        Ok(StackInfo {
            name: summary.name.clone(),
            url: summary.url.clone(),
        })
    }
}
