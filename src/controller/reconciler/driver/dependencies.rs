//! # Project Dependencies
//!
//! Installs the language dependencies of the program in a workspace, based
//! on the `runtime` declared in its `Pulumi.yaml`.

use super::process::run_command;
use super::DriverError;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::info;

/// `runtime` from the project file, either `nodejs` or `{name, options}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectRuntime {
    pub name: String,
    pub virtualenv: Option<String>,
}

/// Read the runtime from `Pulumi.yaml` (or `Pulumi.yml`) in `work_dir`
pub async fn read_project_runtime(work_dir: &Path) -> Result<ProjectRuntime, DriverError> {
    let mut path = work_dir.join("Pulumi.yaml");
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        path = work_dir.join("Pulumi.yml");
    }
    let contents = tokio::fs::read_to_string(&path)
        .await
        .map_err(|source| DriverError::Io {
            context: format!("reading project file in {}", work_dir.display()),
            source,
        })?;
    parse_project_runtime(&contents)
}

fn parse_project_runtime(contents: &str) -> Result<ProjectRuntime, DriverError> {
    let parse_error = |message: String| DriverError::Parse {
        what: "project file".to_string(),
        message,
    };
    let project: serde_yaml::Value =
        serde_yaml::from_str(contents).map_err(|e| parse_error(e.to_string()))?;
    let runtime = project
        .get("runtime")
        .ok_or_else(|| parse_error("missing 'runtime'".to_string()))?;

    match runtime {
        serde_yaml::Value::String(name) => Ok(ProjectRuntime {
            name: name.clone(),
            virtualenv: None,
        }),
        serde_yaml::Value::Mapping(_) => {
            let name = runtime
                .get("name")
                .and_then(serde_yaml::Value::as_str)
                .ok_or_else(|| parse_error("missing 'runtime.name'".to_string()))?;
            let virtualenv = runtime
                .get("options")
                .and_then(|o| o.get("virtualenv"))
                .and_then(serde_yaml::Value::as_str)
                .map(str::to_string);
            Ok(ProjectRuntime {
                name: name.to_string(),
                virtualenv,
            })
        }
        _ => Err(parse_error("'runtime' must be a string or a mapping".to_string())),
    }
}

/// Install dependencies for the program in `work_dir`
pub async fn install(
    work_dir: &Path,
    env: &std::collections::BTreeMap<String, String>,
) -> Result<(), DriverError> {
    let runtime = read_project_runtime(work_dir).await?;
    let command = |program: &Path, args: &[&str]| {
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(work_dir).envs(env);
        cmd
    };

    match runtime.name.as_str() {
        "nodejs" => {
            let (tool, path) = locate(&["npm", "yarn"])?;
            run_command(&format!("{tool} install"), command(&path, &["install"]))
                .await?
                .into_result()?;
            info!(tool, "Installed nodejs dependencies");
        }
        "python" => {
            let (_, python) = locate(&["python3"])?;
            let venv = runtime.virtualenv.ok_or_else(|| DriverError::Parse {
                what: "project file".to_string(),
                message: "python runtime requires 'options.virtualenv'".to_string(),
            })?;
            run_command("python3 -m venv", command(&python, &["-m", "venv", venv.as_str()]))
                .await?
                .into_result()?;

            let venv_python = work_dir.join(&venv).join("bin").join("python");
            run_command(
                "pip install --upgrade",
                command(
                    &venv_python,
                    &["-m", "pip", "install", "--upgrade", "pip", "setuptools", "wheel"],
                ),
            )
            .await?
            .into_result()?;
            run_command(
                "pip install -r requirements.txt",
                command(&venv_python, &["-m", "pip", "install", "-r", "requirements.txt"]),
            )
            .await?
            .into_result()?;
            info!(virtualenv = %venv, "Installed python dependencies");
        }
        "go" | "dotnet" => {}
        other => {
            info!(runtime = other, "No dependency installation for runtime");
        }
    }
    Ok(())
}

/// First of `candidates` found on PATH
fn locate(candidates: &[&str]) -> Result<(String, PathBuf), DriverError> {
    candidates
        .iter()
        .find_map(|name| which::which(name).ok().map(|path| ((*name).to_string(), path)))
        .ok_or_else(|| DriverError::MissingTool(candidates.join(" or ")))
}
