//! # Child Processes
//!
//! Runs an automation command with both output streams drained concurrently,
//! so a chatty child never blocks on a full pipe. Every line is kept for the
//! caller and logged at debug level under the command's title.

use super::DriverError;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::debug;

#[derive(Debug)]
pub struct CommandOutput {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub status: ExitStatus,
}

impl CommandOutput {
    /// Turn a non-zero exit into [`DriverError::Command`]
    pub fn into_result(self) -> Result<Self, DriverError> {
        if self.status.success() {
            Ok(self)
        } else {
            Err(DriverError::Command {
                command: self.command,
                code: self.status.code(),
                stdout: self.stdout,
                stderr: self.stderr,
            })
        }
    }
}

pub async fn run_command(title: &str, mut cmd: Command) -> Result<CommandOutput, DriverError> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);

    let mut child = cmd.spawn().map_err(|source| DriverError::Spawn {
        program: program.clone(),
        source,
    })?;

    let stdout = child.stdout.take().map(|s| drain(title.to_string(), "stdout", s));
    let stderr = child.stderr.take().map(|s| drain(title.to_string(), "stderr", s));

    let status = child.wait().await.map_err(|source| DriverError::Io {
        context: format!("waiting for {title}"),
        source,
    })?;

    let stdout = collect(title, stdout).await?;
    let stderr = collect(title, stderr).await?;
    debug!(command = title, code = ?status.code(), "Command finished");

    Ok(CommandOutput {
        command: title.to_string(),
        stdout,
        stderr,
        status,
    })
}

fn drain<R>(
    title: String,
    stream: &'static str,
    reader: R,
) -> tokio::task::JoinHandle<std::io::Result<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut buffer = String::new();
        while let Some(line) = lines.next_line().await? {
            debug!(command = %title, stream, "{}", line);
            buffer.push_str(&line);
            buffer.push('\n');
        }
        Ok(buffer)
    })
}

async fn collect(
    title: &str,
    handle: Option<tokio::task::JoinHandle<std::io::Result<String>>>,
) -> Result<String, DriverError> {
    let Some(handle) = handle else {
        return Ok(String::new());
    };
    handle
        .await
        .map_err(|e| DriverError::Io {
            context: format!("reading output of {title}"),
            source: std::io::Error::other(e),
        })?
        .map_err(|source| DriverError::Io {
            context: format!("reading output of {title}"),
            source,
        })
}
