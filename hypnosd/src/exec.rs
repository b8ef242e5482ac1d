//! Thin wrappers around external command invocation.
//!
//! Both roles shell out for their privileged action: the waker runs a
//! Wake-on-LAN executable, the sleeper runs systemctl. Output is captured
//! and echoed back in API responses.

use std::process::Stdio;

use serde::Serialize;
use tokio::process::Command;
use tracing::debug;

use crate::error::ServiceError;

#[derive(Debug, Clone, Serialize)]
pub struct CommandOutcome {
    pub args: Vec<String>,
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
}

fn split_argv(argv: &[String]) -> Result<(&String, &[String]), ServiceError> {
    argv.split_first()
        .ok_or_else(|| ServiceError::Configuration("empty command".to_string()))
}

/// Run a command to completion and capture its output.
pub async fn run(argv: &[String]) -> Result<CommandOutcome, ServiceError> {
    let (program, rest) = split_argv(argv)?;
    debug!("running {:?}", argv);
    let output = Command::new(program)
        .args(rest)
        .output()
        .await
        .map_err(|e| ServiceError::Command {
            message: format!("Failed to execute {program}"),
            command: argv.join(" "),
            returncode: -1,
            stderr: e.to_string(),
        })?;
    Ok(CommandOutcome {
        args: argv.to_vec(),
        returncode: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Start a command without waiting for it. Used for `systemctl suspend`,
/// where the HTTP response must get out before the host goes down.
pub fn spawn_detached(argv: &[String]) -> Result<(), ServiceError> {
    let (program, rest) = split_argv(argv)?;
    debug!("spawning detached {:?}", argv);
    Command::new(program)
        .args(rest)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| ServiceError::Command {
            message: format!("Failed to start {program}"),
            command: argv.join(" "),
            returncode: -1,
            stderr: e.to_string(),
        })?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandAvailability {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Probe whether an executable can be found, for the health endpoint.
pub async fn check_command_availability(command: &str) -> CommandAvailability {
    match Command::new("which").arg(command).output().await {
        Ok(output) if output.status.success() => CommandAvailability {
            available: true,
            path: Some(String::from_utf8_lossy(&output.stdout).trim().to_string()),
            error: None,
        },
        Ok(_) => CommandAvailability {
            available: false,
            path: None,
            error: Some(format!("Command {command} not found")),
        },
        Err(e) => CommandAvailability {
            available: false,
            path: None,
            error: Some(e.to_string()),
        },
    }
}
