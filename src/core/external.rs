//! Capability-scoped broker for external commands.
//!
//! Every subprocess the daemon launches (git, the assistant CLI) goes
//! through here: the binary must match the capability's allowlist, and
//! every invocation is appended to `external.events.jsonl` in the config
//! directory for a full audit trail of what touched the operator's
//! repositories.

use crate::core::error::MagpieError;
use crate::core::schemas;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};
use ulid::Ulid;

pub const ASSISTANT_BIN: &str = "claude";
pub const VCS_BIN: &str = "git";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExternalCapability {
    VcsRead,
    VcsWrite,
    AssistantExec,
}

impl ExternalCapability {
    fn as_str(self) -> &'static str {
        match self {
            ExternalCapability::VcsRead => "vcs_read",
            ExternalCapability::VcsWrite => "vcs_write",
            ExternalCapability::AssistantExec => "assistant_exec",
        }
    }

    fn allowed_bin(self) -> &'static str {
        match self {
            ExternalCapability::VcsRead | ExternalCapability::VcsWrite => VCS_BIN,
            ExternalCapability::AssistantExec => ASSISTANT_BIN,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ExternalEvent {
    ts: String,
    event_id: String,
    capability: String,
    scope: String,
    command: String,
    args: Vec<String>,
    cwd: String,
    status: String,
    exit_code: Option<i32>,
}

fn events_path(config_root: &Path) -> PathBuf {
    config_root.join(schemas::EXTERNAL_EVENTS_NAME)
}

fn log_event(config_root: &Path, event: &ExternalEvent) -> Result<(), MagpieError> {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(events_path(config_root))?;
    writeln!(f, "{}", serde_json::to_string(event).unwrap())?;
    Ok(())
}

fn not_found_error(capability: ExternalCapability, command: &str) -> MagpieError {
    match capability {
        ExternalCapability::AssistantExec => MagpieError::AssistantNotFound(command.to_string()),
        _ => MagpieError::VcsNotFound,
    }
}

fn check_allowed(capability: ExternalCapability, command: &str) -> Result<(), MagpieError> {
    let bin = Path::new(command)
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| command.to_string());
    if bin != capability.allowed_bin() {
        return Err(MagpieError::Fatal(format!(
            "external action denied: capability '{}' does not allow binary '{}'",
            capability.as_str(),
            bin
        )));
    }
    Ok(())
}

/// Run an allowed external command to completion, capturing output.
pub fn execute(
    config_root: &Path,
    capability: ExternalCapability,
    scope: &str,
    command: &str,
    args: &[&str],
    cwd: &Path,
) -> Result<Output, MagpieError> {
    check_allowed(capability, command)?;

    let result = Command::new(command)
        .args(args)
        .current_dir(cwd)
        .output();
    let output = match result {
        Ok(o) => o,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(not_found_error(capability, command));
        }
        Err(e) => return Err(MagpieError::Io(e)),
    };

    let event = ExternalEvent {
        ts: chrono::Utc::now().to_rfc3339(),
        event_id: Ulid::new().to_string(),
        capability: capability.as_str().to_string(),
        scope: scope.to_string(),
        command: command.to_string(),
        args: args.iter().map(|s| s.to_string()).collect(),
        cwd: cwd.to_string_lossy().to_string(),
        status: if output.status.success() {
            "success".to_string()
        } else {
            "error".to_string()
        },
        exit_code: output.status.code(),
    };
    let _ = log_event(config_root, &event);

    Ok(output)
}

#[derive(Debug)]
pub struct TimedOutput {
    pub output: Output,
    pub timed_out: bool,
    pub duration: Duration,
}

/// Like [`execute`] but with a hard wall-clock cap; on expiry the child is
/// killed and whatever output was collected so far is returned with
/// `timed_out` set.
pub fn execute_with_timeout(
    config_root: &Path,
    capability: ExternalCapability,
    scope: &str,
    command: &str,
    args: &[&str],
    cwd: &Path,
    timeout: Duration,
) -> Result<TimedOutput, MagpieError> {
    check_allowed(capability, command)?;

    let started = Instant::now();
    let spawn = Command::new(command)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();
    let mut child = match spawn {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(not_found_error(capability, command));
        }
        Err(e) => return Err(MagpieError::Io(e)),
    };

    let mut timed_out = false;
    loop {
        match child.try_wait()? {
            Some(_) => break,
            None => {
                if started.elapsed() >= timeout {
                    let _ = child.kill();
                    timed_out = true;
                    break;
                }
                std::thread::sleep(Duration::from_millis(250));
            }
        }
    }
    let output = child.wait_with_output()?;
    let duration = started.elapsed();

    let event = ExternalEvent {
        ts: chrono::Utc::now().to_rfc3339(),
        event_id: Ulid::new().to_string(),
        capability: capability.as_str().to_string(),
        scope: scope.to_string(),
        command: command.to_string(),
        args: args.iter().map(|s| s.to_string()).collect(),
        cwd: cwd.to_string_lossy().to_string(),
        status: if timed_out {
            "timeout".to_string()
        } else if output.status.success() {
            "success".to_string()
        } else {
            "error".to_string()
        },
        exit_code: output.status.code(),
    };
    let _ = log_event(config_root, &event);

    Ok(TimedOutput {
        output,
        timed_out,
        duration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disallowed_binary_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let err = execute(
            tmp.path(),
            ExternalCapability::VcsRead,
            "test",
            "rm",
            &["-rf", "/"],
            tmp.path(),
        )
        .unwrap_err();
        assert!(matches!(err, MagpieError::Fatal(_)));
    }

    #[test]
    fn git_invocation_logs_event() {
        let tmp = tempfile::tempdir().unwrap();
        let out = execute(
            tmp.path(),
            ExternalCapability::VcsRead,
            "test.version",
            "git",
            &["--version"],
            tmp.path(),
        )
        .unwrap();
        assert!(out.status.success());
        let events = std::fs::read_to_string(events_path(tmp.path())).unwrap();
        assert!(events.contains("\"capability\":\"vcs_read\""));
        assert!(events.contains("\"scope\":\"test.version\""));
    }
}
