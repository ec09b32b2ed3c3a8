//! Command execution on the local host or over SSH
//!
//! Remote commands go through the OpenSSH client so the pinned `known_hosts` file,
//! batch mode and connection multiplexing are all enforced by ssh itself. One control
//! socket per server keeps a pooled connection shared by that server's watchers and
//! its action worker.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::event::{ServerIdentity, SshParams};
use crate::utils::AppError;

/// Exit status ssh uses for its own failures
const SSH_ERROR_STATUS: i32 = 255;

/// How long an idle multiplexed connection stays open
const CONTROL_PERSIST_SECS: u64 = 120;

const HOST_KEY_MARKERS: [&str; 4] = [
    "host key verification failed",
    "remote host identification has changed",
    "host key is known for",
    "no matching host key",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// `ActionFailed` for a command that ran and exited unsuccessfully, carrying its
    /// stderr verbatim (stdout when stderr is empty)
    pub fn failure(&self, what: &str) -> AppError {
        let detail = if self.stderr.is_empty() {
            self.stdout_text().trim().to_string()
        } else {
            self.stderr.clone()
        };
        let status = self
            .status
            .map(|code| code.to_string())
            .unwrap_or_else(|| "signal".to_string());
        AppError::action_failed(format!("{} failed (exit {}): {}", what, status, detail))
    }
}

/// Runs one argv on a server
///
/// Transport-level problems (spawn failure, timeout, ssh errors) come back as `Err`.
/// A command that ran and exited non-zero is `Ok` and left to the caller to judge.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        server: &ServerIdentity,
        argv: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, AppError>;
}

pub struct SystemRunner {
    control_dir: PathBuf,
    connect_timeout: Duration,
}

impl SystemRunner {
    pub fn new(control_dir: impl Into<PathBuf>, connect_timeout: Duration) -> Self {
        Self {
            control_dir: control_dir.into(),
            connect_timeout,
        }
    }

    /// Arguments passed to `ssh` for running `argv` on a remote server
    pub fn ssh_args(&self, host: &str, ssh: &SshParams, argv: &[String]) -> Vec<String> {
        let connect_timeout = self.connect_timeout.as_secs().max(1);
        let control_path = self.control_dir.join("%C");

        let mut args = vec![
            "-p".to_string(),
            ssh.port.to_string(),
            "-i".to_string(),
            ssh.key_path.display().to_string(),
            "-l".to_string(),
            ssh.user.clone(),
        ];
        let options = [
            "BatchMode=yes".to_string(),
            "IdentitiesOnly=yes".to_string(),
            "StrictHostKeyChecking=yes".to_string(),
            format!("UserKnownHostsFile={}", ssh.host_key_path.display()),
            "GlobalKnownHostsFile=/dev/null".to_string(),
            format!("ConnectTimeout={}", connect_timeout),
            "ControlMaster=auto".to_string(),
            format!("ControlPath={}", control_path.display()),
            format!("ControlPersist={}", CONTROL_PERSIST_SECS),
        ];
        for option in options {
            args.push("-o".to_string());
            args.push(option);
        }

        args.push(host.to_string());
        args.push("--".to_string());
        args.push(shell_join(argv));
        args
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    #[instrument(skip_all, fields(server = %server.name))]
    async fn run(
        &self,
        server: &ServerIdentity,
        argv: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, AppError> {
        let (program, args) = match &server.ssh {
            Some(ssh) => ("ssh".to_string(), self.ssh_args(&server.host, ssh, argv)),
            None => {
                let (program, args) = argv
                    .split_first()
                    .ok_or_else(|| AppError::internal_error("empty command"))?;
                (program.clone(), args.to_vec())
            }
        };

        debug!(command = %shell_join(argv), "Running command");

        let mut command = Command::new(&program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(AppError::source_unavailable(
                    &server.name,
                    format!("failed to start {}: {}", program, e),
                ))
            }
            Err(_) => {
                return Err(AppError::source_unavailable(
                    &server.name,
                    format!("command timed out after {}s", timeout.as_secs()),
                ))
            }
        };

        let output = CommandOutput {
            status: output.status.code(),
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        };

        if !server.is_local() && output.status == Some(SSH_ERROR_STATUS) {
            return Err(classify_ssh_failure(&server.name, &output.stderr));
        }

        Ok(output)
    }
}

/// Map an ssh-level failure (exit 255) to the error taxonomy
pub fn classify_ssh_failure(server: &str, stderr: &str) -> AppError {
    let lowered = stderr.to_lowercase();
    let reason = if stderr.is_empty() {
        "ssh exited with status 255".to_string()
    } else {
        stderr.lines().last().unwrap_or(stderr).to_string()
    };

    if HOST_KEY_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        AppError::trust_violation(server, reason)
    } else {
        AppError::source_unavailable(server, reason)
    }
}

/// Quote arguments for the remote POSIX shell
pub fn shell_join(argv: &[String]) -> String {
    argv.iter().map(|arg| shell_quote(arg)).collect::<Vec<_>>().join(" ")
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,%@+".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
