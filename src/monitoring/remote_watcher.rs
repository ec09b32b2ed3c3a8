//! Remote log polling over SSH
//!
//! Each poll asks the remote host for the file's size and inode, then reads only the
//! byte range the cursor has not seen yet. Both commands run through the server's
//! multiplexed ssh connection.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::tail::{ReadRange, TailCursor};
use super::watcher::LogReader;
use crate::action::{CommandOutput, CommandRunner};
use crate::event::ServerIdentity;
use crate::utils::AppError;

pub struct RemoteTailer {
    server: Arc<ServerIdentity>,
    path: PathBuf,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
    cursor: TailCursor,
}

impl RemoteTailer {
    pub fn new(
        server: Arc<ServerIdentity>,
        path: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
        timeout: Duration,
    ) -> Self {
        Self {
            server,
            path: path.into(),
            runner,
            timeout,
            cursor: TailCursor::new(),
        }
    }

    fn stat_argv(&self) -> Vec<String> {
        vec![
            "stat".to_string(),
            "-L".to_string(),
            "-c".to_string(),
            "%s:%i".to_string(),
            self.path.display().to_string(),
        ]
    }

    fn read_argv(&self, range: ReadRange) -> Vec<String> {
        vec![
            "dd".to_string(),
            format!("if={}", self.path.display()),
            "bs=65536".to_string(),
            "iflag=skip_bytes,count_bytes".to_string(),
            format!("skip={}", range.start),
            format!("count={}", range.len),
            "status=none".to_string(),
        ]
    }

    async fn run(&self, argv: &[String]) -> Result<CommandOutput, AppError> {
        let output = self.runner.run(&self.server, argv, self.timeout).await?;
        if !output.success() {
            let reason = if output.stderr.is_empty() {
                let program = argv.first().map(String::as_str).unwrap_or("command");
                format!("{} exited with {:?}", program, output.status)
            } else {
                output.stderr.clone()
            };
            return Err(AppError::source_unavailable(&self.server.name, reason));
        }
        Ok(output)
    }
}

#[async_trait]
impl LogReader for RemoteTailer {
    async fn poll(&mut self) -> Result<Vec<String>, AppError> {
        let stat = match self.run(&self.stat_argv()).await {
            Ok(stat) => stat,
            Err(e) => {
                if is_missing_file(&e) {
                    self.cursor.vanished();
                }
                return Err(e);
            }
        };
        let (size, inode) = parse_stat(&stat.stdout_text()).ok_or_else(|| {
            AppError::source_unavailable(
                &self.server.name,
                format!("unexpected stat output for {}", self.path.display()),
            )
        })?;

        let Some(range) = self.cursor.resync(size, Some(inode)) else {
            return Ok(Vec::new());
        };

        let data = self.run(&self.read_argv(range)).await?;
        let mut bytes = data.stdout;
        bytes.truncate(range.len as usize);

        Ok(self.cursor.ingest(&bytes))
    }
}

/// `stat` ran but the file does not exist (as opposed to ssh failing)
fn is_missing_file(error: &AppError) -> bool {
    matches!(error, AppError::SourceUnavailable { reason, .. } if reason.contains("No such file or directory"))
}

/// Parse `SIZE:INODE`
fn parse_stat(output: &str) -> Option<(u64, u64)> {
    let (size, inode) = output.trim().split_once(':')?;
    Some((size.parse().ok()?, inode.parse().ok()?))
}
