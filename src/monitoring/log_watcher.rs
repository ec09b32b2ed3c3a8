//! Local log file tailing
//!
//! Change notifications come from `notify` on the file's parent directory (so a
//! rotated file that is recreated is still seen); a periodic poll covers anything the
//! notifier misses.

use async_trait::async_trait;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::tail::TailCursor;
use super::watcher::LogReader;
use crate::utils::AppError;

pub struct LocalTailer {
    server: String,
    path: PathBuf,
    cursor: TailCursor,
}

impl LocalTailer {
    pub fn new(server: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            server: server.into(),
            path: path.into(),
            cursor: TailCursor::new(),
        }
    }

    fn unavailable(&self, e: std::io::Error) -> AppError {
        AppError::source_unavailable(&self.server, format!("{}: {}", self.path.display(), e))
    }
}

#[async_trait]
impl LogReader for LocalTailer {
    async fn poll(&mut self) -> Result<Vec<String>, AppError> {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            Err(e) => {
                if e.kind() == std::io::ErrorKind::NotFound {
                    self.cursor.vanished();
                }
                return Err(self.unavailable(e));
            }
        };

        let Some(range) = self.cursor.resync(metadata.len(), inode(&metadata)) else {
            return Ok(Vec::new());
        };

        let mut file = tokio::fs::File::open(&self.path)
            .await
            .map_err(|e| self.unavailable(e))?;
        file.seek(std::io::SeekFrom::Start(range.start))
            .await
            .map_err(|e| self.unavailable(e))?;

        let mut buf = Vec::with_capacity(range.len as usize);
        file.take(range.len)
            .read_to_end(&mut buf)
            .await
            .map_err(|e| self.unavailable(e))?;

        Ok(self.cursor.ingest(&buf))
    }
}

#[cfg(unix)]
fn inode(metadata: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.ino())
}

#[cfg(not(unix))]
fn inode(_metadata: &std::fs::Metadata) -> Option<u64> {
    None
}

/// Watch the parent directory of `path` and nudge the returned channel on changes
/// to that file. The watcher must be kept alive for as long as nudges are wanted.
pub fn watch_file(path: &Path) -> Option<(RecommendedWatcher, mpsc::Receiver<()>)> {
    let (tx, rx) = mpsc::channel(1);
    let file_name = path.file_name()?.to_os_string();

    let handler = move |res: Result<Event, notify::Error>| match res {
        Ok(event) => {
            if event.paths.iter().any(|p| p.file_name() == Some(file_name.as_os_str())) {
                // A full channel already holds a pending nudge
                let _ = tx.try_send(());
            }
        }
        Err(e) => warn!(error = %e, "File watcher error"),
    };

    let mut watcher = match RecommendedWatcher::new(handler, Config::default()) {
        Ok(watcher) => watcher,
        Err(e) => {
            warn!(error = %e, "Failed to create file watcher, polling only");
            return None;
        }
    };

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    if let Err(e) = watcher.watch(parent, RecursiveMode::NonRecursive) {
        warn!(error = %e, dir = %parent.display(), "Failed to watch directory, polling only");
        return None;
    }

    info!(dir = %parent.display(), "Watching directory");
    debug!(path = %path.display(), "Change notifications enabled");
    Some((watcher, rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .expect("open");
        file.write_all(text.as_bytes()).expect("write");
    }

    #[tokio::test]
    async fn should_skip_existing_content_and_return_appended_lines() {
        // Arrange
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("auth.log");
        append(&path, "old line\n");
        let mut tailer = LocalTailer::new("local", &path);

        // Act
        let initial = tailer.poll().await.expect("first poll");
        append(&path, "new line\npartial");
        let appended = tailer.poll().await.expect("second poll");

        // Assert
        assert!(initial.is_empty());
        assert_eq!(appended, vec!["new line".to_string()]);
    }

    #[tokio::test]
    async fn should_read_recreated_file_from_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("auth.log");
        append(&path, "a fairly long line that makes the old file bigger\n");
        let mut tailer = LocalTailer::new("local", &path);
        tailer.poll().await.expect("first poll");

        std::fs::remove_file(&path).expect("remove");
        append(&path, "rotated\n");
        let lines = tailer.poll().await.expect("poll after rotation");

        assert_eq!(lines, vec!["rotated".to_string()]);
    }

    #[tokio::test]
    async fn should_report_missing_file_as_unavailable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut tailer = LocalTailer::new("local", dir.path().join("missing.log"));

        let result = tailer.poll().await;

        assert!(matches!(result, Err(AppError::SourceUnavailable { ref server, .. }) if server == "local"));
    }

    #[tokio::test]
    async fn should_read_log_created_after_start_from_first_line() {
        // Arrange
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fail2ban.log");
        let mut tailer = LocalTailer::new("local", &path);
        assert!(tailer.poll().await.is_err());

        // Act
        append(&path, "2025-03-10 11:58:02,117 fail2ban.actions [1]: NOTICE [sshd] Ban 10.0.0.1\n");
        let lines = tailer.poll().await.expect("poll after creation");

        // Assert
        assert_eq!(
            lines,
            vec!["2025-03-10 11:58:02,117 fail2ban.actions [1]: NOTICE [sshd] Ban 10.0.0.1".to_string()]
        );
    }

    #[tokio::test]
    async fn should_read_file_recreated_after_a_gap_from_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("auth.log");
        append(&path, "a fairly long line that makes the old file bigger\n");
        let mut tailer = LocalTailer::new("local", &path);
        tailer.poll().await.expect("first poll");

        std::fs::remove_file(&path).expect("remove");
        assert!(tailer.poll().await.is_err());
        append(&path, "after gap\n");
        let lines = tailer.poll().await.expect("poll after recreation");

        assert_eq!(lines, vec!["after gap".to_string()]);
    }

    #[tokio::test]
    async fn should_nudge_on_file_change() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fail2ban.log");
        append(&path, "");
        let (_watcher, mut nudges) = watch_file(&path).expect("watcher");

        append(&path, "2025-03-10 11:58:02,117 fail2ban.actions [1]: NOTICE [sshd] Ban 10.0.0.1\n");

        let nudged = tokio::time::timeout(std::time::Duration::from_secs(5), nudges.recv()).await;
        assert!(matches!(nudged, Ok(Some(()))));
    }
}
