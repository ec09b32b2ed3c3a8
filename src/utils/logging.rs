//! Logging initialisation
//!
//! Structured JSON logs on stdout, mirrored to a daily rolling file when
//! `general.log_dir` is configured.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::GeneralConfig;

const LOG_FILE_PREFIX: &str = "securewatch.log";

/// Initialise the tracing subscriber from the `[general]` settings.
///
/// `RUST_LOG` overrides `log_level`. With `log_dir` set, lines also go to
/// `<log_dir>/securewatch.log.YYYY-MM-DD`; keep the returned guard alive in `main`
/// or buffered file lines are lost on exit.
pub fn init_logging(general: &GeneralConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(&general.log_level)));

    let (file_writer, guard) = match general.log_dir.as_deref().map(daily_file) {
        Some(Ok((writer, guard))) => (Some(writer), Some(guard)),
        Some(Err(err)) => {
            eprintln!("securewatch: logging to stdout only: {}", err);
            (None, None)
        }
        None => (None, None),
    };

    let stdout_layer = fmt::layer()
        .json()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_current_span(true);

    let file_layer = file_writer.map(|writer| {
        fmt::layer()
            .json()
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_current_span(true)
            .with_ansi(false)
            .with_writer(writer)
    });

    if let Err(err) = tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
    {
        // A second init (tests, embedding) keeps the first subscriber
        eprintln!("securewatch: tracing not initialised: {}", err);
    }

    guard
}

fn daily_file(
    dir: &Path,
) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard), tracing_appender::rolling::InitError> {
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .build(dir)?;
    Ok(tracing_appender::non_blocking(appender))
}

/// Filter used when `RUST_LOG` is unset: `level` for everything, this crate included
fn default_directive(level: &str) -> String {
    format!("{0},securewatch={0}", level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_apply_configured_level_to_crate_and_dependencies() {
        assert_eq!(default_directive("debug"), "debug,securewatch=debug");
    }

    #[test]
    fn should_skip_file_output_without_log_dir() {
        // Arrange
        let general = GeneralConfig {
            log_dir: None,
            ..GeneralConfig::default()
        };

        // Act
        let guard = init_logging(&general);

        // Assert
        assert!(guard.is_none());
    }

    #[test]
    fn should_write_daily_file_into_configured_directory() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let general = GeneralConfig {
            log_dir: Some(dir.path().to_path_buf()),
            ..GeneralConfig::default()
        };

        // Act
        let guard = init_logging(&general);

        // Assert
        assert!(guard.is_some());
    }
}
