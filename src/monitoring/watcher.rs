//! Poll loop shared by local and remote watchers
//!
//! A watcher owns one `LogReader` for one (server, log source) pair. Each poll either
//! yields complete lines or fails as a whole; lines are classified, enriched and
//! forwarded in file order, and the outcome is reported to the health tracker, which
//! decides when the next poll happens.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use super::classifier::Classifier;
use super::health::{HealthTracker, PollDirective};
use super::resolver::{enrich, HostnameResolver};
use crate::event::{LogSource, SecurityEvent, ServerIdentity};
use crate::utils::AppError;

/// Source of new complete lines for one log file
#[async_trait]
pub trait LogReader: Send {
    async fn poll(&mut self) -> Result<Vec<String>, AppError>;
}

/// Collaborators handed to every watcher task
#[derive(Clone)]
pub struct WatchContext {
    pub classifier: Arc<Classifier>,
    pub resolver: Arc<dyn HostnameResolver>,
    pub health: Arc<HealthTracker>,
    pub events: mpsc::UnboundedSender<SecurityEvent>,
    pub shutdown: watch::Receiver<bool>,
}

/// Run until shutdown is signalled or the event stream closes
///
/// `nudges` lets a change notification trigger a poll before the timer expires.
#[instrument(skip_all, fields(server = %server.name, tag = %source.tag))]
pub async fn run_watcher<R: LogReader>(
    server: Arc<ServerIdentity>,
    source: LogSource,
    mut reader: R,
    mut context: WatchContext,
    mut nudges: Option<mpsc::Receiver<()>>,
) {
    let Some(mut retries) = context.health.subscribe(&server.name) else {
        warn!("Server is not tracked, watcher not started");
        return;
    };

    let source_key = source.path.display().to_string();
    info!(path = %source_key, "Watcher started");

    loop {
        if *context.shutdown.borrow() {
            break;
        }

        let directive = if context.health.is_halted(&server.name) {
            PollDirective::Halt
        } else {
            match reader.poll().await {
                Ok(lines) => {
                    if !forward(&server, &source, lines, &context).await {
                        break;
                    }
                    context.health.report_success(&server.name, &source_key)
                }
                Err(e) => {
                    debug!(error = %e, "Poll failed");
                    context.health.report_failure(&server.name, &source_key, &e)
                }
            }
        };

        let delay = match directive {
            PollDirective::Continue(delay) => Some(delay),
            PollDirective::Halt => {
                warn!("Watcher halted until operator retry");
                None
            }
        };

        if !wait(delay, &mut context.shutdown, &mut retries, nudges.as_mut()).await {
            break;
        }
    }

    info!("Watcher stopped");
}

/// Classify and forward lines in order; `false` once the event stream is gone
async fn forward(server: &Arc<ServerIdentity>, source: &LogSource, lines: Vec<String>, context: &WatchContext) -> bool {
    let observed_at = Utc::now();
    for line in lines {
        let Some(mut event) = context.classifier.classify(&line, source.tag, server, observed_at) else {
            continue;
        };
        enrich(context.resolver.as_ref(), &mut event).await;

        debug!(kind = %event.kind, subject = %event.subject, "Event classified");
        if context.events.send(event).is_err() {
            return false;
        }
    }
    true
}

/// Sleep for `delay` (forever when `None`), waking early on nudges or retries.
/// Returns `false` on shutdown.
async fn wait(
    delay: Option<Duration>,
    shutdown: &mut watch::Receiver<bool>,
    retries: &mut watch::Receiver<u64>,
    nudges: Option<&mut mpsc::Receiver<()>>,
) -> bool {
    let halted = delay.is_none();
    let sleep = async {
        match delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => std::future::pending().await,
        }
    };
    let nudge = async {
        match nudges {
            Some(rx) if !halted => {
                if rx.recv().await.is_none() {
                    std::future::pending::<()>().await;
                }
            }
            _ => std::future::pending().await,
        }
    };

    tokio::select! {
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
        _ = retries.changed() => true,
        _ = sleep => true,
        _ = nudge => true,
    }
}
