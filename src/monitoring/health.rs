//! Per-server connectivity state machine
//!
//! Watchers (and the action executor) report every poll outcome here. The tracker is
//! the only writer of health state: it decides when a server counts as unreachable,
//! emits exactly one transition event per state change, and tells the reporting
//! watcher how long to wait before its next attempt.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::config::GeneralConfig;
use crate::event::{EventKind, SecurityEvent, ServerIdentity, Severity};
use crate::utils::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Reachable,
    Reconnecting,
    /// Halted after a trust violation until an operator retries
    Unreachable,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Reachable => "reachable",
            HealthState::Reconnecting => "reconnecting",
            HealthState::Unreachable => "unreachable",
        }
    }
}

/// What a watcher should do after reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDirective {
    /// Poll again after the delay
    Continue(Duration),
    /// Stop until woken by an operator retry
    Halt,
}

#[derive(Debug, Clone, Copy)]
pub struct HealthSettings {
    pub failure_threshold: u32,
    pub base_interval: Duration,
    pub max_backoff: Duration,
}

impl From<&GeneralConfig> for HealthSettings {
    fn from(general: &GeneralConfig) -> Self {
        Self {
            failure_threshold: general.failure_threshold.max(1),
            base_interval: general.poll_interval(),
            max_backoff: general.max_backoff().max(general.poll_interval()),
        }
    }
}

/// Failure streak of one log source (or the action worker) of a server
#[derive(Debug, Clone)]
struct SourceFailures {
    count: u32,
    backoff: Duration,
}

#[derive(Debug, Clone)]
struct ServerHealthState {
    state: HealthState,
    last_success: Option<DateTime<Utc>>,
    last_error: Option<String>,
    /// Sources whose last poll failed, keyed by source
    failing: BTreeMap<String, SourceFailures>,
}

impl ServerHealthState {
    fn is_failing(&self, threshold: u32) -> bool {
        self.failing.values().any(|source| source.count >= threshold)
    }
}

/// Read-only view handed to the command router
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub server: String,
    pub state: HealthState,
    /// Longest failure streak among the server's sources
    pub consecutive_failures: u32,
    pub failing_sources: Vec<String>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub backoff_secs: u64,
}

struct Entry {
    identity: Arc<ServerIdentity>,
    health: ServerHealthState,
    wake: watch::Sender<u64>,
}

impl Entry {
    fn snapshot(&self, base_interval: Duration) -> HealthSnapshot {
        let failing = &self.health.failing;
        HealthSnapshot {
            server: self.identity.name.clone(),
            state: self.health.state,
            consecutive_failures: failing.values().map(|f| f.count).max().unwrap_or(0),
            failing_sources: failing.keys().cloned().collect(),
            last_success: self.health.last_success,
            last_error: self.health.last_error.clone(),
            backoff_secs: failing
                .values()
                .map(|f| f.backoff)
                .max()
                .unwrap_or(base_interval)
                .as_secs(),
        }
    }
}

pub struct HealthTracker {
    settings: HealthSettings,
    servers: RwLock<BTreeMap<String, Entry>>,
    events: mpsc::UnboundedSender<SecurityEvent>,
}

impl HealthTracker {
    pub fn new(
        identities: &[Arc<ServerIdentity>],
        settings: HealthSettings,
        events: mpsc::UnboundedSender<SecurityEvent>,
    ) -> Self {
        let servers = identities
            .iter()
            .map(|identity| {
                let (wake, _) = watch::channel(0);
                let entry = Entry {
                    identity: Arc::clone(identity),
                    health: ServerHealthState {
                        state: HealthState::Reachable,
                        last_success: None,
                        last_error: None,
                        failing: BTreeMap::new(),
                    },
                    wake,
                };
                (identity.name.clone(), entry)
            })
            .collect();

        Self {
            settings,
            servers: RwLock::new(servers),
            events,
        }
    }

    /// Record a successful poll of `source`
    ///
    /// A reconnecting server only counts as reachable again once none of its sources
    /// is still over the failure threshold.
    pub fn report_success(&self, server: &str, source: &str) -> PollDirective {
        let mut servers = self.servers.write().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = servers.get_mut(server) else {
            return PollDirective::Continue(self.settings.base_interval);
        };

        let health = &mut entry.health;
        if health.state == HealthState::Unreachable {
            return PollDirective::Halt;
        }

        health.last_success = Some(Utc::now());
        health.failing.remove(source);
        if health.failing.is_empty() {
            health.last_error = None;
        }

        if health.state == HealthState::Reconnecting && !health.is_failing(self.settings.failure_threshold) {
            health.state = HealthState::Reachable;
            info!(server, source, "Server reachable again");
            self.emit(SecurityEvent::health(
                EventKind::ServerReachable,
                Arc::clone(&entry.identity),
                "connection restored",
            ));
        }

        PollDirective::Continue(self.settings.base_interval)
    }

    /// Record a failed poll of `source` or a failed action
    pub fn report_failure(&self, server: &str, source: &str, failure: &AppError) -> PollDirective {
        let mut servers = self.servers.write().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = servers.get_mut(server) else {
            return PollDirective::Continue(self.settings.base_interval);
        };

        let health = &mut entry.health;
        health.last_error = Some(failure.to_string());

        if health.state == HealthState::Unreachable {
            return PollDirective::Halt;
        }

        if failure.is_trust_violation() {
            health.state = HealthState::Unreachable;
            error!(server, reason = %failure, "Host key verification failed, monitoring halted");
            self.emit(
                SecurityEvent::health(
                    EventKind::ServerUnreachable,
                    Arc::clone(&entry.identity),
                    failure.to_string(),
                )
                .with_severity(Severity::Critical),
            );
            return PollDirective::Halt;
        }

        let settings = self.settings;
        let streak = health
            .failing
            .entry(source.to_string())
            .or_insert(SourceFailures {
                count: 0,
                backoff: settings.base_interval,
            });
        streak.count = streak.count.saturating_add(1);

        if streak.count < settings.failure_threshold {
            return PollDirective::Continue(settings.base_interval);
        }

        streak.backoff = if streak.count == settings.failure_threshold {
            settings.base_interval
        } else {
            streak.backoff.saturating_mul(2).min(settings.max_backoff)
        };
        let backoff = streak.backoff;

        if health.state == HealthState::Reachable {
            health.state = HealthState::Reconnecting;
            warn!(
                server,
                source,
                failures = settings.failure_threshold,
                reason = %failure,
                "Server unreachable, reconnecting"
            );
            self.emit(SecurityEvent::health(
                EventKind::ServerUnreachable,
                Arc::clone(&entry.identity),
                failure.to_string(),
            ));
        }

        PollDirective::Continue(backoff)
    }

    /// Operator retry of a server: clears a trust halt and wakes its watchers
    pub fn retry(&self, server: &str) -> Result<HealthSnapshot, AppError> {
        let mut servers = self.servers.write().unwrap_or_else(PoisonError::into_inner);
        let entry = servers
            .get_mut(server)
            .ok_or_else(|| AppError::not_found(format!("Unknown server: {}", server)))?;

        if entry.health.state == HealthState::Unreachable {
            entry.health.state = HealthState::Reconnecting;
            info!(server, "Operator retry, leaving halted state");
        }
        entry.wake.send_modify(|generation| *generation += 1);

        Ok(entry.snapshot(self.settings.base_interval))
    }

    /// Retry wake-ups for the watchers of a server
    pub fn subscribe(&self, server: &str) -> Option<watch::Receiver<u64>> {
        let servers = self.servers.read().unwrap_or_else(PoisonError::into_inner);
        servers.get(server).map(|entry| entry.wake.subscribe())
    }

    pub fn is_halted(&self, server: &str) -> bool {
        let servers = self.servers.read().unwrap_or_else(PoisonError::into_inner);
        servers
            .get(server)
            .is_some_and(|entry| entry.health.state == HealthState::Unreachable)
    }

    pub fn snapshot(&self, server: &str) -> Option<HealthSnapshot> {
        let servers = self.servers.read().unwrap_or_else(PoisonError::into_inner);
        servers
            .get(server)
            .map(|entry| entry.snapshot(self.settings.base_interval))
    }

    pub fn snapshots(&self) -> Vec<HealthSnapshot> {
        let servers = self.servers.read().unwrap_or_else(PoisonError::into_inner);
        servers
            .values()
            .map(|entry| entry.snapshot(self.settings.base_interval))
            .collect()
    }

    // Called with the write lock held so transitions of one server reach the
    // dispatcher in the order they happened.
    fn emit(&self, event: SecurityEvent) {
        if self.events.send(event).is_err() {
            warn!("Event stream closed, dropping health transition");
        }
    }
}
