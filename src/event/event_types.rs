//! Security event structure shared by watchers, health tracking and notification

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use super::identity::ServerIdentity;

/// Kinds of security events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SshLoginSuccess,
    SshLoginFailure,
    Fail2banBan,
    Fail2banUnban,
    ServerUnreachable,
    ServerReachable,
}

impl EventKind {
    /// Health transitions are only delivered to admins
    pub fn is_admin_only(&self) -> bool {
        matches!(self, EventKind::ServerUnreachable | EventKind::ServerReachable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SshLoginSuccess => "ssh_login_success",
            EventKind::SshLoginFailure => "ssh_login_failure",
            EventKind::Fail2banBan => "fail2ban_ban",
            EventKind::Fail2banUnban => "fail2ban_unban",
            EventKind::ServerUnreachable => "server_unreachable",
            EventKind::ServerReachable => "server_reachable",
        }
    }

    /// Default severity of the kind
    pub fn default_severity(&self) -> Severity {
        match self {
            EventKind::SshLoginSuccess => Severity::Warning,
            EventKind::SshLoginFailure => Severity::Info,
            EventKind::Fail2banBan => Severity::Warning,
            EventKind::Fail2banUnban => Severity::Info,
            EventKind::ServerUnreachable => Severity::Warning,
            EventKind::ServerReachable => Severity::Info,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info = 0,
    Warning = 1,
    /// Bypasses mute windows
    Critical = 2,
}

/// A classified security event
///
/// Immutable once built, apart from the optional hostname enrichment applied
/// by the watcher before the event leaves it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEvent {
    pub id: Uuid,
    pub kind: EventKind,
    pub server: Arc<ServerIdentity>,
    /// Time parsed from the log line, or the observation time
    pub timestamp: DateTime<Utc>,
    pub observed_at: DateTime<Utc>,
    /// Source IP for login and fail2ban events, server name for health events
    pub subject: String,
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub jail: Option<String>,
    pub severity: Severity,
    /// Original log line, or the failure reason for health events
    pub raw_line: String,
}

impl SecurityEvent {
    pub fn new(
        kind: EventKind,
        server: Arc<ServerIdentity>,
        subject: impl Into<String>,
        raw_line: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            server,
            timestamp: now,
            observed_at: now,
            subject: subject.into(),
            hostname: None,
            user: None,
            jail: None,
            severity: kind.default_severity(),
            raw_line: raw_line.into(),
        }
    }

    /// Health transition event for a server
    pub fn health(kind: EventKind, server: Arc<ServerIdentity>, reason: impl Into<String>) -> Self {
        let subject = server.name.clone();
        Self::new(kind, server, subject, reason)
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_observed_at(mut self, observed_at: DateTime<Utc>) -> Self {
        self.observed_at = observed_at;
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_jail(mut self, jail: impl Into<String>) -> Self {
        self.jail = Some(jail.into());
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn server_name(&self) -> &str {
        &self.server.name
    }

    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }
}
