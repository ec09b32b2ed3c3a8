//! Monitor configuration (servers, recipients, notification tunables)
//!
//! Deserialised from TOML. Only structural checks happen here; the rest of the
//! crate treats a loaded `MonitorConfig` as already validated.

use serde::{Deserialize, Deserializer};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::ConfigError;
use crate::event::{EventKind, LogSource, LogTag, ServerIdentity, SshParams};

/// Upper bound for `/mute` durations
pub const MAX_MUTE_MINUTES: u64 = 1440;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub general: GeneralConfig,
    pub recipients: RecipientsConfig,
    pub notifications: NotificationToggles,
    pub customization: CustomizationConfig,
    pub local: LocalConfig,
    pub servers: BTreeMap<String, RemoteServerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Ignore `[servers]` and monitor only this host
    pub local_only: bool,
    /// Minimum delay between two notifications to the same recipient
    pub notification_delay_secs: u64,
    pub mute_default_minutes: u64,
    /// Consecutive failures before a server is reported unreachable
    pub failure_threshold: u32,
    pub poll_interval_secs: u64,
    pub max_backoff_secs: u64,
    /// Timeout for every remote operation (poll, action)
    pub command_timeout_secs: u64,
    /// Directory for OpenSSH control sockets
    pub ssh_control_dir: PathBuf,
    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Directory of the daily rolling log file; unset logs to stdout only
    pub log_dir: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            local_only: false,
            notification_delay_secs: 10,
            mute_default_minutes: 30,
            failure_threshold: 3,
            poll_interval_secs: 10,
            max_backoff_secs: 300,
            command_timeout_secs: 30,
            ssh_control_dir: PathBuf::from("/run/securewatch/ssh"),
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl GeneralConfig {
    pub fn notification_delay(&self) -> Duration {
        Duration::from_secs(self.notification_delay_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn mute_default(&self) -> Duration {
        Duration::from_secs(self.mute_default_minutes.min(MAX_MUTE_MINUTES) * 60)
    }
}

/// Chat identities allowed to talk to the bot
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RecipientsConfig {
    #[serde(deserialize_with = "deserialize_ids")]
    pub admins: Vec<String>,
    #[serde(deserialize_with = "deserialize_ids")]
    pub viewers: Vec<String>,
}

/// Per-kind notification switches
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationToggles {
    pub ssh_login: bool,
    pub ssh_login_failure: bool,
    pub fail2ban_ban: bool,
    pub fail2ban_unban: bool,
    /// Both reachable and unreachable transitions
    pub server_status: bool,
}

impl Default for NotificationToggles {
    fn default() -> Self {
        Self {
            ssh_login: true,
            ssh_login_failure: false,
            fail2ban_ban: true,
            fail2ban_unban: false,
            server_status: true,
        }
    }
}

impl NotificationToggles {
    pub fn allows(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::SshLoginSuccess => self.ssh_login,
            EventKind::SshLoginFailure => self.ssh_login_failure,
            EventKind::Fail2banBan => self.fail2ban_ban,
            EventKind::Fail2banUnban => self.fail2ban_unban,
            EventKind::ServerUnreachable | EventKind::ServerReachable => self.server_status,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CustomizationConfig {
    /// chrono format string for event times
    pub date_format: String,
    pub resolve_hostnames: bool,
    pub resolve_timeout_ms: u64,
    pub show_ipinfo_link: bool,
}

impl Default for CustomizationConfig {
    fn default() -> Self {
        Self {
            date_format: "%Y-%m-%d %H:%M:%S".to_string(),
            resolve_hostnames: true,
            resolve_timeout_ms: 1500,
            show_ipinfo_link: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogPaths {
    pub ssh: Option<PathBuf>,
    pub fail2ban: Option<PathBuf>,
    pub audit: Option<PathBuf>,
}

impl LogPaths {
    fn sources(&self) -> Vec<LogSource> {
        [
            (LogTag::Ssh, &self.ssh),
            (LogTag::Fail2ban, &self.fail2ban),
            (LogTag::Audit, &self.audit),
        ]
        .into_iter()
        .filter_map(|(tag, path)| path.as_ref().map(|p| LogSource::new(tag, p.clone())))
        .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    #[serde(flatten)]
    pub logs: LogPaths,
    pub use_sudo: bool,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            logs: LogPaths {
                ssh: Some(PathBuf::from("/var/log/auth.log")),
                fail2ban: Some(PathBuf::from("/var/log/fail2ban.log")),
                audit: None,
            },
            use_sudo: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteServerConfig {
    pub host: String,
    pub ssh_user: String,
    pub ssh_key_path: PathBuf,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    pub host_key_path: PathBuf,
    #[serde(default = "default_true")]
    pub use_sudo: bool,
    #[serde(default)]
    pub logs: LogPaths,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_true() -> bool {
    true
}

/// Accept both `123` and `"123"` for chat identities
fn deserialize_ids<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Int(i64),
        Str(String),
    }

    let ids = Vec::<Id>::deserialize(deserializer)?;
    Ok(ids
        .into_iter()
        .map(|id| match id {
            Id::Int(n) => n.to_string(),
            Id::Str(s) => s.trim().to_string(),
        })
        .collect())
}

impl MonitorConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: MonitorConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.recipients.admins.is_empty() && self.recipients.viewers.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one admin or viewer is required".to_string(),
            ));
        }

        let admins: HashSet<&String> = self.recipients.admins.iter().collect();
        if let Some(both) = self.recipients.viewers.iter().find(|v| admins.contains(v)) {
            return Err(ConfigError::Invalid(format!(
                "recipient {} is listed as both admin and viewer",
                both
            )));
        }

        if self.general.poll_interval_secs == 0 || self.general.command_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_secs and command_timeout_secs must be positive".to_string(),
            ));
        }

        if self.general.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "failure_threshold must be at least 1".to_string(),
            ));
        }

        if self.servers.contains_key(crate::event::LOCAL_SERVER) {
            return Err(ConfigError::Invalid(format!(
                "server name '{}' is reserved for this host",
                crate::event::LOCAL_SERVER
            )));
        }

        Ok(())
    }

    /// Identities of every monitored server, local host first
    pub fn identities(&self) -> Vec<Arc<ServerIdentity>> {
        let mut identities = vec![Arc::new(ServerIdentity::local(
            self.local.logs.sources(),
            self.local.use_sudo,
        ))];

        if self.general.local_only {
            return identities;
        }

        identities.extend(self.servers.iter().map(|(name, server)| {
            Arc::new(ServerIdentity::remote(
                name.clone(),
                server.host.clone(),
                SshParams {
                    user: server.ssh_user.clone(),
                    key_path: server.ssh_key_path.clone(),
                    port: server.ssh_port,
                    host_key_path: server.host_key_path.clone(),
                },
                server.logs.sources(),
                server.use_sudo,
            ))
        }));

        identities
    }
}
