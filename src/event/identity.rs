//! Server identities and their monitored log sources

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Name of the distinguished local host identity
pub const LOCAL_SERVER: &str = "local";

/// Grammar family of a monitored log file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogTag {
    Ssh,
    Fail2ban,
    Audit,
}

impl fmt::Display for LogTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogTag::Ssh => "ssh",
            LogTag::Fail2ban => "fail2ban",
            LogTag::Audit => "audit",
        };
        f.write_str(s)
    }
}

/// One tagged log file on a server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSource {
    pub tag: LogTag,
    pub path: PathBuf,
}

impl LogSource {
    pub fn new(tag: LogTag, path: impl Into<PathBuf>) -> Self {
        Self {
            tag,
            path: path.into(),
        }
    }
}

/// SSH connection parameters of a remote server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshParams {
    pub user: String,
    pub key_path: PathBuf,
    pub port: u16,
    /// known_hosts file holding the pinned host key of this server only
    pub host_key_path: PathBuf,
}

/// Immutable description of a monitored server
///
/// Built once from configuration and shared behind `Arc` for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIdentity {
    pub name: String,
    pub host: String,
    /// `None` for the local host
    pub ssh: Option<SshParams>,
    pub logs: Vec<LogSource>,
    /// Prefix fail2ban-client with `sudo -n`
    pub use_sudo: bool,
}

impl ServerIdentity {
    /// The local host identity
    pub fn local(logs: Vec<LogSource>, use_sudo: bool) -> Self {
        Self {
            name: LOCAL_SERVER.to_string(),
            host: "localhost".to_string(),
            ssh: None,
            logs,
            use_sudo,
        }
    }

    pub fn remote(
        name: impl Into<String>,
        host: impl Into<String>,
        ssh: SshParams,
        logs: Vec<LogSource>,
        use_sudo: bool,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            ssh: Some(ssh),
            logs,
            use_sudo,
        }
    }

    pub fn is_local(&self) -> bool {
        self.ssh.is_none()
    }
}
