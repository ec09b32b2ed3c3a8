//! Read-only host inspection: service state, uptime, load, memory, disk and the
//! accepted-login lines of an auth log
//!
//! Queries go through the same per-server queue as fail2ban actions, so they share
//! the server's ssh connection and never overlap with a ban on that host.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

use super::fail2ban::validate_name;
use super::runner::CommandOutput;
use crate::utils::AppError;

/// Services whose state `/status` and `/server status` report
pub const WATCHED_SERVICES: [&str; 2] = ["fail2ban", "ssh"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostQuery {
    ServiceState { service: String },
    Uptime,
    LoadAverage,
    Memory,
    RootDisk,
    /// Every `Accepted ...` line of an sshd log
    AcceptedLogins { path: PathBuf },
}

impl HostQuery {
    pub fn name(&self) -> &'static str {
        match self {
            HostQuery::ServiceState { .. } => "service_state",
            HostQuery::Uptime => "uptime",
            HostQuery::LoadAverage => "load_average",
            HostQuery::Memory => "memory",
            HostQuery::RootDisk => "root_disk",
            HostQuery::AcceptedLogins { .. } => "accepted_logins",
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        match self {
            HostQuery::ServiceState { service } => validate_name("service name", service),
            HostQuery::AcceptedLogins { path } if !path.is_absolute() => Err(AppError::bad_request(
                format!("Log path must be absolute: {}", path.display()),
            )),
            _ => Ok(()),
        }
    }

    pub fn argv(&self) -> Vec<String> {
        match self {
            HostQuery::ServiceState { service } => {
                vec!["systemctl".into(), "is-active".into(), service.clone()]
            }
            HostQuery::Uptime => vec!["uptime".into(), "-p".into()],
            HostQuery::LoadAverage => vec!["cat".into(), "/proc/loadavg".into()],
            HostQuery::Memory => vec!["free".into(), "-h".into()],
            HostQuery::RootDisk => vec!["df".into(), "-P".into(), "-h".into(), "/".into()],
            HostQuery::AcceptedLogins { path } => vec![
                "grep".into(),
                "-a".into(),
                "--".into(),
                "Accepted".into(),
                path.display().to_string(),
            ],
        }
    }
}

impl fmt::Display for HostQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostQuery::ServiceState { service } => write!(f, "state of service {}", service),
            HostQuery::AcceptedLogins { path } => write!(f, "accepted logins in {}", path.display()),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostReport {
    Service { service: String, state: String },
    Uptime { text: String },
    Load { one: String, five: String, fifteen: String },
    Memory { used: String, total: String },
    Disk { used: String, total: String, percent: String },
    Lines { lines: Vec<String> },
}

impl HostReport {
    /// `true` for a service reported as `active`
    pub fn is_active(&self) -> bool {
        matches!(self, HostReport::Service { state, .. } if state == "active")
    }
}

/// Interpret the output of `query`
///
/// `systemctl is-active` exits non-zero for any state but `active`, and grep exits 1
/// when nothing matched; both are answers rather than failures.
pub fn parse_host_output(query: &HostQuery, output: &CommandOutput) -> Result<HostReport, AppError> {
    let stdout = output.stdout_text();

    match query {
        HostQuery::ServiceState { service } => {
            if output.status.is_none() {
                return Err(output.failure(query.name()));
            }
            let state = match stdout.lines().next().map(str::trim) {
                Some(state) if !state.is_empty() => state.to_string(),
                _ => "unknown".to_string(),
            };
            Ok(HostReport::Service {
                service: service.clone(),
                state,
            })
        }
        HostQuery::AcceptedLogins { .. } => match output.status {
            Some(0) => Ok(HostReport::Lines {
                lines: stdout
                    .lines()
                    .filter(|line| !line.trim().is_empty())
                    .map(str::to_string)
                    .collect(),
            }),
            Some(1) => Ok(HostReport::Lines { lines: Vec::new() }),
            _ => Err(output.failure(query.name())),
        },
        _ if !output.success() => Err(output.failure(query.name())),
        HostQuery::Uptime => {
            let text = stdout.trim();
            if text.is_empty() {
                return Err(malformed(query));
            }
            Ok(HostReport::Uptime {
                text: text.strip_prefix("up ").unwrap_or(text).to_string(),
            })
        }
        HostQuery::LoadAverage => match stdout.split_whitespace().collect::<Vec<_>>()[..] {
            [one, five, fifteen, ..] => Ok(HostReport::Load {
                one: one.to_string(),
                five: five.to_string(),
                fifteen: fifteen.to_string(),
            }),
            _ => Err(malformed(query)),
        },
        HostQuery::Memory => {
            let row = stdout
                .lines()
                .find(|line| line.starts_with("Mem:"))
                .ok_or_else(|| malformed(query))?;
            match row.split_whitespace().collect::<Vec<_>>()[..] {
                [_, total, used, ..] => Ok(HostReport::Memory {
                    used: used.to_string(),
                    total: total.to_string(),
                }),
                _ => Err(malformed(query)),
            }
        }
        HostQuery::RootDisk => {
            let row = stdout.lines().last().ok_or_else(|| malformed(query))?;
            match row.split_whitespace().collect::<Vec<_>>()[..] {
                [_, total, used, _, percent, ..] if percent.ends_with('%') => Ok(HostReport::Disk {
                    used: used.to_string(),
                    total: total.to_string(),
                    percent: percent.to_string(),
                }),
                _ => Err(malformed(query)),
            }
        }
    }
}

fn malformed(query: &HostQuery) -> AppError {
    AppError::action_failed(format!("unexpected output for {}", query.name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(status: i32, stdout: &str) -> CommandOutput {
        CommandOutput {
            status: Some(status),
            stdout: stdout.as_bytes().to_vec(),
            stderr: String::new(),
        }
    }

    #[test]
    fn should_treat_inactive_service_as_answer() {
        // Arrange
        let query = HostQuery::ServiceState {
            service: "fail2ban".to_string(),
        };

        // Act
        let report = parse_host_output(&query, &output(3, "inactive\n")).expect("report");

        // Assert
        assert!(!report.is_active());
        assert_eq!(
            report,
            HostReport::Service {
                service: "fail2ban".to_string(),
                state: "inactive".to_string()
            }
        );
    }

    #[test]
    fn should_reject_service_name_with_shell_syntax() {
        let query = HostQuery::ServiceState {
            service: "ssh;reboot".to_string(),
        };

        assert!(matches!(query.validate(), Err(AppError::BadRequest(_))));
    }

    #[test]
    fn should_parse_memory_row() {
        let stdout = "               total        used        free      shared  buff/cache   available\n\
                      Mem:           7.7Gi       2.1Gi       3.0Gi       120Mi       2.6Gi       5.3Gi\n\
                      Swap:          2.0Gi          0B       2.0Gi\n";

        let report = parse_host_output(&HostQuery::Memory, &output(0, stdout)).expect("report");

        assert_eq!(
            report,
            HostReport::Memory {
                used: "2.1Gi".to_string(),
                total: "7.7Gi".to_string()
            }
        );
    }

    #[test]
    fn should_parse_root_disk_and_load() {
        // Arrange
        let df = "Filesystem      Size  Used Avail Capacity Mounted on\n/dev/sda1        50G   20G   28G      42% /\n";
        let loadavg = "0.52 0.58 0.59 1/467 12345\n";

        // Act
        let disk = parse_host_output(&HostQuery::RootDisk, &output(0, df)).expect("disk");
        let load = parse_host_output(&HostQuery::LoadAverage, &output(0, loadavg)).expect("load");

        // Assert
        assert_eq!(
            disk,
            HostReport::Disk {
                used: "20G".to_string(),
                total: "50G".to_string(),
                percent: "42%".to_string()
            }
        );
        assert_eq!(
            load,
            HostReport::Load {
                one: "0.52".to_string(),
                five: "0.58".to_string(),
                fifteen: "0.59".to_string()
            }
        );
    }

    #[test]
    fn should_return_no_lines_when_grep_finds_nothing() {
        let query = HostQuery::AcceptedLogins {
            path: "/var/log/auth.log".into(),
        };

        let report = parse_host_output(&query, &output(1, "")).expect("report");

        assert_eq!(report, HostReport::Lines { lines: Vec::new() });
    }

    #[test]
    fn should_fail_when_log_cannot_be_read() {
        let query = HostQuery::AcceptedLogins {
            path: "/var/log/auth.log".into(),
        };
        let output = CommandOutput {
            status: Some(2),
            stdout: Vec::new(),
            stderr: "grep: /var/log/auth.log: Permission denied".to_string(),
        };

        let result = parse_host_output(&query, &output);

        assert!(matches!(result, Err(AppError::ActionFailed(ref m)) if m.ends_with("Permission denied")));
    }

    #[test]
    fn should_strip_up_prefix_from_uptime() {
        let report = parse_host_output(&HostQuery::Uptime, &output(0, "up 3 days, 4 hours\n")).expect("report");

        assert_eq!(
            report,
            HostReport::Uptime {
                text: "3 days, 4 hours".to_string()
            }
        );
    }

    #[test]
    fn should_build_grep_argv_for_login_lines() {
        let query = HostQuery::AcceptedLogins {
            path: "/var/log/auth.log".into(),
        };

        assert_eq!(query.argv(), vec!["grep", "-a", "--", "Accepted", "/var/log/auth.log"]);
    }
}
