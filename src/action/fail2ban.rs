//! fail2ban-client operations: argv construction, input validation, output parsing

use serde::Serialize;
use std::fmt;
use std::net::IpAddr;

use super::runner::CommandOutput;
use crate::utils::AppError;

const CLIENT: &str = "fail2ban-client";
const MAX_NAME_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fail2banAction {
    ListJails,
    JailStatus { jail: String },
    Ban { ip: String, jail: String },
    Unban { ip: String, jail: String },
}

impl Fail2banAction {
    /// Ban and unban change firewall state and are admin-only
    pub fn is_mutating(&self) -> bool {
        matches!(self, Fail2banAction::Ban { .. } | Fail2banAction::Unban { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Fail2banAction::ListJails => "list_jails",
            Fail2banAction::JailStatus { .. } => "jail_status",
            Fail2banAction::Ban { .. } => "ban",
            Fail2banAction::Unban { .. } => "unban",
        }
    }

    /// Reject jail names and addresses that are not plain identifiers before any
    /// command line is built from them
    pub fn validate(&self) -> Result<(), AppError> {
        match self {
            Fail2banAction::ListJails => Ok(()),
            Fail2banAction::JailStatus { jail } => validate_jail(jail),
            Fail2banAction::Ban { ip, jail } | Fail2banAction::Unban { ip, jail } => {
                validate_jail(jail)?;
                validate_ip(ip)
            }
        }
    }

    pub fn argv(&self, use_sudo: bool) -> Vec<String> {
        let mut argv: Vec<String> = Vec::with_capacity(7);
        if use_sudo {
            argv.push("sudo".to_string());
            argv.push("-n".to_string());
        }
        argv.push(CLIENT.to_string());

        match self {
            Fail2banAction::ListJails => argv.push("status".to_string()),
            Fail2banAction::JailStatus { jail } => {
                argv.extend(["status".to_string(), jail.clone()]);
            }
            Fail2banAction::Ban { ip, jail } => {
                argv.extend(["set".to_string(), jail.clone(), "banip".to_string(), ip.clone()]);
            }
            Fail2banAction::Unban { ip, jail } => {
                argv.extend(["set".to_string(), jail.clone(), "unbanip".to_string(), ip.clone()]);
            }
        }
        argv
    }
}

impl fmt::Display for Fail2banAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fail2banAction::ListJails => write!(f, "list jails"),
            Fail2banAction::JailStatus { jail } => write!(f, "status of jail {}", jail),
            Fail2banAction::Ban { ip, jail } => write!(f, "ban {} in jail {}", ip, jail),
            Fail2banAction::Unban { ip, jail } => write!(f, "unban {} in jail {}", ip, jail),
        }
    }
}

fn validate_jail(jail: &str) -> Result<(), AppError> {
    validate_name("jail name", jail)
}

/// Plain identifier check for names that end up on a command line
pub(super) fn validate_name(label: &str, value: &str) -> Result<(), AppError> {
    let valid = !value.is_empty()
        && value.len() <= MAX_NAME_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '@'));
    if valid {
        Ok(())
    } else {
        Err(AppError::bad_request(format!("Invalid {}: {}", label, value)))
    }
}

fn validate_ip(ip: &str) -> Result<(), AppError> {
    ip.parse::<IpAddr>()
        .map(|_| ())
        .map_err(|_| AppError::bad_request(format!("Invalid IP address: {}", ip)))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JailStatus {
    pub jail: String,
    pub currently_failed: u64,
    pub total_failed: u64,
    pub currently_banned: u64,
    pub total_banned: u64,
    pub banned_ips: Vec<String>,
}

/// Parsed result of a successful action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionReport {
    Jails { jails: Vec<String> },
    Status(JailStatus),
    Banned { ip: String, jail: String, already_banned: bool },
    Unbanned { ip: String, jail: String },
}

/// Interpret the output of `action`; a non-zero exit or missing lines are `ActionFailed`
pub fn parse_output(action: &Fail2banAction, output: &CommandOutput) -> Result<ActionReport, AppError> {
    if !output.success() {
        return Err(output.failure(action.name()));
    }
    let stdout = output.stdout_text();

    match action {
        Fail2banAction::ListJails => {
            let list = field(&stdout, "Jail list:").ok_or_else(|| malformed(action))?;
            let jails = list
                .split(',')
                .map(str::trim)
                .filter(|jail| !jail.is_empty())
                .map(str::to_string)
                .collect();
            Ok(ActionReport::Jails { jails })
        }
        Fail2banAction::JailStatus { jail } => {
            let counter = |key: &str| -> Result<u64, AppError> {
                field(&stdout, key)
                    .and_then(|value| value.parse().ok())
                    .ok_or_else(|| malformed(action))
            };
            let banned_ips = field(&stdout, "Banned IP list:")
                .ok_or_else(|| malformed(action))?
                .split_whitespace()
                .map(str::to_string)
                .collect();

            Ok(ActionReport::Status(JailStatus {
                jail: jail.clone(),
                currently_failed: counter("Currently failed:")?,
                total_failed: counter("Total failed:")?,
                currently_banned: counter("Currently banned:")?,
                total_banned: counter("Total banned:")?,
                banned_ips,
            }))
        }
        Fail2banAction::Ban { ip, jail } => Ok(ActionReport::Banned {
            ip: ip.clone(),
            jail: jail.clone(),
            already_banned: stdout.trim() == "0",
        }),
        Fail2banAction::Unban { ip, jail } => Ok(ActionReport::Unbanned {
            ip: ip.clone(),
            jail: jail.clone(),
        }),
    }
}

/// Value after `key` on the first line containing it
fn field<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    text.lines().find_map(|line| {
        let index = line.find(key)?;
        Some(line[index + key.len()..].trim())
    })
}

fn malformed(action: &Fail2banAction) -> AppError {
    AppError::action_failed(format!("unexpected fail2ban-client output for {}", action.name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(status: i32, stdout: &str, stderr: &str) -> CommandOutput {
        CommandOutput {
            status: Some(status),
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.to_string(),
        }
    }

    fn ban() -> Fail2banAction {
        Fail2banAction::Ban {
            ip: "203.0.113.9".to_string(),
            jail: "sshd".to_string(),
        }
    }

    #[test]
    fn should_build_argv_with_sudo_prefix() {
        assert_eq!(
            ban().argv(true),
            vec!["sudo", "-n", "fail2ban-client", "set", "sshd", "banip", "203.0.113.9"]
        );
        assert_eq!(Fail2banAction::ListJails.argv(false), vec!["fail2ban-client", "status"]);
    }

    #[test]
    fn should_reject_shell_metacharacters_in_jail() {
        let action = Fail2banAction::JailStatus {
            jail: "sshd; rm -rf /".to_string(),
        };

        let result = action.validate();

        assert!(matches!(result, Err(AppError::BadRequest(_))));
    }

    #[test]
    fn should_reject_invalid_ip() {
        let action = Fail2banAction::Unban {
            ip: "10.0.0.300".to_string(),
            jail: "sshd".to_string(),
        };

        assert!(matches!(action.validate(), Err(AppError::BadRequest(_))));
        assert!(ban().validate().is_ok());
    }

    #[test]
    fn should_parse_jail_list() {
        // Arrange
        let stdout = "Status\n|- Number of jail:\t2\n`- Jail list:\tnginx-http-auth, sshd\n";

        // Act
        let report = parse_output(&Fail2banAction::ListJails, &output(0, stdout, "")).expect("report");

        // Assert
        assert_eq!(
            report,
            ActionReport::Jails {
                jails: vec!["nginx-http-auth".to_string(), "sshd".to_string()]
            }
        );
    }

    #[test]
    fn should_parse_jail_status() {
        let stdout = "Status for the jail: sshd\n\
                      |- Filter\n\
                      |  |- Currently failed:\t1\n\
                      |  |- Total failed:\t10\n\
                      |  `- File list:\t/var/log/auth.log\n\
                      `- Actions\n   \
                         |- Currently banned:\t2\n   \
                         |- Total banned:\t5\n   \
                         `- Banned IP list:\t198.51.100.1 203.0.113.9\n";
        let action = Fail2banAction::JailStatus {
            jail: "sshd".to_string(),
        };

        let report = parse_output(&action, &output(0, stdout, "")).expect("report");

        let ActionReport::Status(status) = report else {
            panic!("expected status report");
        };
        assert_eq!(status.currently_failed, 1);
        assert_eq!(status.total_failed, 10);
        assert_eq!(status.currently_banned, 2);
        assert_eq!(status.total_banned, 5);
        assert_eq!(status.banned_ips, vec!["198.51.100.1", "203.0.113.9"]);
    }

    #[test]
    fn should_treat_missing_lines_as_malformed() {
        let result = parse_output(&Fail2banAction::ListJails, &output(0, "Status\n", ""));

        assert!(matches!(result, Err(AppError::ActionFailed(_))));
    }

    #[test]
    fn should_surface_stderr_verbatim_on_failure() {
        // Arrange
        let stderr = "2025-03-10 12:00:00,000 fail2ban [1]: ERROR NOK: ('nope',)\nSorry but the jail 'nope' does not exist";

        // Act
        let result = parse_output(&ban(), &output(255, "", stderr));

        // Assert
        let Err(AppError::ActionFailed(message)) = result else {
            panic!("expected action failure");
        };
        assert!(message.contains("exit 255"));
        assert!(message.ends_with("Sorry but the jail 'nope' does not exist"));
    }

    #[test]
    fn should_flag_already_banned_address() {
        let report = parse_output(&ban(), &output(0, "0\n", "")).expect("report");

        assert_eq!(
            report,
            ActionReport::Banned {
                ip: "203.0.113.9".to_string(),
                jail: "sshd".to_string(),
                already_banned: true,
            }
        );
    }
}
