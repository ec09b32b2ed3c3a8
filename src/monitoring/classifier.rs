//! Event classifier
//!
//! Turns one raw log line into at most one `SecurityEvent`. Each log tag owns an
//! ordered table of patterns; the first pattern whose builder accepts the line wins.
//! Lines matching nothing are skipped silently.

use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::{Captures, Regex};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::trace;

use crate::event::{EventKind, LogTag, SecurityEvent, ServerIdentity};
use crate::utils::AppError;

/// Fields extracted by a pattern builder
#[derive(Debug, Clone, PartialEq)]
struct Extracted {
    kind: EventKind,
    subject: String,
    user: Option<String>,
    jail: Option<String>,
    /// Timestamp carried inside the record itself (audit epoch)
    timestamp: Option<DateTime<Utc>>,
}

type Builder = fn(&Captures<'_>) -> Option<Extracted>;

struct LinePattern {
    name: &'static str,
    regex: Regex,
    build: Builder,
}

impl LinePattern {
    fn new(name: &'static str, pattern: &str, build: Builder) -> Result<Self, AppError> {
        let regex = Regex::new(pattern).map_err(|e| {
            AppError::internal_error(format!("invalid {} pattern: {}", name, e))
        })?;
        Ok(Self { name, regex, build })
    }
}

/// Stateless line classifier with fixed pattern tables per tag
pub struct Classifier {
    ssh: Vec<LinePattern>,
    fail2ban: Vec<LinePattern>,
    audit: Vec<LinePattern>,
    timestamps: TimestampParser,
}

impl Classifier {
    pub fn new() -> Result<Self, AppError> {
        let ssh = vec![
            LinePattern::new(
                "ssh_accepted",
                r"sshd(?:-session)?\[\d+\]:\s+Accepted\s+\S+\s+for\s+(?P<user>\S+)\s+from\s+(?P<ip>\S+)",
                |c| login(c, EventKind::SshLoginSuccess),
            )?,
            LinePattern::new(
                "ssh_failed",
                r"sshd(?:-session)?\[\d+\]:\s+Failed\s+\S+\s+for\s+(?:invalid user\s+)?(?P<user>\S+)\s+from\s+(?P<ip>\S+)",
                |c| login(c, EventKind::SshLoginFailure),
            )?,
            LinePattern::new(
                "ssh_invalid_user",
                r"sshd(?:-session)?\[\d+\]:\s+Invalid user\s+(?P<user>\S*)\s*from\s+(?P<ip>\S+)",
                |c| login(c, EventKind::SshLoginFailure),
            )?,
        ];

        let fail2ban = vec![
            LinePattern::new(
                "fail2ban_action",
                r"fail2ban\.actions\s*\[\d+\]:\s+NOTICE\s+\[(?P<jail>[^\]]+)\]\s+(?:Restore\s+)?(?P<action>Ban|Unban)\s+(?P<ip>\S+)",
                fail2ban_action,
            )?,
            LinePattern::new(
                "fail2ban_bare",
                r"\b(?P<action>Ban|Unban)\s+(?P<ip>[0-9A-Fa-f:.]+)",
                fail2ban_action,
            )?,
        ];

        let audit = vec![LinePattern::new(
            "audit_user_login",
            r#"type=USER_LOGIN\s+msg=audit\((?P<epoch>\d+)(?:\.\d+)?:\d+\):.*exe="[^"]*sshd[^"]*".*\baddr=(?P<ip>[^\s']+).*\bres=(?P<res>success|failed)"#,
            audit_login,
        )?];

        Ok(Self {
            ssh,
            fail2ban,
            audit,
            timestamps: TimestampParser::new()?,
        })
    }

    fn table(&self, tag: LogTag) -> &[LinePattern] {
        match tag {
            LogTag::Ssh => &self.ssh,
            LogTag::Fail2ban => &self.fail2ban,
            LogTag::Audit => &self.audit,
        }
    }

    /// Classify a raw line observed at `observed_at` on `server`
    pub fn classify(
        &self,
        line: &str,
        tag: LogTag,
        server: &Arc<ServerIdentity>,
        observed_at: DateTime<Utc>,
    ) -> Option<SecurityEvent> {
        let line = line.trim_end_matches(['\r', '\n']);

        let (pattern, extracted) = self.table(tag).iter().find_map(|pattern| {
            pattern
                .regex
                .captures(line)
                .and_then(|caps| (pattern.build)(&caps))
                .map(|extracted| (pattern.name, extracted))
        })?;

        trace!(pattern, server = %server.name, "Line classified");

        let timestamp = extracted
            .timestamp
            .or_else(|| self.timestamps.parse(line, observed_at))
            .unwrap_or(observed_at);

        let mut event = SecurityEvent::new(extracted.kind, Arc::clone(server), extracted.subject, line)
            .with_timestamp(timestamp)
            .with_observed_at(observed_at);
        if let Some(user) = extracted.user {
            event = event.with_user(user);
        }
        if let Some(jail) = extracted.jail {
            event = event.with_jail(jail);
        }

        Some(event)
    }
}

fn login(caps: &Captures<'_>, kind: EventKind) -> Option<Extracted> {
    let ip = caps.name("ip")?.as_str();
    Some(Extracted {
        kind,
        subject: ip.to_string(),
        user: caps
            .name("user")
            .map(|u| u.as_str())
            .filter(|u| !u.is_empty())
            .map(str::to_string),
        jail: None,
        timestamp: None,
    })
}

fn fail2ban_action(caps: &Captures<'_>) -> Option<Extracted> {
    let ip: IpAddr = caps.name("ip")?.as_str().parse().ok()?;
    let kind = match caps.name("action")?.as_str() {
        "Ban" => EventKind::Fail2banBan,
        _ => EventKind::Fail2banUnban,
    };
    Some(Extracted {
        kind,
        subject: ip.to_string(),
        user: None,
        jail: caps.name("jail").map(|j| j.as_str().trim().to_string()),
        timestamp: None,
    })
}

fn audit_login(caps: &Captures<'_>) -> Option<Extracted> {
    let ip: IpAddr = caps.name("ip")?.as_str().parse().ok()?;
    let kind = match caps.name("res")?.as_str() {
        "success" => EventKind::SshLoginSuccess,
        _ => EventKind::SshLoginFailure,
    };
    let epoch: i64 = caps.name("epoch")?.as_str().parse().ok()?;
    let line = caps.get(0)?.as_str();

    Some(Extracted {
        kind,
        subject: ip.to_string(),
        user: audit_account(line),
        jail: None,
        timestamp: Utc.timestamp_opt(epoch, 0).single(),
    })
}

fn audit_account(line: &str) -> Option<String> {
    let start = line.find("acct=")? + "acct=".len();
    let value: String = line[start..]
        .trim_start_matches('"')
        .chars()
        .take_while(|c| !matches!(c, '"' | ' ' | '\''))
        .collect();
    (!value.is_empty()).then_some(value)
}

/// Parses the leading timestamp of common syslog / fail2ban layouts
struct TimestampParser {
    rfc3339: Regex,
    native: Regex,
    syslog: Regex,
}

impl TimestampParser {
    fn new() -> Result<Self, AppError> {
        let build = |p: &str| {
            Regex::new(p).map_err(|e| AppError::internal_error(format!("invalid timestamp pattern: {}", e)))
        };
        Ok(Self {
            rfc3339: build(r"^(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:\d{2}))")?,
            native: build(r"^(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})(?:,(\d{1,6}))?")?,
            syslog: build(r"^([A-Z][a-z]{2})\s+(\d{1,2})\s+(\d{2}:\d{2}:\d{2})")?,
        })
    }

    fn parse(&self, line: &str, observed_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if let Some(caps) = self.rfc3339.captures(line) {
            return DateTime::parse_from_rfc3339(&caps[1])
                .ok()
                .map(|dt| dt.with_timezone(&Utc));
        }

        if let Some(caps) = self.native.captures(line) {
            let naive = NaiveDateTime::parse_from_str(&caps[1], "%Y-%m-%d %H:%M:%S").ok()?;
            let millis: i64 = caps
                .get(2)
                .and_then(|m| format!("{:0<3}", m.as_str()).get(..3)?.parse().ok())
                .unwrap_or(0);
            return local_to_utc(naive + chrono::Duration::milliseconds(millis));
        }

        if let Some(caps) = self.syslog.captures(line) {
            return syslog_time(&caps[1], &caps[2], &caps[3], observed_at);
        }

        None
    }
}

fn local_to_utc(naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Syslog lines carry no year: take the observation year, or the previous one
/// when that would put the record more than a day in the future.
fn syslog_time(month: &str, day: &str, time: &str, observed_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let year = observed_at.with_timezone(&Local).year();
    let build = |year: i32| {
        let date = NaiveDate::parse_from_str(&format!("{} {} {}", year, month, day), "%Y %b %d").ok()?;
        let naive = NaiveDateTime::parse_from_str(
            &format!("{} {}", date.format("%Y-%m-%d"), time),
            "%Y-%m-%d %H:%M:%S",
        )
        .ok()?;
        local_to_utc(naive)
    };

    let candidate = build(year)?;
    if candidate > observed_at + chrono::Duration::days(1) {
        return build(year - 1);
    }
    Some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> Classifier {
        Classifier::new().expect("patterns compile")
    }

    fn server() -> Arc<ServerIdentity> {
        Arc::new(ServerIdentity::local(vec![], false))
    }

    fn observed() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn should_classify_accepted_password_login() {
        // Arrange
        let line = "Jan 1 00:00:00 host sshd[1]: Accepted password for root from 10.0.0.5 port 22 ssh2";

        // Act
        let event = classifier()
            .classify(line, LogTag::Ssh, &server(), observed())
            .expect("event");

        // Assert
        assert_eq!(event.kind, EventKind::SshLoginSuccess);
        assert_eq!(event.subject, "10.0.0.5");
        assert_eq!(event.user.as_deref(), Some("root"));
        assert_eq!(event.raw_line, line);
        assert_eq!(event.observed_at, observed());
    }

    #[test]
    fn should_classify_publickey_login_from_sshd_session() {
        let line = "Mar  9 08:15:01 web1 sshd-session[4242]: Accepted publickey for deploy from 2001:db8::7 port 50122 ssh2: ED25519 SHA256:abc";

        let event = classifier()
            .classify(line, LogTag::Ssh, &server(), observed())
            .expect("event");

        assert_eq!(event.kind, EventKind::SshLoginSuccess);
        assert_eq!(event.subject, "2001:db8::7");
        assert_eq!(event.user.as_deref(), Some("deploy"));
    }

    #[test]
    fn should_classify_failed_password_for_invalid_user() {
        let line = "Mar  9 08:15:01 web1 sshd[99]: Failed password for invalid user admin from 203.0.113.9 port 4000 ssh2";

        let event = classifier()
            .classify(line, LogTag::Ssh, &server(), observed())
            .expect("event");

        assert_eq!(event.kind, EventKind::SshLoginFailure);
        assert_eq!(event.user.as_deref(), Some("admin"));
        assert_eq!(event.subject, "203.0.113.9");
    }

    #[test]
    fn should_classify_invalid_user_attempt() {
        let line = "Mar  9 08:15:00 web1 sshd[98]: Invalid user oracle from 203.0.113.9 port 4000";

        let event = classifier()
            .classify(line, LogTag::Ssh, &server(), observed())
            .expect("event");

        assert_eq!(event.kind, EventKind::SshLoginFailure);
        assert_eq!(event.user.as_deref(), Some("oracle"));
    }

    #[test]
    fn should_return_none_for_unrelated_lines() {
        let c = classifier();
        let lines = [
            "",
            "Mar  9 08:15:01 web1 CRON[12]: (root) CMD (run-parts /etc/cron.hourly)",
            "Mar  9 08:15:01 web1 sshd[99]: Connection closed by 10.0.0.1 port 22 [preauth]",
            "random garbage Bandwidth 1.2.3.4",
        ];

        for line in lines {
            for tag in [LogTag::Ssh, LogTag::Fail2ban, LogTag::Audit] {
                assert!(
                    c.classify(line, tag, &server(), observed()).is_none(),
                    "unexpected event for {:?} / {}",
                    tag,
                    line
                );
            }
        }
    }

    #[test]
    fn should_not_cross_match_grammar_of_other_tag() {
        let line = "Jan 1 00:00:00 host sshd[1]: Accepted password for root from 10.0.0.5 port 22 ssh2";

        assert!(classifier()
            .classify(line, LogTag::Fail2ban, &server(), observed())
            .is_none());
    }

    #[test]
    fn should_classify_native_fail2ban_ban_with_jail() {
        // Arrange
        let line = "2025-03-10 11:58:02,117 fail2ban.actions        [812]: NOTICE  [sshd] Ban 198.51.100.23";

        // Act
        let event = classifier()
            .classify(line, LogTag::Fail2ban, &server(), observed())
            .expect("event");

        // Assert
        assert_eq!(event.kind, EventKind::Fail2banBan);
        assert_eq!(event.subject, "198.51.100.23");
        assert_eq!(event.jail.as_deref(), Some("sshd"));
        let expected = Local
            .with_ymd_and_hms(2025, 3, 10, 11, 58, 2)
            .earliest()
            .unwrap()
            .with_timezone(&Utc)
            + chrono::Duration::milliseconds(117);
        assert_eq!(event.timestamp, expected);
    }

    #[test]
    fn should_classify_syslog_fail2ban_unban() {
        let line = "Mar 10 11:00:00 host fail2ban.actions[812]: NOTICE [nginx-http-auth] Unban 198.51.100.23";

        let event = classifier()
            .classify(line, LogTag::Fail2ban, &server(), observed())
            .expect("event");

        assert_eq!(event.kind, EventKind::Fail2banUnban);
        assert_eq!(event.jail.as_deref(), Some("nginx-http-auth"));
    }

    #[test]
    fn should_classify_any_ban_line_by_ip() {
        let c = classifier();
        for ip in ["10.1.2.3", "192.0.2.200", "2001:db8::1"] {
            let line = format!("whatever prefix Ban {} trailing words", ip);

            let event = c
                .classify(&line, LogTag::Fail2ban, &server(), observed())
                .expect("event");

            assert_eq!(event.kind, EventKind::Fail2banBan);
            assert_eq!(event.subject, ip);
            assert_eq!(event.jail, None);
        }
    }

    #[test]
    fn should_skip_already_banned_notices() {
        let line = "2025-03-10 11:58:02,117 fail2ban.actions [812]: NOTICE [sshd] 198.51.100.23 already banned";

        assert!(classifier()
            .classify(line, LogTag::Fail2ban, &server(), observed())
            .is_none());
    }

    #[test]
    fn should_classify_audit_login_with_epoch_timestamp() {
        let line = r#"type=USER_LOGIN msg=audit(1700000000.123:456): pid=812 uid=0 auid=4294967295 ses=4294967295 msg='op=login acct="root" exe="/usr/sbin/sshd" hostname=? addr=10.9.8.7 terminal=ssh res=failed'"#;

        let event = classifier()
            .classify(line, LogTag::Audit, &server(), observed())
            .expect("event");

        assert_eq!(event.kind, EventKind::SshLoginFailure);
        assert_eq!(event.subject, "10.9.8.7");
        assert_eq!(event.user.as_deref(), Some("root"));
        assert_eq!(event.timestamp, Utc.timestamp_opt(1_700_000_000, 0).unwrap());
    }

    #[test]
    fn should_skip_audit_login_without_address() {
        let line = r#"type=USER_LOGIN msg=audit(1700000000.123:456): pid=812 uid=0 msg='op=login id=0 exe="/usr/sbin/sshd" hostname=? addr=? terminal=ssh res=success'"#;

        assert!(classifier()
            .classify(line, LogTag::Audit, &server(), observed())
            .is_none());
    }

    #[test]
    fn should_fall_back_to_observation_time_for_unknown_timestamp() {
        let line = "<34>host sshd[1]: Accepted password for root from 10.0.0.5 port 22 ssh2";

        let event = classifier()
            .classify(line, LogTag::Ssh, &server(), observed())
            .expect("event");

        assert_eq!(event.timestamp, observed());
    }

    #[test]
    fn should_parse_rfc3339_prefix() {
        let line = "2025-03-10T09:30:00.250000+00:00 host sshd[1]: Accepted password for root from 10.0.0.5 port 22 ssh2";

        let event = classifier()
            .classify(line, LogTag::Ssh, &server(), observed())
            .expect("event");

        assert_eq!(
            event.timestamp,
            Utc.with_ymd_and_hms(2025, 3, 10, 9, 30, 0).unwrap() + chrono::Duration::milliseconds(250)
        );
    }

    #[test]
    fn should_infer_previous_year_for_future_syslog_dates() {
        // Observed early January, line from late December
        let observed = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();

        let parsed = syslog_time("Dec", "31", "23:59:00", observed).expect("time");

        assert_eq!(parsed.with_timezone(&Local).year(), 2024);
    }

    #[test]
    fn should_keep_observation_year_for_recent_syslog_dates() {
        let parsed = syslog_time("Mar", "10", "08:00:00", observed()).expect("time");

        assert_eq!(parsed.with_timezone(&Local).year(), 2025);
    }
}
