//! Plain-text rendering of events and command replies

use chrono::{DateTime, Local, Utc};
use std::fmt::Write;
use std::net::IpAddr;

use crate::config::CustomizationConfig;
use crate::event::{EventKind, SecurityEvent, Severity};

#[derive(Debug, Clone)]
pub struct MessageFormatter {
    date_format: String,
    show_ipinfo_link: bool,
}

impl MessageFormatter {
    pub fn new(customization: &CustomizationConfig) -> Self {
        Self {
            date_format: customization.date_format.clone(),
            show_ipinfo_link: customization.show_ipinfo_link,
        }
    }

    /// Local-time rendering with the configured format, RFC 3339 if the format is invalid
    pub fn format_time(&self, time: DateTime<Utc>) -> String {
        let local = time.with_timezone(&Local);
        let mut out = String::new();
        if write!(out, "{}", local.format(&self.date_format)).is_err() {
            return local.to_rfc3339();
        }
        out
    }

    pub fn format_event(&self, event: &SecurityEvent) -> String {
        let mut text = format!("{}{}", severity_marker(event.severity), headline(event));

        match event.kind {
            EventKind::ServerUnreachable | EventKind::ServerReachable => {
                let _ = write!(text, "\nServer: {} ({})", event.server.name, event.server.host);
                if event.kind == EventKind::ServerUnreachable {
                    let _ = write!(text, "\nReason: {}", event.raw_line);
                }
            }
            _ => {
                let _ = write!(text, "\nIP: {}", event.subject);
                if let Some(hostname) = &event.hostname {
                    let _ = write!(text, " ({})", hostname);
                }
                if let Some(user) = &event.user {
                    let _ = write!(text, "\nUser: {}", user);
                }
                if let Some(jail) = &event.jail {
                    let _ = write!(text, "\nJail: {}", jail);
                }
                let _ = write!(text, "\nServer: {}", event.server.name);
            }
        }

        let _ = write!(text, "\nTime: {}", self.format_time(event.timestamp));

        if self.show_ipinfo_link && event.subject.parse::<IpAddr>().is_ok() {
            let _ = write!(text, "\nInfo: https://ipinfo.io/{}", event.subject);
        }
        text
    }
}

fn severity_marker(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "[CRITICAL] ",
        Severity::Warning => "[!] ",
        Severity::Info => "",
    }
}

fn headline(event: &SecurityEvent) -> String {
    match event.kind {
        EventKind::SshLoginSuccess => "SSH login".to_string(),
        EventKind::SshLoginFailure => "Failed SSH login".to_string(),
        EventKind::Fail2banBan => "fail2ban banned an IP".to_string(),
        EventKind::Fail2banUnban => "fail2ban unbanned an IP".to_string(),
        EventKind::ServerUnreachable if event.is_critical() => {
            format!("Server {} halted: host key verification failed", event.server.name)
        }
        EventKind::ServerUnreachable => format!("Server {} unreachable", event.server.name),
        EventKind::ServerReachable => format!("Server {} reachable again", event.server.name),
    }
}
