//! Command router
//!
//! Resolves the caller, parses the command and dispatches it to the health tracker,
//! the action executor or the route table. Callers outside the configured admin and
//! viewer sets are rejected before the text is even parsed. Anything that has to look
//! at a host (service state, load, login lines) goes through the executor queue of
//! that host.

use chrono::{Duration as ChronoDuration, Utc};
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::parser::BotCommand;
use crate::action::{
    ActionExecutor, ActionReport, Fail2banAction, HostQuery, HostReport, PendingAction, WATCHED_SERVICES,
};
use crate::event::{EventKind, LogTag, ServerIdentity, LOCAL_SERVER};
use crate::monitoring::{Classifier, HealthSnapshot, HealthState, HealthTracker};
use crate::notification::{
    Announcement, Caller, LoginHistory, LoginRecord, MessageFormatter, Role, RouteTable,
};
use crate::utils::AppError;

pub struct CommandRouter {
    servers: Vec<Arc<ServerIdentity>>,
    routes: Arc<RouteTable>,
    health: Arc<HealthTracker>,
    executor: Arc<ActionExecutor>,
    history: Arc<LoginHistory>,
    classifier: Arc<Classifier>,
    formatter: MessageFormatter,
    announcements: mpsc::UnboundedSender<Announcement>,
    mute_default: Duration,
}

impl CommandRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        servers: Vec<Arc<ServerIdentity>>,
        routes: Arc<RouteTable>,
        health: Arc<HealthTracker>,
        executor: Arc<ActionExecutor>,
        history: Arc<LoginHistory>,
        classifier: Arc<Classifier>,
        formatter: MessageFormatter,
        announcements: mpsc::UnboundedSender<Announcement>,
        mute_default: Duration,
    ) -> Self {
        Self {
            servers,
            routes,
            health,
            executor,
            history,
            classifier,
            formatter,
            announcements,
            mute_default,
        }
    }

    /// Handle one inbound command and return the reply text for the caller
    #[instrument(skip(self, text))]
    pub async fn handle(&self, caller_id: &str, text: &str) -> Result<String, AppError> {
        let Some(caller) = self.routes.caller(caller_id) else {
            warn!("Command from unknown caller rejected");
            return Err(AppError::auth_denied("You are not authorized to use this bot"));
        };

        let command = BotCommand::parse(text)?;
        info!(command = command.name(), role = caller.role.as_str(), "Command received");

        match command {
            BotCommand::Start => Ok(format!(
                "SecureWatch is monitoring {} server(s). You are registered as {}. Send /help for commands.",
                self.servers.len(),
                caller.role.as_str()
            )),
            BotCommand::Help => Ok(help_text(caller.role)),
            BotCommand::Status => Ok(self.status(&caller).await),
            BotCommand::LoginHistory { limit } => Ok(self.login_history(limit).await),
            BotCommand::ServerList => Ok(self.server_list()),
            BotCommand::ServerStatus { name } => self.server_status(&name).await,
            BotCommand::ServerRetry { name } => self.retry(&caller, &name),
            BotCommand::Fail2banList { server } => {
                self.run_action(caller, Fail2banAction::ListJails, server).await
            }
            BotCommand::Fail2banStatus { jail, server } => {
                self.run_action(caller, Fail2banAction::JailStatus { jail }, server)
                    .await
            }
            BotCommand::Fail2banBan { ip, jail, server } => {
                self.run_action(caller, Fail2banAction::Ban { ip, jail }, server)
                    .await
            }
            BotCommand::Fail2banUnban { ip, jail, server } => {
                self.run_action(caller, Fail2banAction::Unban { ip, jail }, server)
                    .await
            }
            BotCommand::Mute { minutes } => self.mute(&caller, minutes),
            BotCommand::Unmute => {
                let was_muted = self.routes.unmute(&caller.id, Utc::now())?;
                Ok(if was_muted {
                    "Notifications unmuted".to_string()
                } else {
                    "Notifications were not muted".to_string()
                })
            }
            BotCommand::Unknown { command } => Err(AppError::bad_request(format!(
                "Unknown command {}. Send /help for the list of commands.",
                command
            ))),
        }
    }

    async fn status(&self, caller: &Caller) -> String {
        let mut text = String::from("Server status:");
        for snapshot in self.health.snapshots() {
            let _ = write!(text, "\n- {}: {}", snapshot.server, snapshot.state.as_str());
            if snapshot.consecutive_failures > 0 {
                let _ = write!(text, " ({} failures)", snapshot.consecutive_failures);
            }
        }

        text.push_str("\nLocal services:");
        for service in WATCHED_SERVICES {
            let query = HostQuery::ServiceState {
                service: service.to_string(),
            };
            match self.executor.query(LOCAL_SERVER, query).await {
                Ok(report) => {
                    let _ = write!(text, "\n- {}", describe_host(&report));
                }
                Err(e) => {
                    debug!(service, error = %e, "Service state unavailable");
                    let _ = write!(text, "\n- {}: unknown", service);
                }
            }
        }

        match self.routes.muted_until(&caller.id, Utc::now()) {
            Some(until) => {
                let _ = write!(text, "\nNotifications muted until {}", self.formatter.format_time(until));
            }
            None => text.push_str("\nNotifications active"),
        }
        text
    }

    /// Latest accepted logins per server, read from each server's ssh logs
    ///
    /// A server that is not reachable, or whose log cannot be read, falls back to the
    /// logins observed since this process started.
    async fn login_history(&self, limit: usize) -> String {
        let mut text = format!("Last {} SSH login(s) per server:", limit);

        for server in &self.servers {
            if !server.logs.iter().any(|source| source.tag == LogTag::Ssh) {
                continue;
            }

            let (records, note) = match self.logins_from_logs(server, limit).await {
                Ok(records) => (records, ""),
                Err(e) => {
                    warn!(server = %server.name, error = %e, "Login history falls back to memory");
                    (self.history.recent_on(&server.name, limit), " (log unavailable, seen since start)")
                }
            };

            let _ = write!(text, "\n\n{}{}:", server.name, note);
            if records.is_empty() {
                text.push_str("\nNo logins found");
            }
            for record in records {
                let _ = write!(
                    text,
                    "\n- {} {} from {}",
                    self.formatter.format_time(record.timestamp),
                    record.user.as_deref().unwrap_or("?"),
                    record.ip
                );
                if let Some(hostname) = record.hostname {
                    let _ = write!(text, " ({})", hostname);
                }
            }
        }
        text
    }

    async fn logins_from_logs(&self, server: &Arc<ServerIdentity>, limit: usize) -> Result<Vec<LoginRecord>, AppError> {
        let reachable = self
            .health
            .snapshot(&server.name)
            .is_some_and(|snapshot| snapshot.state == HealthState::Reachable);
        if !reachable {
            return Err(AppError::source_unavailable(&server.name, "server is not reachable"));
        }

        let now = Utc::now();
        let mut records = Vec::new();
        for source in server.logs.iter().filter(|source| source.tag == LogTag::Ssh) {
            let query = HostQuery::AcceptedLogins {
                path: source.path.clone(),
            };
            let HostReport::Lines { lines } = self.executor.query(&server.name, query).await? else {
                return Err(AppError::internal_error("unexpected report for login lines"));
            };
            records.extend(
                lines
                    .iter()
                    .filter_map(|line| self.classifier.classify(line, LogTag::Ssh, server, now))
                    .filter(|event| event.kind == EventKind::SshLoginSuccess)
                    .filter_map(|event| LoginRecord::from_event(&event)),
            );
        }

        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records.truncate(limit);
        Ok(records)
    }

    fn server_list(&self) -> String {
        let mut text = String::from("Monitored servers:");
        for server in &self.servers {
            let state = self
                .health
                .snapshot(&server.name)
                .map(|s| s.state.as_str())
                .unwrap_or("unknown");
            let _ = write!(text, "\n- {} ({}): {}", server.name, server.host, state);
        }
        text
    }

    async fn server_status(&self, name: &str) -> Result<String, AppError> {
        let snapshot = self
            .health
            .snapshot(name)
            .ok_or_else(|| AppError::not_found(format!("Unknown server: {}", name)))?;
        let mut text = describe_health(&snapshot);
        if snapshot.state != HealthState::Reachable {
            return Ok(text);
        }

        let remote = self
            .servers
            .iter()
            .any(|server| server.name == name && !server.is_local());
        let queries = [HostQuery::Uptime, HostQuery::LoadAverage, HostQuery::Memory, HostQuery::RootDisk]
            .into_iter()
            .chain(WATCHED_SERVICES.iter().map(|service| HostQuery::ServiceState {
                service: service.to_string(),
            }));

        for query in queries {
            match self.executor.query(name, query).await {
                Ok(report) => {
                    let _ = write!(text, "\n{}", describe_host(&report));
                }
                Err(e @ (AppError::SourceUnavailable { .. } | AppError::TrustViolation { .. })) if remote => {
                    let _ = write!(text, "\nHost details unavailable: {}", e);
                    break;
                }
                Err(e) => debug!(server = name, error = %e, "Host query skipped"),
            }
        }
        Ok(text)
    }

    fn retry(&self, caller: &Caller, name: &str) -> Result<String, AppError> {
        if caller.role != Role::Admin {
            return Err(AppError::auth_denied("/server retry requires the admin role"));
        }

        let snapshot = self.health.retry(name)?;
        self.announce(format!("Admin {} requested a reconnect of {}", caller.id, name));
        Ok(format!("Retrying {}\n{}", name, describe_health(&snapshot)))
    }

    fn mute(&self, caller: &Caller, minutes: Option<u64>) -> Result<String, AppError> {
        let duration = minutes
            .map(|m| Duration::from_secs(m * 60))
            .unwrap_or(self.mute_default);
        let duration = ChronoDuration::from_std(duration)
            .map_err(|_| AppError::bad_request("Mute duration out of range"))?;

        let until = self.routes.mute(&caller.id, duration, Utc::now())?;
        Ok(format!(
            "Notifications muted until {} (critical alerts still arrive)",
            self.formatter.format_time(until)
        ))
    }

    async fn run_action(
        &self,
        caller: Caller,
        action: Fail2banAction,
        server: Option<String>,
    ) -> Result<String, AppError> {
        let server = server.unwrap_or_else(|| LOCAL_SERVER.to_string());
        let caller_id = caller.id.clone();
        let pending = PendingAction::new(action, server.clone(), caller);

        let report = self.executor.submit(pending).await?;

        match &report {
            ActionReport::Banned { ip, jail, .. } => {
                self.announce(format!("Admin {} banned {} in jail {} on {}", caller_id, ip, jail, server));
            }
            ActionReport::Unbanned { ip, jail } => {
                self.announce(format!("Admin {} unbanned {} in jail {} on {}", caller_id, ip, jail, server));
            }
            _ => {}
        }

        Ok(describe_report(&server, &report))
    }

    /// Confirmation to every admin not currently muted
    fn announce(&self, text: String) {
        let recipients = self.routes.unmuted_admins(Utc::now());
        if recipients.is_empty() {
            debug!("Every admin is muted, confirmation not sent");
            return;
        }
        if self.announcements.send(Announcement { recipients, text }).is_err() {
            warn!("Dispatcher stopped, confirmation not delivered");
        }
    }
}

fn describe_health(snapshot: &HealthSnapshot) -> String {
    let mut text = format!("{}: {}", snapshot.server, snapshot.state.as_str());
    if snapshot.consecutive_failures > 0 {
        let _ = write!(
            text,
            "\nConsecutive failures: {}\nNext attempt in: {}s",
            snapshot.consecutive_failures, snapshot.backoff_secs
        );
    }
    if !snapshot.failing_sources.is_empty() {
        let _ = write!(text, "\nFailing sources: {}", snapshot.failing_sources.join(", "));
    }
    if let Some(success) = snapshot.last_success {
        let _ = write!(text, "\nLast success: {}", success.to_rfc3339());
    }
    if let Some(error) = &snapshot.last_error {
        let _ = write!(text, "\nLast error: {}", error);
    }
    text
}

fn describe_host(report: &HostReport) -> String {
    match report {
        HostReport::Service { service, .. } if report.is_active() => format!("{}: running", service),
        HostReport::Service { service, state } => format!("{}: not running ({})", service, state),
        HostReport::Uptime { text } => format!("Uptime: {}", text),
        HostReport::Load { one, five, fifteen } => {
            format!("Load: {} (1m), {} (5m), {} (15m)", one, five, fifteen)
        }
        HostReport::Memory { used, total } => format!("Memory: {} used / {} total", used, total),
        HostReport::Disk { used, total, percent } => {
            format!("Disk: {} used / {} total ({})", used, total, percent)
        }
        HostReport::Lines { lines } => format!("{} line(s)", lines.len()),
    }
}

fn describe_report(server: &str, report: &ActionReport) -> String {
    match report {
        ActionReport::Jails { jails } if jails.is_empty() => format!("No jails active on {}", server),
        ActionReport::Jails { jails } => format!("Jails on {}: {}", server, jails.join(", ")),
        ActionReport::Status(status) => {
            let banned = if status.banned_ips.is_empty() {
                "none".to_string()
            } else {
                status.banned_ips.join(", ")
            };
            format!(
                "Jail {} on {}\nCurrently failed: {}\nTotal failed: {}\nCurrently banned: {}\nTotal banned: {}\nBanned IPs: {}",
                status.jail,
                server,
                status.currently_failed,
                status.total_failed,
                status.currently_banned,
                status.total_banned,
                banned
            )
        }
        ActionReport::Banned { ip, jail, already_banned: true } => {
            format!("{} was already banned in jail {} on {}", ip, jail, server)
        }
        ActionReport::Banned { ip, jail, .. } => format!("Banned {} in jail {} on {}", ip, jail, server),
        ActionReport::Unbanned { ip, jail } => format!("Unbanned {} in jail {} on {}", ip, jail, server),
    }
}

fn help_text(role: Role) -> String {
    let mut text = String::from(
        "Commands:\n\
         /status - server health, local services and your mute state\n\
         /server list - monitored servers\n\
         /server status NAME - health, load, memory, disk and services of one server\n\
         /fail2ban list [SERVER] - active jails\n\
         /fail2ban status JAIL [SERVER] - jail counters and banned IPs\n\
         /login_history [N] - latest logins from each server's auth log (max 20)\n\
         /mute [MINUTES] - pause notifications\n\
         /unmute - resume notifications",
    );
    if role == Role::Admin {
        text.push_str(
            "\n\nAdmin commands:\n\
             /fail2ban ban IP JAIL [SERVER]\n\
             /fail2ban unban IP JAIL [SERVER]\n\
             /server retry NAME - reconnect after re-pinning a host key",
        );
    }
    text
}
