//! Chat command grammar

use crate::config::MAX_MUTE_MINUTES;
use crate::utils::AppError;

pub const DEFAULT_HISTORY_LIMIT: usize = 5;
pub const MAX_HISTORY_LIMIT: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    Start,
    Help,
    Status,
    LoginHistory { limit: usize },
    ServerList,
    ServerStatus { name: String },
    ServerRetry { name: String },
    Fail2banList { server: Option<String> },
    Fail2banStatus { jail: String, server: Option<String> },
    Fail2banBan { ip: String, jail: String, server: Option<String> },
    Fail2banUnban { ip: String, jail: String, server: Option<String> },
    Mute { minutes: Option<u64> },
    Unmute,
    Unknown { command: String },
}

impl BotCommand {
    /// Parse a command line such as `/fail2ban ban 10.0.0.5 sshd web1`
    ///
    /// A `@botname` suffix on the command word is ignored.
    pub fn parse(text: &str) -> Result<Self, AppError> {
        let mut words = text.split_whitespace();
        let Some(first) = words.next() else {
            return Err(AppError::bad_request("Empty command"));
        };
        let command = first.split('@').next().unwrap_or(first).to_lowercase();
        let args: Vec<&str> = words.collect();

        let parsed = match command.as_str() {
            "/start" => BotCommand::Start,
            "/help" => BotCommand::Help,
            "/status" => BotCommand::Status,
            "/login_history" => BotCommand::LoginHistory {
                limit: parse_limit(args.first().copied())?,
            },
            "/server" => parse_server(&args)?,
            "/fail2ban" => parse_fail2ban(&args)?,
            "/mute" => BotCommand::Mute {
                minutes: args.first().map(|m| parse_minutes(m)).transpose()?,
            },
            "/unmute" => BotCommand::Unmute,
            _ => BotCommand::Unknown { command },
        };
        Ok(parsed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            BotCommand::Start => "start",
            BotCommand::Help => "help",
            BotCommand::Status => "status",
            BotCommand::LoginHistory { .. } => "login_history",
            BotCommand::ServerList => "server_list",
            BotCommand::ServerStatus { .. } => "server_status",
            BotCommand::ServerRetry { .. } => "server_retry",
            BotCommand::Fail2banList { .. } => "fail2ban_list",
            BotCommand::Fail2banStatus { .. } => "fail2ban_status",
            BotCommand::Fail2banBan { .. } => "fail2ban_ban",
            BotCommand::Fail2banUnban { .. } => "fail2ban_unban",
            BotCommand::Mute { .. } => "mute",
            BotCommand::Unmute => "unmute",
            BotCommand::Unknown { .. } => "unknown",
        }
    }
}

fn parse_limit(arg: Option<&str>) -> Result<usize, AppError> {
    let Some(arg) = arg else {
        return Ok(DEFAULT_HISTORY_LIMIT);
    };
    let limit: usize = arg
        .parse()
        .map_err(|_| AppError::bad_request("Usage: /login_history [count]"))?;
    if limit == 0 {
        return Err(AppError::bad_request("Count must be at least 1"));
    }
    Ok(limit.min(MAX_HISTORY_LIMIT))
}

fn parse_minutes(arg: &str) -> Result<u64, AppError> {
    let minutes: u64 = arg
        .parse()
        .map_err(|_| AppError::bad_request("Usage: /mute [minutes]"))?;
    if minutes == 0 {
        return Err(AppError::bad_request("Mute duration must be at least 1 minute"));
    }
    Ok(minutes.min(MAX_MUTE_MINUTES))
}

fn parse_server(args: &[&str]) -> Result<BotCommand, AppError> {
    match args {
        [] | ["list"] => Ok(BotCommand::ServerList),
        ["status", name] => Ok(BotCommand::ServerStatus {
            name: name.to_string(),
        }),
        ["retry", name] => Ok(BotCommand::ServerRetry {
            name: name.to_string(),
        }),
        _ => Err(AppError::bad_request(
            "Usage: /server list | /server status NAME | /server retry NAME",
        )),
    }
}

fn parse_fail2ban(args: &[&str]) -> Result<BotCommand, AppError> {
    let server = |s: Option<&&str>| s.map(|s| s.to_string());
    match args {
        ["list", rest @ ..] if rest.len() <= 1 => Ok(BotCommand::Fail2banList {
            server: server(rest.first()),
        }),
        ["status", jail, rest @ ..] if rest.len() <= 1 => Ok(BotCommand::Fail2banStatus {
            jail: jail.to_string(),
            server: server(rest.first()),
        }),
        ["ban", ip, jail, rest @ ..] if rest.len() <= 1 => Ok(BotCommand::Fail2banBan {
            ip: ip.to_string(),
            jail: jail.to_string(),
            server: server(rest.first()),
        }),
        ["unban", ip, jail, rest @ ..] if rest.len() <= 1 => Ok(BotCommand::Fail2banUnban {
            ip: ip.to_string(),
            jail: jail.to_string(),
            server: server(rest.first()),
        }),
        _ => Err(AppError::bad_request(
            "Usage: /fail2ban list [SERVER] | status JAIL [SERVER] | ban IP JAIL [SERVER] | unban IP JAIL [SERVER]",
        )),
    }
}
