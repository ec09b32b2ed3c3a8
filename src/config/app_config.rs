use std::env;
use std::path::PathBuf;

/// Process settings read from the environment
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Path of the monitor configuration (TOML)
    pub monitor_config_path: PathBuf,
    /// Port of the inbound command API
    pub server_port: u16,
    /// HMAC key for signed command requests
    pub command_secret: String,
    /// Outbound chat webhook, `None` disables delivery
    pub notify_webhook_url: Option<String>,
    /// Upper bound for draining actions and notifications on shutdown
    pub shutdown_grace_secs: u64,
}

impl AppConfig {
    /// Load settings from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let monitor_config_path = env::var("SECUREWATCH_CONFIG")
            .unwrap_or_else(|_| "/etc/securewatch/config.toml".to_string())
            .into();

        let server_port = env::var("SERVER_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let command_secret = env::var("COMMAND_SECRET").map_err(|_| ConfigError::MissingCommandSecret)?;
        if command_secret.trim().is_empty() {
            return Err(ConfigError::MissingCommandSecret);
        }

        let notify_webhook_url = env::var("NOTIFY_WEBHOOK_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        let shutdown_grace_secs = env::var("SHUTDOWN_GRACE_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidGracePeriod)?;

        Ok(Self {
            monitor_config_path,
            server_port,
            command_secret,
            notify_webhook_url,
            shutdown_grace_secs,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid port number")]
    InvalidPort,
    #[error("Invalid shutdown grace period")]
    InvalidGracePeriod,
    #[error("COMMAND_SECRET environment variable is required")]
    MissingCommandSecret,
    #[error("Failed to read {path}: {reason}")]
    Read { path: String, reason: String },
    #[error("Failed to parse monitor configuration: {0}")]
    Parse(String),
    #[error("Invalid monitor configuration: {0}")]
    Invalid(String),
}
