pub mod app_config;
pub mod monitor_config;

pub use app_config::{AppConfig, ConfigError};
pub use monitor_config::{
    CustomizationConfig, GeneralConfig, LocalConfig, LogPaths, MonitorConfig, NotificationToggles,
    RecipientsConfig, RemoteServerConfig, MAX_MUTE_MINUTES,
};
