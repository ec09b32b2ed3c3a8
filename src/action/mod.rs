//! fail2ban actions and host queries on the local host and remote servers

pub mod executor;
pub mod fail2ban;
pub mod host;
pub mod runner;

pub use executor::{ActionExecutor, PendingAction};
pub use fail2ban::{ActionReport, Fail2banAction, JailStatus};
pub use host::{HostQuery, HostReport, WATCHED_SERVICES};
pub use runner::{CommandOutput, CommandRunner, SystemRunner};
