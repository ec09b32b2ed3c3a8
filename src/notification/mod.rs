//! Notification delivery
//!
//! - Route table: recipients, roles, mute windows
//! - Dispatcher: rate-limited per-recipient queues
//! - Chat transport boundary and message formatting

pub mod dispatcher;
pub mod format;
pub mod history;
pub mod routes;
pub mod transport;

pub use dispatcher::{Announcement, Dispatcher};
pub use format::MessageFormatter;
pub use history::{LoginHistory, LoginRecord};
pub use routes::{Caller, NotificationRoute, Role, RouteTable};
pub use transport::{ChatTransport, WebhookTransport};
