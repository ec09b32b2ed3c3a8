//! Event model shared by every component
//!
//! - Server identities and their tagged log sources
//! - Classified security events

pub mod identity;

mod event_types;

pub use event_types::{EventKind, SecurityEvent, Severity};
pub use identity::{LogSource, LogTag, ServerIdentity, SshParams, LOCAL_SERVER};
