//! Log monitoring
//!
//! - Classifier: raw line to structured event
//! - Tailers: local files (notify + poll) and remote files (ssh range reads)
//! - Health tracker: per-server reachability and backoff
//! - Resolver: optional reverse DNS enrichment

pub mod classifier;
pub mod health;
pub mod log_watcher;
pub mod remote_watcher;
pub mod resolver;
pub mod tail;
pub mod watcher;

pub use classifier::Classifier;
pub use health::{HealthSettings, HealthSnapshot, HealthState, HealthTracker, PollDirective};
pub use log_watcher::{watch_file, LocalTailer};
pub use remote_watcher::RemoteTailer;
pub use resolver::{DnsResolver, HostnameResolver, NoopResolver};
pub use tail::TailCursor;
pub use watcher::{run_watcher, LogReader, WatchContext};
