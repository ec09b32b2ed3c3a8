//! Best-effort reverse DNS enrichment of event subjects

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

use crate::event::SecurityEvent;

#[async_trait]
pub trait HostnameResolver: Send + Sync {
    /// PTR name of `ip`, or `None` when unknown or too slow
    async fn resolve(&self, ip: IpAddr) -> Option<String>;
}

/// Resolver used when hostname resolution is disabled
pub struct NoopResolver;

#[async_trait]
impl HostnameResolver for NoopResolver {
    async fn resolve(&self, _ip: IpAddr) -> Option<String> {
        None
    }
}

/// System-configured DNS with a bounded lookup time
pub struct DnsResolver {
    resolver: TokioAsyncResolver,
    timeout: Duration,
}

impl DnsResolver {
    pub fn new(timeout: Duration) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        opts.attempts = 1;
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), opts),
            timeout,
        }
    }
}

#[async_trait]
impl HostnameResolver for DnsResolver {
    async fn resolve(&self, ip: IpAddr) -> Option<String> {
        let lookup = match tokio::time::timeout(self.timeout, self.resolver.reverse_lookup(ip)).await {
            Ok(Ok(lookup)) => lookup,
            Ok(Err(e)) => {
                debug!(%ip, error = %e, "Reverse lookup failed");
                return None;
            }
            Err(_) => {
                debug!(%ip, "Reverse lookup timed out");
                return None;
            }
        };

        let name = lookup.iter().next()?.to_string();
        let name = name.strip_suffix('.').unwrap_or(&name).to_string();
        (!name.is_empty()).then_some(name)
    }
}

/// Attach the resolved hostname of the event's subject, if it is an IP that resolves
pub async fn enrich(resolver: &dyn HostnameResolver, event: &mut SecurityEvent) {
    if event.kind.is_admin_only() {
        return;
    }
    let Ok(ip) = event.subject.parse::<IpAddr>() else {
        return;
    };
    event.hostname = resolver.resolve(ip).await;
}
