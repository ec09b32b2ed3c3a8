//! Monitor assembly
//!
//! Wires watchers, health tracking, the action executor and the notification
//! dispatcher together, and tears them down in dependency order.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::action::{ActionExecutor, CommandRunner, SystemRunner};
use crate::command::CommandRouter;
use crate::config::{AppConfig, MonitorConfig};
use crate::event::{SecurityEvent, ServerIdentity};
use crate::monitoring::{
    run_watcher, watch_file, Classifier, DnsResolver, HealthSettings, HealthTracker, HostnameResolver,
    LocalTailer, NoopResolver, RemoteTailer, WatchContext,
};
use crate::notification::{
    ChatTransport, Dispatcher, LoginHistory, MessageFormatter, RouteTable, WebhookTransport,
};
use crate::utils::AppError;

pub struct Monitor {
    commands: Arc<CommandRouter>,
    health: Arc<HealthTracker>,
    executor: Arc<ActionExecutor>,
    shutdown: watch::Sender<bool>,
    watchers: Vec<JoinHandle<()>>,
    dispatcher: JoinHandle<()>,
    grace: Duration,
}

impl Monitor {
    /// Start with the system ssh client and the configured webhook
    pub fn start(config: &MonitorConfig, app: &AppConfig) -> Result<Self, AppError> {
        let identities = config.identities();
        if identities.iter().any(|server| !server.is_local()) {
            std::fs::create_dir_all(&config.general.ssh_control_dir).map_err(|e| {
                AppError::internal_error(format!(
                    "cannot create ssh control dir {}: {}",
                    config.general.ssh_control_dir.display(),
                    e
                ))
            })?;
        }

        let runner = Arc::new(SystemRunner::new(
            config.general.ssh_control_dir.clone(),
            config.general.command_timeout(),
        ));
        let transport = Arc::new(WebhookTransport::from_url(app.notify_webhook_url.as_deref()));

        Self::start_with(
            config,
            runner,
            transport,
            Duration::from_secs(app.shutdown_grace_secs),
        )
    }

    /// Start with explicit command runner and chat transport
    pub fn start_with(
        config: &MonitorConfig,
        runner: Arc<dyn CommandRunner>,
        transport: Arc<dyn ChatTransport>,
        grace: Duration,
    ) -> Result<Self, AppError> {
        let identities = config.identities();
        let general = &config.general;

        let (events_tx, events_rx) = mpsc::unbounded_channel::<SecurityEvent>();
        let (announce_tx, announce_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let health = Arc::new(HealthTracker::new(
            &identities,
            HealthSettings::from(general),
            events_tx.clone(),
        ));
        let routes = Arc::new(RouteTable::from_config(&config.recipients));
        let history = Arc::new(LoginHistory::default());
        let formatter = MessageFormatter::new(&config.customization);

        let dispatcher = Dispatcher::new(
            Arc::clone(&routes),
            transport,
            formatter.clone(),
            config.notifications.clone(),
            Arc::clone(&history),
            general.notification_delay(),
        );
        let dispatcher = tokio::spawn(dispatcher.run(events_rx, announce_rx));

        let executor = Arc::new(ActionExecutor::start(
            &identities,
            Arc::clone(&runner),
            Arc::clone(&health),
            general.command_timeout(),
        ));

        let resolver: Arc<dyn HostnameResolver> = if config.customization.resolve_hostnames {
            Arc::new(DnsResolver::new(Duration::from_millis(
                config.customization.resolve_timeout_ms,
            )))
        } else {
            Arc::new(NoopResolver)
        };

        let classifier = Arc::new(Classifier::new()?);
        let context = WatchContext {
            classifier: Arc::clone(&classifier),
            resolver,
            health: Arc::clone(&health),
            events: events_tx,
            shutdown: shutdown_rx,
        };

        let mut watchers = Vec::new();
        for server in &identities {
            for source in &server.logs {
                watchers.push(spawn_watcher(
                    Arc::clone(server),
                    source.clone(),
                    Arc::clone(&runner),
                    general.command_timeout(),
                    context.clone(),
                ));
            }
        }
        drop(context);

        let commands = Arc::new(CommandRouter::new(
            identities.clone(),
            routes,
            Arc::clone(&health),
            Arc::clone(&executor),
            history,
            classifier,
            formatter,
            announce_tx,
            general.mute_default(),
        ));

        info!(
            servers = identities.len(),
            watchers = watchers.len(),
            "Monitor started"
        );

        Ok(Self {
            commands,
            health,
            executor,
            shutdown,
            watchers,
            dispatcher,
            grace,
        })
    }

    pub fn commands(&self) -> Arc<CommandRouter> {
        Arc::clone(&self.commands)
    }

    pub fn health(&self) -> Arc<HealthTracker> {
        Arc::clone(&self.health)
    }

    /// Stop watchers, finish accepted actions, then flush queued notifications
    ///
    /// Every other holder of `commands()` must be dropped before calling this, otherwise
    /// the dispatcher only stops when the grace period runs out.
    pub async fn shutdown(self) {
        let Monitor {
            commands,
            health,
            executor,
            shutdown,
            watchers,
            dispatcher,
            grace,
        } = self;

        let _ = shutdown.send(true);
        for watcher in watchers {
            if let Err(e) = watcher.await {
                warn!(error = %e, "Watcher terminated abnormally");
            }
        }
        info!("Watchers stopped");

        executor.shutdown().await;
        info!("Action executor drained");

        drop(commands);
        drop(executor);
        drop(health);

        let abort = dispatcher.abort_handle();
        match tokio::time::timeout(grace, dispatcher).await {
            Ok(Ok(())) => info!("Monitor stopped"),
            Ok(Err(e)) => warn!(error = %e, "Dispatcher terminated abnormally"),
            Err(_) => {
                warn!(grace_secs = grace.as_secs(), "Notification drain exceeded grace period");
                abort.abort();
            }
        }
    }
}

fn spawn_watcher(
    server: Arc<ServerIdentity>,
    source: crate::event::LogSource,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
    context: WatchContext,
) -> JoinHandle<()> {
    if server.is_local() {
        let reader = LocalTailer::new(server.name.clone(), source.path.clone());
        tokio::spawn(async move {
            let (file_watcher, nudges) = match watch_file(&source.path) {
                Some((file_watcher, nudges)) => (Some(file_watcher), Some(nudges)),
                None => (None, None),
            };
            run_watcher(server, source, reader, context, nudges).await;
            drop(file_watcher);
        })
    } else {
        let reader = RemoteTailer::new(Arc::clone(&server), source.path.clone(), runner, timeout);
        tokio::spawn(run_watcher(server, source, reader, context, None))
    }
}
