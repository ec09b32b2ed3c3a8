//! Notification dispatcher
//!
//! Single consumer of the event stream. Each event is rendered once, filtered through
//! the toggles and the route table, and appended to the FIFO queue of every recipient
//! that should see it. A recipient receives at most one message per `min_delay`;
//! anything arriving faster waits in its queue rather than being dropped. Due queue
//! heads that belong to the same event are delivered with a single transport call.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::format::MessageFormatter;
use super::history::LoginHistory;
use super::routes::RouteTable;
use super::transport::ChatTransport;
use crate::config::NotificationToggles;
use crate::event::SecurityEvent;

/// Text sent to recipients outside of the event stream, e.g. action confirmations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub recipients: Vec<String>,
    pub text: String,
}

#[derive(Debug)]
struct Queued {
    /// Arrival sequence, shared by every copy of the same message
    seq: u64,
    text: Arc<str>,
}

pub struct Dispatcher {
    routes: Arc<RouteTable>,
    transport: Arc<dyn ChatTransport>,
    formatter: MessageFormatter,
    toggles: NotificationToggles,
    history: Arc<LoginHistory>,
    min_delay: Duration,
    next_seq: u64,
    queues: HashMap<String, VecDeque<Queued>>,
    last_sent: HashMap<String, Instant>,
}

impl Dispatcher {
    pub fn new(
        routes: Arc<RouteTable>,
        transport: Arc<dyn ChatTransport>,
        formatter: MessageFormatter,
        toggles: NotificationToggles,
        history: Arc<LoginHistory>,
        min_delay: Duration,
    ) -> Self {
        Self {
            routes,
            transport,
            formatter,
            toggles,
            history,
            min_delay,
            next_seq: 0,
            queues: HashMap::new(),
            last_sent: HashMap::new(),
        }
    }

    /// Consume events and announcements until both streams close, then flush what is queued
    #[instrument(skip_all)]
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<SecurityEvent>,
        mut announcements: mpsc::UnboundedReceiver<Announcement>,
    ) {
        info!(min_delay_secs = self.min_delay.as_secs(), "Notification dispatcher started");

        let mut events_open = true;
        let mut announcements_open = true;

        while events_open || announcements_open {
            let deadline = self.next_deadline();

            tokio::select! {
                biased;
                received = events.recv(), if events_open => match received {
                    Some(event) => self.accept_event(event),
                    None => events_open = false,
                },
                received = announcements.recv(), if announcements_open => match received {
                    Some(announcement) => self.enqueue(&announcement.recipients, announcement.text.into()),
                    None => announcements_open = false,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush_due(Instant::now()).await;
                }
            }
        }

        let pending: usize = self.queues.values().map(VecDeque::len).sum();
        info!(pending, "Event stream closed, draining notification queues");

        while let Some(deadline) = self.next_deadline() {
            tokio::time::sleep_until(deadline).await;
            self.flush_due(Instant::now()).await;
        }

        info!("Notification dispatcher stopped");
    }

    fn accept_event(&mut self, event: SecurityEvent) {
        self.history.record(&event);

        if !event.is_critical() && !self.toggles.allows(event.kind) {
            debug!(kind = %event.kind, server = %event.server_name(), "Notification disabled for kind");
            return;
        }

        let recipients = self.routes.recipients_for(&event, Utc::now());
        if recipients.is_empty() {
            debug!(kind = %event.kind, "No recipient for event");
            return;
        }

        let text: Arc<str> = self.formatter.format_event(&event).into();
        self.enqueue(&recipients, text);
    }

    fn enqueue(&mut self, recipients: &[String], text: Arc<str>) {
        let seq = self.next_seq;
        self.next_seq += 1;

        for recipient in recipients {
            self.queues.entry(recipient.clone()).or_default().push_back(Queued {
                seq,
                text: Arc::clone(&text),
            });
        }
    }

    fn ready_at(&self, recipient: &str) -> Option<Instant> {
        self.last_sent.get(recipient).map(|sent| *sent + self.min_delay)
    }

    /// Earliest instant at which some queue head may be sent
    fn next_deadline(&self) -> Option<Instant> {
        let now = Instant::now();
        self.queues
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(recipient, _)| self.ready_at(recipient).unwrap_or(now))
            .min()
    }

    async fn flush_due(&mut self, now: Instant) {
        let mut batches: BTreeMap<u64, (Arc<str>, Vec<String>)> = BTreeMap::new();

        for (recipient, queue) in self.queues.iter_mut() {
            let due = self
                .last_sent
                .get(recipient)
                .map_or(true, |sent| *sent + self.min_delay <= now);
            if !due {
                continue;
            }
            if let Some(head) = queue.pop_front() {
                batches
                    .entry(head.seq)
                    .or_insert_with(|| (head.text, Vec::new()))
                    .1
                    .push(recipient.clone());
            }
        }
        self.queues.retain(|_, queue| !queue.is_empty());

        for (_, (text, mut recipients)) in batches {
            recipients.sort();
            for recipient in &recipients {
                self.last_sent.insert(recipient.clone(), now);
            }

            if let Err(e) = self.transport.deliver(&recipients, &text).await {
                warn!(error = %e, recipients = recipients.len(), "Notification delivery failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CustomizationConfig;
    use crate::event::{EventKind, ServerIdentity, Severity};
    use crate::utils::AppError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(Instant, Vec<String>, String)>>,
    }

    impl RecordingTransport {
        fn sent(&self) -> Vec<(Instant, Vec<String>, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatTransport for RecordingTransport {
        async fn deliver(&self, recipients: &[String], text: &str) -> Result<(), AppError> {
            self.sent
                .lock()
                .unwrap()
                .push((Instant::now(), recipients.to_vec(), text.to_string()));
            Ok(())
        }
    }

    struct FailingTransport;

    #[async_trait]
    impl ChatTransport for FailingTransport {
        async fn deliver(&self, _recipients: &[String], _text: &str) -> Result<(), AppError> {
            Err(AppError::DeliveryFailed("bot API down".to_string()))
        }
    }

    fn routes() -> Arc<RouteTable> {
        Arc::new(RouteTable::new(&["1".to_string()], &["2".to_string()]))
    }

    fn dispatcher(routes: Arc<RouteTable>, transport: Arc<dyn ChatTransport>) -> Dispatcher {
        Dispatcher::new(
            routes,
            transport,
            MessageFormatter::new(&CustomizationConfig::default()),
            NotificationToggles::default(),
            Arc::new(LoginHistory::default()),
            Duration::from_secs(10),
        )
    }

    fn event(kind: EventKind, subject: &str) -> SecurityEvent {
        SecurityEvent::new(kind, Arc::new(ServerIdentity::local(vec![], false)), subject, "line")
    }

    fn spawn(
        dispatcher: Dispatcher,
    ) -> (
        mpsc::UnboundedSender<SecurityEvent>,
        mpsc::UnboundedSender<Announcement>,
        tokio::task::JoinHandle<()>,
    ) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (announce_tx, announce_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(dispatcher.run(event_rx, announce_rx));
        (event_tx, announce_tx, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn should_send_one_grouped_message_per_event() {
        // Arrange
        let transport = Arc::new(RecordingTransport::default());
        let (events, announcements, handle) = spawn(dispatcher(routes(), transport.clone()));

        // Act
        events.send(event(EventKind::SshLoginSuccess, "10.0.0.5")).unwrap();
        drop(events);
        drop(announcements);
        handle.await.unwrap();

        // Assert
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, vec!["1", "2"]);
        assert!(sent[0].2.contains("10.0.0.5"));
    }

    #[tokio::test(start_paused = true)]
    async fn should_defer_burst_to_delay_boundary_without_dropping() {
        // Arrange
        let transport = Arc::new(RecordingTransport::default());
        let (events, announcements, handle) = spawn(dispatcher(routes(), transport.clone()));
        let start = Instant::now();

        // Act
        for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            events.send(event(EventKind::Fail2banBan, ip)).unwrap();
        }
        drop(events);
        drop(announcements);
        handle.await.unwrap();

        // Assert
        let sent = transport.sent();
        assert_eq!(sent.len(), 3);
        assert!(sent[0].2.contains("10.0.0.1"));
        assert!(sent[1].2.contains("10.0.0.2"));
        assert!(sent[2].2.contains("10.0.0.3"));
        assert!(sent[1].0 - sent[0].0 >= Duration::from_secs(10));
        assert!(sent[2].0 - start >= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn should_not_deliver_to_muted_recipient() {
        // Arrange
        let routes = routes();
        routes
            .mute("2", chrono::Duration::minutes(5), Utc::now())
            .expect("mute");
        let transport = Arc::new(RecordingTransport::default());
        let (events, announcements, handle) = spawn(dispatcher(routes.clone(), transport.clone()));

        // Act
        events.send(event(EventKind::SshLoginSuccess, "10.0.0.5")).unwrap();
        drop(events);
        drop(announcements);
        handle.await.unwrap();

        // Assert
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, vec!["1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn should_deliver_again_after_unmute() {
        let routes = routes();
        routes
            .mute("2", chrono::Duration::minutes(5), Utc::now())
            .expect("mute");
        routes.unmute("2", Utc::now()).expect("unmute");
        let transport = Arc::new(RecordingTransport::default());
        let (events, announcements, handle) = spawn(dispatcher(routes, transport.clone()));

        events.send(event(EventKind::SshLoginSuccess, "10.0.0.5")).unwrap();
        drop(events);
        drop(announcements);
        handle.await.unwrap();

        assert_eq!(transport.sent()[0].1, vec!["1", "2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn should_bypass_mute_for_critical_events() {
        let routes = routes();
        routes
            .mute("1", chrono::Duration::minutes(5), Utc::now())
            .expect("mute");
        let transport = Arc::new(RecordingTransport::default());
        let (events, announcements, handle) = spawn(dispatcher(routes, transport.clone()));

        let violation = event(EventKind::ServerUnreachable, "web1").with_severity(Severity::Critical);
        events.send(violation).unwrap();
        drop(events);
        drop(announcements);
        handle.await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, vec!["1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn should_skip_kinds_disabled_by_toggles() {
        let transport = Arc::new(RecordingTransport::default());
        let history = Arc::new(LoginHistory::default());
        let dispatcher = Dispatcher::new(
            routes(),
            transport.clone(),
            MessageFormatter::new(&CustomizationConfig::default()),
            NotificationToggles {
                ssh_login: false,
                ..NotificationToggles::default()
            },
            history.clone(),
            Duration::from_secs(10),
        );
        let (events, announcements, handle) = spawn(dispatcher);

        events.send(event(EventKind::SshLoginSuccess, "10.0.0.5")).unwrap();
        drop(events);
        drop(announcements);
        handle.await.unwrap();

        assert!(transport.sent().is_empty());
        assert_eq!(history.recent_on("local", 5).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn should_keep_running_after_delivery_failure() {
        let (events, announcements, handle) = spawn(dispatcher(routes(), Arc::new(FailingTransport)));

        events.send(event(EventKind::Fail2banBan, "10.0.0.1")).unwrap();
        events.send(event(EventKind::Fail2banBan, "10.0.0.2")).unwrap();
        drop(events);
        drop(announcements);

        assert!(handle.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn should_deliver_announcements_through_same_queues() {
        // Arrange
        let transport = Arc::new(RecordingTransport::default());
        let (events, announcements, handle) = spawn(dispatcher(routes(), transport.clone()));

        // Act
        events.send(event(EventKind::Fail2banBan, "10.0.0.1")).unwrap();
        tokio::task::yield_now().await;
        announcements
            .send(Announcement {
                recipients: vec!["1".to_string()],
                text: "admin 1 banned 10.0.0.9".to_string(),
            })
            .unwrap();
        drop(events);
        drop(announcements);
        handle.await.unwrap();

        // Assert
        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].1, vec!["1"]);
        assert_eq!(sent[1].2, "admin 1 banned 10.0.0.9");
        assert!(sent[1].0 - sent[0].0 >= Duration::from_secs(10));
    }
}
