//! Remote action executor
//!
//! One worker task per server drains that server's queue one job at a time, so two
//! commands on the same host never overlap while different hosts proceed in
//! parallel. Jobs are fail2ban actions or read-only host queries. For actions the
//! caller's role is checked when they are submitted and again by the worker right
//! before the command is built.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use super::fail2ban::{parse_output, ActionReport, Fail2banAction};
use super::host::{parse_host_output, HostQuery, HostReport};
use super::runner::{CommandOutput, CommandRunner};
use crate::event::ServerIdentity;
use crate::monitoring::HealthTracker;
use crate::notification::{Caller, Role};
use crate::utils::AppError;

/// A requested fail2ban operation, consumed by the executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAction {
    pub action: Fail2banAction,
    pub server: String,
    pub caller: Caller,
}

impl PendingAction {
    pub fn new(action: Fail2banAction, server: impl Into<String>, caller: Caller) -> Self {
        Self {
            action,
            server: server.into(),
            caller,
        }
    }

    fn authorize(&self) -> Result<(), AppError> {
        if self.action.is_mutating() && self.caller.role != Role::Admin {
            return Err(AppError::auth_denied(format!(
                "{} requires the admin role",
                self.action.name()
            )));
        }
        Ok(())
    }
}

/// Health source name of the action worker
const ACTION_SOURCE: &str = "actions";

enum Job {
    Action {
        pending: PendingAction,
        reply: oneshot::Sender<Result<ActionReport, AppError>>,
    },
    Query {
        query: HostQuery,
        reply: oneshot::Sender<Result<HostReport, AppError>>,
    },
}

#[derive(Clone)]
struct WorkerContext {
    runner: Arc<dyn CommandRunner>,
    health: Arc<HealthTracker>,
    timeout: Duration,
}

pub struct ActionExecutor {
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ActionExecutor {
    /// Spawn one worker per server
    pub fn start(
        identities: &[Arc<ServerIdentity>],
        runner: Arc<dyn CommandRunner>,
        health: Arc<HealthTracker>,
        timeout: Duration,
    ) -> Self {
        let context = WorkerContext {
            runner,
            health,
            timeout,
        };

        let mut queues = HashMap::new();
        let mut workers = Vec::new();
        for identity in identities {
            let (tx, rx) = mpsc::unbounded_channel();
            queues.insert(identity.name.clone(), tx);
            workers.push(tokio::spawn(run_worker(Arc::clone(identity), rx, context.clone())));
        }

        Self {
            queues: Mutex::new(queues),
            workers: Mutex::new(workers),
        }
    }

    /// Queue an action and wait for its outcome
    pub async fn submit(&self, pending: PendingAction) -> Result<ActionReport, AppError> {
        pending.authorize()?;
        pending.action.validate()?;

        let queue = self.queue(&pending.server)?;
        let (reply, outcome) = oneshot::channel();
        queue
            .send(Job::Action { pending, reply })
            .map_err(|_| shutting_down())?;

        outcome
            .await
            .map_err(|_| AppError::action_failed("Action worker stopped before replying"))?
    }

    /// Queue a read-only query on `server` and wait for its answer
    pub async fn query(&self, server: &str, query: HostQuery) -> Result<HostReport, AppError> {
        query.validate()?;

        let queue = self.queue(server)?;
        let (reply, outcome) = oneshot::channel();
        queue.send(Job::Query { query, reply }).map_err(|_| shutting_down())?;

        outcome
            .await
            .map_err(|_| AppError::action_failed("Action worker stopped before replying"))?
    }

    fn queue(&self, server: &str) -> Result<mpsc::UnboundedSender<Job>, AppError> {
        let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        if queues.is_empty() {
            return Err(shutting_down());
        }
        queues
            .get(server)
            .cloned()
            .ok_or_else(|| AppError::not_found(format!("Unknown server: {}", server)))
    }

    /// Stop accepting actions and wait until every accepted one has finished
    pub async fn shutdown(&self) {
        let queues = std::mem::take(&mut *self.queues.lock().unwrap_or_else(PoisonError::into_inner));
        drop(queues);

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Action worker terminated abnormally");
            }
        }
        info!("Action executor drained");
    }
}

fn shutting_down() -> AppError {
    AppError::action_failed("Action executor is shutting down")
}

async fn run_worker(
    server: Arc<ServerIdentity>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    context: WorkerContext,
) {
    while let Some(job) = jobs.recv().await {
        let delivered = match job {
            Job::Action { pending, reply } => reply.send(execute(&server, &pending, &context).await).is_ok(),
            Job::Query { query, reply } => reply.send(inspect(&server, &query, &context).await).is_ok(),
        };
        if !delivered {
            warn!(server = %server.name, "Requester went away before the result arrived");
        }
    }
}

#[instrument(skip_all, fields(server = %server.name, action = pending.action.name(), caller = %pending.caller.id))]
async fn execute(
    server: &ServerIdentity,
    pending: &PendingAction,
    context: &WorkerContext,
) -> Result<ActionReport, AppError> {
    pending.authorize()?;
    pending.action.validate()?;

    let output = run(server, pending.action.argv(server.use_sudo), context).await?;

    let report = parse_output(&pending.action, &output)?;
    if pending.action.is_mutating() {
        info!(action = %pending.action, "Mutating action applied");
    }
    Ok(report)
}

#[instrument(skip_all, fields(server = %server.name, query = query.name()))]
async fn inspect(server: &ServerIdentity, query: &HostQuery, context: &WorkerContext) -> Result<HostReport, AppError> {
    let output = run(server, query.argv(), context).await?;
    parse_host_output(query, &output)
}

/// Run one command unless the server is halted; a host key failure halts it
async fn run(server: &ServerIdentity, argv: Vec<String>, context: &WorkerContext) -> Result<CommandOutput, AppError> {
    if context.health.is_halted(&server.name) {
        return Err(AppError::trust_violation(
            &server.name,
            "host key is not trusted, re-pin it and run /server retry",
        ));
    }

    context
        .runner
        .run(server, &argv, context.timeout)
        .await
        .map_err(|e| {
            if e.is_trust_violation() {
                context.health.report_failure(&server.name, ACTION_SOURCE, &e);
            }
            warn!(error = %e, "Command could not be executed");
            e
        })
}
