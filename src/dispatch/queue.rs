//! Worker pools, one per queue, with supervision and retry.
//!
//! Each queue owns an unbounded channel and a fixed number of workers. A
//! worker takes one task at a time (prefetch = 1) and only asks for the next
//! one when the current task has settled, so a long conversion never hoards
//! queued work that an idle worker could start.
//!
//! ## Supervision
//!
//! * **Late acknowledgment.** A task runs on its own tokio task. If it
//!   panics, the envelope is still held by the worker and is redelivered up
//!   to `max_redeliveries` times.
//! * **Time limits.** Past the soft limit [`TaskContext::soft_limit_reached`]
//!   turns true and the task is expected to wrap up. Past the hard limit the
//!   task is aborted and fails with [`RelayError::TimeLimitExceeded`].
//! * **Retry.** Errors whose [`crate::error::FailureKind`] is retryable are
//!   tried again with capped exponential backoff, up to `max_retries`. Every
//!   other error is final.
//!
//! Shutdown: [`Dispatcher::shutdown`] stops accepting work and closes every
//! queue. Workers keep taking tasks until their queue is empty, so every
//! ticket issued before shutdown still settles with the task's own result.

use super::{QueueName, TaskKind, TaskOutput, TaskRequest};
use crate::config::DispatchSettings;
use crate::error::RelayError;
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Cap on the delay between retries of a transiently failing task.
pub const MAX_RETRY_BACKOFF_SECS: u64 = 60;

/// Delay before retry number `retry` (1-based): 2, 4, 8, ... seconds.
pub(crate) fn retry_backoff(retry: u32) -> Duration {
    Duration::from_secs(2_u64.saturating_pow(retry).min(MAX_RETRY_BACKOFF_SECS))
}

/// Executes requests. Implemented by [`super::TaskExecutor`].
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, request: &TaskRequest, ctx: &TaskContext)
        -> Result<TaskOutput, RelayError>;
}

/// What a running task knows about itself.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task_id: Uuid,
    kind: TaskKind,
    attempt: u32,
    soft_deadline: Instant,
}

impl TaskContext {
    pub fn new(task_id: Uuid, kind: TaskKind, attempt: u32, soft_limit: Duration) -> Self {
        Self {
            task_id,
            kind,
            attempt,
            soft_deadline: Instant::now() + soft_limit,
        }
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// 1-based, counting retries and redeliveries.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// True once the task should stop starting new work.
    pub fn soft_limit_reached(&self) -> bool {
        Instant::now() >= self.soft_deadline
    }
}

type Reply = oneshot::Sender<Result<TaskOutput, RelayError>>;

struct Envelope {
    id: Uuid,
    kind: TaskKind,
    request: Arc<TaskRequest>,
    reply: Reply,
}

/// Handle to a submitted task.
#[derive(Debug)]
pub struct TaskTicket {
    pub id: Uuid,
    pub kind: TaskKind,
    pub queue: String,
    result: oneshot::Receiver<Result<TaskOutput, RelayError>>,
}

impl TaskTicket {
    /// Wait for the task to settle.
    pub async fn wait(self) -> Result<TaskOutput, RelayError> {
        self.result.await.map_err(|_| {
            RelayError::DispatcherClosed(format!("task {} was dropped before it settled", self.id))
        })?
    }
}

/// Routes requests onto queues and runs them.
pub struct Dispatcher {
    senders: HashMap<QueueName, mpsc::UnboundedSender<Envelope>>,
    names: HashMap<QueueName, String>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawn every queue's workers. Must be called inside a tokio runtime.
    pub fn start(settings: DispatchSettings, handler: Arc<dyn TaskHandler>) -> Self {
        let settings = Arc::new(settings);
        let mut senders = HashMap::new();
        let mut names = HashMap::new();
        let mut workers = Vec::new();

        for queue in QueueName::ALL {
            let qs = queue.settings(&settings).clone();
            let (tx, rx) = mpsc::unbounded_channel();
            let rx = Arc::new(Mutex::new(rx));
            for worker in 0..qs.workers {
                workers.push(tokio::spawn(worker_loop(
                    qs.name.clone(),
                    worker,
                    rx.clone(),
                    handler.clone(),
                    settings.clone(),
                )));
            }
            info!(queue = %qs.name, workers = qs.workers, "Queue started");
            senders.insert(queue, tx);
            names.insert(queue, qs.name);
        }

        Self {
            senders,
            names,
            workers,
        }
    }

    /// Configured name of `queue`.
    pub fn queue_name(&self, queue: QueueName) -> &str {
        self.names.get(&queue).map(String::as_str).unwrap_or("default")
    }

    /// Validate `request` and queue it on its kind's queue.
    pub fn submit(&self, request: TaskRequest) -> Result<TaskTicket, RelayError> {
        request.validate()?;
        let kind = request.kind()?;
        let queue = kind.route();
        let sender = self
            .senders
            .get(&queue)
            .ok_or_else(|| RelayError::DispatcherClosed(format!("no queue for {kind}")))?;

        let id = Uuid::new_v4();
        let (reply, result) = oneshot::channel();
        sender
            .send(Envelope {
                id,
                kind,
                request: Arc::new(request),
                reply,
            })
            .map_err(|_| RelayError::DispatcherClosed("dispatcher is shutting down".into()))?;

        let queue = self.queue_name(queue).to_string();
        debug!(task_id = %id, %kind, %queue, "Task submitted");
        Ok(TaskTicket {
            id,
            kind,
            queue,
            result,
        })
    }

    /// Stop accepting work, then wait for every queued and in-flight task
    /// to settle.
    pub async fn shutdown(mut self) {
        // Dropping the senders closes the queues; workers exit once drained.
        self.senders.clear();
        info!(workers = self.workers.len(), "Draining queues");
        for joined in join_all(self.workers.drain(..)).await {
            if let Err(e) = joined {
                error!(error = %e, "Worker ended abnormally");
            }
        }
        info!("Dispatcher stopped");
    }
}

async fn worker_loop(
    queue: String,
    worker: usize,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Envelope>>>,
    handler: Arc<dyn TaskHandler>,
    settings: Arc<DispatchSettings>,
) {
    debug!(%queue, worker, "Worker ready");
    loop {
        let next = rx.lock().await.recv().await;
        let Some(envelope) = next else { break };

        let Envelope {
            id,
            kind,
            request,
            reply,
        } = envelope;
        let result = supervise(&queue, id, kind, request, handler.clone(), &settings).await;
        if reply.send(result).is_err() {
            debug!(task_id = %id, "Submitter went away before the result");
        }
    }
    debug!(%queue, worker, "Worker stopped");
}

#[instrument(name = "task", skip_all, fields(queue = %queue, task_id = %id, kind = %kind))]
async fn supervise(
    queue: &str,
    id: Uuid,
    kind: TaskKind,
    request: Arc<TaskRequest>,
    handler: Arc<dyn TaskHandler>,
    settings: &DispatchSettings,
) -> Result<TaskOutput, RelayError> {
    let mut attempt = 0u32;
    let mut retries = 0u32;
    let mut redeliveries = 0u32;

    loop {
        attempt += 1;
        let ctx = TaskContext::new(id, kind, attempt, settings.soft_time_limit);
        let started = Instant::now();
        let mut running = tokio::spawn({
            let handler = handler.clone();
            let request = request.clone();
            async move { handler.handle(&request, &ctx).await }
        });

        let outcome = match tokio::time::timeout(settings.hard_time_limit, &mut running).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) if join.is_panic() => {
                if redeliveries < settings.max_redeliveries {
                    redeliveries += 1;
                    warn!(attempt, redeliveries, "Task crashed; redelivering");
                    continue;
                }
                Err(RelayError::Internal(format!(
                    "task crashed {} times",
                    redeliveries + 1
                )))
            }
            Ok(Err(join)) => Err(RelayError::Internal(format!("task cancelled: {join}"))),
            Err(_) => {
                running.abort();
                Err(RelayError::TimeLimitExceeded {
                    limit: settings.hard_time_limit.as_secs(),
                })
            }
        };

        match outcome {
            Ok(output) => {
                info!(
                    attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Task succeeded"
                );
                return Ok(output);
            }
            Err(e) if e.kind().is_retryable() && retries < settings.max_retries => {
                retries += 1;
                let delay = retry_backoff(retries);
                warn!(attempt, retries, delay_s = delay.as_secs(), error = %e, "Task failed; retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!(attempt, kind = %e.kind(), error = %e, "Task failed");
                return Err(e);
            }
        }
    }
}
