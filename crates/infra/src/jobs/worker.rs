//! Queue worker: claims jobs, runs the handler, resolves the outcome.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

use fintrack_core::QueueName;
use fintrack_events::{Broadcaster, Signal};

use super::handler::JobHandler;
use super::store::{ClaimedJob, QueueStore, QueueStoreError};
use super::types::{JobError, RetryPolicy};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Name for logging
    pub name: String,
    /// Maximum jobs in flight at once
    pub concurrency: usize,
    /// Visibility lease taken on every claim
    pub lease: Duration,
    /// Idle sleep when no queue has a due job
    pub poll_interval: Duration,
    /// Sleep after a store error before claiming again
    pub error_backoff: Duration,
    /// Backoff applied to failed attempts
    pub retry: RetryPolicy,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            name: "queue-worker".to_string(),
            concurrency: 4,
            lease: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            error_backoff: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkerOptions {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Worker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Running,
    /// Shutdown requested: no new claims, in-flight jobs finishing
    Draining,
    Stopped,
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub leases_lost: u64,
    pub in_flight: usize,
}

/// Status and stats shared between a worker task and its handle.
#[derive(Debug)]
pub(crate) struct WorkerState {
    status: Mutex<WorkerStatus>,
    stats: Mutex<WorkerStats>,
}

impl WorkerState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(WorkerStatus::Starting),
            stats: Mutex::new(WorkerStats::default()),
        })
    }

    pub(crate) fn status(&self) -> WorkerStatus {
        *self.status.lock()
    }

    pub(crate) fn stats(&self) -> WorkerStats {
        self.stats.lock().clone()
    }

    fn set_status(&self, status: WorkerStatus) {
        *self.status.lock() = status;
    }
}

/// Terminal bookkeeping for one attempt.
enum Resolution {
    Succeeded,
    Retried,
    Failed,
    LeaseLost,
    StoreError,
}

struct WorkerCore {
    queues: Vec<QueueName>,
    store: Arc<dyn QueueStore>,
    handler: Arc<dyn JobHandler>,
    notifier: Option<Arc<dyn Broadcaster>>,
    options: WorkerOptions,
    state: Arc<WorkerState>,
}

/// Pulls jobs from a fixed set of queues and executes them.
///
/// Queues are claimed round-robin so one busy queue cannot starve the others;
/// within a queue, jobs are claimed oldest first. At most `concurrency` jobs are
/// in flight, and the worker does not poll while saturated.
pub struct QueueWorker {
    core: WorkerCore,
}

impl QueueWorker {
    pub fn new(
        queues: Vec<QueueName>,
        store: Arc<dyn QueueStore>,
        handler: Arc<dyn JobHandler>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            core: WorkerCore {
                queues,
                store,
                handler,
                notifier: None,
                options,
                state: WorkerState::new(),
            },
        }
    }

    /// Publish a `job_completed` signal after every successful job.
    pub fn with_notifier(mut self, notifier: Arc<dyn Broadcaster>) -> Self {
        self.core.notifier = Some(notifier);
        self
    }

    pub(crate) fn shared_state(&self) -> Arc<WorkerState> {
        self.core.state.clone()
    }

    pub fn status(&self) -> WorkerStatus {
        self.core.state.status()
    }

    pub fn stats(&self) -> WorkerStats {
        self.core.state.stats()
    }

    /// Run until `cancel` fires, then drain: stop claiming and wait for the jobs
    /// already in flight.
    pub async fn run(self, cancel: CancellationToken) {
        let core = Arc::new(self.core);
        let name = core.options.name.clone();
        let slots = Arc::new(Semaphore::new(core.options.concurrency.max(1)));
        let tracker = TaskTracker::new();
        let mut next_queue = 0usize;

        core.state.set_status(WorkerStatus::Running);
        info!(
            worker = %name,
            queues = ?core.queues,
            concurrency = core.options.concurrency,
            "queue worker started"
        );

        loop {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match core.claim_next(&mut next_queue).await {
                Ok(Some(claimed)) => {
                    core.state.stats.lock().in_flight += 1;
                    let core = core.clone();
                    let span = info_span!(
                        "job",
                        worker = %name,
                        job_id = %claimed.job.id,
                        queue = %claimed.job.queue,
                        attempt = claimed.job.attempts,
                    );
                    tracker.spawn(
                        async move {
                            core.process(claimed).await;
                            drop(permit);
                        }
                        .instrument(span),
                    );
                }
                Ok(None) => {
                    drop(permit);
                    if sleep_or_cancel(&cancel, core.options.poll_interval).await {
                        break;
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(worker = %name, error = %e, "failed to claim job");
                    if sleep_or_cancel(&cancel, core.options.error_backoff).await {
                        break;
                    }
                }
            }
        }

        core.state.set_status(WorkerStatus::Draining);
        info!(worker = %name, in_flight = tracker.len(), "queue worker draining");
        tracker.close();
        tracker.wait().await;

        core.state.set_status(WorkerStatus::Stopped);
        info!(worker = %name, "queue worker stopped");
    }
}

impl WorkerCore {
    /// Claim from the bound queues, starting after the last queue served.
    async fn claim_next(
        &self,
        next_queue: &mut usize,
    ) -> Result<Option<ClaimedJob>, QueueStoreError> {
        let count = self.queues.len();
        for offset in 0..count {
            let index = (*next_queue + offset) % count;
            if let Some(claimed) = self
                .store
                .claim(&self.queues[index], self.options.lease)
                .await?
            {
                *next_queue = (index + 1) % count;
                return Ok(Some(claimed));
            }
        }
        Ok(None)
    }

    async fn process(&self, claimed: ClaimedJob) {
        debug!("claimed job");

        let handler = self.handler.clone();
        let job = claimed.job.clone();
        // Run on its own task so a panicking handler is just a failed attempt.
        let outcome = match tokio::spawn(async move { handler.handle(&job).await }).await {
            Ok(outcome) => outcome,
            Err(join_err) => Err(JobError::failed(format!("handler panicked: {join_err}"))),
        };

        let resolution = self.resolve(&claimed, outcome).await;

        let mut stats = self.state.stats.lock();
        stats.in_flight = stats.in_flight.saturating_sub(1);
        stats.jobs_processed += 1;
        match resolution {
            Resolution::Succeeded => stats.jobs_succeeded += 1,
            Resolution::Retried => stats.jobs_retried += 1,
            Resolution::Failed => stats.jobs_failed += 1,
            Resolution::LeaseLost => stats.leases_lost += 1,
            Resolution::StoreError => {}
        }
    }

    async fn resolve(&self, claimed: &ClaimedJob, outcome: Result<(), JobError>) -> Resolution {
        let result = match outcome {
            Ok(()) => self.store.complete(claimed).await.map(|_| {
                info!("job completed");
                Resolution::Succeeded
            }),
            Err(err) => {
                let retry_delay = match &err {
                    JobError::Fatal(_) => None,
                    JobError::RetryAfter { delay, .. } => Some(*delay),
                    JobError::Failed(_) => {
                        Some(self.options.retry.delay_for_attempt(claimed.job.attempts))
                    }
                };

                match retry_delay {
                    Some(delay) if claimed.job.can_retry() => self
                        .store
                        .retry(claimed, err.message(), delay)
                        .await
                        .map(|job| {
                            warn!(
                                error = %err,
                                attempts = job.attempts,
                                max_attempts = job.max_attempts,
                                retry_in_ms = delay.as_millis() as u64,
                                "job attempt failed, retrying"
                            );
                            Resolution::Retried
                        }),
                    _ => self.store.fail(claimed, err.message()).await.map(|job| {
                        error!(
                            error = %err,
                            attempts = job.attempts,
                            "job failed permanently"
                        );
                        Resolution::Failed
                    }),
                }
            }
        };

        match result {
            Ok(Resolution::Succeeded) => {
                self.notify_completed(claimed).await;
                Resolution::Succeeded
            }
            Ok(resolution) => resolution,
            Err(QueueStoreError::LeaseLost(_)) => {
                warn!("lease lost before the job was resolved; outcome discarded");
                Resolution::LeaseLost
            }
            Err(e) => {
                // The lease will expire and the job becomes claimable again.
                error!(error = %e, "failed to record job outcome");
                Resolution::StoreError
            }
        }
    }

    async fn notify_completed(&self, claimed: &ClaimedJob) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let signal = Signal::JobCompleted {
            queue: claimed.job.queue.clone(),
            job_id: claimed.job.id,
        };
        notifier.publish(&signal.channel(), signal.to_payload()).await;
    }
}

/// Sleep for `duration`; returns `true` if cancelled first.
async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
