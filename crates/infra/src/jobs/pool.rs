//! Worker pool: starts queue workers and drains them on shutdown.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fintrack_core::{ConfigError, QueueName};
use fintrack_events::Broadcaster;

use super::handler::JobHandler;
use super::store::{QueueStore, QueueStoreError};
use super::worker::{QueueWorker, WorkerOptions, WorkerState, WorkerStats, WorkerStatus};

/// Errors from [`WorkerPool::start_worker`].
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to reach the queue store: {0}")]
    Connection(#[source] QueueStoreError),
}

/// Handle on a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    queues: Vec<QueueName>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
    state: Arc<WorkerState>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queues(&self) -> &[QueueName] {
        &self.queues
    }

    pub fn status(&self) -> WorkerStatus {
        self.state.status()
    }

    pub fn stats(&self) -> WorkerStats {
        self.state.stats()
    }
}

/// Outcome of [`WorkerPool::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Workers that finished draining within the timeout
    pub workers_drained: usize,
    /// Workers still busy when the timeout expired
    pub workers_timed_out: usize,
    /// Jobs left running; their leases expire and they are redelivered
    pub jobs_abandoned: usize,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.workers_timed_out == 0
    }
}

/// Owns the queue workers of one process.
///
/// Each queue may be bound by at most one worker in the process.
pub struct WorkerPool {
    store: Arc<dyn QueueStore>,
    defaults: WorkerOptions,
    notifier: Option<Arc<dyn Broadcaster>>,
    bound: HashSet<QueueName>,
    workers: Vec<WorkerHandle>,
}

impl WorkerPool {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            store,
            defaults: WorkerOptions::default(),
            notifier: None,
            bound: HashSet::new(),
            workers: Vec::new(),
        }
    }

    /// Options used by [`WorkerPool::start_worker`] (concurrency is overridden per worker).
    pub fn with_defaults(mut self, defaults: WorkerOptions) -> Self {
        self.defaults = defaults;
        self
    }

    /// Announce completed jobs on the job-events channel.
    pub fn with_notifier(mut self, notifier: Arc<dyn Broadcaster>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    pub fn is_bound(&self, queue: &QueueName) -> bool {
        self.bound.contains(queue)
    }

    /// Start a worker on `queues` with the pool's default options.
    pub async fn start_worker(
        &mut self,
        queues: Vec<QueueName>,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) -> Result<&WorkerHandle, PoolError> {
        let options = self.defaults.clone().with_concurrency(concurrency);
        self.start_worker_with(queues, options, handler).await
    }

    /// Start a worker with explicit options.
    ///
    /// Fails with [`ConfigError`] on an empty queue set, zero concurrency or a
    /// queue already bound in this pool, and with [`PoolError::Connection`] when
    /// the queue store is unreachable. Nothing is retried here.
    pub async fn start_worker_with(
        &mut self,
        queues: Vec<QueueName>,
        mut options: WorkerOptions,
        handler: Arc<dyn JobHandler>,
    ) -> Result<&WorkerHandle, PoolError> {
        if queues.is_empty() {
            return Err(ConfigError::NoQueues.into());
        }
        if options.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency.into());
        }
        let mut seen = HashSet::new();
        for queue in &queues {
            if self.bound.contains(queue) || !seen.insert(queue) {
                return Err(ConfigError::DuplicateQueue(queue.to_string()).into());
            }
        }

        self.store.ping().await.map_err(PoolError::Connection)?;

        if options.name == WorkerOptions::default().name {
            let names: Vec<&str> = queues.iter().map(QueueName::as_str).collect();
            options.name = format!("worker[{}]", names.join(","));
        }

        let mut worker =
            QueueWorker::new(queues.clone(), self.store.clone(), handler, options.clone());
        if let Some(notifier) = &self.notifier {
            worker = worker.with_notifier(notifier.clone());
        }

        let state = worker.shared_state();
        let cancel = CancellationToken::new();
        let join = tokio::spawn(worker.run(cancel.clone()));

        info!(worker = %options.name, queues = ?queues, "worker registered");
        self.bound.extend(queues.iter().cloned());
        self.workers.push(WorkerHandle {
            name: options.name,
            queues,
            cancel,
            join,
            state,
        });

        let index = self.workers.len() - 1;
        Ok(&self.workers[index])
    }

    /// Signal every worker to drain and wait up to `timeout` for them.
    ///
    /// Jobs still running at the deadline are abandoned: their leases expire and
    /// the store hands them to another worker later.
    pub async fn shutdown(self, timeout: Duration) -> ShutdownReport {
        info!(
            workers = self.workers.len(),
            timeout_secs = timeout.as_secs_f64(),
            "shutting down worker pool"
        );
        for worker in &self.workers {
            worker.cancel.cancel();
        }

        let deadline = Instant::now() + timeout;
        let mut report = ShutdownReport::default();

        for mut worker in self.workers {
            match tokio::time::timeout_at(deadline, &mut worker.join).await {
                Ok(Ok(())) => report.workers_drained += 1,
                Ok(Err(e)) => {
                    warn!(worker = %worker.name, error = %e, "worker task ended abnormally");
                    report.workers_drained += 1;
                }
                Err(_) => {
                    let in_flight = worker.state.stats().in_flight;
                    warn!(
                        worker = %worker.name,
                        in_flight,
                        "worker did not drain before the shutdown timeout"
                    );
                    report.workers_timed_out += 1;
                    report.jobs_abandoned += in_flight;
                }
            }
        }

        info!(
            drained = report.workers_drained,
            timed_out = report.workers_timed_out,
            abandoned = report.jobs_abandoned,
            "worker pool stopped"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::jobs::handler::handler_fn;
    use crate::jobs::store::{ClaimedJob, InMemoryQueueStore, QueueStats};
    use crate::jobs::types::{Job, JobState};
    use fintrack_core::JobId;

    fn q(name: &'static str) -> QueueName {
        QueueName::from_static(name)
    }

    fn noop() -> Arc<dyn JobHandler> {
        Arc::new(handler_fn(|_job| async { Ok(()) }))
    }

    fn fast_defaults() -> WorkerOptions {
        WorkerOptions::default().with_poll_interval(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn binding_a_queue_twice_is_rejected() {
        let mut pool = WorkerPool::new(InMemoryQueueStore::arc());
        pool.start_worker(vec![q("audit-log")], 1, noop()).await.unwrap();

        let err = pool
            .start_worker(vec![q("messages"), q("audit-log")], 1, noop())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PoolError::Config(ConfigError::DuplicateQueue(ref name)) if name == "audit-log"
        ));
        // The rejected call binds nothing
        assert!(!pool.is_bound(&q("messages")));

        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn invalid_worker_configs_are_rejected() {
        let mut pool = WorkerPool::new(InMemoryQueueStore::arc());

        assert!(matches!(
            pool.start_worker(vec![], 1, noop()).await,
            Err(PoolError::Config(ConfigError::NoQueues))
        ));
        assert!(matches!(
            pool.start_worker(vec![q("messages")], 0, noop()).await,
            Err(PoolError::Config(ConfigError::ZeroConcurrency))
        ));
        assert!(matches!(
            pool.start_worker(vec![q("messages"), q("messages")], 1, noop()).await,
            Err(PoolError::Config(ConfigError::DuplicateQueue(_)))
        ));
    }

    struct UnreachableStore;

    #[async_trait]
    impl QueueStore for UnreachableStore {
        async fn ping(&self) -> Result<(), QueueStoreError> {
            Err(QueueStoreError::Connection("connection refused".into()))
        }
        async fn enqueue(&self, _job: Job) -> Result<JobId, QueueStoreError> {
            unreachable!()
        }
        async fn claim(
            &self,
            _queue: &QueueName,
            _lease: Duration,
        ) -> Result<Option<ClaimedJob>, QueueStoreError> {
            unreachable!()
        }
        async fn complete(&self, _claimed: &ClaimedJob) -> Result<Job, QueueStoreError> {
            unreachable!()
        }
        async fn retry(
            &self,
            _claimed: &ClaimedJob,
            _error: &str,
            _delay: Duration,
        ) -> Result<Job, QueueStoreError> {
            unreachable!()
        }
        async fn fail(&self, _claimed: &ClaimedJob, _error: &str) -> Result<Job, QueueStoreError> {
            unreachable!()
        }
        async fn get(&self, _queue: &QueueName, _id: JobId) -> Result<Option<Job>, QueueStoreError> {
            unreachable!()
        }
        async fn list_failed(
            &self,
            _queue: &QueueName,
            _limit: usize,
        ) -> Result<Vec<Job>, QueueStoreError> {
            unreachable!()
        }
        async fn requeue_failed(
            &self,
            _queue: &QueueName,
            _id: JobId,
            _extra_attempts: u32,
        ) -> Result<Job, QueueStoreError> {
            unreachable!()
        }
        async fn stats(&self, _queue: &QueueName) -> Result<QueueStats, QueueStoreError> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn unreachable_store_fails_startup() {
        let mut pool = WorkerPool::new(Arc::new(UnreachableStore));
        let err = pool
            .start_worker(vec![q("messages")], 1, noop())
            .await
            .unwrap_err();

        assert!(matches!(err, PoolError::Connection(_)));
        assert!(pool.workers().is_empty());
        assert!(!pool.is_bound(&q("messages")));
    }

    #[tokio::test]
    async fn workers_process_their_own_queues() {
        let store = InMemoryQueueStore::arc();
        let mut pool = WorkerPool::new(store.clone()).with_defaults(fast_defaults());
        pool.start_worker(vec![q("audit-log")], 2, noop()).await.unwrap();
        pool.start_worker(vec![q("messages")], 2, noop()).await.unwrap();

        let audit = Job::new(q("audit-log"), json!({}));
        let message = Job::new(q("messages"), json!({}));
        store.enqueue(audit.clone()).await.unwrap();
        store.enqueue(message.clone()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let a = store.get(&audit.queue, audit.id).await.unwrap().unwrap();
                let m = store.get(&message.queue, message.id).await.unwrap().unwrap();
                if a.state == JobState::Completed && m.state == JobState::Completed {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(pool.workers().iter().all(|w| w.status() == WorkerStatus::Running));
        let report = pool.shutdown(Duration::from_secs(1)).await;
        assert_eq!(report.workers_drained, 2);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn shutdown_timeout_abandons_stuck_jobs() {
        let store = InMemoryQueueStore::arc();
        let mut pool = WorkerPool::new(store.clone()).with_defaults(fast_defaults());
        let stuck = Arc::new(handler_fn(|_job| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }));
        pool.start_worker(vec![q("messages")], 1, stuck).await.unwrap();

        let job = Job::new(q("messages"), json!({}));
        store.enqueue(job.clone()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.get(&job.queue, job.id).await.unwrap().unwrap().state != JobState::Active {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let report = pool.shutdown(Duration::from_millis(50)).await;
        assert_eq!(report.workers_timed_out, 1);
        assert_eq!(report.jobs_abandoned, 1);

        // Nobody resolved it; the lease is the only way back
        let job = store.get(&job.queue, job.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Active);
    }
}
