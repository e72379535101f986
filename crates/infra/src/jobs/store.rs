//! Queue storage: the durable home of job records.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use fintrack_core::{JobId, LeaseToken, QueueName};

use super::types::{Job, JobState, to_chrono};

/// Error recorded on a job whose lease ran out on its final attempt.
pub const LEASE_EXPIRED_ERROR: &str = "visibility lease expired on final attempt";

/// How long completed jobs stay readable before the store drops them.
pub const DEFAULT_COMPLETED_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// A job held by one worker under a visibility lease.
///
/// Every transition after the claim must present the lease token; once the
/// lease has expired and the job was claimed again, the old token is rejected
/// with [`QueueStoreError::LeaseLost`].
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: Job,
    pub lease: LeaseToken,
    pub lease_expires_at: DateTime<Utc>,
}

/// Queue store abstraction.
///
/// Implementations must make `claim` atomic: a job is `active` in at most one
/// worker at a time.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Check that the backing store is reachable.
    async fn ping(&self) -> Result<(), QueueStoreError>;

    /// Enqueue a new job.
    async fn enqueue(&self, job: Job) -> Result<JobId, QueueStoreError>;

    /// Claim the oldest due job of `queue` (FIFO by `created_at`), marking it
    /// `active` and incrementing `attempts`. Expired leases are recovered first.
    async fn claim(
        &self,
        queue: &QueueName,
        lease: Duration,
    ) -> Result<Option<ClaimedJob>, QueueStoreError>;

    /// Mark a claimed job `completed`.
    async fn complete(&self, claimed: &ClaimedJob) -> Result<Job, QueueStoreError>;

    /// Put a claimed job back in line after `delay`, recording `error`.
    async fn retry(
        &self,
        claimed: &ClaimedJob,
        error: &str,
        delay: Duration,
    ) -> Result<Job, QueueStoreError>;

    /// Mark a claimed job `failed` (terminal).
    async fn fail(&self, claimed: &ClaimedJob, error: &str) -> Result<Job, QueueStoreError>;

    /// Get a job by ID.
    async fn get(&self, queue: &QueueName, id: JobId) -> Result<Option<Job>, QueueStoreError>;

    /// List failed jobs, oldest failure first.
    async fn list_failed(
        &self,
        queue: &QueueName,
        limit: usize,
    ) -> Result<Vec<Job>, QueueStoreError>;

    /// Move a failed job back to `waiting`, granting `extra_attempts` more tries.
    async fn requeue_failed(
        &self,
        queue: &QueueName,
        id: JobId,
        extra_attempts: u32,
    ) -> Result<Job, QueueStoreError>;

    /// Get queue statistics.
    async fn stats(&self, queue: &QueueName) -> Result<QueueStats, QueueStoreError>;
}

/// Queue store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueStoreError {
    #[error("queue store connection error: {0}")]
    Connection(String),
    #[error("queue store command error: {0}")]
    Command(String),
    #[error("job serialization error: {0}")]
    Serialization(String),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("lease lost for job {0}")]
    LeaseLost(JobId),
    #[error("job {id} is {state}, expected {expected}")]
    InvalidState {
        id: JobId,
        state: JobState,
        expected: JobState,
    },
}

/// Per-queue job counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct QueueSlot {
    jobs: HashMap<JobId, Job>,
    /// Due jobs by `(created_at, id)`; claim takes the first.
    waiting: BTreeSet<(DateTime<Utc>, JobId)>,
    /// Delayed jobs by `(run_at, id)`.
    delayed: BTreeSet<(DateTime<Utc>, JobId)>,
    leases: HashMap<JobId, (LeaseToken, DateTime<Utc>)>,
    /// Completed jobs in completion order, pruned past the retention window.
    completed: VecDeque<(DateTime<Utc>, JobId)>,
}

impl QueueSlot {
    /// File a job under the index matching its state.
    fn index(&mut self, id: JobId) {
        let Some(job) = self.jobs.get(&id) else {
            return;
        };
        match job.state {
            JobState::Waiting => {
                self.waiting.insert((job.created_at, id));
            }
            JobState::Delayed => {
                self.delayed.insert((job.run_at, id));
            }
            JobState::Completed => self.completed.push_back((job.updated_at, id)),
            JobState::Active | JobState::Failed => {}
        }
    }

    /// Return jobs whose lease ran out to the line, or fail them when that was
    /// their last attempt.
    fn recover_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<JobId> = self
            .leases
            .iter()
            .filter(|(_, (_, expires_at))| *expires_at <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            self.leases.remove(&id);
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            if job.can_retry() {
                job.state = JobState::Waiting;
                job.updated_at = now;
            } else {
                job.mark_failed(LEASE_EXPIRED_ERROR, now);
            }
            self.index(id);
        }
    }

    /// Move delayed jobs whose `run_at` has passed into the waiting line.
    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(&(run_at, id)) = self.delayed.first() {
            if run_at > now {
                break;
            }
            self.delayed.pop_first();
            if let Some(job) = self.jobs.get_mut(&id) {
                job.state = JobState::Waiting;
            }
            self.index(id);
        }
    }

    /// Drop completed jobs older than `retention`.
    fn prune_completed(&mut self, now: DateTime<Utc>, retention: Duration) {
        let cutoff = now - to_chrono(retention);
        while let Some(&(completed_at, id)) = self.completed.front() {
            if completed_at > cutoff {
                break;
            }
            self.completed.pop_front();
            self.jobs.remove(&id);
        }
    }

    fn check_lease(&self, claimed: &ClaimedJob) -> Result<(), QueueStoreError> {
        match self.leases.get(&claimed.job.id) {
            Some((token, _)) if *token == claimed.lease => Ok(()),
            _ => Err(QueueStoreError::LeaseLost(claimed.job.id)),
        }
    }

    /// Apply `transition` to a leased job, release its lease and re-index it.
    fn resolve(
        &mut self,
        claimed: &ClaimedJob,
        transition: impl FnOnce(&mut Job),
    ) -> Result<Job, QueueStoreError> {
        self.check_lease(claimed)?;
        let id = claimed.job.id;
        let job = self.jobs.get_mut(&id).ok_or(QueueStoreError::NotFound(id))?;
        transition(job);
        let job = job.clone();
        self.leases.remove(&id);
        self.index(id);
        Ok(job)
    }
}

/// In-memory queue store for tests/dev.
///
/// Completed jobs stay readable for `completed_retention` and are then
/// dropped; failed jobs are kept until requeued.
#[derive(Debug)]
pub struct InMemoryQueueStore {
    queues: Mutex<HashMap<QueueName, QueueSlot>>,
    completed_retention: Duration,
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self {
            queues: Mutex::default(),
            completed_retention: DEFAULT_COMPLETED_RETENTION,
        }
    }
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn with_completed_retention(mut self, retention: Duration) -> Self {
        self.completed_retention = retention;
        self
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn ping(&self) -> Result<(), QueueStoreError> {
        Ok(())
    }

    async fn enqueue(&self, job: Job) -> Result<JobId, QueueStoreError> {
        let mut queues = self.queues.lock();
        let slot = queues.entry(job.queue.clone()).or_default();
        if slot.jobs.contains_key(&job.id) {
            return Err(QueueStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        slot.jobs.insert(id, job);
        slot.index(id);
        Ok(id)
    }

    async fn claim(
        &self,
        queue: &QueueName,
        lease: Duration,
    ) -> Result<Option<ClaimedJob>, QueueStoreError> {
        let mut queues = self.queues.lock();
        let Some(slot) = queues.get_mut(queue) else {
            return Ok(None);
        };
        let now = Utc::now();
        slot.recover_expired(now);
        slot.promote_due(now);
        slot.prune_completed(now, self.completed_retention);

        let Some((_, id)) = slot.waiting.pop_first() else {
            return Ok(None);
        };
        let Some(job) = slot.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.mark_claimed(now);

        let token = LeaseToken::new();
        let lease_expires_at = now + to_chrono(lease);
        let job = job.clone();
        slot.leases.insert(id, (token, lease_expires_at));

        Ok(Some(ClaimedJob {
            job,
            lease: token,
            lease_expires_at,
        }))
    }

    async fn complete(&self, claimed: &ClaimedJob) -> Result<Job, QueueStoreError> {
        let mut queues = self.queues.lock();
        let slot = queues
            .get_mut(&claimed.job.queue)
            .ok_or(QueueStoreError::NotFound(claimed.job.id))?;
        let now = Utc::now();
        let job = slot.resolve(claimed, |job| job.mark_completed(now))?;
        slot.prune_completed(now, self.completed_retention);
        Ok(job)
    }

    async fn retry(
        &self,
        claimed: &ClaimedJob,
        error: &str,
        delay: Duration,
    ) -> Result<Job, QueueStoreError> {
        let mut queues = self.queues.lock();
        let slot = queues
            .get_mut(&claimed.job.queue)
            .ok_or(QueueStoreError::NotFound(claimed.job.id))?;
        slot.resolve(claimed, |job| job.mark_retry(error, delay, Utc::now()))
    }

    async fn fail(&self, claimed: &ClaimedJob, error: &str) -> Result<Job, QueueStoreError> {
        let mut queues = self.queues.lock();
        let slot = queues
            .get_mut(&claimed.job.queue)
            .ok_or(QueueStoreError::NotFound(claimed.job.id))?;
        slot.resolve(claimed, |job| job.mark_failed(error, Utc::now()))
    }

    async fn get(&self, queue: &QueueName, id: JobId) -> Result<Option<Job>, QueueStoreError> {
        let queues = self.queues.lock();
        Ok(queues.get(queue).and_then(|slot| slot.jobs.get(&id)).cloned())
    }

    async fn list_failed(
        &self,
        queue: &QueueName,
        limit: usize,
    ) -> Result<Vec<Job>, QueueStoreError> {
        let queues = self.queues.lock();
        let Some(slot) = queues.get(queue) else {
            return Ok(Vec::new());
        };
        let mut failed: Vec<Job> = slot
            .jobs
            .values()
            .filter(|j| j.state == JobState::Failed)
            .cloned()
            .collect();
        failed.sort_by_key(|j| (j.updated_at, j.id));
        failed.truncate(limit);
        Ok(failed)
    }

    async fn requeue_failed(
        &self,
        queue: &QueueName,
        id: JobId,
        extra_attempts: u32,
    ) -> Result<Job, QueueStoreError> {
        let mut queues = self.queues.lock();
        let slot = queues.get_mut(queue).ok_or(QueueStoreError::NotFound(id))?;
        let job = slot.jobs.get_mut(&id).ok_or(QueueStoreError::NotFound(id))?;
        if job.state != JobState::Failed {
            return Err(QueueStoreError::InvalidState {
                id,
                state: job.state,
                expected: JobState::Failed,
            });
        }
        job.mark_requeued(extra_attempts, Utc::now());
        let job = job.clone();
        slot.index(id);
        Ok(job)
    }

    async fn stats(&self, queue: &QueueName) -> Result<QueueStats, QueueStoreError> {
        let queues = self.queues.lock();
        let mut stats = QueueStats::default();
        let Some(slot) = queues.get(queue) else {
            return Ok(stats);
        };

        for job in slot.jobs.values() {
            match job.state {
                JobState::Waiting => stats.waiting += 1,
                JobState::Delayed => stats.delayed += 1,
                JobState::Active => stats.active += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
            }
        }

        Ok(stats)
    }
}
