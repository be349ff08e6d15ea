//! Storage seams and their in-memory implementations.
//!
//! The kernel persists two things between units of work: execution arenas
//! (one per live process instance) and jobs. Both traits are async so
//! durable backends can plug in; the in-memory variants here back the tests
//! and single-node embedding.

use crate::execution::ExecutionArena;
use crate::job::{AcquiredJobs, Job, JobStore};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

#[async_trait]
pub trait ProcessStore: Send + Sync {
    async fn save(&self, arena: &ExecutionArena) -> anyhow::Result<()>;
    async fn load(&self, process_instance_id: Uuid) -> anyhow::Result<Option<ExecutionArena>>;
    async fn remove(&self, process_instance_id: Uuid) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct MemoryProcessStore {
    instances: Mutex<HashMap<Uuid, ExecutionArena>>,
}

impl MemoryProcessStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.instances.lock().await.len()
    }
}

#[async_trait]
impl ProcessStore for MemoryProcessStore {
    async fn save(&self, arena: &ExecutionArena) -> anyhow::Result<()> {
        self.instances
            .lock()
            .await
            .insert(arena.process_instance_id, arena.clone());
        Ok(())
    }

    async fn load(&self, process_instance_id: Uuid) -> anyhow::Result<Option<ExecutionArena>> {
        Ok(self.instances.lock().await.get(&process_instance_id).cloned())
    }

    async fn remove(&self, process_instance_id: Uuid) -> anyhow::Result<()> {
        self.instances.lock().await.remove(&process_instance_id);
        Ok(())
    }
}

/// A job that exhausted its retries.
#[derive(Clone, Debug)]
pub struct DeadLetter {
    pub job: Job,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Default)]
struct JobStoreInner {
    jobs: HashMap<Uuid, Job>,
    dead: Vec<DeadLetter>,
    /// Pending simulated claim losses, for contention tests.
    contested: usize,
}

/// In-memory job store with optimistic-lock semantics: acquisition claims a
/// job by writing the lock owner, and a claim that loses the race counts as
/// a lock failure instead of an error.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<JobStoreInner>,
    retry_delay: Duration,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(JobStoreInner::default()),
            retry_delay: Duration::seconds(1),
        }
    }

    pub fn with_retry_delay(retry_delay: Duration) -> Self {
        Self {
            inner: Mutex::new(JobStoreInner::default()),
            retry_delay,
        }
    }

    /// Make the next `count` acquirable jobs lose their claim, as if another
    /// node grabbed them first.
    pub async fn contest_next(&self, count: usize) {
        self.inner.lock().await.contested += count;
    }

    pub async fn pending(&self) -> usize {
        self.inner.lock().await.jobs.len()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.lock().await.dead.clone()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn schedule(&self, job: Job) -> anyhow::Result<()> {
        debug!(job = %job.id, handler = %job.handler, "job scheduled");
        self.inner.lock().await.jobs.insert(job.id, job);
        Ok(())
    }

    async fn acquire(
        &self,
        owner: &str,
        max: usize,
        lock_for: Duration,
    ) -> anyhow::Result<AcquiredJobs> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut candidates: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|j| j.acquirable(now))
            .map(|j| j.id)
            .collect();
        candidates.sort_by_key(|id| inner.jobs[id].due_at);
        candidates.truncate(max);

        let mut acquired = AcquiredJobs::default();
        let mut by_instance: HashMap<Uuid, Vec<Job>> = HashMap::new();
        for id in candidates {
            let contested = inner.contested > 0;
            let Some(job) = inner.jobs.get_mut(&id) else {
                continue;
            };
            if contested {
                // Another acquirer won; mirror what its claim would write.
                job.lock_owner = Some(format!("{owner}:rival"));
                job.lock_expires_at = Some(now + lock_for);
                inner.contested -= 1;
                acquired.lock_failures += 1;
                continue;
            }
            job.lock_owner = Some(owner.to_string());
            job.lock_expires_at = Some(now + lock_for);
            by_instance
                .entry(job.process_instance_id)
                .or_default()
                .push(job.clone());
        }
        acquired.batches = by_instance.into_values().collect();
        Ok(acquired)
    }

    async fn complete(&self, job_id: Uuid, owner: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.jobs.get(&job_id) {
            Some(job) if job.lock_owner.as_deref() == Some(owner) => {
                inner.jobs.remove(&job_id);
                Ok(())
            }
            Some(_) => anyhow::bail!("job {job_id} not locked by `{owner}`"),
            None => anyhow::bail!("job {job_id} not found"),
        }
    }

    async fn fail(&self, job_id: Uuid, owner: &str, error: &str) -> anyhow::Result<()> {
        let retry_delay = self.retry_delay;
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            anyhow::bail!("job {job_id} not found")
        };
        if job.lock_owner.as_deref() != Some(owner) {
            anyhow::bail!("job {job_id} not locked by `{owner}`");
        }
        if job.retries > 0 {
            job.retries -= 1;
            job.due_at = Utc::now() + retry_delay;
            job.lock_owner = None;
            job.lock_expires_at = None;
            debug!(job = %job_id, retries_left = job.retries, "job failed, rescheduled");
            return Ok(());
        }
        if let Some(job) = inner.jobs.remove(&job_id) {
            debug!(job = %job_id, "job failed, retries exhausted");
            inner.dead.push(DeadLetter {
                job,
                error: error.to_string(),
                failed_at: Utc::now(),
            });
        }
        Ok(())
    }
}
