//! Job acquisition and dispatch.
//!
//! One coordinator task polls the job store, claims due jobs, and hands the
//! claimed batches to a bounded worker pool. Between polls it waits on a
//! timer that a freshly scheduled job can cut short, and a watch channel
//! shuts the loop down cooperatively.

use crate::config::EngineConfig;
use crate::job::{Job, JobStore};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify, Semaphore};
use tracing::{debug, error, info, warn};

/// Wakes the acquisition loop when a job is scheduled, so an async
/// continuation does not sit out the remainder of the idle wait.
///
/// Wakes coalesce: notifying while the loop is busy acquiring stores at
/// most one pending wake.
#[derive(Default)]
pub struct JobAddedNotifier {
    notify: Notify,
    waiting: AtomicBool,
}

impl JobAddedNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_added(&self) {
        // A wake is only useful while the loop actually waits; adds that
        // land mid-cycle are picked up by the next poll anyway.
        if self.waiting.load(Ordering::Acquire) {
            self.notify.notify_one();
        }
    }

    async fn wait(&self, timeout: Duration) {
        self.waiting.store(true, Ordering::Release);
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {}
            _ = self.notify.notified() => {
                debug!("woken by newly scheduled job");
            }
        }
        self.waiting.store(false, Ordering::Release);
    }
}

/// Runs claimed batches; the pool bounds how many run at once.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute_batch(&self, jobs: Vec<Job>) -> anyhow::Result<()>;
}

/// Worker pool on the tokio runtime: one spawned task per batch, bounded by
/// a semaphore. Jobs within a batch run sequentially so a process instance
/// never sees two of its jobs in flight at once.
pub struct TokioJobExecutor {
    handlers: Arc<crate::job::HandlerRegistry>,
    store: Arc<dyn JobStore>,
    owner: String,
    slots: Arc<Semaphore>,
}

impl TokioJobExecutor {
    pub fn new(
        handlers: Arc<crate::job::HandlerRegistry>,
        store: Arc<dyn JobStore>,
        owner: impl Into<String>,
        worker_slots: usize,
    ) -> Self {
        Self {
            handlers,
            store,
            owner: owner.into(),
            slots: Arc::new(Semaphore::new(worker_slots.max(1))),
        }
    }
}

#[async_trait]
impl JobExecutor for TokioJobExecutor {
    async fn execute_batch(&self, jobs: Vec<Job>) -> anyhow::Result<()> {
        let permit = self.slots.clone().acquire_owned().await?;
        let handlers = self.handlers.clone();
        let store = self.store.clone();
        let owner = self.owner.clone();
        tokio::spawn(async move {
            let _permit = permit;
            for job in jobs {
                let outcome = match handlers.get(&job.handler) {
                    Ok(handler) => handler.execute(&job).await,
                    Err(err) => Err(err.into()),
                };
                let result = match outcome {
                    Ok(()) => store.complete(job.id, &owner).await,
                    Err(err) => {
                        warn!(job = %job.id, handler = %job.handler, error = %err, "job failed");
                        store.fail(job.id, &owner, &err.to_string()).await
                    }
                };
                if let Err(err) = result {
                    error!(job = %job.id, error = %err, "could not record job outcome");
                }
            }
        });
        Ok(())
    }
}

/// The acquisition coordinator.
pub struct JobAcquisition {
    store: Arc<dyn JobStore>,
    executor: Arc<dyn JobExecutor>,
    notifier: Arc<JobAddedNotifier>,
    config: EngineConfig,
    owner: String,
}

impl JobAcquisition {
    pub fn new(
        store: Arc<dyn JobStore>,
        executor: Arc<dyn JobExecutor>,
        notifier: Arc<JobAddedNotifier>,
        config: EngineConfig,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            store,
            executor,
            notifier,
            config,
            owner: owner.into(),
        }
    }

    /// Poll until the shutdown channel flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(owner = %self.owner, "job acquisition started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let wait = self.acquire_cycle().await;
            if wait.is_zero() {
                continue;
            }
            tokio::select! {
                _ = self.notifier.wait(wait) => {}
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(owner = %self.owner, "job acquisition stopped");
    }

    /// One acquisition pass. Returns how long to wait before the next: zero
    /// when the claim filled the whole batch cap, the idle interval
    /// otherwise, and a full backoff after a store error. Claims lost to
    /// rival acquirers never shorten the wait.
    async fn acquire_cycle(&self) -> Duration {
        let max = self.config.max_jobs_per_acquisition;
        match self
            .store
            .acquire(&self.owner, max, self.config.job_lock())
            .await
        {
            Ok(acquired) => {
                if acquired.lock_failures > 0 {
                    // Ordinary contention between acquirers, not a fault.
                    debug!(
                        owner = %self.owner,
                        lost = acquired.lock_failures,
                        "lost job claims to a rival acquirer"
                    );
                }
                let claimed = acquired.job_count();
                for batch in acquired.batches {
                    if let Err(err) = self.executor.execute_batch(batch).await {
                        error!(owner = %self.owner, error = %err, "could not dispatch job batch");
                    }
                }
                if claimed >= max {
                    Duration::ZERO
                } else {
                    self.config.acquire_wait()
                }
            }
            Err(err) => {
                error!(owner = %self.owner, error = %err, "job acquisition failed, backing off");
                self.config.acquire_wait()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::AcquiredJobs;
    use std::sync::Mutex;
    use uuid::Uuid;

    struct ScriptedStore {
        results: Mutex<Vec<anyhow::Result<AcquiredJobs>>>,
    }

    #[async_trait]
    impl JobStore for ScriptedStore {
        async fn schedule(&self, _job: Job) -> anyhow::Result<()> {
            Ok(())
        }

        async fn acquire(
            &self,
            _owner: &str,
            _max: usize,
            _lock_for: chrono::Duration,
        ) -> anyhow::Result<AcquiredJobs> {
            self.results
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(AcquiredJobs::default()))
        }

        async fn complete(&self, _job_id: Uuid, _owner: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn fail(&self, _job_id: Uuid, _owner: &str, _error: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct CountingExecutor {
        batches: Mutex<usize>,
    }

    #[async_trait]
    impl JobExecutor for CountingExecutor {
        async fn execute_batch(&self, _jobs: Vec<Job>) -> anyhow::Result<()> {
            *self.batches.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn acquisition(results: Vec<anyhow::Result<AcquiredJobs>>) -> (JobAcquisition, Arc<CountingExecutor>) {
        let executor = Arc::new(CountingExecutor {
            batches: Mutex::new(0),
        });
        let acquisition = JobAcquisition::new(
            Arc::new(ScriptedStore {
                results: Mutex::new(results),
            }),
            executor.clone(),
            Arc::new(JobAddedNotifier::new()),
            EngineConfig::default(),
            "test-node",
        );
        (acquisition, executor)
    }

    fn full_page() -> AcquiredJobs {
        AcquiredJobs {
            batches: vec![(0..10).map(|_| Job::new("t", Uuid::now_v7())).collect()],
            lock_failures: 0,
        }
    }

    #[tokio::test]
    async fn full_page_means_no_wait() {
        let (acquisition, executor) = acquisition(vec![Ok(full_page())]);
        let wait = acquisition.acquire_cycle().await;
        assert_eq!(wait, Duration::ZERO);
        assert_eq!(*executor.batches.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn lost_claims_do_not_shorten_the_wait() {
        // Four won plus six lost claims: the cap was not filled with real
        // work, so the loop still takes its idle wait.
        let page = AcquiredJobs {
            batches: vec![(0..4).map(|_| Job::new("t", Uuid::now_v7())).collect()],
            lock_failures: 6,
        };
        let (acquisition, _) = acquisition(vec![Ok(page)]);
        assert_eq!(
            acquisition.acquire_cycle().await,
            EngineConfig::default().acquire_wait()
        );
    }

    #[tokio::test]
    async fn short_page_waits_and_error_backs_off() {
        let (acquisition, _) = acquisition(vec![Ok(AcquiredJobs::default())]);
        assert_eq!(
            acquisition.acquire_cycle().await,
            EngineConfig::default().acquire_wait()
        );

        let (acquisition, executor) = acquisition_err();
        assert_eq!(
            acquisition.acquire_cycle().await,
            EngineConfig::default().acquire_wait()
        );
        assert_eq!(*executor.batches.lock().unwrap(), 0);
    }

    fn acquisition_err() -> (JobAcquisition, Arc<CountingExecutor>) {
        acquisition(vec![Err(anyhow::anyhow!("store down"))])
    }

    #[tokio::test(start_paused = true)]
    async fn job_added_cuts_the_idle_wait_short() {
        let notifier = Arc::new(JobAddedNotifier::new());
        let waiter = notifier.clone();
        let handle = tokio::spawn(async move {
            waiter.wait(Duration::from_secs(3600)).await;
        });
        tokio::task::yield_now().await;
        notifier.job_added();
        // With time paused this only finishes if the wake fired.
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let (acquisition, _) = acquisition(vec![]);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { acquisition.run(rx).await });
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
