//! Background jobs and asynchronous continuations.
//!
//! An activity flagged async does not run inside the command that reached
//! it; the kernel records a continuation job instead and a worker picks it
//! up later. Job storage is a seam: the in-memory store lives in
//! [`crate::store`], durable stores plug in behind [`JobStore`].

use crate::error::EngineError;
use crate::execution::ExecutionId;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Handler type of continuation jobs.
pub const CONTINUE_EXECUTION_HANDLER: &str = "continue-execution";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Handler type; selects the [`JobHandler`] that runs the job.
    pub handler: String,
    pub process_instance_id: Uuid,
    pub execution_id: Option<ExecutionId>,
    pub definition_id: Option<String>,
    pub payload: serde_json::Value,
    pub due_at: DateTime<Utc>,
    pub retries: u32,
    pub lock_owner: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(handler: impl Into<String>, process_instance_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            handler: handler.into(),
            process_instance_id,
            execution_id: None,
            definition_id: None,
            payload: serde_json::Value::Null,
            due_at: now,
            retries: 3,
            lock_owner: None,
            lock_expires_at: None,
            created_at: now,
        }
    }

    pub fn continuation(request: &ContinuationRequest) -> Self {
        let mut job = Self::new(CONTINUE_EXECUTION_HANDLER, request.process_instance_id);
        job.execution_id = Some(request.execution_id);
        job.definition_id = Some(request.definition_id.clone());
        job.payload = serde_json::json!({ "activity_id": request.activity_id });
        job
    }

    /// Is the lock free or expired at `now`?
    pub fn acquirable(&self, now: DateTime<Utc>) -> bool {
        self.due_at <= now
            && match (self.lock_owner.as_ref(), self.lock_expires_at) {
                (None, _) => true,
                (Some(_), Some(expires)) => expires <= now,
                (Some(_), None) => false,
            }
    }
}

/// Someone else claimed the job first. Expected under concurrent acquirers
/// and never an application failure.
#[derive(Debug, Error)]
#[error("job {job_id} already locked by another acquirer")]
pub struct OptimisticLockError {
    pub job_id: Uuid,
}

/// Result of one acquisition cycle.
///
/// Jobs are partitioned into batches by process instance so one worker
/// executes all jobs of an instance in order. `lock_failures` counts jobs
/// lost to other acquirers; ordinary contention, surfaced for logging and
/// never part of the wait-interval decision.
#[derive(Debug, Default)]
pub struct AcquiredJobs {
    pub batches: Vec<Vec<Job>>,
    pub lock_failures: usize,
}

impl AcquiredJobs {
    pub fn job_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    /// Jobs that existed, whether or not this acquirer won them. Diagnostic
    /// only.
    pub fn found(&self) -> usize {
        self.job_count() + self.lock_failures
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty() && self.lock_failures == 0
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn schedule(&self, job: Job) -> anyhow::Result<()>;

    /// Claim up to `max` due jobs for `owner`, locking each for `lock_for`.
    async fn acquire(&self, owner: &str, max: usize, lock_for: Duration)
        -> anyhow::Result<AcquiredJobs>;

    async fn complete(&self, job_id: Uuid, owner: &str) -> anyhow::Result<()>;

    /// Record a failed attempt: reschedule with one retry burned, or dead
    /// letter when retries are exhausted.
    async fn fail(&self, job_id: Uuid, owner: &str, error: &str) -> anyhow::Result<()>;
}

/// What the kernel asks for when an execution parks at an async boundary.
#[derive(Clone, Debug)]
pub struct ContinuationRequest {
    pub definition_id: String,
    pub process_instance_id: Uuid,
    pub execution_id: ExecutionId,
    pub activity_id: String,
}

#[async_trait]
pub trait ContinuationScheduler: Send + Sync {
    async fn schedule(&self, request: ContinuationRequest) -> anyhow::Result<()>;
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, job: &Job) -> anyhow::Result<()>;
}

/// Handler lookup by job type, fixed at assembly time.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn register(&mut self, handler_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(handler_type.into(), handler);
    }

    pub fn get(&self, handler_type: &str) -> Result<Arc<dyn JobHandler>, EngineError> {
        self.handlers
            .get(handler_type)
            .cloned()
            .ok_or_else(|| EngineError::UnknownJobHandler(handler_type.to_string()))
    }
}
