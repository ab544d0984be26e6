//! Background dispatcher contract.
//!
//! Enqueueing is fire-and-forget: callers never wait for a job to run. A job whose id is
//! already pending is replaced rather than duplicated, which is how concurrently scheduled
//! identical work collapses into one job.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::types::{JobState, JobType};
use crate::infra::store::StoreError;

pub const GC_QUEUE: &str = "hoard_gc";
pub const REVALIDATE_QUEUE: &str = "hoard_revalidate";

pub const COLLECT_PRIORITY: i32 = 10;
pub const REVALIDATE_PRIORITY: i32 = 4;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptions {
    /// How long to wait before the job becomes due.
    pub delay: Duration,
    pub tags: Vec<String>,
    /// Higher runs first among jobs that are due at the same time.
    pub priority: i32,
    /// Used as the job id. Omit to get a fresh id.
    pub dedupe_key: Option<String>,
    pub max_attempts: u32,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            delay: Duration::ZERO,
            tags: Vec::new(),
            priority: 0,
            dedupe_key: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub queue: String,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub options: JobOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// A pending job with the same id was replaced.
    Replaced,
    /// A job with the same id is running; nothing was queued.
    SkippedRunning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub queue: String,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub state: JobState,
    /// Runs started so far, including the current one.
    pub attempts: u32,
    pub max_attempts: u32,
    pub priority: i32,
    pub tags: Vec<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("job payload could not be encoded: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("job `{id}` is corrupt: {reason}")]
    Corrupt { id: String, reason: String },
    #[error("{0}")]
    Failed(String),
}

impl JobError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: NewJob) -> Result<(String, EnqueueOutcome), JobError>;

    /// Mark up to `limit` due jobs of `queue` as running and return them.
    async fn claim_due(&self, queue: &str, limit: usize) -> Result<Vec<JobRecord>, JobError>;

    async fn complete(&self, job_id: &str) -> Result<(), JobError>;

    /// Reschedule a failed job after `delay`, or drop it once its attempts are spent.
    /// Returns `true` when the job will run again.
    async fn retry_or_fail(
        &self,
        job: &JobRecord,
        error: &str,
        delay: Duration,
    ) -> Result<bool, JobError>;
}

/// Serialize `payload` and enqueue it, returning the job id.
pub async fn enqueue_job<P>(
    queue: &dyn JobQueue,
    queue_name: &str,
    job_type: JobType,
    payload: &P,
    options: JobOptions,
) -> Result<(String, EnqueueOutcome), JobError>
where
    P: Serialize + ?Sized,
{
    let payload = serde_json::to_value(payload)?;
    queue
        .enqueue(NewJob {
            queue: queue_name.to_string(),
            job_type,
            payload,
            options,
        })
        .await
}
