use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use crate::application::jobs::{EnqueueOutcome, JobError, JobQueue, JobRecord, NewJob};
use crate::domain::types::JobState;
use crate::infra::lock::mutex_lock;

const LOCK_TARGET: &str = "infra::queue::memory";

#[derive(Debug, Clone)]
struct Entry {
    record: JobRecord,
    run_at: Instant,
    seq: u64,
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<String, Entry>,
    next_seq: u64,
}

/// In-process job queue driven by the tokio clock, so paused-clock tests control when
/// delayed jobs become due.
#[derive(Debug, Clone, Default)]
pub struct MemoryJobQueue {
    state: Arc<Mutex<State>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, job_id: &str) -> Option<JobRecord> {
        let state = mutex_lock(&self.state, LOCK_TARGET, "get");
        state.jobs.get(job_id).map(|entry| entry.record.clone())
    }

    /// Time until `job_id` becomes due; zero once it is.
    pub fn due_in(&self, job_id: &str) -> Option<Duration> {
        let state = mutex_lock(&self.state, LOCK_TARGET, "due_in");
        state
            .jobs
            .get(job_id)
            .map(|entry| entry.run_at.saturating_duration_since(Instant::now()))
    }

    /// Every job still held for `queue`, in no particular order.
    pub fn jobs(&self, queue: &str) -> Vec<JobRecord> {
        let state = mutex_lock(&self.state, LOCK_TARGET, "jobs");
        state
            .jobs
            .values()
            .filter(|entry| entry.record.queue == queue)
            .map(|entry| entry.record.clone())
            .collect()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: NewJob) -> Result<(String, EnqueueOutcome), JobError> {
        let id = job
            .options
            .dedupe_key
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        let mut state = mutex_lock(&self.state, LOCK_TARGET, "enqueue");
        let outcome = match state.jobs.get(&id).map(|entry| entry.record.state) {
            Some(JobState::Running) => return Ok((id, EnqueueOutcome::SkippedRunning)),
            Some(JobState::Scheduled) => EnqueueOutcome::Replaced,
            None => EnqueueOutcome::Queued,
        };

        let seq = state.next_seq;
        state.next_seq += 1;
        let record = JobRecord {
            id: id.clone(),
            queue: job.queue,
            job_type: job.job_type,
            payload: job.payload,
            state: JobState::Scheduled,
            attempts: 0,
            max_attempts: job.options.max_attempts.max(1),
            priority: job.options.priority,
            tags: job.options.tags,
            last_error: None,
        };
        state.jobs.insert(
            id.clone(),
            Entry {
                record,
                run_at: Instant::now() + job.options.delay,
                seq,
            },
        );
        Ok((id, outcome))
    }

    async fn claim_due(&self, queue: &str, limit: usize) -> Result<Vec<JobRecord>, JobError> {
        let now = Instant::now();
        let mut state = mutex_lock(&self.state, LOCK_TARGET, "claim_due");

        let mut due: Vec<(i32, Instant, u64, String)> = state
            .jobs
            .values()
            .filter(|entry| {
                entry.record.queue == queue
                    && entry.record.state == JobState::Scheduled
                    && entry.run_at <= now
            })
            .map(|entry| {
                (
                    entry.record.priority,
                    entry.run_at,
                    entry.seq,
                    entry.record.id.clone(),
                )
            })
            .collect();
        due.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        let mut claimed = Vec::new();
        for (_, _, _, id) in due.into_iter().take(limit) {
            if let Some(entry) = state.jobs.get_mut(&id) {
                entry.record.state = JobState::Running;
                entry.record.attempts += 1;
                claimed.push(entry.record.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, job_id: &str) -> Result<(), JobError> {
        let mut state = mutex_lock(&self.state, LOCK_TARGET, "complete");
        state.jobs.remove(job_id);
        Ok(())
    }

    async fn retry_or_fail(
        &self,
        job: &JobRecord,
        error: &str,
        delay: Duration,
    ) -> Result<bool, JobError> {
        let mut state = mutex_lock(&self.state, LOCK_TARGET, "retry_or_fail");
        if job.attempts >= job.max_attempts {
            state.jobs.remove(&job.id);
            return Ok(false);
        }
        let Some(entry) = state.jobs.get_mut(&job.id) else {
            return Ok(false);
        };
        entry.record.state = JobState::Scheduled;
        entry.record.last_error = Some(error.to_string());
        entry.run_at = Instant::now() + delay;
        Ok(true)
    }
}
