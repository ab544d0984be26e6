//! Redis job queue: one hash per job plus a sorted set per queue scored by the
//! millisecond timestamp the job becomes due.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use deadpool_redis::{Connection, Pool};
use redis::Script;
use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

use crate::application::jobs::{EnqueueOutcome, JobError, JobQueue, JobRecord, NewJob};
use crate::domain::types::{JobState, JobType};
use crate::infra::store::StoreError;

const JOB_PREFIX: &str = "hoard:jobs:";
const QUEUE_PREFIX: &str = "hoard:jobs:queue:";

// Replaces a scheduled job of the same id; leaves a running one alone.
const ENQUEUE_SCRIPT: &str = r"
local state = redis.call('HGET', KEYS[1], 'state')
if state == 'running' then
  return 2
end
redis.call('DEL', KEYS[1])
redis.call('HSET', KEYS[1], unpack(ARGV, 3))
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
if state then
  return 1
end
return 0
";

const CLAIM_SCRIPT: &str = r"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
local claimed = {}
for _, id in ipairs(ids) do
  redis.call('ZREM', KEYS[1], id)
  local key = ARGV[3] .. id
  if redis.call('EXISTS', key) == 1 then
    redis.call('HSET', key, 'state', 'running')
    redis.call('HINCRBY', key, 'attempts', 1)
    table.insert(claimed, id)
  end
end
return claimed
";

#[derive(Clone)]
pub struct RedisJobQueue {
    pool: Pool,
}

impl RedisJobQueue {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn connection(&self) -> Result<Connection, JobError> {
        Ok(self.pool.get().await.map_err(StoreError::from)?)
    }
}

fn job_key(id: &str) -> String {
    format!("{JOB_PREFIX}{id}")
}

fn queue_key(queue: &str) -> String {
    format!("{QUEUE_PREFIX}{queue}")
}

fn run_at_millis(delay: Duration) -> i64 {
    let now = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    let delay = i128::try_from(delay.as_millis()).unwrap_or(i128::MAX);
    i64::try_from(now.saturating_add(delay)).unwrap_or(i64::MAX)
}

fn parse_record(id: &str, fields: HashMap<String, String>) -> Result<JobRecord, JobError> {
    let corrupt = |reason: &str| JobError::Corrupt {
        id: id.to_string(),
        reason: reason.to_string(),
    };
    let text = |name: &str| fields.get(name).ok_or_else(|| corrupt(name));
    let number = |name: &str| -> Result<i64, JobError> {
        text(name)?.parse().map_err(|_| corrupt(name))
    };

    Ok(JobRecord {
        id: id.to_string(),
        queue: text("queue")?.clone(),
        job_type: JobType::try_from(text("job_type")?.as_str())
            .map_err(|err| corrupt(err.as_str()))?,
        payload: serde_json::from_str(text("payload")?)?,
        state: JobState::try_from(text("state")?.as_str())
            .map_err(|err| corrupt(err.as_str()))?,
        attempts: u32::try_from(number("attempts")?).map_err(|_| corrupt("attempts"))?,
        max_attempts: u32::try_from(number("max_attempts")?)
            .map_err(|_| corrupt("max_attempts"))?,
        priority: i32::try_from(number("priority")?).map_err(|_| corrupt("priority"))?,
        tags: serde_json::from_str(text("tags")?)?,
        last_error: fields.get("last_error").cloned(),
    })
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: NewJob) -> Result<(String, EnqueueOutcome), JobError> {
        let id = job
            .options
            .dedupe_key
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let fields = [
            ("queue", job.queue.clone()),
            ("job_type", job.job_type.as_str().to_string()),
            ("payload", serde_json::to_string(&job.payload)?),
            ("state", JobState::Scheduled.as_str().to_string()),
            ("attempts", "0".to_string()),
            ("max_attempts", job.options.max_attempts.max(1).to_string()),
            ("priority", job.options.priority.to_string()),
            ("tags", serde_json::to_string(&job.options.tags)?),
        ];

        let script = Script::new(ENQUEUE_SCRIPT);
        let mut invocation = script.key(job_key(&id));
        invocation
            .key(queue_key(&job.queue))
            .arg(&id)
            .arg(run_at_millis(job.options.delay));
        for (name, value) in fields {
            invocation.arg(name).arg(value);
        }

        let mut conn = self.connection().await?;
        let code: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(StoreError::from)?;
        let outcome = match code {
            2 => EnqueueOutcome::SkippedRunning,
            1 => EnqueueOutcome::Replaced,
            _ => EnqueueOutcome::Queued,
        };
        Ok((id, outcome))
    }

    async fn claim_due(&self, queue: &str, limit: usize) -> Result<Vec<JobRecord>, JobError> {
        let mut conn = self.connection().await?;
        let ids: Vec<String> = Script::new(CLAIM_SCRIPT)
            .key(queue_key(queue))
            .arg(run_at_millis(Duration::ZERO))
            .arg(limit)
            .arg(JOB_PREFIX)
            .invoke_async(&mut conn)
            .await
            .map_err(StoreError::from)?;

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            let fields: HashMap<String, String> = redis::cmd("HGETALL")
                .arg(job_key(&id))
                .query_async(&mut conn)
                .await
                .map_err(StoreError::from)?;
            match parse_record(&id, fields) {
                Ok(record) => claimed.push(record),
                Err(err) => {
                    warn!(job_id = %id, error = %err, "dropping unreadable job");
                    let _: Result<u64, _> = redis::cmd("DEL")
                        .arg(job_key(&id))
                        .query_async(&mut conn)
                        .await;
                }
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, job_id: &str) -> Result<(), JobError> {
        let mut conn = self.connection().await?;
        let _: u64 = redis::cmd("DEL")
            .arg(job_key(job_id))
            .query_async(&mut conn)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn retry_or_fail(
        &self,
        job: &JobRecord,
        error: &str,
        delay: Duration,
    ) -> Result<bool, JobError> {
        let mut conn = self.connection().await?;
        if job.attempts >= job.max_attempts {
            let _: u64 = redis::cmd("DEL")
                .arg(job_key(&job.id))
                .query_async(&mut conn)
                .await
                .map_err(StoreError::from)?;
            return Ok(false);
        }

        let () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(job_key(&job.id))
            .arg("state")
            .arg(JobState::Scheduled.as_str())
            .arg("last_error")
            .arg(error)
            .ignore()
            .cmd("ZADD")
            .arg(queue_key(&job.queue))
            .arg(run_at_millis(delay))
            .arg(&job.id)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(StoreError::from)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> HashMap<String, String> {
        [
            ("queue", "hoard_gc"),
            ("job_type", "collect_entity"),
            ("payload", r#"{"entity_id":"abc"}"#),
            ("state", "running"),
            ("attempts", "1"),
            ("max_attempts", "3"),
            ("priority", "10"),
            ("tags", r#"["collect_entity"]"#),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
    }

    #[test]
    fn stored_fields_parse_into_a_record() {
        let record = parse_record("j1", fields()).expect("record");
        assert_eq!(record.job_type, JobType::CollectEntity);
        assert_eq!(record.state, JobState::Running);
        assert_eq!(record.priority, 10);
        assert_eq!(record.payload["entity_id"], "abc");
        assert!(record.last_error.is_none());
    }

    #[test]
    fn unknown_job_types_are_corrupt() {
        let mut fields = fields();
        fields.insert("job_type".into(), "render_post".into());
        assert!(matches!(
            parse_record("j1", fields),
            Err(JobError::Corrupt { .. })
        ));
    }

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(job_key("a"), "hoard:jobs:a");
        assert_eq!(queue_key("hoard_gc"), "hoard:jobs:queue:hoard_gc");
    }
}
