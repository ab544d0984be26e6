use apalis::prelude::{Data, Error as ApalisError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
    context::{JobWorkerContext, job_failed},
    queue::{COLLECT_PRIORITY, GC_QUEUE, JobError, JobOptions, JobQueue, enqueue_job},
};
use crate::domain::{entity::EntityId, types::JobType};
use crate::storage::gc_wait;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectEntityPayload {
    pub entity_id: EntityId,
    /// Recorded size, kept for diagnostics.
    #[serde(default)]
    pub size: u64,
}

/// Schedule a retired entity for deletion once slow readers have had time to finish it.
///
/// Scheduling the same entity again replaces the pending job instead of adding another.
pub async fn schedule_collection(
    queue: &dyn JobQueue,
    entity_id: &EntityId,
    size: u64,
    min_download_rate_kbps: u64,
    max_attempts: u32,
) -> Result<String, JobError> {
    let delay = gc_wait(size, min_download_rate_kbps);
    let payload = CollectEntityPayload {
        entity_id: entity_id.clone(),
        size,
    };
    let options = JobOptions {
        delay,
        tags: vec![JobType::CollectEntity.as_str().to_string()],
        priority: COLLECT_PRIORITY,
        dedupe_key: Some(format!("collect:{entity_id}")),
        max_attempts,
    };
    let (job_id, outcome) =
        enqueue_job(queue, GC_QUEUE, JobType::CollectEntity, &payload, options).await?;
    debug!(
        entity_id = %entity_id,
        size,
        delay_secs = delay.as_secs(),
        outcome = ?outcome,
        "entity collection scheduled"
    );
    Ok(job_id)
}

pub async fn process_collect_entity_job(
    payload: CollectEntityPayload,
    context: Data<JobWorkerContext>,
) -> Result<(), ApalisError> {
    let removed = context
        .storage
        .delete(&payload.entity_id)
        .await
        .map_err(|err| job_failed(JobError::failed(err.to_string())))?;
    info!(
        entity_id = %payload.entity_id,
        size = payload.size,
        removed,
        "entity collected"
    );
    Ok(())
}
