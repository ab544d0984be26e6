//! Cache orchestrator: the operations a decision engine composes to answer a request.
//!
//! Each operation takes the explicit [`RequestContext`] and touches shared state only through
//! the backing store, the storage driver and the job queue.

use std::sync::Arc;

use metrics::counter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use super::context::{RequestContext, states};
use super::jobs::{JobOptions, JobQueue, enqueue_job, schedule_collection};
use crate::cache::{CacheConfig, EventBus, metadata, metadata::MetadataError};
use crate::domain::{entity::EntityId, types::JobType};
use crate::infra::{
    store::{Store, StoreError},
    upstream::UpstreamClient,
};
use crate::storage::{StorageDriver, StorageError};

mod fetch;
mod read;
mod revalidate;
mod save;
mod serve;

pub use save::{SaveOutcome, SaveReceipt, SaveResult};
pub use serve::{ClientSink, ServeOutcome, SinkError};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub struct Orchestrator {
    config: CacheConfig,
    store: Arc<dyn Store>,
    storage: Arc<dyn StorageDriver>,
    upstream: UpstreamClient,
    jobs: Arc<dyn JobQueue>,
    events: Arc<EventBus>,
}

impl Orchestrator {
    pub fn new(
        config: CacheConfig,
        store: Arc<dyn Store>,
        storage: Arc<dyn StorageDriver>,
        upstream: UpstreamClient,
        jobs: Arc<dyn JobQueue>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            store,
            storage,
            upstream,
            jobs,
            events,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn StorageDriver> {
        &self.storage
    }

    /// Schedule collection of every entity the key references, then remove the key's
    /// direct keys. Returns whether anything was stored.
    pub async fn delete(&self, ctx: &mut RequestContext) -> Result<bool, CacheError> {
        ctx.history.record_state(states::DELETING);
        let chain = ctx.key_chain(&self.config.key_spec);

        let pointer = metadata::entity_pointer(self.store.as_ref(), &chain).await?;
        if let Some((entity_id, size)) = pointer {
            self.collect_later(&entity_id, size).await;
        }
        let removed = self.store.del(&chain.keys()).await?;
        debug!(cache_key = chain.root(), removed, "cache entry deleted");
        Ok(removed > 0)
    }

    /// Fire-and-forget entity collection; failures are logged.
    async fn collect_later(&self, entity_id: &EntityId, size: u64) {
        match schedule_collection(
            self.jobs.as_ref(),
            entity_id,
            size,
            self.config.minimum_old_entity_download_rate,
            self.config.job_max_attempts,
        )
        .await
        {
            Ok(_) => {
                counter!("hoard_entity_gc_scheduled_total").increment(1);
                counter!("hoard_jobs_enqueued_total", "job" => JobType::CollectEntity.as_str())
                    .increment(1);
            }
            Err(err) => {
                warn!(
                    entity_id = %entity_id,
                    error = %err,
                    "failed to schedule entity collection"
                );
            }
        }
    }

    /// Fire-and-forget enqueue; failures are logged and yield `None`.
    async fn enqueue<P: Serialize>(
        &self,
        queue: &str,
        job_type: JobType,
        payload: &P,
        options: JobOptions,
    ) -> Option<String> {
        let options = JobOptions {
            max_attempts: self.config.job_max_attempts,
            ..options
        };
        match enqueue_job(self.jobs.as_ref(), queue, job_type, payload, options).await {
            Ok((job_id, outcome)) => {
                counter!("hoard_jobs_enqueued_total", "job" => job_type.as_str()).increment(1);
                debug!(job_id, job = job_type.as_str(), outcome = ?outcome, "job enqueued");
                Some(job_id)
            }
            Err(err) => {
                warn!(job = job_type.as_str(), error = %err, "failed to enqueue job");
                None
            }
        }
    }
}

pub(crate) fn sha256_hex(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digests_are_lowercase_hex() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
