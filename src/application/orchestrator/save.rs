use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::{CacheError, Orchestrator};
use crate::application::context::{RequestContext, states};
use crate::application::jobs::{JobQueue, schedule_collection};
use crate::cache::{Event, KeyChain, metadata};
use crate::domain::{entity::EntityId, response::Response};
use crate::infra::store::{Batch, Watch};
use crate::storage::{BoxError, StorageDriver, WriteCompletion, WriteOutcome, WriteSummary};

/// How a save ended once its entity write (if any) finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveResult {
    Committed { bytes: u64 },
    /// A competing save changed the key first; the written entity was removed.
    Aborted,
    Failed(String),
}

/// Resolves once the tee'd body has been fully pulled and the save finalized.
#[derive(Debug)]
pub struct SaveReceipt(oneshot::Receiver<SaveResult>);

impl SaveReceipt {
    /// `None` when the body was dropped before it reached end of stream.
    pub async fn wait(self) -> Option<SaveResult> {
        self.0.await.ok()
    }
}

#[derive(Debug)]
pub enum SaveOutcome {
    /// Too large for storage; the response is served but not persisted.
    Skipped,
    /// The body reader now tees into storage; the save completes when it is drained.
    Streaming(SaveReceipt),
    Finished(SaveResult),
}

impl Orchestrator {
    /// Persist `res` as the current response for the request's key.
    ///
    /// Metadata and revalidation data are committed together with the entity, under a
    /// watch on the main key, so a racing save for the same key commits at most once.
    pub async fn save(
        &self,
        ctx: &mut RequestContext,
        res: &mut Response,
    ) -> Result<SaveOutcome, CacheError> {
        ctx.history.record_state(states::SAVING);
        self.events.emit(Event::BeforeSave(res));

        let chain = ctx.key_chain(&self.config.key_spec);
        let max_size = self.storage.max_size();
        if res.length.is_some_and(|length| length > max_size) {
            info!(
                cache_key = chain.root(),
                length = res.length,
                max_size,
                "response exceeds storage maximum; not saving"
            );
            counter!("hoard_save_skipped_total").increment(1);
            return Ok(SaveOutcome::Skipped);
        }

        let watch = self.store.watch(chain.main()).await?;
        let previous = match metadata::entity_pointer(self.store.as_ref(), &chain).await {
            Ok(previous) => previous,
            Err(err) => {
                watch.discard().await;
                return Err(err.into());
            }
        };

        let mut batch = Batch::new();
        if let Some((previous_id, _)) = previous.as_ref() {
            batch.srem(chain.entities(), previous_id.as_str());
        }

        let streams_body = res.has_body && res.has_body_reader();
        res.entity_id = streams_body.then(EntityId::generate);
        res.size = 0;
        metadata::save(&mut batch, &chain, res, self.config.keep_cache_for);

        let expire_after = self.expire_after(res);
        let data = self.revalidation_data(ctx);
        metadata::save_revalidation(&mut batch, &chain, &data, expire_after.as_secs());

        let (sender, receiver) = oneshot::channel();
        let finalizer = SaveFinalizer {
            chain: chain.clone(),
            entity_id: res.entity_id.clone(),
            previous,
            watch,
            batch,
            storage: Arc::clone(&self.storage),
            jobs: Arc::clone(&self.jobs),
            min_rate: self.config.minimum_old_entity_download_rate,
            max_attempts: self.config.job_max_attempts,
            done: sender,
        };

        if !streams_body {
            Box::new(finalizer).finish(Ok(WriteSummary::default())).await;
            let result = receiver
                .await
                .unwrap_or_else(|_| SaveResult::Failed("save finalizer dropped".to_string()));
            return Ok(SaveOutcome::Finished(result));
        }

        self.storage
            .get_writer(res, expire_after, Box::new(finalizer))?;
        debug!(
            cache_key = chain.root(),
            entity_id = ?res.entity_id,
            "streaming body into storage"
        );
        Ok(SaveOutcome::Streaming(SaveReceipt(receiver)))
    }

    fn expire_after(&self, res: &Response) -> std::time::Duration {
        let ttl = u64::try_from(res.ttl.max(0)).unwrap_or(0);
        std::time::Duration::from_secs(ttl) + self.config.keep_cache_for
    }
}

/// Finishes a save once the entity writer is done: records the size, commits the
/// metadata batch under the watch and retires whichever entity lost.
struct SaveFinalizer {
    chain: KeyChain,
    entity_id: Option<EntityId>,
    previous: Option<(EntityId, u64)>,
    watch: Box<dyn Watch>,
    batch: Batch,
    storage: Arc<dyn StorageDriver>,
    jobs: Arc<dyn JobQueue>,
    min_rate: u64,
    max_attempts: u32,
    done: oneshot::Sender<SaveResult>,
}

impl SaveFinalizer {
    async fn finish(self: Box<Self>, outcome: WriteOutcome) {
        let SaveFinalizer {
            chain,
            entity_id,
            previous,
            watch,
            mut batch,
            storage,
            jobs,
            min_rate,
            max_attempts,
            done,
        } = *self;

        let summary = match outcome {
            Ok(summary) => summary,
            Err(failure) => {
                warn!(cache_key = chain.root(), reason = %failure, "save abandoned");
                watch.discard().await;
                let _ = done.send(SaveResult::Failed(failure.to_string()));
                return;
            }
        };

        let bytes = summary.bytes;
        match entity_id.as_ref() {
            Some(entity_id) if bytes == 0 => metadata::unlink_entity(&mut batch, &chain, entity_id),
            _ => metadata::set_body(&mut batch, &chain, bytes, summary.has_markup),
        }

        let result = match watch.commit(batch).await {
            Ok(true) => {
                if let Some((previous_id, size)) = previous.as_ref() {
                    if entity_id.as_ref() != Some(previous_id) {
                        retire(jobs.as_ref(), previous_id, *size, min_rate, max_attempts).await;
                    }
                }
                counter!("hoard_save_committed_total").increment(1);
                debug!(cache_key = chain.root(), bytes, "save committed");
                SaveResult::Committed { bytes }
            }
            Ok(false) => {
                counter!("hoard_save_aborted_total").increment(1);
                info!(
                    cache_key = chain.root(),
                    "key changed during save; discarding the written entity"
                );
                remove_entity(storage.as_ref(), entity_id.as_ref()).await;
                SaveResult::Aborted
            }
            Err(err) => {
                warn!(cache_key = chain.root(), error = %err, "save commit failed");
                remove_entity(storage.as_ref(), entity_id.as_ref()).await;
                SaveResult::Failed(err.to_string())
            }
        };
        let _ = done.send(result);
    }
}

#[async_trait]
impl WriteCompletion for SaveFinalizer {
    async fn complete(self: Box<Self>, outcome: WriteOutcome) -> Result<(), BoxError> {
        self.finish(outcome).await;
        Ok(())
    }
}

async fn retire(
    jobs: &dyn JobQueue,
    entity_id: &EntityId,
    size: u64,
    min_rate: u64,
    max_attempts: u32,
) {
    match schedule_collection(jobs, entity_id, size, min_rate, max_attempts).await {
        Ok(_) => counter!("hoard_entity_gc_scheduled_total").increment(1),
        Err(err) => warn!(
            entity_id = %entity_id,
            error = %err,
            "failed to schedule collection of the replaced entity"
        ),
    }
}

async fn remove_entity(storage: &dyn StorageDriver, entity_id: Option<&EntityId>) {
    let Some(entity_id) = entity_id else {
        return;
    };
    if let Err(err) = storage.delete(entity_id).await {
        warn!(entity_id = %entity_id, error = %err, "failed to remove losing entity");
    }
}
