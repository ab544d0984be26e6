use metrics::counter;
use tracing::{debug, info};

use super::{CacheError, Orchestrator};
use crate::application::context::{RequestContext, states};
use crate::cache::{Event, metadata};
use crate::domain::response::Response;

impl Orchestrator {
    /// Load the cached response for the request. `Ok(None)` is a miss, including when the
    /// metadata points at an entity the storage driver no longer holds.
    pub async fn read(&self, ctx: &mut RequestContext) -> Result<Option<Response>, CacheError> {
        ctx.history.record_state(states::READING);
        let chain = ctx.key_chain(&self.config.key_spec);

        let Some(mut res) = metadata::read(self.store.as_ref(), &chain).await? else {
            counter!("hoard_cache_miss_total").increment(1);
            debug!(cache_key = chain.root(), "cache miss");
            return Ok(None);
        };

        if res.size > 0 {
            let Some(entity_id) = res.entity_id.clone() else {
                counter!("hoard_cache_miss_total").increment(1);
                return Ok(None);
            };
            if !self.storage.exists(&entity_id).await? {
                info!(
                    cache_key = chain.root(),
                    entity_id = %entity_id,
                    "cached entity was evicted; treating as a miss"
                );
                counter!("hoard_cache_evicted_entity_total").increment(1);
                counter!("hoard_cache_miss_total").increment(1);
                self.collect_later(&entity_id, res.size).await;
                return Ok(None);
            }

            let reader = self.storage.get_reader(&res)?;
            res.set_body_reader("cache", reader);
        }

        self.events.emit(Event::AfterCacheRead(&mut res));
        counter!("hoard_cache_hit_total").increment(1);
        debug!(cache_key = chain.root(), ttl = res.ttl, "cache hit");
        Ok(Some(res))
    }
}
