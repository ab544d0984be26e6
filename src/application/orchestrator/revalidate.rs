use std::collections::BTreeMap;

use axum::http::header;
use tracing::warn;

use super::{Orchestrator, sha256_hex};
use crate::application::context::RequestContext;
use crate::application::jobs::{JobOptions, REVALIDATE_PRIORITY, REVALIDATE_QUEUE, RevalidatePayload};
use crate::cache::{Event, metadata};
use crate::domain::{
    revalidation::{RevalidationData, RevalidationParams},
    types::JobType,
};
use crate::infra::store::Batch;

/// Retention used when the stored parameters' TTL cannot be read.
const FALLBACK_REVALIDATION_TTL_SECS: u64 = 3_600;

impl Orchestrator {
    /// Connection parameters and the header subset needed to replay this request later.
    pub fn revalidation_data(&self, ctx: &RequestContext) -> RevalidationData {
        let request = &ctx.request;
        let config = &self.config;

        let mut headers = BTreeMap::new();
        headers.insert(
            header::HOST.as_str().to_string(),
            request
                .header_str(&header::HOST)
                .map(str::to_string)
                .unwrap_or_else(|| request.host.clone()),
        );
        for name in [header::AUTHORIZATION, header::COOKIE] {
            if let Some(value) = request.header_str(&name) {
                headers.insert(name.as_str().to_string(), value.to_string());
            }
        }

        let mut data = RevalidationData {
            params: RevalidationParams {
                server_addr: request.server_addr.to_string(),
                server_port: request.server_port,
                scheme: request.scheme.clone(),
                uri: request.request_uri(),
                connect_timeout_ms: millis(config.upstream_connect_timeout),
                send_timeout_ms: millis(config.upstream_send_timeout),
                read_timeout_ms: millis(config.upstream_read_timeout),
                keepalive_timeout_ms: millis(config.upstream_keepalive_timeout),
                keepalive_poolsize: config.upstream_keepalive_poolsize,
            },
            headers,
        };
        self.events.emit(Event::BeforeSaveRevalidationData(&mut data));
        data
    }

    /// Schedule a background refresh of the stored response. With `update`, the stored
    /// revalidation data is first replaced by this request's, keeping its current TTL.
    ///
    /// Returns the job id, or `None` when nothing could be scheduled.
    pub async fn revalidate_in_background(
        &self,
        ctx: &mut RequestContext,
        update: bool,
    ) -> Option<String> {
        let chain = ctx.key_chain(&self.config.key_spec);

        if update {
            let ttl = match self.store.ttl(chain.reval_params()).await {
                Ok(Some(ttl)) => ttl,
                Ok(None) => FALLBACK_REVALIDATION_TTL_SECS,
                Err(err) => {
                    warn!(
                        cache_key = chain.root(),
                        error = %err,
                        "could not read revalidation TTL; using fallback"
                    );
                    FALLBACK_REVALIDATION_TTL_SECS
                }
            };
            let data = self.revalidation_data(ctx);
            let mut batch = Batch::new();
            metadata::save_revalidation(&mut batch, &chain, &data, ttl);
            if let Err(err) = self.store.execute(batch).await {
                warn!(cache_key = chain.root(), error = %err, "failed to update revalidation data");
            }
        }

        let uri = match metadata::uri(self.store.as_ref(), &chain).await {
            Ok(Some(uri)) => uri,
            Ok(None) => {
                warn!(cache_key = chain.root(), "no stored uri; not scheduling revalidation");
                return None;
            }
            Err(err) => {
                warn!(cache_key = chain.root(), error = %err, "failed to read stored uri");
                return None;
            }
        };

        let payload = RevalidatePayload {
            key_chain: chain,
            data: None,
        };
        self.enqueue(
            REVALIDATE_QUEUE,
            JobType::Revalidate,
            &payload,
            revalidate_options(format!("revalidate:{}", sha256_hex(&uri))),
        )
        .await
    }

    /// Schedule a background fetch for a request with nothing stored yet. The job carries
    /// the captured revalidation data itself.
    pub async fn fetch_in_background(&self, ctx: &mut RequestContext) -> Option<String> {
        let chain = ctx.key_chain(&self.config.key_spec);
        let data = self.revalidation_data(ctx);
        let dedupe_key = format!("fetch:{}", sha256_hex(&ctx.request.full_uri()));
        let payload = RevalidatePayload {
            key_chain: chain,
            data: Some(data),
        };
        self.enqueue(
            REVALIDATE_QUEUE,
            JobType::Revalidate,
            &payload,
            revalidate_options(dedupe_key),
        )
        .await
    }
}

fn revalidate_options(dedupe_key: String) -> JobOptions {
    JobOptions {
        tags: vec![JobType::Revalidate.as_str().to_string()],
        priority: REVALIDATE_PRIORITY,
        dedupe_key: Some(dedupe_key),
        ..JobOptions::default()
    }
}

fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
