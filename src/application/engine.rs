//! Decision engine seam and the minimal engine the binary runs.
//!
//! An engine decides which orchestrator operations to compose for a request. The
//! orchestrator never calls back into it except through the abort handler.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use axum::http::{HeaderValue, Method, StatusCode, header};
use serde_json::json;
use tracing::{debug, error, warn};

use super::context::{AbortAction, RequestContext, events};
use super::orchestrator::{ClientSink, Orchestrator, SaveOutcome, SaveResult};
use crate::domain::response::Response;
use crate::storage::body::BufferedBody;

/// Statuses stored when the origin marks them cacheable.
const CACHEABLE_STATUSES: [u16; 6] = [200, 203, 300, 301, 404, 410];

#[async_trait]
pub trait DecisionEngine: Send + Sync {
    async fn run(
        &self,
        orchestrator: &Orchestrator,
        ctx: &mut RequestContext,
        sink: &mut dyn ClientSink,
    );
}

/// Read-through engine: serve fresh hits, serve stale within `max_stale` while refreshing
/// in the background, otherwise fetch, store when cacheable and serve.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicEngine;

#[async_trait]
impl DecisionEngine for BasicEngine {
    async fn run(
        &self,
        orchestrator: &Orchestrator,
        ctx: &mut RequestContext,
        sink: &mut dyn ClientSink,
    ) {
        let method = ctx.request.method.clone();
        if method.as_str() == "PURGE" {
            purge(orchestrator, ctx).await;
        } else if method == Method::GET || method == Method::HEAD {
            read_through(orchestrator, ctx).await;
        } else {
            ctx.history.record_event(events::RESPONSE_NOT_CACHEABLE);
            ctx.response = Some(orchestrator.fetch(ctx).await);
        }

        let receipt = ctx.take_pending_save();
        let outcome = orchestrator.serve(ctx, sink).await;
        debug!(outcome = ?outcome, "response served");

        if let Some(receipt) = receipt {
            match receipt.wait().await {
                Some(SaveResult::Committed { bytes }) => debug!(bytes, "response stored"),
                Some(result) => debug!(result = ?result, "response not stored"),
                None => debug!("body not fully read; response not stored"),
            }
        }
    }
}

async fn read_through(orchestrator: &Orchestrator, ctx: &mut RequestContext) {
    let cached = match orchestrator.read(ctx).await {
        Ok(cached) => cached,
        Err(err) => {
            error!(uri = %ctx.request.full_uri(), error = %err, "failed to read cached metadata");
            ctx.error_response = Some(Response::new(StatusCode::INTERNAL_SERVER_ERROR));
            return;
        }
    };

    if let Some(res) = cached {
        if res.ttl > 0 {
            ctx.response = Some(res);
            return;
        }
        let max_stale = i64::try_from(orchestrator.config().max_stale.as_secs()).unwrap_or(i64::MAX);
        if res.ttl.saturating_add(max_stale) > 0 && !forbids_stale(ctx) {
            ctx.history.record_event(events::CAN_SERVE_STALE);
            ctx.response = Some(res);
            orchestrator.revalidate_in_background(ctx, true).await;
            return;
        }
    }

    let mut res = orchestrator.fetch(ctx).await;

    if ctx.request.headers.contains_key(header::RANGE) {
        ctx.history.record_event(events::RESPONSE_NOT_CACHEABLE);
        ctx.response = Some(res);
        orchestrator.fetch_in_background(ctx).await;
        return;
    }

    let ttl = (ctx.request.method == Method::GET)
        .then(|| cacheable_ttl(&res))
        .flatten();
    let Some(ttl) = ttl else {
        ctx.history.record_event(events::RESPONSE_NOT_CACHEABLE);
        ctx.response = Some(res);
        return;
    };

    res.ttl = ttl;
    let saving = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&saving);
    ctx.register_abort_handler(move || {
        if flag.load(Ordering::Acquire) {
            AbortAction::Drain
        } else {
            AbortAction::Stop
        }
    });

    match orchestrator.save(ctx, &mut res).await {
        Ok(SaveOutcome::Streaming(receipt)) => {
            saving.store(true, Ordering::Release);
            ctx.set_pending_save(receipt);
        }
        Ok(SaveOutcome::Finished(result)) => debug!(result = ?result, "bodiless response saved"),
        Ok(SaveOutcome::Skipped) => {}
        Err(err) => warn!(uri = %ctx.request.full_uri(), error = %err, "save failed; serving uncached"),
    }
    ctx.response = Some(res);
}

async fn purge(orchestrator: &Orchestrator, ctx: &mut RequestContext) {
    ctx.history.record_event(events::RESPONSE_NOT_CACHEABLE);
    let (status, result) = match orchestrator.delete(ctx).await {
        Ok(true) => (StatusCode::OK, "purged"),
        Ok(false) => (StatusCode::NOT_FOUND, "nothing to purge"),
        Err(err) => {
            error!(uri = %ctx.request.full_uri(), error = %err, "purge failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "purge failed")
        }
    };

    let body = json!({ "purge_mode": "delete", "result": result }).to_string();
    let mut res = Response::new(status);
    res.headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    res.length = Some(body.len() as u64);
    res.set_body_reader("purge", Box::new(BufferedBody::from_bytes(body)));
    ctx.response = Some(res);
}

/// True when the client sent `Cache-Control: max-stale=0`.
fn forbids_stale(ctx: &RequestContext) -> bool {
    ctx.request
        .header_str(&header::CACHE_CONTROL)
        .is_some_and(|value| directive(value, "max-stale") == Some(Some("0")))
}

/// Freshness lifetime in seconds when the origin allows shared caching, else `None`.
pub fn cacheable_ttl(res: &Response) -> Option<i64> {
    if !CACHEABLE_STATUSES.contains(&res.status.as_u16()) {
        return None;
    }
    let cache_control = res.header_str(&header::CACHE_CONTROL)?;
    if ["no-store", "private", "no-cache"]
        .iter()
        .any(|name| directive(cache_control, name).is_some())
    {
        return None;
    }
    let lifetime = directive(cache_control, "s-maxage")
        .or_else(|| directive(cache_control, "max-age"))
        .flatten()?
        .parse::<i64>()
        .ok()?;
    (lifetime > 0).then_some(lifetime)
}

/// `Some(None)` for a bare directive, `Some(Some(value))` for `name=value`.
fn directive<'a>(header: &'a str, name: &str) -> Option<Option<&'a str>> {
    header.split(',').find_map(|part| {
        let part = part.trim();
        let (key, value) = match part.split_once('=') {
            Some((key, value)) => (key.trim(), Some(value.trim().trim_matches('"'))),
            None => (part, None),
        };
        key.eq_ignore_ascii_case(name).then_some(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, cache_control: &'static str) -> Response {
        let mut res = Response::new(StatusCode::from_u16(status).expect("status"));
        res.headers
            .insert(header::CACHE_CONTROL, HeaderValue::from_static(cache_control));
        res
    }

    #[test]
    fn shared_max_age_wins() {
        assert_eq!(cacheable_ttl(&response(200, "max-age=60, s-maxage=300")), Some(300));
        assert_eq!(cacheable_ttl(&response(404, "public, max-age=60")), Some(60));
    }

    #[test]
    fn private_or_uncacheable_statuses_are_rejected() {
        assert_eq!(cacheable_ttl(&response(200, "private, max-age=60")), None);
        assert_eq!(cacheable_ttl(&response(200, "no-cache")), None);
        assert_eq!(cacheable_ttl(&response(500, "max-age=60")), None);
        assert_eq!(cacheable_ttl(&response(200, "max-age=0")), None);
        assert_eq!(cacheable_ttl(&Response::new(StatusCode::OK)), None);
    }

    #[test]
    fn directives_are_parsed_case_insensitively() {
        assert_eq!(directive("Max-Stale=0, public", "max-stale"), Some(Some("0")));
        assert_eq!(directive("public", "public"), Some(None));
        assert_eq!(directive("public", "private"), None);
    }
}
