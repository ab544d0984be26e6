use apalis::prelude::{Data, Error as ApalisError};
use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{
    context::{JobWorkerContext, job_failed},
    queue::JobError,
};
use crate::cache::{KeyChain, metadata};
use crate::domain::revalidation::RevalidationData;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevalidatePayload {
    pub key_chain: KeyChain,
    /// Captured at scheduling time when nothing is stored for the key yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<RevalidationData>,
}

/// Replay the original request against this node with `max-stale=0`, so the normal
/// request path refreshes the cache. The body is read and discarded.
pub async fn process_revalidate_job(
    payload: RevalidatePayload,
    context: Data<JobWorkerContext>,
) -> Result<(), ApalisError> {
    let ctx = &*context;
    let data = match payload.data {
        Some(data) => data,
        None => metadata::read_revalidation(ctx.store.as_ref(), &payload.key_chain)
            .await
            .map_err(job_failed)?
            .ok_or_else(|| {
                job_failed(JobError::failed(
                    "revalidation data is missing; entry presumed evicted",
                ))
            })?,
    };

    let params = &data.params;
    let url = format!(
        "{}://{}:{}{}",
        params.scheme,
        bracket_ipv6(&params.server_addr),
        params.server_port,
        params.uri
    );
    let headers = replay_headers(&data);

    let response = ctx
        .http
        .get(&url)
        .headers(headers)
        .timeout(params.request_timeout())
        .send()
        .await
        .map_err(|err| job_failed(JobError::failed(format!("revalidation request failed: {err}"))))?;
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|err| job_failed(JobError::failed(format!("revalidation body failed: {err}"))))?;

    info!(
        cache_key = payload.key_chain.root(),
        %url,
        status = status.as_u16(),
        bytes = body.len(),
        "revalidation finished"
    );
    Ok(())
}

fn bracket_ipv6(addr: &str) -> String {
    if addr.contains(':') && !addr.starts_with('[') {
        format!("[{addr}]")
    } else {
        addr.to_string()
    }
}

fn replay_headers(data: &RevalidationData) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &data.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "skipping unreplayable revalidation header"),
        }
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("max-stale=0"));
    headers
}
