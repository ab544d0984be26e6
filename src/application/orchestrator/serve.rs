use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, warn};

use super::Orchestrator;
use crate::application::context::{AbortAction, RequestContext, events, states};
use crate::cache::Event;
use crate::domain::response::Response;

const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("client disconnected")]
    Disconnected,
    #[error("headers already sent")]
    HeadersSent,
}

/// Where a served response is written. Implemented by the listener adapter.
#[async_trait]
pub trait ClientSink: Send {
    fn headers_sent(&self) -> bool;

    async fn send_headers(&mut self, status: StatusCode, headers: &HeaderMap)
    -> Result<(), SinkError>;

    async fn write(&mut self, data: Bytes) -> Result<(), SinkError>;

    /// Only called when [`ClientSink::supports_flush`] is true.
    async fn flush(&mut self) -> Result<(), SinkError>;

    fn supports_flush(&self) -> bool;

    async fn finish(&mut self) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    Served,
    /// Headers had already gone out; nothing was written.
    AlreadySent,
    ClientAborted,
    /// The body reader failed after headers were sent.
    Truncated,
}

impl Orchestrator {
    /// Write the context's response (or its error response) to `sink`.
    pub async fn serve(&self, ctx: &mut RequestContext, sink: &mut dyn ClientSink) -> ServeOutcome {
        if sink.headers_sent() {
            debug!("headers already sent; serve skipped");
            return ServeOutcome::AlreadySent;
        }
        ctx.history.record_state(states::SERVING);

        let (mut res, is_error) = match (ctx.response.take(), ctx.error_response.take()) {
            (_, Some(error)) => (error, true),
            (Some(res), None) => (res, false),
            (None, None) => (Response::new(StatusCode::INTERNAL_SERVER_ERROR), true),
        };

        self.add_via(&mut res.headers);
        if let Some(marker) = cache_marker(ctx, &self.config.visible_hostname) {
            prepend(&mut res.headers, X_CACHE, &marker);
        }
        self.events.emit(Event::BeforeServe(&mut res));

        let outcome = self.write_response(ctx, &mut res, sink).await;

        if is_error {
            ctx.error_response = Some(res);
        } else {
            ctx.response = Some(res);
        }
        outcome
    }

    async fn write_response(
        &self,
        ctx: &mut RequestContext,
        res: &mut Response,
        sink: &mut dyn ClientSink,
    ) -> ServeOutcome {
        if sink.send_headers(res.status, &res.headers).await.is_err() {
            ctx.client_aborted();
            return ServeOutcome::ClientAborted;
        }

        let skip_body = ctx.request.method == Method::HEAD
            || res.status == StatusCode::NOT_MODIFIED
            || !res.has_body;
        let reader = if skip_body { None } else { res.take_body_reader() };
        let Some(mut reader) = reader else {
            return finish(ctx, sink).await;
        };

        let flushes = sink.supports_flush();
        let mut buffered = 0usize;
        let mut draining = false;
        loop {
            let chunk = match reader.next_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(err) => {
                    warn!(uri = %ctx.request.full_uri(), error = %err, "body stream failed mid-response");
                    return if draining {
                        ServeOutcome::ClientAborted
                    } else {
                        ServeOutcome::Truncated
                    };
                }
            };
            if draining || chunk.is_empty() {
                continue;
            }

            buffered += chunk.len();
            let mut written = sink.write(chunk.data).await;
            if written.is_ok() && flushes && buffered >= self.config.buffer_size {
                buffered = 0;
                written = sink.flush().await;
            }
            if written.is_err() {
                match ctx.client_aborted() {
                    AbortAction::Stop => return ServeOutcome::ClientAborted,
                    AbortAction::Drain => {
                        debug!("client gone; draining body so the save can finish");
                        draining = true;
                    }
                }
            }
        }

        if draining {
            return ServeOutcome::ClientAborted;
        }
        finish(ctx, sink).await
    }

    fn add_via(&self, headers: &mut HeaderMap) {
        let mut via = format!("1.1 {}", self.config.visible_hostname);
        if self.config.advertise_server {
            via.push_str(&format!(" ({}/{})", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")));
        }
        prepend(headers, header::VIA, &via);
    }
}

async fn finish(ctx: &mut RequestContext, sink: &mut dyn ClientSink) -> ServeOutcome {
    match sink.finish().await {
        Ok(()) => ServeOutcome::Served,
        Err(_) => {
            ctx.client_aborted();
            ServeOutcome::ClientAborted
        }
    }
}

/// `HIT` unless this request fetched from the origin without falling back to a stored
/// response. Not-cacheable responses carry no marker.
fn cache_marker(ctx: &RequestContext, hostname: &str) -> Option<String> {
    let history = &ctx.history;
    if history.saw(events::RESPONSE_NOT_CACHEABLE) {
        return None;
    }
    let fetched_fresh = history.visited(states::FETCHING)
        && !history.saw(events::CAN_SERVE_STALE)
        && !history.saw(events::CAN_SERVE_DISCONNECTED);
    let verdict = if fetched_fresh { "MISS" } else { "HIT" };
    Some(format!("{verdict} from {hostname}"))
}

/// Put `value` ahead of any existing values, folded into a single header.
fn prepend(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    let mut merged = value.to_string();
    for existing in headers.get_all(&name) {
        match existing.to_str() {
            Ok(existing) if !existing.is_empty() => {
                merged.push_str(", ");
                merged.push_str(existing);
            }
            _ => {}
        }
    }
    match HeaderValue::from_str(&merged) {
        Ok(merged) => {
            headers.insert(name, merged);
        }
        Err(err) => warn!(header = %name, error = %err, "merged header value is invalid"),
    }
}

#[cfg(test)]
mod tests {
    use axum::http::Method;

    use super::*;
    use crate::domain::request::RequestInfo;

    fn context() -> RequestContext {
        RequestContext::new(RequestInfo::new(Method::GET, "http://h/").expect("url"))
    }

    #[test]
    fn existing_values_follow_ours() {
        let mut headers = HeaderMap::new();
        headers.append(header::VIA, HeaderValue::from_static("1.0 a"));
        headers.append(header::VIA, HeaderValue::from_static("1.1 b"));
        prepend(&mut headers, header::VIA, "1.1 hoard");
        assert_eq!(headers.get(header::VIA).expect("via"), "1.1 hoard, 1.0 a, 1.1 b");
        assert_eq!(headers.get_all(header::VIA).iter().count(), 1);
    }

    #[test]
    fn fetched_responses_are_misses() {
        let mut ctx = context();
        assert_eq!(cache_marker(&ctx, "n").as_deref(), Some("HIT from n"));

        ctx.history.record_state(states::FETCHING);
        assert_eq!(cache_marker(&ctx, "n").as_deref(), Some("MISS from n"));

        ctx.history.record_event(events::CAN_SERVE_STALE);
        assert_eq!(cache_marker(&ctx, "n").as_deref(), Some("HIT from n"));

        ctx.history.record_event(events::RESPONSE_NOT_CACHEABLE);
        assert_eq!(cache_marker(&ctx, "n"), None);
    }
}
