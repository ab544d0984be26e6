use std::time::Instant;

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use metrics::{counter, histogram};
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::Orchestrator;
use crate::application::context::{RequestContext, states};
use crate::cache::Event;
use crate::domain::{
    request::RequestInfo,
    response::Response,
    upstream::OutboundRequest,
};
use crate::infra::upstream::UpstreamBodyReader;
use crate::storage::{BoxBodyReader, markup::MarkupScanner};
use crate::util::http_date;

const SURROGATE_CAPABILITY: HeaderName = HeaderName::from_static("surrogate-capability");

/// Methods the origin transport can send.
const SUPPORTED_METHODS: [Method; 7] = [
    Method::GET,
    Method::HEAD,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::OPTIONS,
    Method::PATCH,
];

pub(crate) fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "content-length"
    )
}

fn copy_end_to_end(source: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(source.len());
    for (name, value) in source {
        if !is_hop_by_hop(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    headers
}

impl Orchestrator {
    /// Fetch the request from the origin. Transport failures come back as a bodiless
    /// response carrying the mapped status.
    pub async fn fetch(&self, ctx: &mut RequestContext) -> Response {
        ctx.history.record_state(states::FETCHING);

        let method = ctx.request.method.clone();
        if !SUPPORTED_METHODS.contains(&method) {
            debug!(method = %method, "method not supported by the origin transport");
            return Response::new(StatusCode::NOT_IMPLEMENTED);
        }

        let mut target = self.config.upstream.clone();
        self.events.emit(Event::BeforeUpstreamConnect(&mut target));

        let mut outbound = self.outbound_request(&ctx.request);
        self.events.emit(Event::BeforeUpstreamRequest(&mut outbound));

        let started = Instant::now();
        let upstream_res = match self.upstream.send(&target, outbound).await {
            Ok(upstream_res) => upstream_res,
            Err(err) => {
                let status = err.status();
                warn!(
                    host = %target.host,
                    port = target.port,
                    status = status.as_u16(),
                    error = %err,
                    "upstream request failed"
                );
                counter!("hoard_upstream_error_total", "status" => status.as_u16().to_string())
                    .increment(1);
                return Response::new(status);
            }
        };
        histogram!("hoard_upstream_fetch_ms").record(started.elapsed().as_secs_f64() * 1_000.0);

        let mut res = Response::new(upstream_res.status());
        res.headers = copy_end_to_end(upstream_res.headers());
        res.length = upstream_res
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok());
        res.uri = Some(ctx.request.full_uri());

        if carries_body(&method, res.status) {
            let mut reader: BoxBodyReader = Box::new(UpstreamBodyReader::new(
                upstream_res,
                self.upstream.options().read_timeout,
            ));
            if self.config.esi_enabled {
                reader = Box::new(MarkupScanner::new(reader));
            }
            res.set_body_reader("upstream", reader);
        }

        let date = res.header_str(&header::DATE).and_then(http_date::parse);
        match date {
            Some(date) => res.generated_ts = Some(date.unix_timestamp()),
            None if res.status.as_u16() < 500 => {
                let now = OffsetDateTime::now_utc();
                match http_date::format(now) {
                    Ok(value) => match HeaderValue::from_str(&value) {
                        Ok(value) => {
                            res.headers.insert(header::DATE, value);
                            res.generated_ts = Some(now.unix_timestamp());
                        }
                        Err(err) => warn!(error = %err, "synthesized Date is not a header value"),
                    },
                    Err(err) => warn!(error = %err, "failed to synthesize Date"),
                }
            }
            None => {}
        }

        self.events.emit(Event::AfterUpstreamRequest(&mut res));
        res
    }

    fn outbound_request(&self, request: &RequestInfo) -> OutboundRequest {
        let mut headers = copy_end_to_end(&request.headers);
        if self.config.esi_enabled {
            let capability = format!("{}=\"ESI/1.0\"", self.config.visible_hostname);
            match HeaderValue::from_str(&capability) {
                Ok(value) => {
                    headers.append(SURROGATE_CAPABILITY, value);
                }
                Err(err) => warn!(error = %err, "visible hostname is not a valid header value"),
            }
        }
        OutboundRequest {
            method: request.method.clone(),
            path: request.request_uri(),
            headers,
            body: request.body.clone(),
        }
    }
}

fn carries_body(method: &Method, status: StatusCode) -> bool {
    *method != Method::HEAD
        && !status.is_informational()
        && status != StatusCode::NO_CONTENT
        && status != StatusCode::NOT_MODIFIED
}
