//! Origin HTTP client.

use std::{error::Error as StdError, net::IpAddr, net::SocketAddr, time::Duration};

use async_trait::async_trait;
use axum::http::StatusCode;
use thiserror::Error;
use tracing::warn;

use crate::domain::upstream::{OutboundRequest, UpstreamTarget};
use crate::storage::{BodyError, BodyReader, Chunk};

const STATUS_TIMEOUT: u16 = 524;
const STATUS_TLS_FAILURE: u16 = 525;

#[derive(Debug, Clone)]
pub struct UpstreamOptions {
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub read_timeout: Duration,
    pub keepalive_timeout: Duration,
    pub keepalive_poolsize: u32,
    pub ssl_verify: bool,
}

impl Default for UpstreamOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
            send_timeout: Duration::from_millis(2_000),
            read_timeout: Duration::from_millis(10_000),
            keepalive_timeout: Duration::from_millis(75_000),
            keepalive_poolsize: 64,
            ssl_verify: true,
        }
    }
}

impl From<&crate::config::UpstreamSettings> for UpstreamOptions {
    fn from(settings: &crate::config::UpstreamSettings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout,
            send_timeout: settings.send_timeout,
            read_timeout: settings.read_timeout,
            keepalive_timeout: settings.keepalive_timeout,
            keepalive_poolsize: settings.keepalive_poolsize.get(),
            ssl_verify: settings.ssl_verify,
        }
    }
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream timed out")]
    Timeout,
    #[error("upstream connection failed: {0}")]
    Connect(String),
    #[error("upstream TLS handshake failed: {0}")]
    Tls(String),
    #[error("upstream request failed: {0}")]
    Request(String),
    #[error("failed to build upstream client: {0}")]
    Build(String),
}

impl UpstreamError {
    /// Status answered to the client when the origin could not be reached.
    pub fn status(&self) -> StatusCode {
        match self {
            UpstreamError::Connect(_) => StatusCode::SERVICE_UNAVAILABLE,
            UpstreamError::Tls(_) => custom_status(STATUS_TLS_FAILURE),
            UpstreamError::Timeout | UpstreamError::Request(_) => custom_status(STATUS_TIMEOUT),
            UpstreamError::Build(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn classify(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout;
        }
        let detail = error_chain(&err);
        if err.is_connect() {
            let lowered = detail.to_ascii_lowercase();
            if ["tls", "certificate", "handshake", "ssl"]
                .iter()
                .any(|needle| lowered.contains(needle))
            {
                return Self::Tls(detail);
            }
            return Self::Connect(detail);
        }
        Self::Request(detail)
    }
}

fn custom_status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY)
}

fn error_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut current = err.source();
    while let Some(inner) = current {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        current = inner.source();
    }
    message
}

/// Pooled client for the configured origin. Connect and idle-read limits are enforced by
/// the transport; sending the request and receiving its head is bounded by
/// `send_timeout + read_timeout`.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    options: UpstreamOptions,
}

impl UpstreamClient {
    pub fn new(options: UpstreamOptions) -> Result<Self, UpstreamError> {
        Self::build(options, None)
    }

    /// A client that sends requests for `target`'s server name to its host address, so the
    /// TLS server name can differ from the address connected to.
    pub fn for_target(
        options: UpstreamOptions,
        target: &UpstreamTarget,
    ) -> Result<Self, UpstreamError> {
        let resolve = match (target.server_name.as_deref(), target.host.parse::<IpAddr>()) {
            (Some(name), Ok(ip)) => Some((name.to_string(), SocketAddr::new(ip, target.port))),
            (Some(name), Err(_)) => {
                warn!(
                    server_name = name,
                    host = %target.host,
                    "server name override needs an IP host; resolving the server name instead"
                );
                None
            }
            (None, _) => None,
        };
        Self::build(options, resolve)
    }

    fn build(
        options: UpstreamOptions,
        resolve: Option<(String, SocketAddr)>,
    ) -> Result<Self, UpstreamError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout)
            .read_timeout(options.read_timeout)
            .pool_idle_timeout(options.keepalive_timeout)
            .pool_max_idle_per_host(options.keepalive_poolsize as usize)
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(!options.ssl_verify);
        if let Some((name, addr)) = resolve {
            builder = builder.resolve(&name, addr);
        }
        let client = builder
            .build()
            .map_err(|err| UpstreamError::Build(error_chain(&err)))?;
        Ok(Self { client, options })
    }

    pub fn options(&self) -> &UpstreamOptions {
        &self.options
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn send(
        &self,
        target: &UpstreamTarget,
        request: OutboundRequest,
    ) -> Result<reqwest::Response, UpstreamError> {
        let url = target.url(&request.path);
        let pending = self
            .client
            .request(request.method, url)
            .headers(request.headers)
            .body(request.body)
            .send();

        let limit = self.options.send_timeout + self.options.read_timeout;
        match tokio::time::timeout(limit, pending).await {
            Err(_) => Err(UpstreamError::Timeout),
            Ok(Err(err)) => Err(UpstreamError::classify(err)),
            Ok(Ok(response)) => Ok(response),
        }
    }
}

/// Streams an origin response body chunk by chunk.
pub struct UpstreamBodyReader {
    response: reqwest::Response,
    read_timeout: Duration,
}

impl UpstreamBodyReader {
    pub fn new(response: reqwest::Response, read_timeout: Duration) -> Self {
        Self {
            response,
            read_timeout,
        }
    }
}

#[async_trait]
impl BodyReader for UpstreamBodyReader {
    async fn next_chunk(&mut self) -> Result<Option<Chunk>, BodyError> {
        match tokio::time::timeout(self.read_timeout, self.response.chunk()).await {
            Err(_) => Err(BodyError::Upstream("timed out reading body".to_string())),
            Ok(Err(err)) => Err(BodyError::Upstream(error_chain(&err))),
            Ok(Ok(chunk)) => Ok(chunk.map(Chunk::new)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_map_to_statuses() {
        assert_eq!(UpstreamError::Timeout.status().as_u16(), 524);
        assert_eq!(
            UpstreamError::Connect("refused".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(UpstreamError::Tls("bad cert".into()).status().as_u16(), 525);
    }

    #[tokio::test]
    async fn refused_connections_are_connect_errors() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let client = UpstreamClient::new(UpstreamOptions::default()).expect("client");
        let target = UpstreamTarget {
            host: "127.0.0.1".into(),
            port,
            use_ssl: false,
            server_name: None,
        };
        let request = OutboundRequest {
            method: axum::http::Method::GET,
            path: "/".into(),
            headers: Default::default(),
            body: Default::default(),
        };
        let err = client.send(&target, request).await.expect_err("refused");
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
