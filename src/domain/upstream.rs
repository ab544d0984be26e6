use axum::http::{HeaderMap, Method};
use bytes::Bytes;

/// Where the next origin request goes. Hooks may redirect it before connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub host: String,
    pub port: u16,
    pub use_ssl: bool,
    /// SNI and certificate name, when it differs from `host`.
    pub server_name: Option<String>,
}

impl UpstreamTarget {
    pub fn scheme(&self) -> &'static str {
        if self.use_ssl { "https" } else { "http" }
    }

    pub fn url(&self, path_and_query: &str) -> String {
        let host = self.server_name.as_deref().unwrap_or(&self.host);
        format!("{}://{}:{}{}", self.scheme(), host, self.port, path_and_query)
    }
}

/// The request about to be sent to the origin. Hooks may rewrite any part.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    /// Path plus query string.
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}
