use std::fmt;

use axum::http::{HeaderMap, HeaderName, StatusCode};
use tracing::debug;

use super::entity::EntityId;
use crate::storage::BoxBodyReader;

/// A response moving through the cache: either read back from storage or fetched from the origin.
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Advertised `Content-Length`, when the origin sent one.
    pub length: Option<u64>,
    pub has_body: bool,
    pub entity_id: Option<EntityId>,
    /// Stored body size in bytes.
    pub size: u64,
    /// Remaining freshness lifetime in seconds. Negative once stale.
    pub ttl: i64,
    pub uri: Option<String>,
    pub has_markup: bool,
    /// Unix time the origin generated the response, from its `Date` header.
    pub generated_ts: Option<i64>,
    body: Option<BoxBodyReader>,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            length: None,
            has_body: false,
            entity_id: None,
            size: 0,
            ttl: 0,
            uri: None,
            has_markup: false,
            generated_ts: None,
            body: None,
        }
    }

    /// Install `reader` as the body source, replacing any existing one.
    pub fn set_body_reader(&mut self, name: &'static str, reader: BoxBodyReader) {
        debug!(filter = name, "binding body reader");
        self.has_body = true;
        self.body = Some(reader);
    }

    /// Wrap the current body reader. Returns `false` when there is nothing to wrap.
    pub fn filter_body_reader<F>(&mut self, name: &'static str, filter: F) -> bool
    where
        F: FnOnce(BoxBodyReader) -> BoxBodyReader,
    {
        match self.body.take() {
            Some(inner) => {
                debug!(filter = name, "wrapping body reader");
                self.body = Some(filter(inner));
                true
            }
            None => false,
        }
    }

    pub fn take_body_reader(&mut self) -> Option<BoxBodyReader> {
        self.body.take()
    }

    pub fn has_body_reader(&self) -> bool {
        self.body.is_some()
    }

    pub fn header_str(&self, name: &HeaderName) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("length", &self.length)
            .field("has_body", &self.has_body)
            .field("entity_id", &self.entity_id)
            .field("size", &self.size)
            .field("ttl", &self.ttl)
            .field("uri", &self.uri)
            .field("has_markup", &self.has_markup)
            .field("body_reader", &self.body.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::body::{BufferedBody, collect};

    #[tokio::test]
    async fn filters_wrap_the_existing_reader() {
        let mut res = Response::new(StatusCode::OK);
        assert!(!res.filter_body_reader("noop", |inner| inner));

        res.set_body_reader("origin", Box::new(BufferedBody::from_bytes("abc")));
        assert!(res.filter_body_reader("passthrough", |inner| inner));

        let mut reader = res.take_body_reader().expect("reader");
        assert_eq!(collect(reader.as_mut()).await.expect("body"), "abc");
        assert!(!res.has_body_reader());
    }
}
