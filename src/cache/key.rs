//! Cache key derivation.
//!
//! A key is built from an ordered list of fields, each contributing one string, joined
//! with `:` under the `hoard:cache` namespace.

use std::{fmt, panic::AssertUnwindSafe, str::FromStr, sync::Arc};

use thiserror::Error;
use tracing::error;
use url::form_urlencoded;

use crate::domain::request::RequestInfo;
use crate::storage::BoxError;

const KEY_NAMESPACE: &str = "hoard:cache";

/// User-supplied key contribution. `Ok(None)` means the extractor had nothing to add.
pub type KeyExtractor = Arc<dyn Fn(&RequestInfo) -> Result<Option<String>, BoxError> + Send + Sync>;

#[derive(Clone)]
pub enum KeyField {
    Scheme,
    Host,
    Port,
    /// Request path, without the query string.
    Uri,
    /// Query arguments, sorted by name.
    Args,
    Custom {
        name: String,
        extractor: KeyExtractor,
    },
}

impl KeyField {
    pub fn custom<F>(name: impl Into<String>, extractor: F) -> Self
    where
        F: Fn(&RequestInfo) -> Result<Option<String>, BoxError> + Send + Sync + 'static,
    {
        Self::Custom {
            name: name.into(),
            extractor: Arc::new(extractor),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            KeyField::Scheme => "scheme",
            KeyField::Host => "host",
            KeyField::Port => "port",
            KeyField::Uri => "uri",
            KeyField::Args => "args",
            KeyField::Custom { name, .. } => name,
        }
    }
}

impl fmt::Debug for KeyField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyField::Custom { name, .. } => f.debug_tuple("Custom").field(name).finish(),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown cache key field `{0}`")]
pub struct UnknownKeyField(String);

impl FromStr for KeyField {
    type Err = UnknownKeyField;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "scheme" => Ok(KeyField::Scheme),
            "host" => Ok(KeyField::Host),
            "port" => Ok(KeyField::Port),
            "uri" => Ok(KeyField::Uri),
            "args" => Ok(KeyField::Args),
            other => Err(UnknownKeyField(other.to_string())),
        }
    }
}

/// Fully-qualified cache key for one cacheable request variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CacheKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered field list plus the argument limit used for `args`.
#[derive(Debug, Clone)]
pub struct CacheKeySpec {
    fields: Vec<KeyField>,
    max_args: usize,
}

impl Default for CacheKeySpec {
    fn default() -> Self {
        Self {
            fields: vec![KeyField::Scheme, KeyField::Host, KeyField::Uri, KeyField::Args],
            max_args: 100,
        }
    }
}

impl CacheKeySpec {
    /// An empty field list falls back to the default `scheme:host:uri:args`.
    pub fn new(fields: Vec<KeyField>, max_args: usize) -> Self {
        if fields.is_empty() {
            return Self {
                max_args,
                ..Self::default()
            };
        }
        Self { fields, max_args }
    }

    pub fn fields(&self) -> &[KeyField] {
        &self.fields
    }

    pub fn derive(&self, req: &RequestInfo) -> CacheKey {
        let mut segments = Vec::with_capacity(self.fields.len() + 1);
        segments.push(KEY_NAMESPACE.to_string());
        for field in &self.fields {
            let value = match field {
                KeyField::Scheme => Some(req.scheme.clone()),
                KeyField::Host => Some(req.host.clone()),
                KeyField::Port => Some(req.port.to_string()),
                KeyField::Uri => Some(req.path.clone()),
                KeyField::Args => Some(sorted_args(req.query.as_deref(), self.max_args)),
                KeyField::Custom { name, extractor } => run_extractor(name, extractor, req),
            };
            if let Some(value) = value {
                segments.push(value);
            }
        }
        CacheKey(segments.join(":"))
    }
}

fn run_extractor(name: &str, extractor: &KeyExtractor, req: &RequestInfo) -> Option<String> {
    match std::panic::catch_unwind(AssertUnwindSafe(|| extractor(req))) {
        Ok(Ok(Some(value))) => Some(value),
        Ok(Ok(None)) => {
            error!(field = name, "cache key field returned no value; skipping");
            None
        }
        Ok(Err(err)) => {
            error!(field = name, error = %err, "cache key field failed; skipping");
            None
        }
        Err(_) => {
            error!(field = name, "cache key field panicked; skipping");
            None
        }
    }
}

/// Re-encode at most `max_args` query arguments, stably sorted by name.
fn sorted_args(query: Option<&str>, max_args: usize) -> String {
    let Some(query) = query else {
        return String::new();
    };
    let mut args: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .take(max_args)
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    args.sort_by(|a, b| a.0.cmp(&b.0));

    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(args)
        .finish()
}
