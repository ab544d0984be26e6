//! Connection parameters and header subset captured so a detached job can replay a request.

use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevalidationParams {
    pub server_addr: String,
    pub server_port: u16,
    pub scheme: String,
    pub uri: String,
    pub connect_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub keepalive_timeout_ms: u64,
    pub keepalive_poolsize: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("revalidation field `{field}` is {problem}")]
pub struct RevalidationFieldError {
    field: &'static str,
    problem: &'static str,
}

impl RevalidationParams {
    /// Flatten into hash fields for storage.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("server_addr".into(), self.server_addr.clone()),
            ("server_port".into(), self.server_port.to_string()),
            ("scheme".into(), self.scheme.clone()),
            ("uri".into(), self.uri.clone()),
            ("connect_timeout".into(), self.connect_timeout_ms.to_string()),
            ("send_timeout".into(), self.send_timeout_ms.to_string()),
            ("read_timeout".into(), self.read_timeout_ms.to_string()),
            ("keepalive_timeout".into(), self.keepalive_timeout_ms.to_string()),
            ("keepalive_poolsize".into(), self.keepalive_poolsize.to_string()),
        ]
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, RevalidationFieldError> {
        Ok(Self {
            server_addr: text(fields, "server_addr")?,
            server_port: number(fields, "server_port")?,
            scheme: text(fields, "scheme")?,
            uri: text(fields, "uri")?,
            connect_timeout_ms: number(fields, "connect_timeout")?,
            send_timeout_ms: number(fields, "send_timeout")?,
            read_timeout_ms: number(fields, "read_timeout")?,
            keepalive_timeout_ms: number(fields, "keepalive_timeout")?,
            keepalive_poolsize: number(fields, "keepalive_poolsize")?,
        })
    }

    /// Upper bound for one replay: connect, send and read back to back.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(
            self.connect_timeout_ms
                .saturating_add(self.send_timeout_ms)
                .saturating_add(self.read_timeout_ms),
        )
    }
}

fn text(
    fields: &HashMap<String, String>,
    field: &'static str,
) -> Result<String, RevalidationFieldError> {
    fields
        .get(field)
        .filter(|value| !value.is_empty())
        .cloned()
        .ok_or(RevalidationFieldError {
            field,
            problem: "missing",
        })
}

fn number<T: std::str::FromStr>(
    fields: &HashMap<String, String>,
    field: &'static str,
) -> Result<T, RevalidationFieldError> {
    text(fields, field)?.parse().map_err(|_| RevalidationFieldError {
        field,
        problem: "not a number",
    })
}

/// Everything needed to re-issue a request out of band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevalidationData {
    pub params: RevalidationParams,
    /// Lower-cased header name to value; only `host`, `authorization` and `cookie`.
    pub headers: BTreeMap<String, String>,
}
