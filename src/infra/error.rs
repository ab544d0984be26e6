use thiserror::Error;

use super::{store::StoreError, upstream::UpstreamError};
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backing store error: {0}")]
    Store(#[from] StoreError),
    #[error("storage driver error: {0}")]
    Storage(#[from] StorageError),
    #[error("upstream client error: {0}")]
    Upstream(#[from] UpstreamError),
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl InfraError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}
