use std::sync::Arc;

use apalis::prelude::Error as ApalisError;

use crate::infra::store::Store;
use crate::storage::StorageDriver;

/// Shared context passed to job workers so they can reach the stores and the network.
#[derive(Clone)]
pub struct JobWorkerContext {
    pub store: Arc<dyn Store>,
    pub storage: Arc<dyn StorageDriver>,
    pub http: reqwest::Client,
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Convert any error into an [`ApalisError::Failed`].
pub fn job_failed<E>(err: E) -> ApalisError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let boxed: BoxError = Box::new(err);
    ApalisError::Failed(Arc::new(boxed))
}
