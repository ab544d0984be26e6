//! Entity body storage: the driver contract, the pull-based body stream interface and
//! the eviction-delay policy.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::domain::{entity::EntityId, response::Response};
use crate::infra::store::StoreError;

pub mod body;
mod gc;
pub mod markup;
mod redis;

pub use self::gc::gc_wait;
pub use self::redis::{RedisStorage, StorageParams};

/// One piece of a response body together with its markup flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub data: Bytes,
    pub has_markup: bool,
}

impl Chunk {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            has_markup: false,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum BodyError {
    #[error("upstream body read failed: {0}")]
    Upstream(String),
    #[error("stored body read failed: {0}")]
    Store(#[from] StoreError),
}

/// Pull-driven body stream. `Ok(None)` signals end of sequence.
#[async_trait]
pub trait BodyReader: Send {
    async fn next_chunk(&mut self) -> Result<Option<Chunk>, BodyError>;
}

pub type BoxBodyReader = Box<dyn BodyReader>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("response has no entity id")]
    MissingEntity,
    #[error("response has no body reader to persist")]
    MissingBody,
}

/// Why a write did not produce a durable entity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteFailure {
    #[error("body is larger than the storage maximum of {max_size} bytes")]
    TooLarge { max_size: u64 },
    #[error("error writing chunk: {0}")]
    Store(String),
    #[error("body stream failed: {0}")]
    Body(String),
    #[error("entity transaction failed: {0}")]
    Commit(String),
}

/// What a completed write persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub bytes: u64,
    /// At least one persisted chunk was flagged as containing markup.
    pub has_markup: bool,
}

pub type WriteOutcome = Result<WriteSummary, WriteFailure>;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Finalization step run once a writer's source is exhausted.
///
/// Errors and panics raised here are logged by the writer and never reach the body stream.
#[async_trait]
pub trait WriteCompletion: Send {
    async fn complete(self: Box<Self>, outcome: WriteOutcome) -> Result<(), BoxError>;
}

/// Storage driver contract. Every backend stores an entity as an ordered chunk sequence
/// plus a parallel markup-flag sequence.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    fn max_size(&self) -> u64;

    /// True only when both backing sequences exist.
    async fn exists(&self, entity_id: &EntityId) -> Result<bool, StorageError>;

    async fn delete(&self, entity_id: &EntityId) -> Result<bool, StorageError>;

    async fn set_ttl(&self, entity_id: &EntityId, ttl: Duration) -> Result<bool, StorageError>;

    async fn get_ttl(&self, entity_id: &EntityId) -> Result<Option<Duration>, StorageError>;

    fn get_reader(&self, res: &Response) -> Result<BoxBodyReader, StorageError>;

    /// Replace `res`'s body reader with one that also persists every chunk it yields.
    fn get_writer(
        &self,
        res: &mut Response,
        ttl: Duration,
        completion: Box<dyn WriteCompletion>,
    ) -> Result<(), StorageError>;

    async fn close(&self);
}
