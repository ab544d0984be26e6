//! Entity storage laid out as two parallel Redis lists per entity: the body chunks and a
//! `"true"`/`"false"` markup flag per chunk.

use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use tracing::{debug, error, warn};

use super::{
    BodyError, BodyReader, BoxBodyReader, Chunk, StorageDriver, StorageError, WriteCompletion,
    WriteFailure, WriteOutcome, WriteSummary,
};
use crate::domain::{entity::EntityId, response::Response};
use crate::infra::store::{Batch, RedisStore, Store};

const ENTITY_NAMESPACE: &str = "hoard:entity";
const MARKUP_TRUE: &[u8] = b"true";
const MARKUP_FALSE: &[u8] = b"false";

#[derive(Debug, Clone, Copy)]
pub struct StorageParams {
    pub max_size: u64,
    /// When false, chunks are written as they arrive and partial writes are deleted directly.
    pub supports_transactions: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct EntityKeys {
    body: String,
    body_markup: String,
}

impl EntityKeys {
    fn new(entity_id: &EntityId) -> Self {
        Self {
            body: format!("{ENTITY_NAMESPACE}:{entity_id}:body"),
            body_markup: format!("{ENTITY_NAMESPACE}:{entity_id}:body_esi"),
        }
    }

    fn all(&self) -> [String; 2] {
        [self.body.clone(), self.body_markup.clone()]
    }
}

pub struct RedisStorage {
    store: Arc<dyn Store>,
    owned: Option<RedisStore>,
    params: StorageParams,
}

impl RedisStorage {
    /// Open a dedicated pool for entity bodies.
    pub fn connect(
        url: &str,
        max_connections: usize,
        params: StorageParams,
    ) -> Result<Self, StorageError> {
        let store = RedisStore::connect(url, max_connections)?;
        Ok(Self {
            store: Arc::new(store.clone()),
            owned: Some(store),
            params,
        })
    }

    /// Share an existing store, typically the metadata store.
    pub fn with_store(store: Arc<dyn Store>, params: StorageParams) -> Self {
        Self {
            store,
            owned: None,
            params,
        }
    }
}

#[async_trait]
impl StorageDriver for RedisStorage {
    fn max_size(&self) -> u64 {
        self.params.max_size
    }

    async fn exists(&self, entity_id: &EntityId) -> Result<bool, StorageError> {
        let keys = EntityKeys::new(entity_id);
        Ok(self.store.exists(&keys.all()).await? == 2)
    }

    async fn delete(&self, entity_id: &EntityId) -> Result<bool, StorageError> {
        let keys = EntityKeys::new(entity_id);
        Ok(self.store.del(&keys.all()).await? > 0)
    }

    async fn set_ttl(&self, entity_id: &EntityId, ttl: Duration) -> Result<bool, StorageError> {
        let keys = EntityKeys::new(entity_id);
        let mut batch = Batch::new();
        batch
            .expire(&keys.body, ttl.as_secs())
            .expire(&keys.body_markup, ttl.as_secs());
        self.store.execute(batch).await?;
        Ok(self.store.ttl(&keys.body).await?.is_some())
    }

    async fn get_ttl(&self, entity_id: &EntityId) -> Result<Option<Duration>, StorageError> {
        let keys = EntityKeys::new(entity_id);
        Ok(self
            .store
            .ttl(&keys.body)
            .await?
            .map(Duration::from_secs))
    }

    fn get_reader(&self, res: &Response) -> Result<BoxBodyReader, StorageError> {
        let entity_id = res.entity_id.as_ref().ok_or(StorageError::MissingEntity)?;
        Ok(Box::new(EntityReader {
            store: Arc::clone(&self.store),
            entity_id: entity_id.clone(),
            keys: EntityKeys::new(entity_id),
            cursor: 0,
            len: None,
        }))
    }

    fn get_writer(
        &self,
        res: &mut Response,
        ttl: Duration,
        completion: Box<dyn WriteCompletion>,
    ) -> Result<(), StorageError> {
        let entity_id = res.entity_id.clone().ok_or(StorageError::MissingEntity)?;
        if !res.has_body_reader() {
            return Err(StorageError::MissingBody);
        }

        let store = Arc::clone(&self.store);
        let params = self.params;
        res.filter_body_reader("entity_writer", move |source| {
            Box::new(EntityWriter {
                store,
                keys: EntityKeys::new(&entity_id),
                entity_id,
                source,
                ttl,
                params,
                batch: None,
                size: 0,
                has_markup: false,
                started: false,
                failure: None,
                completion: Some(completion),
            })
        });
        Ok(())
    }

    async fn close(&self) {
        if let Some(store) = self.owned.as_ref() {
            store.close();
        }
    }
}

struct EntityReader {
    store: Arc<dyn Store>,
    entity_id: EntityId,
    keys: EntityKeys,
    cursor: u64,
    len: Option<u64>,
}

#[async_trait]
impl BodyReader for EntityReader {
    async fn next_chunk(&mut self) -> Result<Option<Chunk>, BodyError> {
        let len = match self.len {
            Some(len) => len,
            None => {
                let len = self.store.llen(&self.keys.body).await?;
                self.len = Some(len);
                len
            }
        };
        if self.cursor >= len {
            return Ok(None);
        }

        let index = self.cursor;
        self.cursor += 1;

        let data = self.store.lindex(&self.keys.body, index).await?;
        let flag = self.store.lindex(&self.keys.body_markup, index).await?;
        match data {
            Some(data) => Ok(Some(Chunk {
                data,
                has_markup: flag.as_deref() == Some(MARKUP_TRUE),
            })),
            None => {
                warn!(
                    entity_id = %self.entity_id,
                    index,
                    "entity removed during read"
                );
                self.cursor = len;
                Ok(None)
            }
        }
    }
}

/// Pass-through reader that tees every chunk into the entity lists.
struct EntityWriter {
    store: Arc<dyn Store>,
    entity_id: EntityId,
    keys: EntityKeys,
    source: BoxBodyReader,
    ttl: Duration,
    params: StorageParams,
    batch: Option<Batch>,
    size: u64,
    has_markup: bool,
    started: bool,
    failure: Option<WriteFailure>,
    completion: Option<Box<dyn WriteCompletion>>,
}

impl EntityWriter {
    async fn write(&mut self, chunk: &Chunk) {
        self.size += chunk.len() as u64;
        if self.size > self.params.max_size {
            warn!(
                entity_id = %self.entity_id,
                max_size = self.params.max_size,
                "body exceeds storage maximum, abandoning write"
            );
            self.failure = Some(WriteFailure::TooLarge {
                max_size: self.params.max_size,
            });
            return;
        }

        self.has_markup |= chunk.has_markup;
        let flag = if chunk.has_markup {
            MARKUP_TRUE
        } else {
            MARKUP_FALSE
        };
        let mut commands = Batch::new();
        commands
            .rpush(&self.keys.body, chunk.data.clone())
            .rpush(&self.keys.body_markup, Bytes::from_static(flag));
        if !self.started {
            self.started = true;
            // EXPIRE 0 would delete the lists just pushed.
            let ttl = self.ttl.as_secs().max(1);
            commands
                .expire(&self.keys.body, ttl)
                .expire(&self.keys.body_markup, ttl);
        }

        if self.params.supports_transactions {
            self.batch.get_or_insert_with(Batch::new).extend(commands);
        } else if let Err(err) = self.store.execute(commands).await {
            self.failure = Some(WriteFailure::Store(err.to_string()));
        }
    }

    async fn finish(&mut self) {
        let Some(completion) = self.completion.take() else {
            return;
        };
        let outcome = self.settle().await;
        if let Err(failure) = &outcome {
            warn!(entity_id = %self.entity_id, reason = %failure, "entity write failed");
        } else {
            debug!(
                entity_id = %self.entity_id,
                size = self.size,
                has_markup = self.has_markup,
                "entity write complete"
            );
        }

        let entity_id = self.entity_id.clone();
        match AssertUnwindSafe(completion.complete(outcome))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(entity_id = %entity_id, error = %err, "write completion failed");
            }
            Err(_) => {
                error!(entity_id = %entity_id, "write completion panicked");
            }
        }
    }

    async fn settle(&mut self) -> WriteOutcome {
        let batch = self.batch.take();
        if let Some(failure) = self.failure.take() {
            // Discarding the batch rolls back; direct writes have to be removed.
            if batch.is_none() && self.started {
                if let Err(err) = self.store.del(&self.keys.all()).await {
                    warn!(entity_id = %self.entity_id, error = %err, "failed to remove partial entity");
                }
            }
            return Err(failure);
        }

        let summary = WriteSummary {
            bytes: self.size,
            has_markup: self.has_markup,
        };
        match batch {
            Some(batch) => match self.store.execute(batch).await {
                Ok(()) => Ok(summary),
                Err(err) => Err(WriteFailure::Commit(err.to_string())),
            },
            None => Ok(summary),
        }
    }
}

#[async_trait]
impl BodyReader for EntityWriter {
    async fn next_chunk(&mut self) -> Result<Option<Chunk>, BodyError> {
        if self.completion.is_none() {
            return self.source.next_chunk().await;
        }
        match self.source.next_chunk().await {
            Ok(Some(chunk)) => {
                if self.failure.is_none() {
                    self.write(&chunk).await;
                }
                Ok(Some(chunk))
            }
            Ok(None) => {
                self.finish().await;
                Ok(None)
            }
            Err(err) => {
                self.failure
                    .get_or_insert_with(|| WriteFailure::Body(err.to_string()));
                self.finish().await;
                Err(err)
            }
        }
    }
}
