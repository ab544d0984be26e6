use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use deadpool_redis::{Connection, Pool, PoolConfig, Runtime};
use redis::{Pipeline, RedisResult};
use tracing::warn;

use super::{Batch, Command, Store, StoreError, Watch};

/// [`Store`] backed by a pooled Redis connection set.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("status", &self.pool.status())
            .finish()
    }
}

impl RedisStore {
    /// Build a connection pool. No connection is opened until first use.
    pub fn connect(url: &str, max_connections: usize) -> Result<Self, StoreError> {
        let mut config = deadpool_redis::Config::from_url(url);
        config.pool = Some(PoolConfig::new(max_connections));
        let pool = config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|err| StoreError::Unavailable(format!("failed to create pool: {err}")))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn close(&self) {
        self.pool.close();
    }

    async fn connection(&self) -> Result<Connection, StoreError> {
        Ok(self.pool.get().await?)
    }
}

fn queue_command(pipe: &mut Pipeline, command: Command) {
    match command {
        Command::HSet { key, fields } => {
            pipe.cmd("HSET").arg(key).arg(fields).ignore();
        }
        Command::HDel { key, fields } => {
            pipe.cmd("HDEL").arg(key).arg(fields).ignore();
        }
        Command::SAdd { key, member } => {
            pipe.cmd("SADD").arg(key).arg(member).ignore();
        }
        Command::SRem { key, member } => {
            pipe.cmd("SREM").arg(key).arg(member).ignore();
        }
        Command::RPush { key, value } => {
            pipe.cmd("RPUSH").arg(key).arg(value.as_ref()).ignore();
        }
        Command::Expire { key, seconds } => {
            pipe.cmd("EXPIRE").arg(key).arg(seconds).ignore();
        }
        Command::Del { keys } => {
            pipe.cmd("DEL").arg(keys).ignore();
        }
    }
}

fn transaction(batch: Batch) -> Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic();
    for command in batch.into_commands() {
        queue_command(&mut pipe, command);
    }
    pipe
}

#[async_trait]
impl Store for RedisStore {
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.connection().await?;
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(fields)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn exists(&self, keys: &[String]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        let count: u64 = redis::cmd("EXISTS")
            .arg(keys)
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let mut conn = self.connection().await?;
        let ttl: i64 = redis::cmd("TTL").arg(key).query_async(&mut conn).await?;
        Ok(u64::try_from(ttl).ok())
    }

    async fn llen(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let len: u64 = redis::cmd("LLEN").arg(key).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn lindex(&self, key: &str, index: u64) -> Result<Option<Bytes>, StoreError> {
        let mut conn = self.connection().await?;
        let value: Option<Vec<u8>> = redis::cmd("LINDEX")
            .arg(key)
            .arg(index)
            .query_async(&mut conn)
            .await?;
        Ok(value.map(Bytes::from))
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let applied: bool = redis::cmd("EXPIRE")
            .arg(key)
            .arg(seconds)
            .query_async(&mut conn)
            .await?;
        Ok(applied)
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        let removed: u64 = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn execute(&self, batch: Batch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let () = transaction(batch).query_async(&mut conn).await?;
        Ok(())
    }

    async fn watch(&self, key: &str) -> Result<Box<dyn Watch>, StoreError> {
        let mut conn = self.connection().await?;
        let () = redis::cmd("WATCH").arg(key).query_async(&mut conn).await?;
        Ok(Box::new(RedisWatch { conn: Some(conn) }))
    }
}

/// Holds the pooled connection the `WATCH` was issued on until `EXEC` or `UNWATCH`.
struct RedisWatch {
    conn: Option<Connection>,
}

impl RedisWatch {
    fn detach(&mut self) {
        // A connection with unknown WATCH state must not go back to the pool.
        if let Some(conn) = self.conn.take() {
            drop(Connection::take(conn));
        }
    }
}

#[async_trait]
impl Watch for RedisWatch {
    async fn commit(mut self: Box<Self>, batch: Batch) -> Result<bool, StoreError> {
        let Some(mut conn) = self.conn.take() else {
            return Err(StoreError::Command("watch already released".to_string()));
        };

        let result: RedisResult<Option<()>> = transaction(batch).query_async(&mut conn).await;
        match result {
            Ok(applied) => Ok(applied.is_some()),
            Err(err) => {
                self.conn = Some(conn);
                self.detach();
                Err(err.into())
            }
        }
    }

    async fn discard(mut self: Box<Self>) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        let result: RedisResult<()> = redis::cmd("UNWATCH").query_async(&mut conn).await;
        if let Err(err) = result {
            warn!(error = %err, "failed to release watch; dropping connection");
            self.conn = Some(conn);
            self.detach();
        }
    }
}

impl Drop for RedisWatch {
    fn drop(&mut self) {
        self.detach();
    }
}
