//! Backing-store abstraction shared by the metadata layer, the storage engine and the job queue.
//!
//! The only cross-request coordination primitive is compare-and-commit: [`Store::watch`]
//! returns a [`Watch`] whose [`Watch::commit`] applies a [`Batch`] only if the watched key
//! was not modified since the watch began.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backing store unavailable: {0}")]
    Unavailable(String),
    #[error("backing store command failed: {0}")]
    Command(String),
    #[error("key `{key}` holds a value of the wrong type")]
    WrongType { key: String },
}

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            Self::Unavailable(err.to_string())
        } else {
            Self::Command(err.to_string())
        }
    }
}

impl From<deadpool_redis::PoolError> for StoreError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// One mutation queued inside a [`Batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    HSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    HDel {
        key: String,
        fields: Vec<String>,
    },
    SAdd {
        key: String,
        member: String,
    },
    SRem {
        key: String,
        member: String,
    },
    RPush {
        key: String,
        value: Bytes,
    },
    Expire {
        key: String,
        seconds: u64,
    },
    Del {
        keys: Vec<String>,
    },
}

/// Ordered list of mutations applied atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    commands: Vec<Command>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    /// `HSET` with no fields is rejected by Redis, so empty field lists are skipped.
    pub fn hset<I, K, V>(&mut self, key: &str, fields: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let fields: Vec<(String, String)> = fields
            .into_iter()
            .map(|(field, value)| (field.into(), value.into()))
            .collect();
        if fields.is_empty() {
            return self;
        }
        self.push(Command::HSet {
            key: key.to_string(),
            fields,
        })
    }

    pub fn hdel(&mut self, key: &str, field: &str) -> &mut Self {
        self.push(Command::HDel {
            key: key.to_string(),
            fields: vec![field.to_string()],
        })
    }

    pub fn sadd(&mut self, key: &str, member: &str) -> &mut Self {
        self.push(Command::SAdd {
            key: key.to_string(),
            member: member.to_string(),
        })
    }

    pub fn srem(&mut self, key: &str, member: &str) -> &mut Self {
        self.push(Command::SRem {
            key: key.to_string(),
            member: member.to_string(),
        })
    }

    pub fn rpush(&mut self, key: &str, value: Bytes) -> &mut Self {
        self.push(Command::RPush {
            key: key.to_string(),
            value,
        })
    }

    pub fn expire(&mut self, key: &str, seconds: u64) -> &mut Self {
        self.push(Command::Expire {
            key: key.to_string(),
            seconds,
        })
    }

    pub fn del<I, K>(&mut self, keys: I) -> &mut Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        if keys.is_empty() {
            return self;
        }
        self.push(Command::Del { keys })
    }

    pub fn extend(&mut self, other: Batch) -> &mut Self {
        self.commands.extend(other.commands);
        self
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }
}

/// An optimistic lock on one key, held until committed or discarded.
#[async_trait]
pub trait Watch: Send {
    /// Apply `batch` atomically if the watched key is unchanged. `Ok(false)` means the
    /// transaction was aborted and nothing was applied.
    async fn commit(self: Box<Self>, batch: Batch) -> Result<bool, StoreError>;

    /// Release the watch without applying anything.
    async fn discard(self: Box<Self>);
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    /// Number of the given keys that exist.
    async fn exists(&self, keys: &[String]) -> Result<u64, StoreError>;

    /// Remaining time to live in seconds; `None` when the key is missing or never expires.
    async fn ttl(&self, key: &str) -> Result<Option<u64>, StoreError>;

    async fn llen(&self, key: &str) -> Result<u64, StoreError>;

    async fn lindex(&self, key: &str, index: u64) -> Result<Option<Bytes>, StoreError>;

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool, StoreError>;

    /// Number of keys removed.
    async fn del(&self, keys: &[String]) -> Result<u64, StoreError>;

    /// Apply `batch` atomically without any watch.
    async fn execute(&self, batch: Batch) -> Result<(), StoreError>;

    async fn watch(&self, key: &str) -> Result<Box<dyn Watch>, StoreError>;
}
