//! In-process [`Store`] with Redis-compatible semantics for hashes, sets and lists.
//!
//! Every mutation bumps a per-key version; a [`Watch`] aborts its commit when the watched
//! key's version moved. Versions are only kept while a key is live or watched. Expiry is lazy and driven by [`tokio::time::Instant`], so paused-clock
//! tests observe TTLs deterministically.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;

use super::{Batch, Command, Store, StoreError, Watch};
use crate::infra::lock::mutex_lock;

const SOURCE: &str = "hoard::infra::store::memory";

#[derive(Debug, Clone)]
enum Value {
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
    List(Vec<Bytes>),
}

impl Value {
    fn is_empty(&self) -> bool {
        match self {
            Value::Hash(map) => map.is_empty(),
            Value::Set(set) => set.is_empty(),
            Value::List(list) => list.is_empty(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    versions: HashMap<String, u64>,
    watchers: HashMap<String, usize>,
}

impl State {
    fn touch(&mut self, key: &str) {
        *self.versions.entry(key.to_string()).or_default() += 1;
    }

    /// Records the removal of `key`; an unwatched key needs no version once it is gone.
    fn forget(&mut self, key: &str) {
        if self.watchers.contains_key(key) {
            self.touch(key);
        } else {
            self.versions.remove(key);
        }
    }

    fn unwatch(&mut self, key: &str) {
        let Some(count) = self.watchers.get_mut(key) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            self.watchers.remove(key);
            if !self.entries.contains_key(key) {
                self.versions.remove(key);
            }
        }
    }

    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or_default()
    }

    fn purge_expired(&mut self, key: &str) {
        let expired = self
            .entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            self.entries.remove(key);
            self.forget(key);
        }
    }

    fn get(&mut self, key: &str) -> Option<&Entry> {
        self.purge_expired(key);
        self.entries.get(key)
    }

    fn entry_or_insert(&mut self, key: &str, empty: Value) -> &mut Entry {
        self.purge_expired(key);
        self.entries.entry(key.to_string()).or_insert(Entry {
            value: empty,
            expires_at: None,
        })
    }

    fn drop_if_empty(&mut self, key: &str) {
        if self
            .entries
            .get(key)
            .is_some_and(|entry| entry.value.is_empty())
        {
            self.entries.remove(key);
            self.forget(key);
        }
    }

    fn apply(&mut self, command: Command) -> Result<(), StoreError> {
        match command {
            Command::HSet { key, fields } => {
                let entry = self.entry_or_insert(&key, Value::Hash(HashMap::new()));
                let Value::Hash(map) = &mut entry.value else {
                    return Err(StoreError::WrongType { key });
                };
                map.extend(fields);
                self.touch(&key);
            }
            Command::HDel { key, fields } => {
                self.purge_expired(&key);
                let Some(entry) = self.entries.get_mut(&key) else {
                    return Ok(());
                };
                let Value::Hash(map) = &mut entry.value else {
                    return Err(StoreError::WrongType { key });
                };
                let before = map.len();
                for field in &fields {
                    map.remove(field);
                }
                if map.len() != before {
                    self.touch(&key);
                    self.drop_if_empty(&key);
                }
            }
            Command::SAdd { key, member } => {
                let entry = self.entry_or_insert(&key, Value::Set(HashSet::new()));
                let Value::Set(set) = &mut entry.value else {
                    return Err(StoreError::WrongType { key });
                };
                set.insert(member);
                self.touch(&key);
            }
            Command::SRem { key, member } => {
                self.purge_expired(&key);
                let Some(entry) = self.entries.get_mut(&key) else {
                    return Ok(());
                };
                let Value::Set(set) = &mut entry.value else {
                    return Err(StoreError::WrongType { key });
                };
                if set.remove(&member) {
                    self.touch(&key);
                    self.drop_if_empty(&key);
                }
            }
            Command::RPush { key, value } => {
                let entry = self.entry_or_insert(&key, Value::List(Vec::new()));
                let Value::List(list) = &mut entry.value else {
                    return Err(StoreError::WrongType { key });
                };
                list.push(value);
                self.touch(&key);
            }
            Command::Expire { key, seconds } => {
                self.expire(&key, seconds);
            }
            Command::Del { keys } => {
                self.del(&keys);
            }
        }
        Ok(())
    }

    fn expire(&mut self, key: &str, seconds: u64) -> bool {
        self.purge_expired(key);
        if !self.entries.contains_key(key) {
            return false;
        }
        if seconds == 0 {
            self.entries.remove(key);
            self.forget(key);
        } else if let Some(entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + Duration::from_secs(seconds));
            self.touch(key);
        }
        true
    }

    fn del(&mut self, keys: &[String]) -> u64 {
        let mut removed = 0;
        for key in keys {
            self.purge_expired(key);
            if self.entries.remove(key).is_some() {
                self.forget(key);
                removed += 1;
            }
        }
        removed
    }

    /// Applies every command; like a Redis `EXEC`, a failing command does not stop the rest.
    fn apply_all(&mut self, batch: Batch) -> Result<(), StoreError> {
        let mut first_error = None;
        for command in batch.into_commands() {
            if let Err(err) = self.apply(command) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Shared in-process store. Clones observe the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` currently holds a live value.
    pub fn contains_key(&self, key: &str) -> bool {
        let mut state = mutex_lock(&self.state, SOURCE, "contains_key");
        state.get(key).is_some()
    }

    /// Members of the set at `key`, sorted; empty when absent.
    pub fn members(&self, key: &str) -> Vec<String> {
        let mut state = mutex_lock(&self.state, SOURCE, "members");
        let mut members: Vec<String> = match state.get(key).map(|entry| &entry.value) {
            Some(Value::Set(set)) => set.iter().cloned().collect(),
            _ => Vec::new(),
        };
        members.sort();
        members
    }

    /// Every live key, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut state = mutex_lock(&self.state, SOURCE, "keys");
        let candidates: Vec<String> = state.entries.keys().cloned().collect();
        let mut live: Vec<String> = candidates
            .into_iter()
            .filter(|key| state.get(key).is_some())
            .collect();
        live.sort();
        live
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut state = mutex_lock(&self.state, SOURCE, "hgetall");
        match state.get(key).map(|entry| &entry.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(map)) => Ok(map.clone()),
            Some(_) => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut state = mutex_lock(&self.state, SOURCE, "hget");
        match state.get(key).map(|entry| &entry.value) {
            None => Ok(None),
            Some(Value::Hash(map)) => Ok(map.get(field).cloned()),
            Some(_) => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
        }
    }

    async fn exists(&self, keys: &[String]) -> Result<u64, StoreError> {
        let mut state = mutex_lock(&self.state, SOURCE, "exists");
        Ok(keys.iter().filter(|key| state.get(key).is_some()).count() as u64)
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let mut state = mutex_lock(&self.state, SOURCE, "ttl");
        let remaining = state
            .get(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now()));
        Ok(remaining.map(|left| left.as_secs() + u64::from(left.subsec_nanos() > 0)))
    }

    async fn llen(&self, key: &str) -> Result<u64, StoreError> {
        let mut state = mutex_lock(&self.state, SOURCE, "llen");
        match state.get(key).map(|entry| &entry.value) {
            None => Ok(0),
            Some(Value::List(list)) => Ok(list.len() as u64),
            Some(_) => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
        }
    }

    async fn lindex(&self, key: &str, index: u64) -> Result<Option<Bytes>, StoreError> {
        let mut state = mutex_lock(&self.state, SOURCE, "lindex");
        match state.get(key).map(|entry| &entry.value) {
            None => Ok(None),
            Some(Value::List(list)) => Ok(usize::try_from(index)
                .ok()
                .and_then(|index| list.get(index))
                .cloned()),
            Some(_) => Err(StoreError::WrongType {
                key: key.to_string(),
            }),
        }
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool, StoreError> {
        let mut state = mutex_lock(&self.state, SOURCE, "expire");
        Ok(state.expire(key, seconds))
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StoreError> {
        let mut state = mutex_lock(&self.state, SOURCE, "del");
        Ok(state.del(keys))
    }

    async fn execute(&self, batch: Batch) -> Result<(), StoreError> {
        let mut state = mutex_lock(&self.state, SOURCE, "execute");
        state.apply_all(batch)
    }

    async fn watch(&self, key: &str) -> Result<Box<dyn Watch>, StoreError> {
        let mut state = mutex_lock(&self.state, SOURCE, "watch");
        state.purge_expired(key);
        *state.watchers.entry(key.to_string()).or_default() += 1;
        let version = state.version(key);
        Ok(Box::new(MemoryWatch {
            state: Arc::clone(&self.state),
            key: key.to_string(),
            version,
        }))
    }
}

struct MemoryWatch {
    state: Arc<Mutex<State>>,
    key: String,
    version: u64,
}

#[async_trait]
impl Watch for MemoryWatch {
    async fn commit(self: Box<Self>, batch: Batch) -> Result<bool, StoreError> {
        let mut state = mutex_lock(&self.state, SOURCE, "commit");
        state.purge_expired(&self.key);
        if state.version(&self.key) != self.version {
            return Ok(false);
        }
        state.apply_all(batch)?;
        Ok(true)
    }

    async fn discard(self: Box<Self>) {}
}

impl Drop for MemoryWatch {
    fn drop(&mut self) {
        mutex_lock(&self.state, SOURCE, "unwatch").unwatch(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[tokio::test]
    async fn commit_applies_when_watched_key_is_untouched() {
        let store = MemoryStore::new();
        let watch = store.watch("main").await.expect("watch");

        let mut batch = Batch::new();
        batch.hset("main", [("status", "200")]).sadd("entities", "a");
        assert!(watch.commit(batch).await.expect("commit"));

        assert_eq!(
            store.hget("main", "status").await.expect("hget"),
            Some("200".to_string())
        );
        assert_eq!(store.members("entities"), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn commit_aborts_when_watched_key_changed() {
        let store = MemoryStore::new();
        let first = store.watch("main").await.expect("watch");
        let second = store.watch("main").await.expect("watch");

        let mut winner = Batch::new();
        winner.hset("main", [("entity", "winner")]);
        assert!(first.commit(winner).await.expect("commit"));

        let mut loser = Batch::new();
        loser.hset("main", [("entity", "loser")]).sadd("entities", "loser");
        assert!(!second.commit(loser).await.expect("commit"));

        assert_eq!(
            store.hget("main", "entity").await.expect("hget"),
            Some("winner".to_string())
        );
        assert!(store.members("entities").is_empty());
    }

    #[tokio::test]
    async fn changes_to_other_keys_do_not_abort() {
        let store = MemoryStore::new();
        let watch = store.watch("main").await.expect("watch");

        let mut unrelated = Batch::new();
        unrelated.rpush("body", Bytes::from_static(b"chunk"));
        store.execute(unrelated).await.expect("execute");

        assert!(watch.commit(Batch::new()).await.expect("commit"));
    }

    #[tokio::test(start_paused = true)]
    async fn keys_expire_after_ttl() {
        let store = MemoryStore::new();
        let mut batch = Batch::new();
        batch
            .rpush("body", Bytes::from_static(b"a"))
            .expire("body", 10);
        store.execute(batch).await.expect("execute");

        assert_eq!(store.ttl("body").await.expect("ttl"), Some(10));
        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(store.llen("body").await.expect("llen"), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.llen("body").await.expect("llen"), 0);
        assert_eq!(store.ttl("body").await.expect("ttl"), None);
    }

    #[tokio::test]
    async fn lists_preserve_order_and_index() {
        let store = MemoryStore::new();
        let mut batch = Batch::new();
        batch
            .rpush("body", Bytes::from_static(b"one"))
            .rpush("body", Bytes::from_static(b"two"));
        store.execute(batch).await.expect("execute");

        assert_eq!(
            store.lindex("body", 1).await.expect("lindex"),
            Some(Bytes::from_static(b"two"))
        );
        assert_eq!(store.lindex("body", 2).await.expect("lindex"), None);
    }

    #[tokio::test]
    async fn wrong_type_is_reported() {
        let store = MemoryStore::new();
        let mut batch = Batch::new();
        batch.sadd("set", "member");
        store.execute(batch).await.expect("execute");

        let err = store.hgetall("set").await.expect_err("wrong type");
        assert!(matches!(err, StoreError::WrongType { .. }));
    }

    #[tokio::test]
    async fn del_counts_only_existing_keys() {
        let store = MemoryStore::new();
        let mut batch = Batch::new();
        batch.hset("a", [("f", "v")]);
        store.execute(batch).await.expect("execute");

        assert_eq!(store.del(&keys(&["a", "b"])).await.expect("del"), 1);
        assert_eq!(store.exists(&keys(&["a", "b"])).await.expect("exists"), 0);
    }

    fn tracked_versions(store: &MemoryStore) -> usize {
        mutex_lock(&store.state, SOURCE, "tracked_versions").versions.len()
    }

    #[tokio::test(start_paused = true)]
    async fn removed_keys_release_their_versions() {
        let store = MemoryStore::new();
        let mut batch = Batch::new();
        batch
            .hset("a", [("f", "v")])
            .sadd("s", "m")
            .rpush("l", Bytes::from_static(b"x"))
            .rpush("e", Bytes::from_static(b"y"))
            .expire("e", 5);
        store.execute(batch).await.expect("execute");
        assert_eq!(tracked_versions(&store), 4);

        let mut batch = Batch::new();
        batch.hdel("a", "f").srem("s", "m").del(["l"]);
        store.execute(batch).await.expect("execute");
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!store.contains_key("e"));
        assert_eq!(tracked_versions(&store), 0);
    }

    #[tokio::test]
    async fn watched_keys_keep_their_version_until_released() {
        let store = MemoryStore::new();
        let mut batch = Batch::new();
        batch.hset("main", [("f", "v")]);
        store.execute(batch).await.expect("execute");

        let watch = store.watch("main").await.expect("watch");
        assert_eq!(store.del(&keys(&["main"])).await.expect("del"), 1);
        let mut batch = Batch::new();
        batch.hset("main", [("f", "stale")]);
        assert!(!watch.commit(batch).await.expect("commit"));
        assert_eq!(tracked_versions(&store), 0);

        let watch = store.watch("main").await.expect("watch");
        let mut batch = Batch::new();
        batch.del(["main"]);
        assert!(watch.commit(batch).await.expect("commit"));
        assert_eq!(tracked_versions(&store), 0);
    }

    #[tokio::test]
    async fn emptied_collections_disappear() {
        let store = MemoryStore::new();
        let mut batch = Batch::new();
        batch.sadd("set", "only").hset("hash", [("only", "1")]);
        store.execute(batch).await.expect("execute");

        let mut batch = Batch::new();
        batch.srem("set", "only").hdel("hash", "only");
        store.execute(batch).await.expect("execute");

        assert!(!store.contains_key("set"));
        assert!(!store.contains_key("hash"));
    }
}
