//! Response metadata persisted next to each cached entity.
//!
//! `main` holds the scalar fields, `headers` holds one field per header value keyed
//! `"{position}:{name}"` so repeated headers come back in their original order, and
//! `entities` is the set of entity ids still considered live for the key.

use std::{collections::HashMap, time::Duration};

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::warn;

use super::keychain::KeyChain;
use crate::domain::{
    entity::EntityId,
    response::Response,
    revalidation::{RevalidationData, RevalidationParams},
};
use crate::infra::store::{Batch, Store, StoreError};

const FIELD_ENTITY: &str = "entity";
const FIELD_STATUS: &str = "status";
const FIELD_URI: &str = "uri";
const FIELD_SIZE: &str = "size";
const FIELD_EXPIRES: &str = "expires";
const FIELD_SAVED_TS: &str = "saved_ts";
const FIELD_GENERATED_TS: &str = "generated_ts";
const FIELD_HAS_MARKUP: &str = "has_markup";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("metadata at `{key}` is corrupt: {reason}")]
    Corrupt { key: String, reason: String },
}

impl MetadataError {
    fn corrupt(key: &str, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Load the stored response for `chain`, without a body reader. `Ok(None)` is a miss.
pub async fn read(store: &dyn Store, chain: &KeyChain) -> Result<Option<Response>, MetadataError> {
    let main = store.hgetall(chain.main()).await?;
    if main.is_empty() {
        return Ok(None);
    }

    let status = main
        .get(FIELD_STATUS)
        .ok_or_else(|| MetadataError::corrupt(chain.main(), "missing status"))?
        .parse::<u16>()
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| MetadataError::corrupt(chain.main(), "invalid status"))?;

    let mut res = Response::new(status);
    res.entity_id = main
        .get(FIELD_ENTITY)
        .filter(|value| !value.is_empty())
        .map(|value| EntityId::from(value.as_str()));
    res.size = parse_field(&main, FIELD_SIZE).unwrap_or(0);
    res.uri = main.get(FIELD_URI).cloned();
    res.has_markup = main.get(FIELD_HAS_MARKUP).is_some_and(|value| value == "true");
    res.generated_ts = parse_field(&main, FIELD_GENERATED_TS);
    res.length = Some(res.size);

    let expires: i64 = parse_field(&main, FIELD_EXPIRES).unwrap_or(0);
    res.ttl = expires - OffsetDateTime::now_utc().unix_timestamp();

    let stored_headers = store.hgetall(chain.headers()).await?;
    res.headers = restore_headers(chain.headers(), stored_headers);

    Ok(Some(res))
}

/// The entity currently referenced by `chain`, with its recorded size.
pub async fn entity_pointer(
    store: &dyn Store,
    chain: &KeyChain,
) -> Result<Option<(EntityId, u64)>, StoreError> {
    let Some(entity) = store.hget(chain.main(), FIELD_ENTITY).await? else {
        return Ok(None);
    };
    if entity.is_empty() {
        return Ok(None);
    }
    let size = store
        .hget(chain.main(), FIELD_SIZE)
        .await?
        .and_then(|value| value.parse().ok())
        .unwrap_or(0);
    Ok(Some((EntityId::from(entity), size)))
}

/// Queue the writes that persist `res` as the current response for `chain`.
///
/// `main` is rewritten from scratch, so fields the new response lacks (its entity in
/// particular) never survive from the one it replaces. Every key written here expires
/// `keep_cache_for` after the response goes stale.
pub fn save(batch: &mut Batch, chain: &KeyChain, res: &Response, keep_cache_for: Duration) {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let ttl = res.ttl.max(0);
    let expire_after = u64::try_from(ttl)
        .unwrap_or(0)
        .saturating_add(keep_cache_for.as_secs())
        .max(1);

    let mut fields = vec![
        (FIELD_STATUS.to_string(), res.status.as_u16().to_string()),
        (FIELD_SIZE.to_string(), res.size.to_string()),
        (FIELD_EXPIRES.to_string(), (now + ttl).to_string()),
        (FIELD_SAVED_TS.to_string(), now.to_string()),
        (FIELD_HAS_MARKUP.to_string(), res.has_markup.to_string()),
    ];
    if let Some(entity) = res.entity_id.as_ref() {
        fields.push((FIELD_ENTITY.to_string(), entity.to_string()));
    }
    if let Some(uri) = res.uri.as_ref() {
        fields.push((FIELD_URI.to_string(), uri.clone()));
    }
    if let Some(generated) = res.generated_ts {
        fields.push((FIELD_GENERATED_TS.to_string(), generated.to_string()));
    }

    batch.del([chain.main()]).hset(chain.main(), fields);
    if let Some(entity) = res.entity_id.as_ref() {
        batch.sadd(chain.entities(), entity.as_str());
    }
    batch
        .del([chain.headers()])
        .hset(chain.headers(), flatten_headers(&res.headers));

    for key in [chain.main(), chain.entities(), chain.headers()] {
        batch.expire(key, expire_after);
    }
}

/// Record what the entity writer persisted once it has finished.
pub fn set_body(batch: &mut Batch, chain: &KeyChain, size: u64, has_markup: bool) {
    batch.hset(
        chain.main(),
        [
            (FIELD_SIZE, size.to_string()),
            (FIELD_HAS_MARKUP, has_markup.to_string()),
        ],
    );
}

/// Drop the entity reference from both the live set and the metadata hash.
pub fn unlink_entity(batch: &mut Batch, chain: &KeyChain, entity_id: &EntityId) {
    batch
        .srem(chain.entities(), entity_id.as_str())
        .hdel(chain.main(), FIELD_ENTITY);
}

pub async fn uri(store: &dyn Store, chain: &KeyChain) -> Result<Option<String>, StoreError> {
    store.hget(chain.main(), FIELD_URI).await
}

/// Replace the stored revalidation parameters and request headers.
pub fn save_revalidation(
    batch: &mut Batch,
    chain: &KeyChain,
    data: &RevalidationData,
    expire_after: u64,
) {
    batch
        .del([chain.reval_params(), chain.reval_req_headers()])
        .hset(chain.reval_params(), data.params.to_fields())
        .hset(
            chain.reval_req_headers(),
            data.headers
                .iter()
                .map(|(name, value)| (name.clone(), value.clone())),
        )
        .expire(chain.reval_params(), expire_after)
        .expire(chain.reval_req_headers(), expire_after);
}

pub async fn read_revalidation(
    store: &dyn Store,
    chain: &KeyChain,
) -> Result<Option<RevalidationData>, MetadataError> {
    let fields = store.hgetall(chain.reval_params()).await?;
    if fields.is_empty() {
        return Ok(None);
    }
    let params = RevalidationParams::from_fields(&fields)
        .map_err(|err| MetadataError::corrupt(chain.reval_params(), err.to_string()))?;
    let headers = store
        .hgetall(chain.reval_req_headers())
        .await?
        .into_iter()
        .collect();
    Ok(Some(RevalidationData { params, headers }))
}

fn parse_field<T: std::str::FromStr>(fields: &HashMap<String, String>, name: &str) -> Option<T> {
    fields.get(name).and_then(|value| value.parse().ok())
}

fn flatten_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .enumerate()
        .filter_map(|(position, (name, value))| {
            value
                .to_str()
                .ok()
                .map(|value| (format!("{position}:{name}"), value.to_string()))
        })
        .collect()
}

fn restore_headers(key: &str, stored: HashMap<String, String>) -> HeaderMap {
    let mut entries: Vec<(usize, String, String)> = stored
        .into_iter()
        .filter_map(|(field, value)| {
            let (position, name) = field.split_once(':')?;
            Some((position.parse().ok()?, name.to_string(), value))
        })
        .collect();
    entries.sort_by_key(|(position, _, _)| *position);

    let mut headers = HeaderMap::with_capacity(entries.len());
    for (_, name, value) in entries {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => warn!(key, header = %name, "skipping unreadable stored header"),
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use axum::http::header;

    use super::*;
    use crate::cache::key::CacheKey;
    use crate::infra::store::MemoryStore;

    fn chain() -> KeyChain {
        KeyChain::new(&CacheKey::from("hoard:cache:http:h:/m:".to_string()))
    }

    fn response() -> Response {
        let mut res = Response::new(StatusCode::OK);
        res.entity_id = Some(EntityId::from("abc"));
        res.size = 42;
        res.ttl = 300;
        res.uri = Some("http://h/m".into());
        res.generated_ts = Some(784_111_777);
        res.headers
            .append(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        res.headers
            .append(header::SET_COOKIE, HeaderValue::from_static("a=1"));
        res.headers
            .append(header::SET_COOKIE, HeaderValue::from_static("b=2"));
        res
    }

    #[tokio::test]
    async fn saved_metadata_reads_back() {
        let store = MemoryStore::new();
        let chain = chain();
        let mut batch = Batch::new();
        save(&mut batch, &chain, &response(), Duration::from_secs(60));
        store.execute(batch).await.expect("execute");

        let res = read(&store, &chain).await.expect("read").expect("hit");
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(res.entity_id, Some(EntityId::from("abc")));
        assert_eq!(res.size, 42);
        assert_eq!(res.uri.as_deref(), Some("http://h/m"));
        assert_eq!(res.generated_ts, Some(784_111_777));
        assert!((299..=300).contains(&res.ttl));

        let cookies: Vec<_> = res.headers.get_all(header::SET_COOKIE).iter().collect();
        assert_eq!(cookies, ["a=1", "b=2"]);
        assert_eq!(res.headers.get(header::CONTENT_TYPE).expect("type"), "text/plain");

        assert_eq!(store.members(chain.entities()), ["abc"]);
        assert!(store.ttl(chain.headers()).await.expect("ttl").is_some());
    }

    #[tokio::test]
    async fn missing_main_hash_is_a_miss() {
        let store = MemoryStore::new();
        assert!(read(&store, &chain()).await.expect("read").is_none());
    }

    #[tokio::test]
    async fn missing_status_is_corrupt() {
        let store = MemoryStore::new();
        let chain = chain();
        let mut batch = Batch::new();
        batch.hset(chain.main(), [("entity", "abc")]);
        store.execute(batch).await.expect("execute");

        let err = read(&store, &chain).await.expect_err("corrupt");
        assert!(matches!(err, MetadataError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn saving_without_an_entity_drops_the_previous_pointer() {
        let store = MemoryStore::new();
        let chain = chain();
        let mut batch = Batch::new();
        save(&mut batch, &chain, &response(), Duration::from_secs(60));
        store.execute(batch).await.expect("execute");

        let mut bodiless = Response::new(StatusCode::NO_CONTENT);
        bodiless.ttl = 30;
        let mut batch = Batch::new();
        save(&mut batch, &chain, &bodiless, Duration::from_secs(60));
        store.execute(batch).await.expect("execute");

        assert!(entity_pointer(&store, &chain).await.expect("pointer").is_none());
        let res = read(&store, &chain).await.expect("read").expect("hit");
        assert_eq!(res.status, StatusCode::NO_CONTENT);
        assert!(res.entity_id.is_none());
        assert!(res.uri.is_none());
        assert!(res.generated_ts.is_none());
    }

    #[tokio::test]
    async fn body_summary_updates_size_and_markup() {
        let store = MemoryStore::new();
        let chain = chain();
        let mut batch = Batch::new();
        save(&mut batch, &chain, &response(), Duration::from_secs(60));
        set_body(&mut batch, &chain, 7, true);
        store.execute(batch).await.expect("execute");

        let res = read(&store, &chain).await.expect("read").expect("hit");
        assert_eq!(res.size, 7);
        assert!(res.has_markup);
    }

    #[tokio::test]
    async fn unlinking_clears_the_pointer() {
        let store = MemoryStore::new();
        let chain = chain();
        let mut batch = Batch::new();
        save(&mut batch, &chain, &response(), Duration::from_secs(60));
        unlink_entity(&mut batch, &chain, &EntityId::from("abc"));
        store.execute(batch).await.expect("execute");

        assert!(entity_pointer(&store, &chain).await.expect("pointer").is_none());
        assert!(store.members(chain.entities()).is_empty());
        let res = read(&store, &chain).await.expect("read").expect("hit");
        assert!(res.entity_id.is_none());
    }
}
