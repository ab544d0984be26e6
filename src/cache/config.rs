//! Cache configuration.
//!
//! The orchestrator only ever sees this value object; it is derived once from the loaded
//! [`Settings`](crate::config::Settings) and never mutated afterwards.

use std::time::Duration;

use super::key::CacheKeySpec;
use crate::config::Settings;
use crate::domain::upstream::UpstreamTarget;

const DEFAULT_VISIBLE_HOSTNAME: &str = "hoard";
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
const DEFAULT_KEEP_CACHE_FOR: Duration = Duration::from_secs(30 * 24 * 3600);
const DEFAULT_MIN_DOWNLOAD_RATE_KBPS: u64 = 56;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub key_spec: CacheKeySpec,
    /// Identity appended to `Via` and used in `Surrogate-Capability`.
    pub visible_hostname: String,
    /// Append the product token to `Via`.
    pub advertise_server: bool,
    /// Bytes written to the client between explicit flushes.
    pub buffer_size: usize,
    /// Retention grace period added to a response's TTL.
    pub keep_cache_for: Duration,
    /// Kilobits per second; sizes the delay before retired entities are collected.
    pub minimum_old_entity_download_rate: u64,
    pub esi_enabled: bool,
    /// How long past expiry a stored response may still be served.
    pub max_stale: Duration,
    pub upstream: UpstreamTarget,
    pub upstream_connect_timeout: Duration,
    pub upstream_send_timeout: Duration,
    pub upstream_read_timeout: Duration,
    pub upstream_keepalive_timeout: Duration,
    pub upstream_keepalive_poolsize: u32,
    /// Attempts allowed for each background job this node enqueues.
    pub job_max_attempts: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_spec: CacheKeySpec::default(),
            visible_hostname: DEFAULT_VISIBLE_HOSTNAME.to_string(),
            advertise_server: true,
            buffer_size: DEFAULT_BUFFER_SIZE,
            keep_cache_for: DEFAULT_KEEP_CACHE_FOR,
            minimum_old_entity_download_rate: DEFAULT_MIN_DOWNLOAD_RATE_KBPS,
            esi_enabled: false,
            max_stale: Duration::ZERO,
            upstream: UpstreamTarget {
                host: "127.0.0.1".to_string(),
                port: 80,
                use_ssl: false,
                server_name: None,
            },
            upstream_connect_timeout: Duration::from_millis(500),
            upstream_send_timeout: Duration::from_millis(2_000),
            upstream_read_timeout: Duration::from_millis(10_000),
            upstream_keepalive_timeout: Duration::from_millis(75_000),
            upstream_keepalive_poolsize: 64,
            job_max_attempts: 3,
        }
    }
}

impl From<&Settings> for CacheConfig {
    fn from(settings: &Settings) -> Self {
        let cache = &settings.cache;
        let upstream = &settings.upstream;
        Self {
            key_spec: CacheKeySpec::new(cache.key_spec.clone(), cache.max_uri_args),
            visible_hostname: settings.server.visible_hostname.clone(),
            advertise_server: settings.server.advertise_server,
            buffer_size: cache.buffer_size.get(),
            keep_cache_for: cache.keep_cache_for,
            minimum_old_entity_download_rate: cache.minimum_old_entity_download_rate.get(),
            esi_enabled: cache.esi_enabled,
            max_stale: cache.max_stale,
            upstream: UpstreamTarget {
                host: upstream.host.clone(),
                port: upstream.port,
                use_ssl: upstream.use_ssl,
                server_name: upstream.ssl_server_name.clone(),
            },
            upstream_connect_timeout: upstream.connect_timeout,
            upstream_send_timeout: upstream.send_timeout,
            upstream_read_timeout: upstream.read_timeout,
            upstream_keepalive_timeout: upstream.keepalive_timeout,
            upstream_keepalive_poolsize: upstream.keepalive_poolsize.get(),
            job_max_attempts: settings.jobs.max_attempts.get(),
        }
    }
}
