//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroU64, NonZeroUsize},
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::key::KeyField;

mod cli;

pub use cli::{CliArgs, Command, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "hoard";
const ENV_PREFIX: &str = "HOARD";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_VISIBLE_HOSTNAME: &str = "hoard";
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_MAX_REQUEST_BODY_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379/0";
const DEFAULT_REDIS_MAX_CONNECTIONS: u32 = 16;
const DEFAULT_UPSTREAM_HOST: &str = "127.0.0.1";
const DEFAULT_UPSTREAM_PORT: u16 = 80;
const DEFAULT_UPSTREAM_CONNECT_TIMEOUT_MS: u64 = 500;
const DEFAULT_UPSTREAM_SEND_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_UPSTREAM_READ_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_UPSTREAM_KEEPALIVE_TIMEOUT_MS: u64 = 75_000;
const DEFAULT_UPSTREAM_KEEPALIVE_POOLSIZE: u32 = 64;
const DEFAULT_KEY_SPEC: [&str; 4] = ["scheme", "host", "uri", "args"];
const DEFAULT_MAX_URI_ARGS: usize = 100;
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
const DEFAULT_KEEP_CACHE_FOR_SECS: u64 = 30 * 24 * 3600;
const DEFAULT_MINIMUM_OLD_ENTITY_DOWNLOAD_RATE: u64 = 56;
const DEFAULT_STORAGE_MAX_SIZE_BYTES: u64 = 1024 * 1024;
const DEFAULT_JOBS_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_JOBS_BATCH_SIZE: u32 = 16;
const DEFAULT_JOBS_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_JOBS_RETRY_DELAY_SECS: u64 = 5;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub redis: RedisSettings,
    pub upstream: UpstreamSettings,
    pub cache: CacheSettings,
    pub storage: StorageSettings,
    pub jobs: JobsSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen_addr: SocketAddr,
    pub visible_hostname: String,
    pub advertise_server: bool,
    pub graceful_shutdown: Duration,
    pub max_request_body_bytes: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub url: String,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub host: String,
    pub port: u16,
    pub use_ssl: bool,
    pub ssl_server_name: Option<String>,
    pub ssl_verify: bool,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub read_timeout: Duration,
    pub keepalive_timeout: Duration,
    pub keepalive_poolsize: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub key_spec: Vec<KeyField>,
    pub max_uri_args: usize,
    pub buffer_size: NonZeroUsize,
    pub keep_cache_for: Duration,
    pub minimum_old_entity_download_rate: NonZeroU64,
    pub esi_enabled: bool,
    pub max_stale: Duration,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub max_size: NonZeroU64,
    pub supports_transactions: bool,
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct JobsSettings {
    pub poll_interval: Duration,
    pub batch_size: NonZeroU32,
    pub max_attempts: NonZeroU32,
    pub retry_delay: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) | Some(Command::CheckConfig(args)) => {
            raw.apply_serve_overrides(&args.overrides)
        }
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    redis: RawRedisSettings,
    upstream: RawUpstreamSettings,
    cache: RawCacheSettings,
    storage: RawStorageSettings,
    jobs: RawJobsSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(name) = overrides.visible_hostname.as_ref() {
            self.server.visible_hostname = Some(name.clone());
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.redis_url.as_ref() {
            self.redis.url = Some(url.clone());
        }
        if let Some(host) = overrides.upstream_host.as_ref() {
            self.upstream.host = Some(host.clone());
        }
        if let Some(port) = overrides.upstream_port {
            self.upstream.port = Some(port);
        }
        if let Some(max) = overrides.storage_max_size_bytes {
            self.storage.max_size_bytes = Some(max);
        }
        if let Some(enabled) = overrides.esi_enabled {
            self.cache.esi_enabled = Some(enabled);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            redis,
            upstream,
            cache,
            storage,
            jobs,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            redis: build_redis_settings(redis)?,
            upstream: build_upstream_settings(upstream)?,
            cache: build_cache_settings(cache)?,
            storage: build_storage_settings(storage)?,
            jobs: build_jobs_settings(jobs)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }
    let listen_addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.listen_addr", reason))?;

    let visible_hostname = non_empty(server.visible_hostname)
        .unwrap_or_else(|| DEFAULT_VISIBLE_HOSTNAME.to_string());

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    let body_limit = server
        .max_request_body_bytes
        .unwrap_or(DEFAULT_MAX_REQUEST_BODY_BYTES);
    let body_limit = usize::try_from(body_limit).map_err(|_| {
        LoadError::invalid(
            "server.max_request_body_bytes",
            "value exceeds supported range for usize",
        )
    })?;
    let max_request_body_bytes = NonZeroUsize::new(body_limit).ok_or_else(|| {
        LoadError::invalid("server.max_request_body_bytes", "must be greater than zero")
    })?;

    Ok(ServerSettings {
        listen_addr,
        visible_hostname,
        advertise_server: server.advertise_server.unwrap_or(true),
        graceful_shutdown: Duration::from_secs(graceful_secs),
        max_request_body_bytes,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_redis_settings(redis: RawRedisSettings) -> Result<RedisSettings, LoadError> {
    let url = non_empty(redis.url).unwrap_or_else(|| DEFAULT_REDIS_URL.to_string());
    validate_redis_url(&url, "redis.url")?;

    let max_connections = non_zero_u32(
        redis
            .max_connections
            .unwrap_or(DEFAULT_REDIS_MAX_CONNECTIONS)
            .into(),
        "redis.max_connections",
    )?;

    Ok(RedisSettings {
        url,
        max_connections,
    })
}

fn build_upstream_settings(upstream: RawUpstreamSettings) -> Result<UpstreamSettings, LoadError> {
    let host = non_empty(upstream.host).unwrap_or_else(|| DEFAULT_UPSTREAM_HOST.to_string());
    let port = upstream.port.unwrap_or(DEFAULT_UPSTREAM_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "upstream.port",
            "port must be greater than zero",
        ));
    }

    Ok(UpstreamSettings {
        host,
        port,
        use_ssl: upstream.use_ssl.unwrap_or(false),
        ssl_server_name: non_empty(upstream.ssl_server_name),
        ssl_verify: upstream.ssl_verify.unwrap_or(true),
        connect_timeout: millis(
            upstream.connect_timeout_ms,
            DEFAULT_UPSTREAM_CONNECT_TIMEOUT_MS,
            "upstream.connect_timeout_ms",
        )?,
        send_timeout: millis(
            upstream.send_timeout_ms,
            DEFAULT_UPSTREAM_SEND_TIMEOUT_MS,
            "upstream.send_timeout_ms",
        )?,
        read_timeout: millis(
            upstream.read_timeout_ms,
            DEFAULT_UPSTREAM_READ_TIMEOUT_MS,
            "upstream.read_timeout_ms",
        )?,
        keepalive_timeout: millis(
            upstream.keepalive_timeout_ms,
            DEFAULT_UPSTREAM_KEEPALIVE_TIMEOUT_MS,
            "upstream.keepalive_timeout_ms",
        )?,
        keepalive_poolsize: non_zero_u32(
            upstream
                .keepalive_poolsize
                .unwrap_or(DEFAULT_UPSTREAM_KEEPALIVE_POOLSIZE)
                .into(),
            "upstream.keepalive_poolsize",
        )?,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let key_spec = match cache.key_spec {
        Some(fields) if !fields.is_empty() => fields,
        _ => DEFAULT_KEY_SPEC.iter().map(|field| field.to_string()).collect(),
    };
    let key_spec = key_spec
        .iter()
        .map(|field| KeyField::from_str(field))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| LoadError::invalid("cache.key_spec", err.to_string()))?;

    let buffer_size = NonZeroUsize::new(cache.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE))
        .ok_or_else(|| LoadError::invalid("cache.buffer_size", "must be greater than zero"))?;

    let rate = cache
        .minimum_old_entity_download_rate
        .unwrap_or(DEFAULT_MINIMUM_OLD_ENTITY_DOWNLOAD_RATE);
    let minimum_old_entity_download_rate = NonZeroU64::new(rate).ok_or_else(|| {
        LoadError::invalid(
            "cache.minimum_old_entity_download_rate",
            "must be greater than zero",
        )
    })?;

    Ok(CacheSettings {
        key_spec,
        max_uri_args: cache.max_uri_args.unwrap_or(DEFAULT_MAX_URI_ARGS),
        buffer_size,
        keep_cache_for: Duration::from_secs(
            cache
                .keep_cache_for_seconds
                .unwrap_or(DEFAULT_KEEP_CACHE_FOR_SECS),
        ),
        minimum_old_entity_download_rate,
        esi_enabled: cache.esi_enabled.unwrap_or(false),
        max_stale: Duration::from_secs(cache.max_stale_seconds.unwrap_or(0)),
    })
}

fn build_storage_settings(storage: RawStorageSettings) -> Result<StorageSettings, LoadError> {
    let max_size = NonZeroU64::new(
        storage
            .max_size_bytes
            .unwrap_or(DEFAULT_STORAGE_MAX_SIZE_BYTES),
    )
    .ok_or_else(|| LoadError::invalid("storage.max_size_bytes", "must be greater than zero"))?;

    let redis_url = non_empty(storage.redis_url);
    if let Some(url) = redis_url.as_deref() {
        validate_redis_url(url, "storage.redis_url")?;
    }

    Ok(StorageSettings {
        max_size,
        supports_transactions: storage.supports_transactions.unwrap_or(true),
        redis_url,
    })
}

fn build_jobs_settings(jobs: RawJobsSettings) -> Result<JobsSettings, LoadError> {
    Ok(JobsSettings {
        poll_interval: millis(
            jobs.poll_interval_ms,
            DEFAULT_JOBS_POLL_INTERVAL_MS,
            "jobs.poll_interval_ms",
        )?,
        batch_size: non_zero_u32(
            jobs.batch_size.unwrap_or(DEFAULT_JOBS_BATCH_SIZE).into(),
            "jobs.batch_size",
        )?,
        max_attempts: non_zero_u32(
            jobs.max_attempts.unwrap_or(DEFAULT_JOBS_MAX_ATTEMPTS).into(),
            "jobs.max_attempts",
        )?,
        retry_delay: Duration::from_secs(
            jobs.retry_delay_seconds
                .unwrap_or(DEFAULT_JOBS_RETRY_DELAY_SECS),
        ),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    visible_hostname: Option<String>,
    advertise_server: Option<bool>,
    graceful_shutdown_seconds: Option<u64>,
    max_request_body_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct RawRedisSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct RawUpstreamSettings {
    host: Option<String>,
    port: Option<u16>,
    use_ssl: Option<bool>,
    ssl_server_name: Option<String>,
    ssl_verify: Option<bool>,
    connect_timeout_ms: Option<u64>,
    send_timeout_ms: Option<u64>,
    read_timeout_ms: Option<u64>,
    keepalive_timeout_ms: Option<u64>,
    keepalive_poolsize: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct RawCacheSettings {
    key_spec: Option<Vec<String>>,
    max_uri_args: Option<usize>,
    buffer_size: Option<usize>,
    keep_cache_for_seconds: Option<u64>,
    minimum_old_entity_download_rate: Option<u64>,
    esi_enabled: Option<bool>,
    max_stale_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct RawStorageSettings {
    max_size_bytes: Option<u64>,
    supports_transactions: Option<bool>,
    redis_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct RawJobsSettings {
    poll_interval_ms: Option<u64>,
    batch_size: Option<u32>,
    max_attempts: Option<u32>,
    retry_delay_seconds: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn validate_redis_url(url: &str, key: &'static str) -> Result<(), LoadError> {
    let parsed =
        url::Url::parse(url).map_err(|err| LoadError::invalid(key, format!("{err}")))?;
    match parsed.scheme() {
        "redis" | "rediss" | "redis+unix" | "unix" => Ok(()),
        other => Err(LoadError::invalid(
            key,
            format!("unsupported scheme `{other}`"),
        )),
    }
}

fn millis(value: Option<u64>, default: u64, key: &'static str) -> Result<Duration, LoadError> {
    let value = value.unwrap_or(default);
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_millis(value))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

impl Settings {
    /// Settings with every default applied, as if no file, environment or flag was present.
    pub fn defaults() -> Result<Self, LoadError> {
        Self::from_raw(RawSettings::default())
    }
}

#[cfg(test)]
mod tests;
