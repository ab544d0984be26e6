#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::http::{HeaderMap, Method, StatusCode, header};
use bytes::{Bytes, BytesMut};
use hoard::{
    application::{
        context::RequestContext,
        jobs::{JobQueue, JobWorkerContext, WorkerSettings, job_monitor},
        orchestrator::{ClientSink, Orchestrator, SinkError},
    },
    cache::{CacheConfig, EventBus},
    domain::{request::RequestInfo, response::Response, upstream::UpstreamTarget},
    infra::{
        queue::MemoryJobQueue,
        store::{MemoryStore, Store},
        upstream::{UpstreamClient, UpstreamOptions},
    },
    storage::{Chunk, RedisStorage, StorageDriver, StorageParams, body::BufferedBody},
};

pub const MAX_SIZE: u64 = 1024;

pub struct Harness {
    pub store: MemoryStore,
    pub jobs: MemoryJobQueue,
    pub storage: Arc<dyn StorageDriver>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Harness {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_events(config, EventBus::new(), UpstreamOptions::default())
    }

    pub fn with_events(config: CacheConfig, events: EventBus, options: UpstreamOptions) -> Self {
        let store = MemoryStore::new();
        let shared: Arc<dyn Store> = Arc::new(store.clone());
        let storage: Arc<dyn StorageDriver> = Arc::new(RedisStorage::with_store(
            Arc::clone(&shared),
            StorageParams {
                max_size: MAX_SIZE,
                supports_transactions: true,
            },
        ));
        let jobs = MemoryJobQueue::new();
        let upstream = UpstreamClient::new(options).expect("upstream client");
        let orchestrator = Orchestrator::new(
            config,
            shared,
            Arc::clone(&storage),
            upstream,
            Arc::new(jobs.clone()) as Arc<dyn JobQueue>,
            Arc::new(events),
        );
        Self {
            store,
            jobs,
            storage,
            orchestrator: Arc::new(orchestrator),
        }
    }

    /// Runs the background workers until the returned guard is dropped.
    pub fn start_workers(&self) -> Workers {
        let monitor = job_monitor(
            Arc::new(self.jobs.clone()),
            JobWorkerContext {
                store: Arc::new(self.store.clone()),
                storage: Arc::clone(&self.storage),
                http: reqwest::Client::new(),
            },
            &WorkerSettings {
                poll_interval: Duration::from_millis(10),
                batch_size: 16,
                retry_delay: Duration::from_secs(1),
            },
        );
        Workers(tokio::spawn(async move {
            let _ = monitor.run().await;
        }))
    }
}

pub struct Workers(tokio::task::JoinHandle<()>);

impl Drop for Workers {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Polls `done` until it holds, failing the test after five seconds.
pub async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

/// Cache configuration pointed at `origin`.
pub fn config_for(origin: SocketAddr) -> CacheConfig {
    CacheConfig {
        upstream: UpstreamTarget {
            host: origin.ip().to_string(),
            port: origin.port(),
            use_ssl: false,
            server_name: None,
        },
        ..CacheConfig::default()
    }
}

pub fn context(url: &str) -> RequestContext {
    RequestContext::new(RequestInfo::new(Method::GET, url).expect("url"))
}

/// A cacheable response whose body is the given chunks.
pub fn response(chunks: &[&'static str], ttl: i64) -> Response {
    let mut res = Response::new(StatusCode::OK);
    res.ttl = ttl;
    res.headers
        .insert(header::CONTENT_TYPE, "text/plain".parse().expect("value"));
    res.set_body_reader(
        "test",
        Box::new(BufferedBody::new(chunks.iter().map(|chunk| Chunk::new(*chunk)))),
    );
    res
}

/// Pull a response's body to completion, as the serve loop would.
pub async fn drain(res: &mut Response) -> Bytes {
    let mut reader = res.take_body_reader().expect("body reader");
    let mut body = BytesMut::new();
    while let Some(chunk) = reader.next_chunk().await.expect("chunk") {
        body.extend_from_slice(&chunk.data);
    }
    body.freeze()
}

/// Sink that records everything written to it.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
    pub body: BytesMut,
    pub header_writes: usize,
    pub flushes: usize,
    pub finished: bool,
    /// Fail every body write once this many bytes were accepted.
    pub disconnect_after: Option<usize>,
}

impl RecordingSink {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

#[async_trait]
impl ClientSink for RecordingSink {
    fn headers_sent(&self) -> bool {
        self.header_writes > 0
    }

    async fn send_headers(
        &mut self,
        status: StatusCode,
        headers: &HeaderMap,
    ) -> Result<(), SinkError> {
        self.header_writes += 1;
        self.status = Some(status);
        self.headers = headers.clone();
        Ok(())
    }

    async fn write(&mut self, data: Bytes) -> Result<(), SinkError> {
        if let Some(limit) = self.disconnect_after {
            if self.body.len() >= limit {
                return Err(SinkError::Disconnected);
            }
        }
        self.body.extend_from_slice(&data);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.flushes += 1;
        Ok(())
    }

    fn supports_flush(&self) -> bool {
        true
    }

    async fn finish(&mut self) -> Result<(), SinkError> {
        self.finished = true;
        Ok(())
    }
}
