use std::{process, sync::Arc};

use hoard::{
    application::{
        engine::{BasicEngine, DecisionEngine},
        error::AppError,
        jobs::{JobQueue, JobWorkerContext, WorkerSettings, job_monitor},
        orchestrator::Orchestrator,
    },
    cache::{CacheConfig, EventBus},
    config,
    infra::{
        error::InfraError,
        http::{ProxyState, build_router},
        queue::RedisJobQueue,
        store::{RedisStore, Store},
        telemetry,
        upstream::{UpstreamClient, UpstreamOptions},
    },
    storage::{RedisStorage, StorageDriver, StorageParams},
};
use tokio::{net::TcpListener, sync::oneshot, task::JoinError};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    match command {
        config::Command::Serve(_) => {
            telemetry::init(&settings.logging)?;
            run_serve(settings).await
        }
        config::Command::CheckConfig(_) => {
            println!("{settings:#?}");
            Ok(())
        }
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let store = RedisStore::connect(
        &settings.redis.url,
        settings.redis.max_connections.get() as usize,
    )
    .map_err(InfraError::from)?;
    let shared_store: Arc<dyn Store> = Arc::new(store.clone());

    let params = StorageParams {
        max_size: settings.storage.max_size.get(),
        supports_transactions: settings.storage.supports_transactions,
    };
    let storage: Arc<dyn StorageDriver> = match settings.storage.redis_url.as_deref() {
        Some(url) => Arc::new(
            RedisStorage::connect(url, settings.redis.max_connections.get() as usize, params)
                .map_err(InfraError::from)?,
        ),
        None => Arc::new(RedisStorage::with_store(Arc::clone(&shared_store), params)),
    };

    let jobs: Arc<dyn JobQueue> = Arc::new(RedisJobQueue::new(store.pool().clone()));
    let cache_config = CacheConfig::from(&settings);
    let upstream = UpstreamClient::for_target(
        UpstreamOptions::from(&settings.upstream),
        &cache_config.upstream,
    )
    .map_err(InfraError::from)?;

    let worker_handle = spawn_job_monitor(
        Arc::clone(&jobs),
        JobWorkerContext {
            store: Arc::clone(&shared_store),
            storage: Arc::clone(&storage),
            http: upstream.http().clone(),
        },
        &settings.jobs,
    );

    let orchestrator = Arc::new(Orchestrator::new(
        cache_config,
        shared_store,
        Arc::clone(&storage),
        upstream,
        jobs,
        Arc::new(EventBus::new()),
    ));

    let result = serve_http(&settings, orchestrator, Arc::new(BasicEngine)).await;

    worker_handle.abort();
    let _ = worker_handle.await;
    storage.close().await;
    store.close();

    result
}

fn spawn_job_monitor(
    queue: Arc<dyn JobQueue>,
    context: JobWorkerContext,
    jobs: &config::JobsSettings,
) -> tokio::task::JoinHandle<()> {
    let monitor = job_monitor(queue, context, &WorkerSettings::from(jobs));

    tokio::spawn(async move {
        if let Err(err) = monitor.run().await {
            error!(error = %err, "job monitor stopped");
        }
    })
}

async fn serve_http(
    settings: &config::Settings,
    orchestrator: Arc<Orchestrator>,
    engine: Arc<dyn DecisionEngine>,
) -> Result<(), AppError> {
    let listener = TcpListener::bind(settings.server.listen_addr)
        .await
        .map_err(InfraError::from)?;
    let local_addr = listener.local_addr().map_err(InfraError::from)?;

    let router = build_router(ProxyState {
        orchestrator,
        engine,
        local_addr,
        max_request_body_bytes: settings.server.max_request_body_bytes.get(),
    });

    info!(
        addr = %local_addr,
        upstream_host = %settings.upstream.host,
        upstream_port = settings.upstream.port,
        "hoard listening"
    );

    let grace = settings.server.graceful_shutdown;
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = stop_rx.await;
            })
            .await
    });

    tokio::select! {
        joined = &mut server => return server_result(joined),
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                warn!(error = %err, "failed to listen for shutdown signal");
            }
        }
    }

    info!(grace_secs = grace.as_secs(), "shutdown requested; draining connections");
    let _ = stop_tx.send(());
    match tokio::time::timeout(grace, &mut server).await {
        Ok(joined) => server_result(joined),
        Err(_) => {
            warn!(grace_secs = grace.as_secs(), "connections still open after grace period");
            server.abort();
            Ok(())
        }
    }
}

fn server_result(joined: Result<std::io::Result<()>, JoinError>) -> Result<(), AppError> {
    match joined {
        Ok(result) => result.map_err(|err| AppError::from(InfraError::from(err))),
        Err(err) => Err(AppError::unexpected(format!("server task failed: {err}"))),
    }
}
