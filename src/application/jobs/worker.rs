//! Background workers that drain the collection and revalidation queues.

use std::{sync::Arc, time::Duration};

use apalis::prelude::{Monitor, WorkerBuilder, WorkerBuilderExt, WorkerFactoryFn};

use super::{
    backend::QueueBackend,
    collect::{CollectEntityPayload, process_collect_entity_job},
    context::JobWorkerContext,
    queue::{GC_QUEUE, JobQueue, REVALIDATE_QUEUE},
    revalidate::{RevalidatePayload, process_revalidate_job},
};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    /// Jobs claimed per poll, and the most a worker runs at once.
    pub batch_size: usize,
    pub retry_delay: Duration,
}

impl From<&crate::config::JobsSettings> for WorkerSettings {
    fn from(settings: &crate::config::JobsSettings) -> Self {
        Self {
            poll_interval: settings.poll_interval,
            batch_size: settings.batch_size.get() as usize,
            retry_delay: settings.retry_delay,
        }
    }
}

/// One worker per queue, registered on a monitor the caller runs.
pub fn job_monitor(
    queue: Arc<dyn JobQueue>,
    context: JobWorkerContext,
    settings: &WorkerSettings,
) -> Monitor {
    let collect_worker = WorkerBuilder::new("collect-entity-worker")
        .concurrency(settings.batch_size)
        .catch_panic()
        .data(context.clone())
        .backend(QueueBackend::<CollectEntityPayload>::new(
            Arc::clone(&queue),
            GC_QUEUE,
            settings,
        ))
        .build_fn(process_collect_entity_job);
    let revalidate_worker = WorkerBuilder::new("revalidate-worker")
        .concurrency(settings.batch_size)
        .catch_panic()
        .data(context)
        .backend(QueueBackend::<RevalidatePayload>::new(
            queue,
            REVALIDATE_QUEUE,
            settings,
        ))
        .build_fn(process_revalidate_job);

    Monitor::new()
        .register(collect_worker)
        .register(revalidate_worker)
}
