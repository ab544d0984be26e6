mod backend;
mod collect;
mod context;
mod queue;
mod revalidate;
mod worker;

pub use backend::{ClaimedJob, QueueBackend};
pub use collect::{CollectEntityPayload, process_collect_entity_job, schedule_collection};
pub use context::{JobWorkerContext, job_failed};
pub use queue::{
    COLLECT_PRIORITY, EnqueueOutcome, GC_QUEUE, JobError, JobOptions, JobQueue, JobRecord,
    NewJob, REVALIDATE_PRIORITY, REVALIDATE_QUEUE, enqueue_job,
};
pub use revalidate::{RevalidatePayload, process_revalidate_job};
pub use worker::{WorkerSettings, job_monitor};
