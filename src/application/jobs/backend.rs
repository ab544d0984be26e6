//! Feeds claimed [`JobQueue`] records to apalis workers and writes each outcome back.

use std::{marker::PhantomData, sync::Arc, time::Duration};

use apalis::prelude::{Backend, Context, Error as ApalisError, Poller, Request, Worker};
use apalis_core::{
    codec::NoopCodec,
    layers::{Ack, AckLayer},
    response::Response,
};
use futures::{StreamExt, stream::BoxStream};
use metrics::counter;
use serde::de::DeserializeOwned;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use super::{
    queue::{JobError, JobQueue, JobRecord},
    worker::WorkerSettings,
};

type QueueCodec = NoopCodec<serde_json::Value>;

/// Request context: the record a payload was claimed from.
#[derive(Debug, Clone)]
pub struct ClaimedJob(pub JobRecord);

/// Polls one named queue and decodes due records into `P`.
pub struct QueueBackend<P> {
    queue: Arc<dyn JobQueue>,
    name: &'static str,
    poll_interval: Duration,
    batch_size: usize,
    retry_delay: Duration,
    payload: PhantomData<fn() -> P>,
}

impl<P> QueueBackend<P> {
    pub fn new(queue: Arc<dyn JobQueue>, name: &'static str, settings: &WorkerSettings) -> Self {
        Self {
            queue,
            name,
            poll_interval: settings.poll_interval,
            batch_size: settings.batch_size,
            retry_delay: settings.retry_delay,
            payload: PhantomData,
        }
    }
}

impl<P> Backend<Request<P, ClaimedJob>> for QueueBackend<P>
where
    P: DeserializeOwned + Send + 'static,
{
    type Stream = BoxStream<'static, Result<Option<Request<P, ClaimedJob>>, ApalisError>>;
    type Layer = AckLayer<QueueAck, P, ClaimedJob, QueueCodec>;
    type Codec = QueueCodec;

    fn poll(self, worker: &Worker<Context>) -> Poller<Self::Stream, Self::Layer> {
        let layer = AckLayer::new(QueueAck {
            queue: Arc::clone(&self.queue),
            retry_delay: self.retry_delay,
        });
        let worker = worker.clone();
        let stream = async_stream::stream! {
            let mut interval = tokio::time::interval(self.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            while !worker.is_shutting_down() {
                interval.tick().await;
                let jobs = match self.queue.claim_due(self.name, self.batch_size).await {
                    Ok(jobs) => jobs,
                    Err(err) => {
                        warn!(queue = self.name, error = %err, "failed to claim jobs");
                        Vec::new()
                    }
                };
                if jobs.is_empty() {
                    yield Ok(None);
                    continue;
                }
                for job in jobs {
                    match serde_json::from_value::<P>(job.payload.clone()) {
                        Ok(payload) => {
                            yield Ok(Some(Request::new_with_ctx(payload, ClaimedJob(job))));
                        }
                        Err(err) => {
                            let message = JobError::from(err).to_string();
                            record_failure(self.queue.as_ref(), &job, &message, self.retry_delay).await;
                        }
                    }
                }
            }
        };
        Poller::new_with_layer(stream.boxed(), futures::future::ready(()), layer)
    }
}

/// Completes finished jobs and reschedules or drops failed ones.
#[derive(Clone)]
pub struct QueueAck {
    queue: Arc<dyn JobQueue>,
    retry_delay: Duration,
}

impl<P, Cdc> Ack<P, (), Cdc> for QueueAck {
    type Context = ClaimedJob;
    type AckError = JobError;

    async fn ack(&mut self, ctx: &ClaimedJob, response: &Response<()>) -> Result<(), JobError> {
        let job = &ctx.0;
        match &response.inner {
            Ok(()) => {
                debug!(job_id = %job.id, job = job.job_type.as_str(), "job finished");
                self.queue.complete(&job.id).await.inspect_err(|err| {
                    warn!(job_id = %job.id, error = %err, "failed to mark job complete");
                })
            }
            Err(err) => {
                record_failure(
                    self.queue.as_ref(),
                    job,
                    &failure_message(err),
                    self.retry_delay,
                )
                .await;
                Ok(())
            }
        }
    }
}

fn failure_message(err: &ApalisError) -> String {
    match err {
        ApalisError::Failed(inner) | ApalisError::Abort(inner) => inner.to_string(),
        other => other.to_string(),
    }
}

async fn record_failure(queue: &dyn JobQueue, job: &JobRecord, message: &str, delay: Duration) {
    let job_name = job.job_type.as_str();
    counter!("hoard_jobs_failed_total", "job" => job_name).increment(1);
    match queue.retry_or_fail(job, message, delay).await {
        Ok(true) => warn!(
            job_id = %job.id,
            job = job_name,
            attempt = job.attempts,
            error = %message,
            "job failed; retrying"
        ),
        Ok(false) => error!(
            job_id = %job.id,
            job = job_name,
            attempts = job.attempts,
            error = %message,
            "job failed permanently"
        ),
        Err(err) => error!(job_id = %job.id, error = %err, "failed to record job failure"),
    }
}
