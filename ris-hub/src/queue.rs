//! Job hand-off and the result stream.
//!
//! The hub only ever calls [`JobQueue::enqueue`]. [`LocalJobQueue`] is the
//! in-process implementation used by the server binary:
//!
//! ```text
//! MessageRelay ── enqueue ──► mpsc<JobDescriptor> ──► JobRunner
//!                                                       │ (≤ N jobs in flight)
//!                                                       ▼
//!                         BroadcastLoop ◄── ResultStream ◄── mpsc<JobResult>
//! ```

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use futures_util::Stream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};

use crate::job::JobDescriptor;
use crate::protocol::JobResult;

/// Fire-and-forget job submission.
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, job: JobDescriptor);
}

/// Bounded in-process job queue.
pub struct LocalJobQueue {
    sender: mpsc::Sender<JobDescriptor>,
}

impl LocalJobQueue {
    /// Create a queue, the runner that drains it, and the stream of results
    /// the runner produces.
    pub fn new(capacity: usize, max_concurrent: usize) -> (Self, JobRunner, ResultStream) {
        let capacity = capacity.max(1);
        let (sender, jobs) = mpsc::channel(capacity);
        let (results, stream) = ResultStream::channel(capacity);
        let runner = JobRunner {
            jobs,
            results,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        };
        (Self { sender }, runner, stream)
    }
}

impl JobQueue for LocalJobQueue {
    fn enqueue(&self, job: JobDescriptor) {
        match self.sender.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                log::warn!("Job queue full, dropping job {:?}", job.job_id());
            }
            Err(TrySendError::Closed(job)) => {
                log::warn!("Job runner stopped, dropping job {:?}", job.job_id());
            }
        }
    }
}

/// Executes queued jobs and forwards successful results.
pub struct JobRunner {
    jobs: mpsc::Receiver<JobDescriptor>,
    results: mpsc::Sender<JobResult>,
    permits: Arc<Semaphore>,
}

impl JobRunner {
    /// Drain the queue until every [`LocalJobQueue`] is dropped.
    ///
    /// Failed jobs are logged and produce no result.
    pub async fn run(mut self) {
        while let Some(job) = self.jobs.recv().await {
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                break;
            };
            let results = self.results.clone();

            tokio::spawn(async move {
                let _permit = permit;
                let job_id = job.job_id().map(str::to_owned);
                let kind = job.operation().kind();

                match job.run().await {
                    Ok(result) => {
                        log::debug!("Job {job_id:?} ({kind}) completed");
                        if results.send(result).await.is_err() {
                            log::debug!("Result stream closed, discarding result of job {job_id:?}");
                        }
                    }
                    Err(e) => {
                        log::error!("Job {job_id:?} ({kind}) failed: {e}");
                    }
                }
            });
        }
        log::info!("Job queue closed, runner exiting");
    }
}

/// Pull-based stream of job results.
///
/// Ends once every producer has been dropped.
pub struct ResultStream {
    receiver: mpsc::Receiver<JobResult>,
}

impl ResultStream {
    /// Create a result stream fed by the returned sender.
    pub fn channel(capacity: usize) -> (mpsc::Sender<JobResult>, Self) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (sender, Self { receiver })
    }
}

impl Stream for ResultStream {
    type Item = JobResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<JobResult>> {
        self.receiver.poll_recv(cx)
    }
}
