//! The broadcast loop: drains job results and fans each one out to every
//! open connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures_util::{Stream, StreamExt};

use crate::protocol::JobResult;
use crate::registry::{ConnectionRegistry, Payload};
use crate::shutdown::ShutdownSignal;

/// Long-lived consumer of the result stream.
pub struct BroadcastLoop {
    registry: ConnectionRegistry,
    broadcasts: Arc<AtomicU64>,
}

impl BroadcastLoop {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self::with_counter(registry, Arc::new(AtomicU64::new(0)))
    }

    /// Use an externally owned counter of broadcast results.
    pub fn with_counter(registry: ConnectionRegistry, broadcasts: Arc<AtomicU64>) -> Self {
        Self {
            registry,
            broadcasts,
        }
    }

    /// Broadcast every result until the stream ends or shutdown fires.
    ///
    /// Returns how many results were broadcast by this run.
    pub async fn run<S>(self, results: S, mut shutdown: ShutdownSignal) -> u64
    where
        S: Stream<Item = JobResult>,
    {
        let mut results = std::pin::pin!(results);
        let mut broadcast = 0u64;

        loop {
            let result = tokio::select! {
                _ = shutdown.wait() => {
                    log::info!("Broadcast loop stopping: shutdown requested");
                    break;
                }
                next = results.next() => match next {
                    Some(result) => result,
                    None => {
                        log::warn!("Result stream ended, no further results will be broadcast");
                        break;
                    }
                },
            };

            let payload = match result.encode() {
                Ok(text) => Payload::from(text),
                Err(e) => {
                    log::error!("Failed to encode result of job {:?}: {e}", result.job_id);
                    continue;
                }
            };

            let delivered = self.registry.broadcast_all(&payload).await;
            broadcast += 1;
            self.broadcasts.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "Broadcast result of job {:?} to {delivered} connection(s)",
                result.job_id
            );
        }

        broadcast
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ResultStream;
    use crate::registry::{ConnectionHandle, OutboundQueue};
    use crate::shutdown::Shutdown;
    use tokio::time::{timeout, Duration};
    use uuid::Uuid;

    async fn register(registry: &ConnectionRegistry) -> (Uuid, OutboundQueue) {
        let id = Uuid::new_v4();
        let (handle, queue) = ConnectionHandle::channel(id, 16);
        registry.add(handle).await;
        (id, queue)
    }

    async fn next_result(queue: &mut OutboundQueue) -> JobResult {
        let payload = timeout(Duration::from_secs(1), queue.recv())
            .await
            .unwrap()
            .unwrap();
        JobResult::decode(payload.as_str()).unwrap()
    }

    #[tokio::test]
    async fn test_results_reach_every_connection() {
        let registry = ConnectionRegistry::new();
        let mut queues = Vec::new();
        for _ in 0..3 {
            queues.push(register(&registry).await.1);
        }

        let shutdown = Shutdown::new();
        let results = futures_util::stream::iter(vec![
            JobResult::new(vec![1.0, 2.0, 3.0], Some("abc".into())),
            JobResult::new(vec![4.0], None),
        ]);
        let count = BroadcastLoop::new(registry)
            .run(results, shutdown.signal())
            .await;
        assert_eq!(count, 2);

        for queue in &mut queues {
            assert_eq!(
                next_result(queue).await,
                JobResult::new(vec![1.0, 2.0, 3.0], Some("abc".into()))
            );
            let second = next_result(queue).await;
            assert!(second.job_id.is_none());
        }
    }

    #[tokio::test]
    async fn test_removed_connection_stops_receiving() {
        let registry = ConnectionRegistry::new();
        let (_a, mut qa) = register(&registry).await;
        let (b, mut qb) = register(&registry).await;
        let (gone, _qgone) = register(&registry).await;
        registry.remove(&gone).await;

        let (sender, stream) = ResultStream::channel(4);
        let shutdown = Shutdown::new();
        let task = tokio::spawn(BroadcastLoop::new(registry.clone()).run(stream, shutdown.signal()));

        sender.send(JobResult::new(vec![1.0], Some("1".into()))).await.unwrap();
        assert_eq!(next_result(&mut qa).await.job_id.as_deref(), Some("1"));
        assert_eq!(next_result(&mut qb).await.job_id.as_deref(), Some("1"));

        registry.remove(&b).await;
        sender.send(JobResult::new(vec![2.0], Some("2".into()))).await.unwrap();
        assert_eq!(next_result(&mut qa).await.job_id.as_deref(), Some("2"));
        assert!(qb.recv().await.is_none());

        drop(sender);
        assert_eq!(task.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let registry = ConnectionRegistry::new();
        let (_sender, stream) = ResultStream::channel(4);
        let shutdown = Shutdown::new();
        let counter = Arc::new(AtomicU64::new(0));

        let task = tokio::spawn(
            BroadcastLoop::with_counter(registry, counter.clone()).run(stream, shutdown.signal()),
        );
        shutdown.trigger();

        let count = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert_eq!(count, 0);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_broadcast_with_no_connections() {
        let shutdown = Shutdown::new();
        let results = futures_util::stream::iter(vec![JobResult::new(vec![0.0], None)]);
        let count = BroadcastLoop::new(ConnectionRegistry::new())
            .run(results, shutdown.signal())
            .await;
        assert_eq!(count, 1);
    }
}
