//! Integration tests for the hub over real WebSocket connections.
//!
//! These tests start a real listener and connect real clients, covering
//! relay, job dispatch and result broadcast end to end.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use ris_hub::{
    ComputeEndpoint, ComputeError, Configuration, HubServer, JobFactory, JobResult, LocalJobQueue,
    Operation, ResultStream, ServerConfig, Shutdown,
};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Always answers `[1, 2, 3]`.
struct FixedEndpoint;

impl ComputeEndpoint for FixedEndpoint {
    fn compute<'a>(
        &'a self,
        _operation: &'a Operation,
    ) -> BoxFuture<'a, Result<Configuration, ComputeError>> {
        Box::pin(async { Ok(vec![1.0, 2.0, 3.0]) })
    }
}

struct TestHub {
    url: String,
    server: Arc<HubServer>,
    shutdown: Shutdown,
}

impl TestHub {
    async fn wait_for_connections(&self, n: usize) {
        for _ in 0..200 {
            if self.server.registry().len().await == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {n} registered connections, found {}",
            self.server.registry().len().await
        );
    }

    async fn connect(&self) -> Client {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str()).await.unwrap();
        ws
    }
}

/// Start a hub on a free port fed by the given result stream.
async fn start_hub<S>(results: S, queue: Arc<dyn ris_hub::JobQueue>) -> TestHub
where
    S: futures_util::Stream<Item = JobResult> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = ServerConfig {
        bind_addr: addr.to_string(),
        connection_buffer: 64,
        ..ServerConfig::default()
    };
    let server = Arc::new(HubServer::new(
        config,
        JobFactory::new(Arc::new(FixedEndpoint)),
        queue,
    ));
    let shutdown = Shutdown::new();

    let serving = server.clone();
    let signal = shutdown.signal();
    tokio::spawn(async move {
        serving.serve(listener, results, signal).await.unwrap();
    });

    TestHub {
        url: format!("ws://{addr}"),
        server,
        shutdown,
    }
}

/// Next text frame, or `None` if nothing arrives in time.
async fn next_text(ws: &mut Client, wait: Duration) -> Option<String> {
    loop {
        match timeout(wait, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return Some(text.as_str().to_owned()),
            Ok(Some(Ok(_))) => continue,
            _ => return None,
        }
    }
}

/// Skip relayed frames until a job result arrives.
async fn next_result(ws: &mut Client) -> JobResult {
    loop {
        let text = next_text(ws, Duration::from_secs(2))
            .await
            .expect("expected a job result");
        if let Ok(result) = JobResult::decode(&text) {
            return result;
        }
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (queue, _runner, results) = LocalJobQueue::new(8, 1);
    let hub = start_hub(results, Arc::new(queue)).await;

    let _client = hub.connect().await;
    hub.wait_for_connections(1).await;
    assert_eq!(hub.server.stats().await.total_connections, 1);
}

#[tokio::test]
async fn test_relay_reaches_peers_but_not_sender() {
    let (queue, _runner, results) = LocalJobQueue::new(8, 1);
    let hub = start_hub(results, Arc::new(queue)).await;

    let mut c1 = hub.connect().await;
    let mut c2 = hub.connect().await;
    let mut c3 = hub.connect().await;
    hub.wait_for_connections(3).await;

    let raw = r#"{"tx":{"x":1,"y":1},"rx":{"x":2,"y":2},"ris":{"x":3,"y":3}}"#;
    c1.send(Message::text(raw)).await.unwrap();

    assert_eq!(next_text(&mut c2, Duration::from_secs(2)).await.as_deref(), Some(raw));
    assert_eq!(next_text(&mut c3, Duration::from_secs(2)).await.as_deref(), Some(raw));
    assert_eq!(next_text(&mut c1, Duration::from_millis(200)).await, None);

    let stats = hub.server.stats().await;
    assert_eq!(stats.messages_relayed, 1);
    assert_eq!(stats.jobs_submitted, 0);
}

#[tokio::test]
async fn test_job_result_broadcast_to_everyone() {
    let (queue, runner, results) = LocalJobQueue::new(8, 2);
    tokio::spawn(runner.run());
    let hub = start_hub(results, Arc::new(queue)).await;

    let mut c1 = hub.connect().await;
    let mut c2 = hub.connect().await;
    let mut c3 = hub.connect().await;
    hub.wait_for_connections(3).await;

    let raw = r#"{"angle":45,"jobId":"abc"}"#;
    c2.send(Message::text(raw)).await.unwrap();

    // Peers see the relayed request first.
    assert_eq!(next_text(&mut c1, Duration::from_secs(2)).await.as_deref(), Some(raw));
    assert_eq!(next_text(&mut c3, Duration::from_secs(2)).await.as_deref(), Some(raw));

    let expected = JobResult::new(vec![1.0, 2.0, 3.0], Some("abc".into()));
    assert_eq!(next_result(&mut c1).await, expected);
    assert_eq!(next_result(&mut c2).await, expected);
    assert_eq!(next_result(&mut c3).await, expected);

    let stats = hub.server.stats().await;
    assert_eq!(stats.jobs_submitted, 1);
    assert_eq!(stats.results_broadcast, 1);
}

#[tokio::test]
async fn test_closed_connection_misses_later_broadcasts() {
    let (sender, results) = ResultStream::channel(8);
    let (queue, _runner, _unused) = LocalJobQueue::new(8, 1);
    let hub = start_hub(results, Arc::new(queue)).await;

    let mut c1 = hub.connect().await;
    let mut c2 = hub.connect().await;
    let mut c3 = hub.connect().await;
    hub.wait_for_connections(3).await;

    c3.close(None).await.unwrap();
    hub.wait_for_connections(2).await;

    sender
        .send(JobResult::new(vec![0.5], Some("late".into())))
        .await
        .unwrap();

    assert_eq!(next_result(&mut c1).await.job_id.as_deref(), Some("late"));
    assert_eq!(next_result(&mut c2).await.job_id.as_deref(), Some("late"));
    assert_eq!(hub.server.stats().await.active_connections, 2);
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection_open() {
    let (queue, _runner, results) = LocalJobQueue::new(8, 1);
    let hub = start_hub(results, Arc::new(queue)).await;

    let mut c1 = hub.connect().await;
    let mut c2 = hub.connect().await;
    hub.wait_for_connections(2).await;

    c1.send(Message::text("definitely not json")).await.unwrap();
    c1.send(Message::text(r#"{"hello":"world"}"#)).await.unwrap();

    assert_eq!(
        next_text(&mut c2, Duration::from_secs(2)).await.as_deref(),
        Some(r#"{"hello":"world"}"#)
    );
    assert_eq!(hub.server.stats().await.malformed_messages, 1);
    assert_eq!(hub.server.registry().len().await, 2);
}

#[tokio::test]
async fn test_jobs_reach_queue() {
    struct ChannelQueue(mpsc::UnboundedSender<ris_hub::JobDescriptor>);

    impl ris_hub::JobQueue for ChannelQueue {
        fn enqueue(&self, job: ris_hub::JobDescriptor) {
            let _ = self.0.send(job);
        }
    }

    let (_sender, results) = ResultStream::channel(1);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let hub = start_hub(results, Arc::new(ChannelQueue(tx))).await;

    let mut client = hub.connect().await;
    hub.wait_for_connections(1).await;

    client
        .send(Message::text(r#"{"tx":{"x":0,"y":0}}"#))
        .await
        .unwrap();
    client
        .send(Message::text(
            r#"{"focus":{"tx":{"x":0,"y":0},"rx":{"x":1,"y":0},"ris":{"x":0,"y":1}},"jobId":"f1"}"#,
        ))
        .await
        .unwrap();

    let job = timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.job_id(), Some("f1"));
    assert!(matches!(job.operation(), Operation::Focus(_)));
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
}

#[tokio::test]
async fn test_shutdown_stops_accepting() {
    let (_sender, results) = ResultStream::channel(1);
    let (queue, _runner, _unused) = LocalJobQueue::new(8, 1);
    let hub = start_hub(results, Arc::new(queue)).await;

    let _client = hub.connect().await;
    hub.wait_for_connections(1).await;

    hub.shutdown.trigger();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let refused = timeout(
        Duration::from_secs(1),
        tokio_tungstenite::connect_async(hub.url.as_str()),
    )
    .await;
    assert!(
        !matches!(refused, Ok(Ok(_))),
        "no new connections after shutdown"
    );
}
