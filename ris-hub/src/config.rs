//! Hub configuration.
//!
//! Every setting can be given as a flag or through its `RIS_HUB_*`
//! environment variable; flags win.

use clap::builder::RangedU64ValueParser;
use clap::Parser;

/// Upper bound for buffer, queue and concurrency settings. Keeps every
/// capacity well inside what tokio channels and semaphores accept.
pub const MAX_CAPACITY: u64 = 1 << 20;

fn capacity() -> RangedU64ValueParser<usize> {
    RangedU64ValueParser::new().range(1..=MAX_CAPACITY)
}

/// Server configuration.
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "ris-hub")]
#[command(about = "Realtime broadcast hub for surface configuration jobs")]
pub struct ServerConfig {
    /// Address to bind to
    #[arg(long, env = "RIS_HUB_BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind_addr: String,

    /// Outbound payloads buffered per connection before fan-out drops
    #[arg(long, env = "RIS_HUB_CONNECTION_BUFFER", default_value = "256", value_parser = capacity())]
    pub connection_buffer: usize,

    /// WebSocket URL of the compute endpoint
    #[arg(long, env = "RIS_HUB_COMPUTE_URL", default_value = "ws://127.0.0.1:8081")]
    pub compute_url: String,

    /// Jobs executed concurrently by the in-process runner
    #[arg(long, env = "RIS_HUB_MAX_CONCURRENT_JOBS", default_value = "8", value_parser = capacity())]
    pub max_concurrent_jobs: usize,

    /// Jobs buffered before submissions are dropped
    #[arg(long, env = "RIS_HUB_JOB_QUEUE_CAPACITY", default_value = "1024", value_parser = capacity())]
    pub job_queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            connection_buffer: 256,
            compute_url: "ws://127.0.0.1:8081".to_string(),
            max_concurrent_jobs: 8,
            job_queue_capacity: 1024,
        }
    }
}
