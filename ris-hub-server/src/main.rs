//! ris-hub server — runs the broadcast hub with an in-process job runner.
//!
//! Configuration comes from flags or `RIS_HUB_*` environment variables, log
//! verbosity from `RUST_LOG`. Ctrl-C stops accepting connections and ends
//! the broadcast loop.

use clap::Parser;
use log::info;
use std::sync::Arc;

use ris_hub::{HubServer, JobFactory, LocalJobQueue, ServerConfig, Shutdown, WsComputeEndpoint};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = ServerConfig::parse();
    info!(
        "Starting ris-hub on {} (compute endpoint {})",
        config.bind_addr, config.compute_url
    );

    let endpoint = Arc::new(WsComputeEndpoint::new(config.compute_url.clone()));
    let factory = JobFactory::new(endpoint);
    let (queue, runner, results) =
        LocalJobQueue::new(config.job_queue_capacity, config.max_concurrent_jobs);
    let runner_task = tokio::spawn(runner.run());

    let shutdown = Shutdown::new();
    let signal = shutdown.signal();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, shutting down");
                shutdown.trigger();
            }
            Err(e) => log::error!("Failed to listen for Ctrl-C: {e}"),
        }
    });

    let server = HubServer::new(config, factory, Arc::new(queue));
    server.run(results, signal).await?;

    let stats = server.stats().await;
    info!(
        "Hub stopped: {} connections served, {} messages relayed, {} jobs submitted, {} results broadcast",
        stats.total_connections, stats.messages_relayed, stats.jobs_submitted, stats.results_broadcast
    );

    runner_task.abort();
    Ok(())
}
