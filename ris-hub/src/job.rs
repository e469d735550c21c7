//! Job descriptors: packaged, not-yet-executed operations.
//!
//! The hub never runs a job itself. It builds a [`JobDescriptor`] and hands
//! it to a [`JobQueue`](crate::queue::JobQueue); whoever drains the queue
//! calls [`JobDescriptor::run`], which talks to the compute endpoint and
//! tags the configuration with the job's correlation id.

use std::fmt;
use std::sync::Arc;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{Configuration, JobResult, Operation};

/// External service that turns an operation into a surface configuration.
pub trait ComputeEndpoint: Send + Sync {
    fn compute<'a>(
        &'a self,
        operation: &'a Operation,
    ) -> BoxFuture<'a, Result<Configuration, ComputeError>>;
}

/// Compute endpoint reached over WebSocket.
///
/// Each call opens a connection, sends the operation as one JSON text frame
/// and reads the first text frame back as a JSON array of numbers.
#[derive(Debug, Clone)]
pub struct WsComputeEndpoint {
    url: String,
}

impl WsComputeEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn round_trip(&self, operation: &Operation) -> Result<Configuration, ComputeError> {
        let request = serde_json::to_string(operation)
            .map_err(|e| ComputeError::Encode(e.to_string()))?;

        let (mut ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| ComputeError::Connect(e.to_string()))?;

        ws.send(Message::text(request))
            .await
            .map_err(|e| ComputeError::Transport(e.to_string()))?;

        while let Some(frame) = ws.next().await {
            match frame.map_err(|e| ComputeError::Transport(e.to_string()))? {
                Message::Text(text) => {
                    let configuration: Configuration = serde_json::from_str(text.as_str())
                        .map_err(|e| ComputeError::InvalidResponse(e.to_string()))?;
                    let _ = ws.close(None).await;
                    return Ok(configuration);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }

        Err(ComputeError::Closed)
    }
}

impl ComputeEndpoint for WsComputeEndpoint {
    fn compute<'a>(
        &'a self,
        operation: &'a Operation,
    ) -> BoxFuture<'a, Result<Configuration, ComputeError>> {
        Box::pin(self.round_trip(operation))
    }
}

/// Builds job descriptors bound to one compute endpoint.
#[derive(Clone)]
pub struct JobFactory {
    endpoint: Arc<dyn ComputeEndpoint>,
}

impl JobFactory {
    pub fn new(endpoint: Arc<dyn ComputeEndpoint>) -> Self {
        Self { endpoint }
    }

    /// Package an operation. Performs no I/O.
    pub fn create_job(&self, operation: Operation, job_id: Option<String>) -> JobDescriptor {
        JobDescriptor {
            operation,
            job_id,
            endpoint: self.endpoint.clone(),
        }
    }
}

/// A deferred unit of work: one operation plus its correlation id.
///
/// Holds no reference to the connection that created it.
pub struct JobDescriptor {
    operation: Operation,
    job_id: Option<String>,
    endpoint: Arc<dyn ComputeEndpoint>,
}

impl JobDescriptor {
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn job_id(&self) -> Option<&str> {
        self.job_id.as_deref()
    }

    /// Execute the job against the compute endpoint.
    ///
    /// The result carries this descriptor's job id unchanged.
    pub async fn run(self) -> Result<JobResult, ComputeError> {
        let configuration = self.endpoint.compute(&self.operation).await?;
        Ok(JobResult {
            configuration,
            job_id: self.job_id,
        })
    }
}

impl fmt::Debug for JobDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDescriptor")
            .field("operation", &self.operation)
            .field("job_id", &self.job_id)
            .finish_non_exhaustive()
    }
}

/// Compute endpoint failures.
#[derive(Debug, Clone, PartialEq)]
pub enum ComputeError {
    Encode(String),
    Connect(String),
    Transport(String),
    InvalidResponse(String),
    /// Endpoint closed the connection without answering.
    Closed,
}

impl fmt::Display for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "Failed to encode operation: {e}"),
            Self::Connect(e) => write!(f, "Failed to reach compute endpoint: {e}"),
            Self::Transport(e) => write!(f, "Compute endpoint transport error: {e}"),
            Self::InvalidResponse(e) => write!(f, "Invalid compute endpoint response: {e}"),
            Self::Closed => write!(f, "Compute endpoint closed without a response"),
        }
    }
}

impl std::error::Error for ComputeError {}
