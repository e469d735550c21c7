//! JSON wire protocol carried in WebSocket text frames.
//!
//! Inbound (client → hub):
//! ```text
//! ┌──────────────────────────────┬─────────────┬──────────────────────────┐
//! │ couple | focus | angle       │ jobId       │ anything else            │
//! │ at most one operation        │ optional    │ relayed, never inspected │
//! └──────────────────────────────┴─────────────┴──────────────────────────┘
//! ```
//!
//! Outbound (broadcast loop → every client):
//! ```text
//! { "configuration": [f64, ...], "jobId": "..." }
//! ```
//!
//! Configuration values are `f64`, so integral values go out with a
//! fractional part (`[1.0,2.0,3.0]`).

use serde::{Deserialize, Serialize};

/// A point in the scene plane.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Positions of the transmitter, receiver and reconfigurable surface.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObjectPositions {
    pub tx: Position,
    pub rx: Position,
    pub ris: Position,
}

/// A deferred unit of computation requested by a client.
///
/// Serialized externally tagged in lowercase, so `Angle(45.0)` travels as
/// `{"angle":45.0}`. This is also the request body sent to the compute
/// endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Pair two objects at the given positions.
    Couple(ObjectPositions),
    /// Focus the surface on the given object set.
    Focus(ObjectPositions),
    /// Steer the surface to a fixed angle (degrees).
    Angle(f64),
}

impl Operation {
    /// Wire key of this variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Couple(_) => "couple",
            Self::Focus(_) => "focus",
            Self::Angle(_) => "angle",
        }
    }
}

/// Surface configuration returned by the compute endpoint.
pub type Configuration = Vec<f64>;

/// Result of an executed job, broadcast to every open connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub configuration: Configuration,
    #[serde(rename = "jobId", default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl JobResult {
    pub fn new(configuration: Configuration, job_id: Option<String>) -> Self {
        Self {
            configuration,
            job_id,
        }
    }

    /// Serialize to the outbound text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse an outbound text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// The fields the hub recognises, all optional. Position updates and any
/// other payload fields are left untyped so they cannot fail the parse.
#[derive(Debug, Deserialize)]
struct WireMessage {
    couple: Option<ObjectPositions>,
    focus: Option<ObjectPositions>,
    angle: Option<f64>,
    #[serde(rename = "jobId")]
    job_id: Option<String>,
}

/// A parsed inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Deferred work carried by the message, if any.
    pub operation: Option<Operation>,
    /// Correlation id echoed on the job result.
    pub job_id: Option<String>,
}

impl InboundMessage {
    /// Parse an inbound text frame.
    ///
    /// The frame must be a JSON object. At most one of `couple`, `focus`
    /// and `angle` may be present.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let object: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let wire: WireMessage = serde_json::from_value(serde_json::Value::Object(object))
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let operation = match (wire.couple, wire.focus, wire.angle) {
            (None, None, None) => None,
            (Some(positions), None, None) => Some(Operation::Couple(positions)),
            (None, Some(positions), None) => Some(Operation::Focus(positions)),
            (None, None, Some(angle)) => Some(Operation::Angle(angle)),
            _ => return Err(ProtocolError::ConflictingOperations),
        };

        Ok(Self {
            operation,
            job_id: wire.job_id,
        })
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Frame is not a JSON object or a recognised field has the wrong shape.
    Malformed(String),
    /// More than one operation field is populated.
    ConflictingOperations,
    Serialization(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "Malformed message: {e}"),
            Self::ConflictingOperations => {
                write!(f, "Message carries more than one of couple, focus, angle")
            }
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
