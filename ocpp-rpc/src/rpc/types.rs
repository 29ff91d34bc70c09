//! Identifiers and envelopes carried through the RPC layer

use std::borrow::Borrow;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::RpcError;
use crate::ocpp::{ErrorCode, FrameError};

// ============================================================================
// Identifiers
// ============================================================================

/// Identity of any addressable party: charge box, gateway or central system
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkingNodeId(String);

impl NetworkingNodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NetworkingNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NetworkingNodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NetworkingNodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for NetworkingNodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// OCPP-J message id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id (UUID v4)
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Correlates log lines across request, response and handler
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventTrackingId(String);

impl EventTrackingId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string()[..8].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EventTrackingId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventTrackingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Network path
// ============================================================================

/// Ordered, duplicate-free list of hops a message has traversed.
///
/// For requests the path grows from the origin toward the destination. A
/// response carries the request's path back and every hop pops itself off
/// the end, so the last entry is always the next node to receive it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<NetworkingNodeId>", into = "Vec<NetworkingNodeId>")]
pub struct NetworkPath(Vec<NetworkingNodeId>);

impl NetworkPath {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Build a path from hops, rejecting any repeated node
    pub fn from_hops(
        hops: impl IntoIterator<Item = NetworkingNodeId>,
    ) -> Result<Self, FrameError> {
        let mut path = Self::new();
        for hop in hops {
            path.push(hop)?;
        }
        Ok(path)
    }

    /// Append a hop; a node already on the path is a loop
    pub fn push(&mut self, hop: NetworkingNodeId) -> Result<(), FrameError> {
        if self.contains(&hop) {
            return Err(FrameError::Loop(hop));
        }
        self.0.push(hop);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<NetworkingNodeId> {
        self.0.pop()
    }

    pub fn contains(&self, hop: &NetworkingNodeId) -> bool {
        self.0.iter().any(|h| h == hop)
    }

    /// Node that originated the request
    pub fn origin(&self) -> Option<&NetworkingNodeId> {
        self.0.first()
    }

    pub fn last(&self) -> Option<&NetworkingNodeId> {
        self.0.last()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn hops(&self) -> &[NetworkingNodeId] {
        &self.0
    }
}

impl TryFrom<Vec<NetworkingNodeId>> for NetworkPath {
    type Error = FrameError;

    fn try_from(hops: Vec<NetworkingNodeId>) -> Result<Self, Self::Error> {
        Self::from_hops(hops)
    }
}

impl From<NetworkPath> for Vec<NetworkingNodeId> {
    fn from(path: NetworkPath) -> Self {
        path.0
    }
}

impl fmt::Display for NetworkPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hops: Vec<&str> = self.0.iter().map(|h| h.as_str()).collect();
        write!(f, "[{}]", hops.join(" > "))
    }
}

// ============================================================================
// Envelopes
// ============================================================================

/// Outbound or inbound request as seen by the RPC layer
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    /// Allocated by the correlator when unset
    pub request_id: Option<RequestId>,
    pub action: String,
    pub destination: NetworkingNodeId,
    pub network_path: NetworkPath,
    pub payload: Value,
    /// Opaque signature objects, passed through untouched
    pub signatures: Vec<Value>,
    pub created_at: DateTime<Utc>,
    /// Falls back to the node's default timeout when unset
    pub timeout: Option<Duration>,
    pub event_tracking_id: EventTrackingId,
}

impl RequestEnvelope {
    pub fn new(
        destination: impl Into<NetworkingNodeId>,
        action: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            request_id: None,
            action: action.into(),
            destination: destination.into(),
            network_path: NetworkPath::new(),
            payload,
            signatures: Vec::new(),
            created_at: Utc::now(),
            timeout: None,
            event_tracking_id: EventTrackingId::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_request_id(mut self, id: impl Into<RequestId>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Deserialize the payload into a typed request
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Error reply carried in place of a payload
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    pub code: ErrorCode,
    pub description: String,
    pub details: Value,
}

impl Fault {
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            details: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Result of a request: a payload or a fault
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Payload(Value),
    Fault(Fault),
}

/// Response travelling back toward the request's origin
#[derive(Debug, Clone)]
pub struct ResponseEnvelope {
    pub request_id: RequestId,
    /// Origin of the request this answers
    pub destination: NetworkingNodeId,
    /// Remaining hops; the last entry is the next receiver
    pub network_path: NetworkPath,
    pub outcome: Outcome,
    pub responded_at: DateTime<Utc>,
    /// Time between sending the request and receiving this response, set on
    /// completion of the pending call
    pub runtime: Option<Duration>,
    pub event_tracking_id: EventTrackingId,
}

impl ResponseEnvelope {
    /// Build the response for a request, addressed back along its path
    pub fn for_request(request: &RequestEnvelope, outcome: Outcome) -> Self {
        let destination = request
            .network_path
            .origin()
            .cloned()
            .unwrap_or_else(|| request.destination.clone());

        Self {
            request_id: request.request_id.clone().unwrap_or_else(RequestId::random),
            destination,
            network_path: request.network_path.clone(),
            outcome,
            responded_at: Utc::now(),
            runtime: None,
            event_tracking_id: request.event_tracking_id.clone(),
        }
    }

    pub fn is_fault(&self) -> bool {
        matches!(self.outcome, Outcome::Fault(_))
    }

    /// Payload of a successful response; a fault becomes `HandlerFault`
    pub fn into_payload(self) -> Result<Value, RpcError> {
        match self.outcome {
            Outcome::Payload(value) => Ok(value),
            Outcome::Fault(fault) => Err(RpcError::HandlerFault {
                code: fault.code,
                description: fault.description,
            }),
        }
    }

    /// Parse the payload as a specific response type
    pub fn parse_payload<T: DeserializeOwned>(self) -> Result<T, RpcError> {
        let value = self.into_payload()?;
        Ok(serde_json::from_value(value)?)
    }
}
