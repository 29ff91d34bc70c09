//! Error taxonomy for the RPC substrate
//!
//! Every `call` resolves to either a response envelope or one of these.

use thiserror::Error;

use crate::ocpp::{ErrorCode, FrameError};
use crate::rpc::types::{NetworkingNodeId, RequestId};

/// Errors surfaced by calls, routing and dispatch
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Timeout waiting for response")]
    Timeout,

    #[error("Call cancelled")]
    Cancelled,

    #[error("Connection lost while call was in flight")]
    ConnectionLost,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("No handler registered for action: {0}")]
    NotSupportedAction(String),

    #[error("Routing loop: {0} already in network path")]
    RoutingLoop(NetworkingNodeId),

    #[error("No route to destination: {0}")]
    DestinationUnknown(NetworkingNodeId),

    #[error("Handler fault {code}: {description}")]
    HandlerFault { code: ErrorCode, description: String },

    #[error("Request id already pending: {0}")]
    DuplicateRequestId(RequestId),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Send queue to {0} is full")]
    QueueFull(NetworkingNodeId),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for RpcError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        RpcError::WebSocket(Box::new(e))
    }
}

impl From<FrameError> for RpcError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Loop(node) => RpcError::RoutingLoop(node),
            other => RpcError::ProtocolError(other.to_string()),
        }
    }
}

impl RpcError {
    /// OCPP-J error code used when this error has to be reported to a peer
    pub fn error_code(&self) -> ErrorCode {
        match self {
            RpcError::ProtocolError(_) => ErrorCode::ProtocolError,
            RpcError::Json(_) => ErrorCode::FormationViolation,
            RpcError::NotSupportedAction(_) => ErrorCode::NotSupported,
            RpcError::HandlerFault { code, .. } => *code,
            _ => ErrorCode::GenericError,
        }
    }
}
