//! # OCPP RPC
//!
//! Duplex OCPP 1.6 JSON RPC between networking nodes: central systems,
//! charge points and the gateways between them.
//!
//! Every node can both issue and serve calls over the same connection.
//! Outbound calls are correlated with their responses, bounded by a timeout
//! and cancellable. Inbound calls pass through observer hooks to a single
//! handler per action. Requests addressed to nodes behind a gateway carry
//! their destination and the path they travelled, and responses retrace
//! that path.
//!
//! ## Architecture
//!
//! ```text
//!             ┌──────────────────────────────────────────────┐
//!  call() ───►│ NetworkingNode                               │
//!             │  ┌────────────┐ ┌────────────┐ ┌───────────┐ │
//!             │  │ Correlator │ │   Router   │ │Dispatcher │◄├── handlers,
//!             │  └────────────┘ └─────┬──────┘ └───────────┘ │   observers
//!             │                 ┌─────▼──────┐               │
//!             │                 │  Registry  │               │
//!             │                 └─────┬──────┘               │
//!             └───────────────────────┼──────────────────────┘
//!                                     │ frame channels
//!                          ┌──────────▼──────────┐
//!                          │ WebSocket / memory  │
//!                          └─────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use ocpp_rpc::{ws, CallOptions, HandlerError, NetworkingNode, NodeConfig, RequestEnvelope};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let csms = NetworkingNode::new(NodeConfig::new("CSMS"));
//!     csms.register_handler("Heartbeat", |_req: RequestEnvelope| async {
//!         Ok::<_, HandlerError>(json!({"currentTime": chrono::Utc::now()}))
//!     });
//!
//!     tokio::spawn(ws::serve(csms.clone(), ws::WsServerConfig::default()));
//!
//!     let response = csms
//!         .call("CP042", "Reset", json!({"type": "Soft"}), CallOptions::default())
//!         .await?;
//!     println!("{:?}", response.outcome);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod net;
pub mod node;
pub mod ocpp;
pub mod rpc;

pub use config::{CallOptions, NodeConfig};
pub use error::RpcError;
pub use net::{Connection, ConnectionEvent, ConnectionId, ConnectionState, Direction, NextHop};
pub use node::{link_in_memory, NetworkingNode};
pub use ocpp::{ws, Action, ErrorCode, OcppMessage};
pub use rpc::{
    CallOutcome, CorrelatorStats, EventTrackingId, Fault, HandlerError, NetworkPath,
    NetworkingNodeId, Outcome, PendingCallHandle, RequestEnvelope, RequestHandler, RequestId,
    RequestObserver, ResponseEnvelope,
};
