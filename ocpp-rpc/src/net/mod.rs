//! Connections and routing between networking nodes

pub mod connection;
pub mod registry;
pub mod router;

pub use connection::{Connection, ConnectionId, ConnectionSignal, ConnectionState, Direction};
pub use registry::{ConnectionEvent, ConnectionRegistry};
pub use router::{NetworkRouter, NextHop};
