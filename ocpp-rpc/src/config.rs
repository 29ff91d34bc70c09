//! Configuration for a networking node
//!
//! Plain structs with documented defaults; transport settings live next to
//! the WebSocket transport in `ocpp::ws`.

use std::time::Duration;

use serde_json::Value;

use crate::rpc::types::{EventTrackingId, NetworkingNodeId, RequestId};

/// Complete node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Identity of this node
    pub node_id: NetworkingNodeId,

    /// Timeout for calls that do not set one (default 30 s)
    pub default_timeout: Duration,

    /// Upper bound for each observer hook (default 5 s)
    pub hook_timeout: Duration,

    /// Outbound frames buffered per connection (default 64)
    pub send_queue_capacity: usize,

    /// Inbound frames buffered per connection (default 64)
    pub receive_queue_capacity: usize,

    /// Maximum gateway indirections followed when resolving a route (default 8)
    pub max_route_depth: usize,

    /// Static routes: (destination, via)
    pub routes: Vec<(NetworkingNodeId, NetworkingNodeId)>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: NetworkingNodeId::from("CSMS"),
            default_timeout: Duration::from_secs(30),
            hook_timeout: Duration::from_secs(5),
            send_queue_capacity: 64,
            receive_queue_capacity: 64,
            max_route_depth: 8,
            routes: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Create config for the given node identity
    pub fn new(node_id: impl Into<NetworkingNodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    /// Set default call timeout
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Set observer hook timeout
    pub fn with_hook_timeout(mut self, timeout: Duration) -> Self {
        self.hook_timeout = timeout;
        self
    }

    /// Set per-connection queue capacity (both directions)
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity;
        self.receive_queue_capacity = capacity;
        self
    }

    /// Add static route
    pub fn with_route(
        mut self,
        destination: impl Into<NetworkingNodeId>,
        via: impl Into<NetworkingNodeId>,
    ) -> Self {
        self.routes.push((destination.into(), via.into()));
        self
    }
}

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overrides the node's default timeout
    pub timeout: Option<Duration>,

    /// Caller-chosen request id; allocated when unset
    pub request_id: Option<RequestId>,

    /// Opaque signatures attached to the request
    pub signatures: Vec<Value>,

    /// Correlates logs with an existing operation
    pub event_tracking_id: Option<EventTrackingId>,
}

impl CallOptions {
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Default::default()
        }
    }

    pub fn with_request_id(mut self, id: impl Into<RequestId>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn with_signature(mut self, signature: Value) -> Self {
        self.signatures.push(signature);
        self
    }

    pub fn with_event_tracking_id(mut self, id: EventTrackingId) -> Self {
        self.event_tracking_id = Some(id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = NodeConfig::new("GW1")
            .with_default_timeout(Duration::from_secs(10))
            .with_queue_capacity(16)
            .with_route("CP042", "GW2");

        assert_eq!(config.node_id, NetworkingNodeId::from("GW1"));
        assert_eq!(config.default_timeout, Duration::from_secs(10));
        assert_eq!(config.hook_timeout, Duration::from_secs(5));
        assert_eq!(config.send_queue_capacity, 16);
        assert_eq!(config.routes, vec![("CP042".into(), "GW2".into())]);
    }

    #[test]
    fn test_call_options() {
        let options = CallOptions::timeout(Duration::from_secs(1)).with_request_id("r-1");
        assert_eq!(options.timeout, Some(Duration::from_secs(1)));
        assert_eq!(options.request_id, Some(RequestId::from("r-1")));
        assert!(options.signatures.is_empty());
    }
}
