//! Next-hop resolution and source-routed replies
//!
//! Requests are routed toward their destination: directly if the node is
//! attached, otherwise through the gateway a static route names (resolved
//! recursively for nested gateways). Every node a request leaves appends
//! itself to the network path.
//!
//! Responses never consult the route table. The path a request collected is
//! the way back: each hop pops itself off the end and hands the response to
//! the new last entry.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use super::connection::Connection;
use super::registry::ConnectionRegistry;
use crate::error::RpcError;
use crate::rpc::types::{NetworkingNodeId, RequestEnvelope, ResponseEnvelope};

/// Where a message goes next
#[derive(Debug, Clone)]
pub enum NextHop {
    /// Addressed to this node
    Local,
    /// Hand to this neighbour
    Forward(Arc<Connection>),
}

pub struct NetworkRouter {
    local: NetworkingNodeId,
    registry: Arc<ConnectionRegistry>,
    /// destination -> gateway it is reachable through
    routes: DashMap<NetworkingNodeId, NetworkingNodeId>,
    max_route_depth: usize,
}

impl NetworkRouter {
    pub fn new(
        local: NetworkingNodeId,
        registry: Arc<ConnectionRegistry>,
        max_route_depth: usize,
    ) -> Self {
        Self {
            local,
            registry,
            routes: DashMap::new(),
            max_route_depth,
        }
    }

    pub fn local_id(&self) -> &NetworkingNodeId {
        &self.local
    }

    /// Reach `destination` through `via`
    pub fn add_route(&self, destination: NetworkingNodeId, via: NetworkingNodeId) {
        debug!("Route {} via {}", destination, via);
        self.routes.insert(destination, via);
    }

    pub fn remove_route(&self, destination: &NetworkingNodeId) -> Option<NetworkingNodeId> {
        self.routes.remove(destination).map(|(_, via)| via)
    }

    /// Connection toward `destination`, following static routes until a
    /// directly attached node is found
    pub fn resolve(&self, destination: &NetworkingNodeId) -> Result<Arc<Connection>, RpcError> {
        let mut target = destination.clone();
        let mut visited = HashSet::new();

        for _ in 0..=self.max_route_depth {
            if let Some(connection) = self.registry.lookup(&target) {
                return Ok(connection);
            }
            if !visited.insert(target.clone()) {
                warn!("Route table cycle while resolving {}", destination);
                break;
            }
            match self.routes.get(&target) {
                Some(via) => target = via.value().clone(),
                None => break,
            }
        }

        Err(RpcError::DestinationUnknown(destination.clone()))
    }

    /// Prepare a locally originated request: stamp this node onto the path and
    /// pick the outbound connection. Loops are rejected before anything is
    /// sent.
    pub fn route_outbound(&self, request: &mut RequestEnvelope) -> Result<Arc<Connection>, RpcError> {
        if request.network_path.contains(&request.destination) || request.destination == self.local
        {
            return Err(RpcError::RoutingLoop(request.destination.clone()));
        }

        let connection = self.resolve(&request.destination)?;
        request.network_path.push(self.local.clone())?;
        Ok(connection)
    }

    /// Decide what to do with a received request
    pub fn route_inbound_request(&self, request: &mut RequestEnvelope) -> Result<NextHop, RpcError> {
        if request.destination == self.local {
            return Ok(NextHop::Local);
        }

        if request.network_path.contains(&request.destination) {
            return Err(RpcError::RoutingLoop(request.destination.clone()));
        }

        let connection = self.resolve(&request.destination)?;
        request.network_path.push(self.local.clone())?;

        debug!(
            "Forwarding {} for {} via {} (path {})",
            request.action,
            request.destination,
            connection.remote(),
            request.network_path
        );
        Ok(NextHop::Forward(connection))
    }

    /// Connection a locally built response leaves on: the last hop of the
    /// request's path
    pub fn route_outbound_response(
        &self,
        response: &ResponseEnvelope,
    ) -> Result<Arc<Connection>, RpcError> {
        let next = response
            .network_path
            .last()
            .ok_or_else(|| RpcError::ProtocolError("response without return path".into()))?;

        self.registry
            .lookup(next)
            .ok_or_else(|| RpcError::DestinationUnknown(next.clone()))
    }

    /// Decide what to do with a received response. The path must end with
    /// this node; it is popped and the response is either ours or goes to
    /// the new last hop.
    pub fn route_inbound_response(
        &self,
        response: &mut ResponseEnvelope,
    ) -> Result<NextHop, RpcError> {
        match response.network_path.last() {
            Some(hop) if *hop == self.local => {
                response.network_path.pop();
            }
            other => {
                return Err(RpcError::ProtocolError(format!(
                    "response {} arrived at {} but path ends at {:?}",
                    response.request_id, self.local, other
                )));
            }
        }

        if response.destination == self.local {
            if !response.network_path.is_empty() {
                debug!(
                    "Response {} reached {} with leftover path {}",
                    response.request_id, self.local, response.network_path
                );
            }
            return Ok(NextHop::Local);
        }

        let connection = self.route_outbound_response(response)?;
        debug!(
            "Returning response {} for {} via {}",
            response.request_id,
            response.destination,
            connection.remote()
        );
        Ok(NextHop::Forward(connection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::Direction;
    use crate::rpc::correlator::RequestCorrelator;
    use crate::rpc::types::{NetworkPath, Outcome};
    use serde_json::json;
    use std::time::Duration;

    fn id(s: &str) -> NetworkingNodeId {
        NetworkingNodeId::from(s)
    }

    struct Fixture {
        router: NetworkRouter,
        registry: Arc<ConnectionRegistry>,
        _queues: Vec<tokio::sync::mpsc::Receiver<String>>,
    }

    impl Fixture {
        fn new(local: &str) -> Self {
            let correlator = RequestCorrelator::new(Duration::from_secs(30));
            let registry = Arc::new(ConnectionRegistry::new(correlator));
            Self {
                router: NetworkRouter::new(id(local), registry.clone(), 8),
                registry,
                _queues: Vec::new(),
            }
        }

        fn attach(&mut self, remote: &str) -> Arc<Connection> {
            let (conn, rx) = Connection::new(id(remote), Direction::Outbound, 8);
            self.registry.register(conn.clone());
            self._queues.push(rx);
            conn
        }
    }

    #[test]
    fn test_direct_route() {
        let mut fx = Fixture::new("CSMS");
        let cp = fx.attach("CP042");

        let mut request = RequestEnvelope::new("CP042", "Reset", json!({}));
        let conn = fx.router.route_outbound(&mut request).unwrap();
        assert_eq!(conn.id(), cp.id());
        assert_eq!(request.network_path.hops(), &[id("CSMS")]);
    }

    #[test]
    fn test_recursive_gateway_route() {
        let mut fx = Fixture::new("CSMS");
        let gw1 = fx.attach("GW1");
        fx.router.add_route(id("GW2"), id("GW1"));
        fx.router.add_route(id("CP042"), id("GW2"));

        let conn = fx.router.resolve(&id("CP042")).unwrap();
        assert_eq!(conn.id(), gw1.id());
    }

    #[test]
    fn test_route_cycle_is_unknown() {
        let fx = Fixture::new("CSMS");
        fx.router.add_route(id("A"), id("B"));
        fx.router.add_route(id("B"), id("A"));

        assert!(matches!(
            fx.router.resolve(&id("A")),
            Err(RpcError::DestinationUnknown(_))
        ));
    }

    #[test]
    fn test_unknown_destination() {
        let fx = Fixture::new("CSMS");
        let mut request = RequestEnvelope::new("CP999", "Reset", json!({}));
        assert!(matches!(
            fx.router.route_outbound(&mut request),
            Err(RpcError::DestinationUnknown(_))
        ));
    }

    #[test]
    fn test_loop_rejected_before_send() {
        let mut fx = Fixture::new("GW1");
        fx.attach("CP042");

        let mut request = RequestEnvelope::new("CP042", "Reset", json!({}));
        request.network_path = NetworkPath::from_hops([id("CSMS"), id("CP042")]).unwrap();
        assert!(matches!(
            fx.router.route_inbound_request(&mut request),
            Err(RpcError::RoutingLoop(n)) if n == id("CP042")
        ));

        let mut to_self = RequestEnvelope::new("GW1", "Reset", json!({}));
        assert!(matches!(
            fx.router.route_outbound(&mut to_self),
            Err(RpcError::RoutingLoop(_))
        ));
    }

    #[test]
    fn test_inbound_request_forwarded_and_stamped() {
        let mut fx = Fixture::new("GW1");
        let cp = fx.attach("CP042");

        let mut request = RequestEnvelope::new("CP042", "Reset", json!({}));
        request.network_path = NetworkPath::from_hops([id("CSMS")]).unwrap();

        match fx.router.route_inbound_request(&mut request).unwrap() {
            NextHop::Forward(conn) => assert_eq!(conn.id(), cp.id()),
            NextHop::Local => panic!("Expected Forward"),
        }
        assert_eq!(request.network_path.hops(), &[id("CSMS"), id("GW1")]);
    }

    #[test]
    fn test_response_follows_path_without_routes() {
        let mut fx = Fixture::new("GW1");
        let csms = fx.attach("CSMS");

        let mut request = RequestEnvelope::new("CP042", "Reset", json!({})).with_request_id("r1");
        request.network_path = NetworkPath::from_hops([id("CSMS"), id("GW1")]).unwrap();
        let mut response = ResponseEnvelope::for_request(&request, Outcome::Payload(json!({})));

        match fx.router.route_inbound_response(&mut response).unwrap() {
            NextHop::Forward(conn) => assert_eq!(conn.id(), csms.id()),
            NextHop::Local => panic!("Expected Forward"),
        }
        assert_eq!(response.network_path.hops(), &[id("CSMS")]);
    }

    #[test]
    fn test_response_for_local_node() {
        let fx = Fixture::new("CSMS");
        let mut request = RequestEnvelope::new("CP042", "Reset", json!({})).with_request_id("r1");
        request.network_path = NetworkPath::from_hops([id("CSMS")]).unwrap();
        let mut response = ResponseEnvelope::for_request(&request, Outcome::Payload(json!({})));

        assert!(matches!(
            fx.router.route_inbound_response(&mut response).unwrap(),
            NextHop::Local
        ));
    }

    #[test]
    fn test_misrouted_response_rejected() {
        let fx = Fixture::new("GW2");
        let mut request = RequestEnvelope::new("CP042", "Reset", json!({})).with_request_id("r1");
        request.network_path = NetworkPath::from_hops([id("CSMS"), id("GW1")]).unwrap();
        let mut response = ResponseEnvelope::for_request(&request, Outcome::Payload(json!({})));

        assert!(matches!(
            fx.router.route_inbound_response(&mut response),
            Err(RpcError::ProtocolError(_))
        ));
    }
}
