//! Registry of current connections, one per networking node
//!
//! The last connection to register for a node wins: the previous one is
//! closed and every call that left on it fails with `ConnectionLost`.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::connection::{Connection, ConnectionId, ConnectionSignal, Direction};
use crate::rpc::correlator::RequestCorrelator;
use crate::rpc::types::NetworkingNodeId;

/// Capacity of the lifecycle notification channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Connection lifecycle notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opened {
        node_id: NetworkingNodeId,
        connection_id: ConnectionId,
        direction: Direction,
    },
    Closed {
        node_id: NetworkingNodeId,
        connection_id: ConnectionId,
        /// Closed because a newer connection for the node replaced it
        superseded: bool,
    },
}

impl ConnectionEvent {
    pub fn node_id(&self) -> &NetworkingNodeId {
        match self {
            ConnectionEvent::Opened { node_id, .. } | ConnectionEvent::Closed { node_id, .. } => {
                node_id
            }
        }
    }
}

/// Current connection per networking node
pub struct ConnectionRegistry {
    connections: DashMap<NetworkingNodeId, Arc<Connection>>,
    correlator: Arc<RequestCorrelator>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionRegistry {
    pub fn new(correlator: Arc<RequestCorrelator>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            connections: DashMap::new(),
            correlator,
            events,
        }
    }

    /// Make `connection` the current one for its remote node. Returns the
    /// evicted predecessor, which has been closed and its calls failed.
    pub fn register(&self, connection: Arc<Connection>) -> Option<Arc<Connection>> {
        let node_id = connection.remote().clone();
        connection.signal(ConnectionSignal::Established);

        let previous = self.connections.insert(node_id.clone(), connection.clone());
        info!(
            "Connection {} to {} registered ({:?})",
            connection.id(),
            node_id,
            connection.direction()
        );

        // The predecessor is reported closed before the successor opens, so
        // subscribers end up seeing the node online
        let evicted = previous.filter(|old| old.id() != connection.id());
        if let Some(evicted) = &evicted {
            warn!(
                "Connection {} to {} superseded by {}",
                evicted.id(),
                node_id,
                connection.id()
            );
            evicted.close();
            self.correlator.fail_connection(evicted.id());
            self.publish(ConnectionEvent::Closed {
                node_id: node_id.clone(),
                connection_id: evicted.id(),
                superseded: true,
            });
        }

        self.publish(ConnectionEvent::Opened {
            node_id,
            connection_id: connection.id(),
            direction: connection.direction(),
        });
        evicted
    }

    pub fn lookup(&self, node_id: &NetworkingNodeId) -> Option<Arc<Connection>> {
        self.connections.get(node_id).map(|entry| entry.value().clone())
    }

    /// Tear down `connection` after its transport closed. The registry entry
    /// is only removed while it still points at this connection, so a stale
    /// close never evicts a successor. Returns whether it was current.
    pub fn unregister(&self, connection: &Connection) -> bool {
        connection.signal(ConnectionSignal::TransportClosed);

        let removed = self
            .connections
            .remove_if(connection.remote(), |_, current| current.id() == connection.id())
            .is_some();

        self.correlator.fail_connection(connection.id());

        if removed {
            info!("Connection {} to {} closed", connection.id(), connection.remote());
            self.publish(ConnectionEvent::Closed {
                node_id: connection.remote().clone(),
                connection_id: connection.id(),
                superseded: false,
            });
        }
        removed
    }

    /// Close every connection, e.g. on shutdown
    pub fn close_all(&self) {
        let connections: Vec<Arc<Connection>> =
            self.connections.iter().map(|e| e.value().clone()).collect();
        for connection in connections {
            connection.close();
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn connected_nodes(&self) -> Vec<NetworkingNodeId> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn publish(&self, event: ConnectionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcError;
    use crate::net::connection::ConnectionState;
    use crate::rpc::types::RequestEnvelope;
    use std::time::Duration;

    fn registry() -> (ConnectionRegistry, Arc<RequestCorrelator>) {
        let correlator = RequestCorrelator::new(Duration::from_secs(30));
        (ConnectionRegistry::new(correlator.clone()), correlator)
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let (registry, _) = registry();
        let (conn, _rx) = Connection::new("CP042".into(), Direction::Inbound, 8);

        assert!(registry.register(conn.clone()).is_none());
        assert!(conn.is_established());
        assert_eq!(registry.lookup(&"CP042".into()).unwrap().id(), conn.id());
        assert!(registry.lookup(&"CP043".into()).is_none());
    }

    #[tokio::test]
    async fn test_reconnect_evicts_and_fails_calls() {
        let (registry, correlator) = registry();
        let mut events = registry.subscribe();

        let (old, _old_rx) = Connection::new("CP042".into(), Direction::Inbound, 8);
        registry.register(old.clone());

        let mut envelope = RequestEnvelope::new("CP042", "Reset", serde_json::json!({}));
        let handle = correlator.register(&mut envelope).unwrap();
        correlator.attach_connection(handle.request_id(), old.id());

        let (new, _new_rx) = Connection::new("CP042".into(), Direction::Inbound, 8);
        let evicted = registry.register(new.clone()).unwrap();

        assert_eq!(evicted.id(), old.id());
        assert_eq!(old.state(), ConnectionState::Draining);
        assert_eq!(registry.lookup(&"CP042".into()).unwrap().id(), new.id());
        assert!(matches!(handle.wait().await, Err(RpcError::ConnectionLost)));

        let opened = |conn: &Connection| ConnectionEvent::Opened {
            node_id: "CP042".into(),
            connection_id: conn.id(),
            direction: Direction::Inbound,
        };
        assert_eq!(events.recv().await.unwrap(), opened(&old));
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::Closed {
                node_id: "CP042".into(),
                connection_id: old.id(),
                superseded: true,
            }
        );
        assert_eq!(events.recv().await.unwrap(), opened(&new));
    }

    #[tokio::test]
    async fn test_stale_unregister_keeps_successor() {
        let (registry, _) = registry();
        let (old, _old_rx) = Connection::new("CP042".into(), Direction::Inbound, 8);
        let (new, _new_rx) = Connection::new("CP042".into(), Direction::Inbound, 8);
        registry.register(old.clone());
        registry.register(new.clone());

        assert!(!registry.unregister(&old));
        assert_eq!(old.state(), ConnectionState::Closed);
        assert_eq!(registry.lookup(&"CP042".into()).unwrap().id(), new.id());

        assert!(registry.unregister(&new));
        assert!(registry.is_empty());
    }
}
