//! Shared fixtures for node-level tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ocpp_rpc::{Connection, Direction, NetworkingNode, NodeConfig, OcppMessage};
use serde_json::{json, Value};
use tokio::sync::mpsc;

pub fn node(id: &str) -> NetworkingNode {
    NetworkingNode::new(NodeConfig::new(id).with_hook_timeout(Duration::from_secs(1)))
}

/// Hand-driven peer: the test plays the remote side of a connection frame by
/// frame
pub struct RawPeer {
    pub to_node: mpsc::Sender<String>,
    pub from_node: mpsc::Receiver<String>,
    pub connection: Arc<Connection>,
}

impl RawPeer {
    pub fn attach(node: &NetworkingNode, remote: &str) -> Self {
        let (to_node, inbound) = mpsc::channel(16);
        let (outbound, from_node) = mpsc::channel(16);
        let connection = node.attach_channels(remote.into(), Direction::Inbound, inbound, outbound);
        Self {
            to_node,
            from_node,
            connection,
        }
    }

    pub async fn send(&self, frame: Value) {
        self.to_node.send(frame.to_string()).await.unwrap();
    }

    pub async fn next_message(&mut self) -> OcppMessage {
        let frame = self.from_node.recv().await.expect("node closed the connection");
        OcppMessage::parse(frame.as_bytes()).unwrap()
    }

    /// Read the next CALL and return its message id and action
    pub async fn next_call(&mut self) -> (String, String) {
        match self.next_message().await {
            OcppMessage::Call(call) => (call.message_id, call.action),
            other => panic!("Expected CALL, got {:?}", other),
        }
    }

    pub async fn reply(&self, message_id: &str, payload: Value) {
        self.send(json!([3, message_id, payload])).await;
    }
}
