//! Networking node
//!
//! Owns the correlator, registry, router and dispatcher, and runs the
//! per-connection read and write loops.
//!
//! ## Message Flow
//!
//! ```text
//!  call() ──► Router.route_outbound ──► Correlator.register ──► Connection.send
//!
//!  frame in ──► parse ──┬─ CALL ───► Router ──┬─ local ───► Dispatcher ──► response out
//!                       │                     └─ forward ─► next hop
//!                       └─ RESULT ─► Router ──┬─ local ───► Correlator.complete
//!                                             └─ forward ─► previous hop
//! ```
//!
//! The transport is consumed as a pair of channels: frames read from the
//! wire are pushed into `inbound`, frames to write are pulled from
//! `outbound`. Closing `inbound` means the transport is gone.
//!
//! The read loop never waits on a send queue. Forwards, rejections and
//! protocol error replies use `Connection::try_send` and are dropped when
//! the next hop is backed up; local handlers answer from their own task.

use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::{CallOptions, NodeConfig};
use crate::error::RpcError;
use crate::net::connection::{Connection, Direction};
use crate::net::registry::{ConnectionEvent, ConnectionRegistry};
use crate::net::router::{NetworkRouter, NextHop};
use crate::ocpp::{salvage_header, Call, CallError, ErrorCode, FrameError, MessageType, OcppMessage};
use crate::rpc::correlator::{PendingCallHandle, RequestCorrelator};
use crate::rpc::dispatcher::{InboundDispatcher, RequestHandler, RequestObserver};
use crate::rpc::types::{
    Fault, NetworkingNodeId, Outcome, RequestEnvelope, RequestId, ResponseEnvelope,
};

struct NodeInner {
    config: NodeConfig,
    correlator: Arc<RequestCorrelator>,
    registry: Arc<ConnectionRegistry>,
    router: NetworkRouter,
    dispatcher: InboundDispatcher,
}

/// A duplex OCPP RPC endpoint: central system, charge point or gateway
#[derive(Clone)]
pub struct NetworkingNode {
    inner: Arc<NodeInner>,
}

impl NetworkingNode {
    /// Create a node with the given configuration
    pub fn new(config: NodeConfig) -> Self {
        let correlator = RequestCorrelator::new(config.default_timeout);
        let registry = Arc::new(ConnectionRegistry::new(correlator.clone()));
        let router = NetworkRouter::new(
            config.node_id.clone(),
            registry.clone(),
            config.max_route_depth,
        );
        for (destination, via) in &config.routes {
            router.add_route(destination.clone(), via.clone());
        }
        let dispatcher = InboundDispatcher::new(config.hook_timeout);

        info!("Networking node {} created", config.node_id);

        Self {
            inner: Arc::new(NodeInner {
                config,
                correlator,
                registry,
                router,
                dispatcher,
            }),
        }
    }

    pub fn id(&self) -> &NetworkingNodeId {
        &self.inner.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn correlator(&self) -> &Arc<RequestCorrelator> {
        &self.inner.correlator
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.inner.registry
    }

    pub fn router(&self) -> &NetworkRouter {
        &self.inner.router
    }

    /// Install the business handler for an inbound action
    pub fn register_handler<H>(&self, action: impl Into<String>, handler: H)
    where
        H: RequestHandler + 'static,
    {
        self.inner.dispatcher.register_handler(action, Arc::new(handler));
    }

    /// Append an observer to the inbound hook chain
    pub fn add_observer(&self, observer: Arc<dyn RequestObserver>) {
        self.inner.dispatcher.add_observer(observer);
    }

    /// Connection opened/closed notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.registry.subscribe()
    }

    /// Reach `destination` through gateway `via`
    pub fn add_route(
        &self,
        destination: impl Into<NetworkingNodeId>,
        via: impl Into<NetworkingNodeId>,
    ) {
        self.inner.router.add_route(destination.into(), via.into());
    }

    pub fn connection(&self, node_id: &NetworkingNodeId) -> Option<Arc<Connection>> {
        self.inner.registry.lookup(node_id)
    }

    // ------------------------------------------------------------------------
    // Outbound calls
    // ------------------------------------------------------------------------

    /// Send a request and wait for its response
    pub async fn call(
        &self,
        destination: impl Into<NetworkingNodeId>,
        action: impl Into<String>,
        payload: Value,
        options: CallOptions,
    ) -> Result<ResponseEnvelope, RpcError> {
        self.start_call(destination, action, payload, options)
            .await?
            .wait()
            .await
    }

    /// Send a typed request and parse the typed response
    pub async fn call_typed<Req, Resp>(
        &self,
        destination: impl Into<NetworkingNodeId>,
        action: impl Into<String>,
        request: &Req,
        options: CallOptions,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_value(request)?;
        self.call(destination, action, payload, options)
            .await?
            .parse_payload()
    }

    /// Send a request and return the handle of its pending call. Dropping
    /// the handle cancels the call.
    pub async fn start_call(
        &self,
        destination: impl Into<NetworkingNodeId>,
        action: impl Into<String>,
        payload: Value,
        options: CallOptions,
    ) -> Result<PendingCallHandle, RpcError> {
        let mut envelope = RequestEnvelope::new(destination, action, payload);
        envelope.timeout = options.timeout;
        envelope.request_id = options.request_id;
        envelope.signatures = options.signatures;
        if let Some(id) = options.event_tracking_id {
            envelope.event_tracking_id = id;
        }
        self.send(envelope).await
    }

    /// Route, register and transmit a prepared request envelope
    pub async fn send(&self, mut envelope: RequestEnvelope) -> Result<PendingCallHandle, RpcError> {
        let connection = self.inner.router.route_outbound(&mut envelope)?;
        let handle = self.inner.correlator.register(&mut envelope)?;
        let request_id = handle.request_id().clone();

        let frame = OcppMessage::Call(Call::from_envelope(&envelope, connection.remote())?).to_text()?;

        // Attach before checking state: an eviction racing with us either
        // sees the attached call or we see the closed connection
        self.inner.correlator.attach_connection(&request_id, connection.id());
        if !connection.is_established() {
            self.inner.correlator.fail(&request_id);
            return Ok(handle);
        }

        let timeout = envelope
            .timeout
            .unwrap_or(self.inner.config.default_timeout);
        match tokio::time::timeout(timeout, connection.send(frame)).await {
            Ok(Ok(())) => {
                self.inner.correlator.mark_sent(&request_id);
                info!(
                    "{} {} sent to {} via {} [{}]",
                    envelope.action,
                    request_id,
                    envelope.destination,
                    connection.remote(),
                    envelope.event_tracking_id
                );
            }
            Ok(Err(e)) => {
                warn!("Failed to send {} {}: {}", envelope.action, request_id, e);
                self.inner.correlator.fail(&request_id);
            }
            Err(_) => {
                // The deadline timer has already resolved the call
                warn!("Send queue to {} stayed full for {}", connection.remote(), request_id);
            }
        }

        Ok(handle)
    }

    /// Cancel a pending call. The peer is not notified.
    pub fn cancel(&self, request_id: &RequestId) -> bool {
        self.inner.correlator.cancel(request_id)
    }

    // ------------------------------------------------------------------------
    // Transport boundary
    // ------------------------------------------------------------------------

    /// Hand a transport to the node. Registers the connection (evicting any
    /// previous one for `remote`) and spawns its read and write loops.
    pub fn attach_channels(
        &self,
        remote: NetworkingNodeId,
        direction: Direction,
        mut inbound: mpsc::Receiver<String>,
        outbound: mpsc::Sender<String>,
    ) -> Arc<Connection> {
        let (connection, mut queue) =
            Connection::new(remote, direction, self.inner.config.send_queue_capacity);
        self.inner.registry.register(connection.clone());

        let writer = connection.clone();
        tokio::spawn(async move {
            while let Some(frame) = queue.recv().await {
                if outbound.send(frame).await.is_err() {
                    debug!("Transport for connection {} gone", writer.id());
                    break;
                }
            }
            debug!("Writer for connection {} finished", writer.id());
        });

        let node = self.clone();
        let reader = connection.clone();
        tokio::spawn(async move {
            while let Some(text) = inbound.recv().await {
                node.handle_frame(&reader, &text);
            }
            node.connection_closed(&reader);
        });

        connection
    }

    /// Process one frame received on `connection`
    pub fn handle_frame(&self, connection: &Arc<Connection>, text: &str) {
        if !connection.is_established() {
            debug!(
                "Dropping frame on {:?} connection {} from {}",
                connection.state(),
                connection.id(),
                connection.remote()
            );
            return;
        }

        debug!("Received from {}: {}", connection.remote(), text);

        match OcppMessage::parse(text.as_bytes()) {
            Ok(OcppMessage::Call(call)) => self.handle_call(connection, call),
            Ok(message) => self.handle_response(connection, message),
            Err(e) => self.handle_malformed(connection, text, e),
        }
    }

    /// Transport of `connection` closed
    pub fn connection_closed(&self, connection: &Connection) {
        self.inner.registry.unregister(connection);
    }

    /// Close every connection
    pub fn shutdown(&self) {
        info!("Networking node {} shutting down", self.id());
        self.inner.registry.close_all();
    }

    fn handle_call(&self, connection: &Arc<Connection>, call: Call) {
        let mut request = match call.into_envelope(self.id(), connection.remote()) {
            Ok(request) => request,
            Err(e) => {
                warn!("Unusable request from {}: {}", connection.remote(), e);
                return;
            }
        };

        match self.inner.router.route_inbound_request(&mut request) {
            Ok(NextHop::Local) => {
                let node = self.clone();
                tokio::spawn(async move {
                    let response = node.inner.dispatcher.dispatch(request).await;
                    node.send_response(response).await;
                });
            }
            Ok(NextHop::Forward(next)) => {
                let sent = match Call::from_envelope(&request, next.remote())
                    .and_then(|call| OcppMessage::Call(call).to_text())
                {
                    Ok(frame) => next.try_send(frame),
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = sent {
                    self.reject(request, e);
                }
            }
            Err(e) => self.reject(request, e),
        }
    }

    fn handle_response(&self, connection: &Arc<Connection>, message: OcppMessage) {
        let message_id = message.message_id().to_string();
        let Some(mut response) = message.into_response(self.id()) else {
            debug!("Unusable response {} from {}", message_id, connection.remote());
            return;
        };

        match self.inner.router.route_inbound_response(&mut response) {
            Ok(NextHop::Local) => {
                self.inner.correlator.complete(response, Some(connection.id()));
            }
            Ok(NextHop::Forward(next)) => {
                let sent = match OcppMessage::from_response(&response, next.remote()).to_text() {
                    Ok(frame) => next.try_send(frame),
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = sent {
                    warn!(
                        "Failed to return response {} toward {}: {}",
                        response.request_id, response.destination, e
                    );
                }
            }
            Err(e) => warn!("Dropping response {}: {}", response.request_id, e),
        }
    }

    fn handle_malformed(&self, connection: &Arc<Connection>, text: &str, error: FrameError) {
        warn!("Malformed frame from {}: {}", connection.remote(), error);

        let Some((msg_type, message_id)) = salvage_header(text.as_bytes()) else {
            return;
        };

        let code = match &error {
            FrameError::UnknownMessageType(_) => ErrorCode::NotImplemented,
            FrameError::Loop(_) => ErrorCode::ProtocolError,
            _ if msg_type == MessageType::Call as i64 => ErrorCode::FormationViolation,
            // Broken responses get no reply
            _ => return,
        };

        let reply = OcppMessage::CallError(CallError::new(message_id, code, error.to_string()));
        match reply.to_text() {
            Ok(frame) => {
                if let Err(e) = connection.try_send(frame) {
                    debug!("Could not report protocol error to {}: {}", connection.remote(), e);
                }
            }
            Err(e) => warn!("Failed to serialize error reply: {}", e),
        }
    }

    /// Answer a request that cannot be delivered with a CALLERROR sent back
    /// along its path
    fn reject(&self, mut request: RequestEnvelope, error: RpcError) {
        warn!(
            "Rejecting {} for {} from {}: {}",
            request.action, request.destination, request.network_path, error
        );

        if request.network_path.last() == Some(self.id()) {
            request.network_path.pop();
        }
        let fault = Fault::new(error.error_code(), error.to_string());
        let response = ResponseEnvelope::for_request(&request, Outcome::Fault(fault));
        if let Some((connection, frame)) = self.response_frame(&response) {
            if let Err(e) = connection.try_send(frame) {
                warn!(
                    "Dropping rejection {} for {}: {}",
                    response.request_id,
                    connection.remote(),
                    e
                );
            }
        }
    }

    /// Answer from a handler task; waits for room in the send queue
    async fn send_response(&self, response: ResponseEnvelope) {
        let Some((connection, frame)) = self.response_frame(&response) else {
            return;
        };

        if let Err(e) = connection.send(frame).await {
            warn!(
                "Failed to send response {} to {}: {}",
                response.request_id,
                connection.remote(),
                e
            );
        }
    }

    /// First hop and serialized frame of a response
    fn response_frame(&self, response: &ResponseEnvelope) -> Option<(Arc<Connection>, String)> {
        let connection = match self.inner.router.route_outbound_response(response) {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Cannot return response {}: {}", response.request_id, e);
                return None;
            }
        };

        match OcppMessage::from_response(response, connection.remote()).to_text() {
            Ok(frame) => Some((connection, frame)),
            Err(e) => {
                warn!("Failed to serialize response {}: {}", response.request_id, e);
                None
            }
        }
    }
}

/// Connect two nodes in-process with channel transports. Returns the
/// connection as seen from `a` and from `b`.
pub fn link_in_memory(
    a: &NetworkingNode,
    b: &NetworkingNode,
) -> (Arc<Connection>, Arc<Connection>) {
    let capacity = a.config().receive_queue_capacity;
    let (a_to_b_tx, a_to_b_rx) = mpsc::channel(capacity);
    let (b_to_a_tx, b_to_a_rx) = mpsc::channel(capacity);

    let at_a = a.attach_channels(b.id().clone(), Direction::Outbound, b_to_a_rx, a_to_b_tx);
    let at_b = b.attach_channels(a.id().clone(), Direction::Inbound, a_to_b_rx, b_to_a_tx);
    (at_a, at_b)
}
