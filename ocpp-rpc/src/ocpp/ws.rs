//! OCPP-J WebSocket transport
//!
//! Charge points dial `{base_url}/{their id}` with the `ocpp1.6`
//! subprotocol; the accepting side learns the remote node id from the last
//! path segment. Once the handshake is done a socket is only a pair of
//! frame channels handed to the node.

use std::future::Future;
use std::io;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    accept_hdr_async_with_config, connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        handshake::server::{ErrorResponse, Request, Response},
        http::{header, HeaderValue, StatusCode},
        protocol::WebSocketConfig,
        Message,
    },
    WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::error::RpcError;
use crate::net::connection::Direction;
use crate::node::NetworkingNode;
use crate::rpc::types::NetworkingNodeId;

/// OCPP 1.6 JSON WebSocket subprotocol
pub const OCPP16_SUBPROTOCOL: &str = "ocpp1.6";

const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Pause after a failed accept
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Accepting side configuration
#[derive(Debug, Clone)]
pub struct WsServerConfig {
    /// Listen address, e.g. `0.0.0.0:9000`
    pub bind_addr: String,
    /// Largest accepted WebSocket message
    pub max_message_size: usize,
    /// Refuse clients that do not offer `ocpp1.6`
    pub require_subprotocol: bool,
}

impl Default for WsServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".to_string(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            require_subprotocol: false,
        }
    }
}

/// Dialing side configuration
#[derive(Debug, Clone)]
pub struct WsClientConfig {
    /// Base URL; the local node id is appended as the last path segment
    pub url: String,
    /// Node id of the peer behind `url`
    pub remote_id: NetworkingNodeId,
    /// Reconnect delay (initial)
    pub reconnect_delay: Duration,
    /// Maximum reconnect delay
    pub max_reconnect_delay: Duration,
    /// Largest accepted WebSocket message
    pub max_message_size: usize,
}

impl WsClientConfig {
    pub fn new(url: impl Into<String>, remote_id: impl Into<NetworkingNodeId>) -> Self {
        Self {
            url: url.into(),
            remote_id: remote_id.into(),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(300),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

fn ws_config(max_message_size: usize) -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(max_message_size),
        max_frame_size: Some(max_message_size),
        ..Default::default()
    }
}

/// Build the full OCPP WebSocket URL
pub fn build_ocpp_url(base_url: &str, node_id: &NetworkingNodeId) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), node_id)
}

/// Node id announced by a handshake path such as `/ocpp/CP042`
pub fn node_id_from_path(path: &str) -> Option<NetworkingNodeId> {
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .map(NetworkingNodeId::from)
}

fn offers_ocpp16(request: &Request) -> bool {
    request
        .headers()
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|protocol| protocol.trim() == OCPP16_SUBPROTOCOL)
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Bind `config.bind_addr` and accept connections forever
pub async fn serve(node: NetworkingNode, config: WsServerConfig) -> Result<(), RpcError> {
    let listener = TcpListener::bind(&config.bind_addr).await?;
    serve_on(node, listener, config).await
}

/// Accept connections on an already bound listener
pub async fn serve_on(
    node: NetworkingNode,
    listener: TcpListener,
    config: WsServerConfig,
) -> Result<(), RpcError> {
    info!(
        "{} accepting OCPP connections on {}",
        node.id(),
        listener.local_addr()?
    );

    let listener = &listener;
    loop {
        let (stream, peer) = accept_retrying(move || listener.accept()).await;
        let node = node.clone();
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(e) = accept_connection(node, stream, &config).await {
                warn!("Connection from {} failed: {}", peer, e);
            }
        });
    }
}

/// Wait for the next accepted socket. Accept errors (out of descriptors,
/// aborted handshakes) are transient for a listener: log, pause, go on.
async fn accept_retrying<T, F, Fut>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                warn!("Accept failed, retrying in {:?}: {}", ACCEPT_ERROR_BACKOFF, e);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}

async fn accept_connection(
    node: NetworkingNode,
    stream: TcpStream,
    config: &WsServerConfig,
) -> Result<(), RpcError> {
    let mut remote = None;
    let require_subprotocol = config.require_subprotocol;

    let callback = |request: &Request, mut response: Response| {
        let Some(node_id) = node_id_from_path(request.uri().path()) else {
            return Err(reject(StatusCode::NOT_FOUND, "missing node id in path"));
        };

        if offers_ocpp16(request) {
            response.headers_mut().insert(
                header::SEC_WEBSOCKET_PROTOCOL,
                HeaderValue::from_static(OCPP16_SUBPROTOCOL),
            );
        } else if require_subprotocol {
            return Err(reject(StatusCode::BAD_REQUEST, "ocpp1.6 subprotocol required"));
        }

        remote = Some(node_id);
        Ok(response)
    };

    let ws = accept_hdr_async_with_config(stream, callback, Some(ws_config(config.max_message_size)))
        .await?;

    let remote = remote.ok_or_else(|| RpcError::ProtocolError("handshake without node id".into()))?;
    info!("{} connected", remote);

    run_socket(node, remote, Direction::Inbound, ws).await
}

/// Dial `config.url` and keep the connection up, reconnecting with
/// exponential backoff. Runs until the task is dropped.
pub async fn connect(node: NetworkingNode, config: WsClientConfig) {
    let mut reconnect_delay = config.reconnect_delay;

    loop {
        match dial(&node, &config).await {
            Ok(()) => {
                info!("Connection to {} closed", config.remote_id);
                reconnect_delay = config.reconnect_delay;
            }
            Err(e) => {
                error!("Connection to {} failed: {}", config.remote_id, e);
            }
        }

        info!("Reconnecting in {:?}", reconnect_delay);
        tokio::time::sleep(reconnect_delay).await;
        reconnect_delay = std::cmp::min(reconnect_delay * 2, config.max_reconnect_delay);
    }
}

async fn dial(node: &NetworkingNode, config: &WsClientConfig) -> Result<(), RpcError> {
    let url = build_ocpp_url(&config.url, node.id());
    info!("Connecting to {} at {}", config.remote_id, url);

    let mut request = url.as_str().into_client_request()?;
    request.headers_mut().insert(
        header::SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(OCPP16_SUBPROTOCOL),
    );

    let (ws, response) =
        connect_async_with_config(request, Some(ws_config(config.max_message_size)), false)
            .await?;

    let accepted = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok());
    if accepted != Some(OCPP16_SUBPROTOCOL) {
        warn!("{} did not accept ocpp1.6 subprotocol, got: {:?}", config.remote_id, accepted);
    }

    run_socket(node.clone(), config.remote_id.clone(), Direction::Outbound, ws).await
}

/// Pump frames between a WebSocket and the node until either side closes
pub async fn run_socket<S>(
    node: NetworkingNode,
    remote: NetworkingNodeId,
    direction: Direction,
    ws: WebSocketStream<S>,
) -> Result<(), RpcError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (inbound_tx, inbound_rx) = mpsc::channel(node.config().receive_queue_capacity);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(node.config().send_queue_capacity);

    let connection = node.attach_channels(remote, direction, inbound_rx, outbound_tx);

    // A frame read from the socket that the node has no room for yet. While
    // it waits, the socket is not read but outbound frames keep flowing.
    let mut backlog: Option<String> = None;

    loop {
        tokio::select! {
            permit = inbound_tx.reserve(), if backlog.is_some() => match permit {
                Ok(permit) => {
                    if let Some(text) = backlog.take() {
                        permit.send(text);
                    }
                }
                Err(_) => break,
            },
            frame = outbound_rx.recv() => match frame {
                Some(text) => {
                    debug!("Sending to {}: {}", connection.remote(), text);
                    if let Err(e) = sink.send(Message::text(text)).await {
                        warn!("Write to {} failed: {}", connection.remote(), e);
                        break;
                    }
                }
                None => {
                    // Connection drained after a local close
                    if let Err(e) = sink.close().await {
                        debug!("Close handshake with {} failed: {}", connection.remote(), e);
                    }
                    break;
                }
            },
            message = stream.next(), if backlog.is_none() => match message {
                Some(Ok(Message::Text(text))) => {
                    backlog = Some(text.to_string());
                }
                Some(Ok(Message::Binary(_))) => {
                    warn!("Ignoring binary frame from {}", connection.remote());
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("WebSocket to {} closed by peer", connection.remote());
                    break;
                }
                Some(Err(e)) => {
                    warn!("WebSocket to {} failed: {}", connection.remote(), e);
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    // Ends the node's read loop, which tears the connection down
    drop(inbound_tx);
    Ok(())
}
