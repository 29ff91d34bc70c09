//! Logical connection to a directly attached networking node
//!
//! State machine:
//!
//! ```text
//! Pending ──Established──► Established ──CloseRequested──► Draining ──TransportClosed──► Closed
//!    │                          │                                                         ▲
//!    └──────────────────────────┴─────────────────TransportClosed────────────────────────┘
//! ```
//!
//! Draining stops new sends while frames already queued are flushed by the
//! writer task. Closed is terminal.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::RpcError;
use crate::rpc::types::NetworkingNodeId;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted by this node
    Inbound,
    /// Dialed by this node
    Outbound,
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Pending,
    Established,
    Draining,
    Closed,
}

/// Inputs to the connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionSignal {
    /// Handshake finished and the connection is registered
    Established,
    /// Close requested locally (eviction or shutdown)
    CloseRequested,
    /// Transport is gone
    TransportClosed,
}

impl ConnectionState {
    /// Next state for `signal`, or `None` if the signal does not apply
    pub fn on(self, signal: ConnectionSignal) -> Option<ConnectionState> {
        use ConnectionSignal as S;
        use ConnectionState::*;

        match (self, signal) {
            (Pending, S::Established) => Some(Established),
            (Pending | Established, S::CloseRequested) => Some(Draining),
            (Pending | Established | Draining, S::TransportClosed) => Some(Closed),
            _ => None,
        }
    }
}

/// A framed duplex connection to one neighbour.
///
/// Outbound frames go through a bounded queue drained by the connection's
/// writer task.
pub struct Connection {
    id: ConnectionId,
    remote: NetworkingNodeId,
    direction: Direction,
    state: Mutex<ConnectionState>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
}

impl Connection {
    /// Create a pending connection and the receiving end of its send queue
    pub fn new(
        remote: NetworkingNodeId,
        direction: Direction,
        queue_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let connection = Arc::new(Self {
            id: ConnectionId::next(),
            remote,
            direction,
            state: Mutex::new(ConnectionState::Pending),
            outbound: Mutex::new(Some(tx)),
        });
        (connection, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote(&self) -> &NetworkingNodeId {
        &self.remote
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_established(&self) -> bool {
        self.state() == ConnectionState::Established
    }

    /// Apply a signal; returns whether the state changed
    pub fn signal(&self, signal: ConnectionSignal) -> bool {
        let mut state = self.state.lock();
        let Some(next) = state.on(signal) else {
            return false;
        };

        debug!("Connection {} to {}: {:?} -> {:?}", self.id, self.remote, *state, next);
        *state = next;

        if next != ConnectionState::Established {
            // Dropping the last sender lets the writer drain and finish
            self.outbound.lock().take();
        }
        true
    }

    /// Queue a frame for sending. Only established connections accept new
    /// frames; a send already past this check completes even if the
    /// connection starts draining.
    pub async fn send(&self, frame: String) -> Result<(), RpcError> {
        let tx = {
            let state = self.state.lock();
            if *state != ConnectionState::Established {
                return Err(RpcError::ConnectionClosed);
            }
            self.outbound.lock().clone().ok_or(RpcError::ConnectionClosed)?
        };

        tx.send(frame).await.map_err(|_| RpcError::ConnectionClosed)
    }

    /// Queue a frame without waiting. Used from the read loop, which must
    /// never stall on a slow writer; a full queue fails with `QueueFull`.
    pub fn try_send(&self, frame: String) -> Result<(), RpcError> {
        let state = self.state.lock();
        if *state != ConnectionState::Established {
            return Err(RpcError::ConnectionClosed);
        }
        let outbound = self.outbound.lock();
        let tx = outbound.as_ref().ok_or(RpcError::ConnectionClosed)?;

        tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RpcError::QueueFull(self.remote.clone()),
            mpsc::error::TrySendError::Closed(_) => RpcError::ConnectionClosed,
        })
    }

    /// Request a graceful close
    pub fn close(&self) -> bool {
        self.signal(ConnectionSignal::CloseRequested)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish()
    }
}
