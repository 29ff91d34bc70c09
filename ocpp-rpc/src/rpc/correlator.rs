//! Request/response correlation
//!
//! Every outbound request gets a `PendingCall` keyed by its request id. The
//! pending map is the single point of truth: whichever of response, timeout,
//! cancellation or connection loss removes the entry first wins, and the
//! removed entry's oneshot slot carries the outcome to the caller. A second
//! contender finds nothing to remove and is a no-op.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::types::{NetworkingNodeId, RequestEnvelope, RequestId, ResponseEnvelope};
use crate::error::RpcError;
use crate::net::connection::ConnectionId;

/// Pending call lifecycle before its terminal transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    Created,
    Sent,
}

/// How a pending call ended
#[derive(Debug)]
pub enum CallOutcome {
    Completed(ResponseEnvelope),
    TimedOut,
    Cancelled,
    ConnectionLost,
}

impl CallOutcome {
    pub fn into_result(self) -> Result<ResponseEnvelope, RpcError> {
        match self {
            CallOutcome::Completed(response) => Ok(response),
            CallOutcome::TimedOut => Err(RpcError::Timeout),
            CallOutcome::Cancelled => Err(RpcError::Cancelled),
            CallOutcome::ConnectionLost => Err(RpcError::ConnectionLost),
        }
    }
}

/// Bookkeeping for one in-flight request
struct PendingCall {
    action: String,
    destination: NetworkingNodeId,
    connection: Option<ConnectionId>,
    state: PendingState,
    created_at: DateTime<Utc>,
    started: Instant,
    deadline: Instant,
    timer: Option<AbortHandle>,
    slot: oneshot::Sender<CallOutcome>,
}

#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    completed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    connection_lost: AtomicU64,
    dropped_responses: AtomicU64,
}

/// Snapshot of correlator counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrelatorStats {
    pub created: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub connection_lost: u64,
    pub dropped_responses: u64,
    pub pending: u64,
}

impl CorrelatorStats {
    /// Calls that reached a terminal state
    pub fn terminated(&self) -> u64 {
        self.completed + self.timed_out + self.cancelled + self.connection_lost
    }
}

/// Tracks pending calls and matches responses to their callers
pub struct RequestCorrelator {
    pending: DashMap<RequestId, PendingCall>,
    default_timeout: Duration,
    counters: Counters,
    me: Weak<RequestCorrelator>,
}

impl RequestCorrelator {
    /// Create a correlator; `default_timeout` applies to envelopes without one
    pub fn new(default_timeout: Duration) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            pending: DashMap::new(),
            default_timeout,
            counters: Counters::default(),
            me: me.clone(),
        })
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Register a pending call for `envelope`, allocating its request id if
    /// unset, and arm its deadline timer. Must run inside a tokio runtime.
    pub fn register(&self, envelope: &mut RequestEnvelope) -> Result<PendingCallHandle, RpcError> {
        let timeout = envelope.timeout.unwrap_or(self.default_timeout);
        let started = Instant::now();
        let deadline = started + timeout;
        let (slot, rx) = oneshot::channel();

        let mut call = PendingCall {
            action: envelope.action.clone(),
            destination: envelope.destination.clone(),
            connection: None,
            state: PendingState::Created,
            created_at: envelope.created_at,
            started,
            deadline,
            timer: None,
            slot,
        };

        let request_id = loop {
            let (candidate, supplied) = match &envelope.request_id {
                Some(id) => (id.clone(), true),
                None => (RequestId::random(), false),
            };

            match self.pending.entry(candidate.clone()) {
                Entry::Occupied(_) if supplied => {
                    return Err(RpcError::DuplicateRequestId(candidate));
                }
                Entry::Occupied(_) => continue,
                Entry::Vacant(entry) => {
                    call.timer = Some(self.arm_timer(candidate.clone(), deadline));
                    entry.insert(call);
                    break candidate;
                }
            }
        };

        envelope.request_id = Some(request_id.clone());
        self.counters.created.fetch_add(1, Ordering::Relaxed);

        debug!(
            "Pending call {} ({} -> {}) registered, timeout {:?} [{}]",
            request_id, envelope.action, envelope.destination, timeout, envelope.event_tracking_id
        );

        Ok(PendingCallHandle {
            request_id,
            rx,
            correlator: self.me.clone(),
            resolved: false,
        })
    }

    fn arm_timer(&self, request_id: RequestId, deadline: Instant) -> AbortHandle {
        let me = self.me.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(correlator) = me.upgrade() {
                correlator.expire(&request_id);
            }
        });
        task.abort_handle()
    }

    /// Record the connection the request leaves on. Responses are only
    /// accepted from this connection, and its loss fails the call.
    pub fn attach_connection(&self, request_id: &RequestId, connection: ConnectionId) -> bool {
        match self.pending.get_mut(request_id) {
            Some(mut call) => {
                call.connection = Some(connection);
                true
            }
            None => false,
        }
    }

    /// Mark the request as handed to the transport
    pub fn mark_sent(&self, request_id: &RequestId) {
        if let Some(mut call) = self.pending.get_mut(request_id) {
            call.state = PendingState::Sent;
        }
    }

    /// Complete a pending call with a response received on `via`.
    ///
    /// Unknown, late and duplicate responses are dropped and logged; so is a
    /// response that arrives on a different connection than the request left
    /// on. Returns whether a caller was resolved.
    pub fn complete(&self, mut response: ResponseEnvelope, via: Option<ConnectionId>) -> bool {
        let removed = self.pending.remove_if(&response.request_id, |_, call| {
            via.is_none() || call.connection == via
        });

        let Some((request_id, call)) = removed else {
            self.counters.dropped_responses.fetch_add(1, Ordering::Relaxed);
            if self.pending.contains_key(&response.request_id) {
                warn!(
                    "Dropping response {} received on unexpected connection {:?}",
                    response.request_id, via
                );
            } else {
                debug!(
                    "Dropping response for unknown or completed request {}",
                    response.request_id
                );
            }
            return false;
        };

        let runtime = call.started.elapsed();
        response.runtime = Some(runtime);
        info!(
            "{} {} completed by {} after {:?}",
            call.action, request_id, call.destination, runtime
        );
        debug!("{} was created at {}", request_id, call.created_at);

        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        Self::resolve(call, CallOutcome::Completed(response));
        true
    }

    /// Cancel a pending call. Returns false when it already terminated.
    pub fn cancel(&self, request_id: &RequestId) -> bool {
        self.finish(request_id, CallOutcome::Cancelled)
    }

    /// Fail a single call with `ConnectionLost`
    pub fn fail(&self, request_id: &RequestId) -> bool {
        self.finish(request_id, CallOutcome::ConnectionLost)
    }

    /// Fail every pending call that left on `connection`
    pub fn fail_connection(&self, connection: ConnectionId) -> usize {
        let affected: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|entry| entry.connection == Some(connection))
            .map(|entry| entry.key().clone())
            .collect();

        let mut failed = 0;
        for request_id in affected {
            let removed = self
                .pending
                .remove_if(&request_id, |_, call| call.connection == Some(connection));
            if let Some((_, call)) = removed {
                self.counters.connection_lost.fetch_add(1, Ordering::Relaxed);
                Self::resolve(call, CallOutcome::ConnectionLost);
                failed += 1;
            }
        }

        if failed > 0 {
            warn!("Connection {} lost, failed {} pending call(s)", connection, failed);
        }
        failed
    }

    fn expire(&self, request_id: &RequestId) -> bool {
        let expired = self.pending.remove_if(request_id, |_, call| Instant::now() >= call.deadline);
        match expired {
            Some((_, call)) => {
                warn!(
                    "{} {} to {} timed out (state {:?})",
                    call.action, request_id, call.destination, call.state
                );
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                Self::resolve(call, CallOutcome::TimedOut);
                true
            }
            None => false,
        }
    }

    fn finish(&self, request_id: &RequestId, outcome: CallOutcome) -> bool {
        let Some((_, call)) = self.pending.remove(request_id) else {
            return false;
        };

        let counter = match &outcome {
            CallOutcome::Completed(_) => &self.counters.completed,
            CallOutcome::TimedOut => &self.counters.timed_out,
            CallOutcome::Cancelled => &self.counters.cancelled,
            CallOutcome::ConnectionLost => &self.counters.connection_lost,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        debug!("{} {} finished: {:?}", call.action, request_id, outcome);
        Self::resolve(call, outcome);
        true
    }

    fn resolve(mut call: PendingCall, outcome: CallOutcome) {
        if let Some(timer) = call.timer.take() {
            timer.abort();
        }
        // The caller may have gone away; nothing left to notify then
        let _ = call.slot.send(outcome);
    }

    pub fn is_pending(&self, request_id: &RequestId) -> bool {
        self.pending.contains_key(request_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> CorrelatorStats {
        CorrelatorStats {
            created: self.counters.created.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            connection_lost: self.counters.connection_lost.load(Ordering::Relaxed),
            dropped_responses: self.counters.dropped_responses.load(Ordering::Relaxed),
            pending: self.pending.len() as u64,
        }
    }
}

/// Caller's side of a pending call.
///
/// Dropping the handle before it resolves cancels the call.
pub struct PendingCallHandle {
    request_id: RequestId,
    rx: oneshot::Receiver<CallOutcome>,
    correlator: Weak<RequestCorrelator>,
    resolved: bool,
}

impl PendingCallHandle {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Wait for the terminal outcome of the call
    pub async fn wait(mut self) -> Result<ResponseEnvelope, RpcError> {
        let outcome = match (&mut self.rx).await {
            Ok(outcome) => outcome,
            // Slot dropped without an outcome: the correlator itself is gone
            Err(_) => CallOutcome::ConnectionLost,
        };
        self.resolved = true;
        outcome.into_result()
    }
}

impl Drop for PendingCallHandle {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        if let Some(correlator) = self.correlator.upgrade() {
            if correlator.cancel(&self.request_id) {
                debug!("Pending call {} cancelled by caller", self.request_id);
            }
        }
    }
}
