//! Request/response core
//!
//! - `types`: node ids, network paths, request and response envelopes
//! - `correlator`: pending calls, timeouts, cancellation
//! - `dispatcher`: inbound handlers and observer hooks

pub mod correlator;
pub mod dispatcher;
pub mod types;

pub use correlator::{CallOutcome, CorrelatorStats, PendingCallHandle, PendingState, RequestCorrelator};
pub use dispatcher::{
    HandlerError, HandlerFuture, HookError, InboundDispatcher, RequestHandler, RequestObserver,
};
pub use types::*;
