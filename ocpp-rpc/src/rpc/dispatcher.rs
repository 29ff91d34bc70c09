//! Inbound request dispatch
//!
//! Each locally addressed request runs through a fixed pipeline:
//!
//! ```text
//! observers.on_request ──► handler(action) ──► observers.on_response
//!   (every observer,         (exactly one,        (every observer, even
//!    bounded by timeout)      may fail/panic)       after a failure)
//! ```
//!
//! Observers are purely observational: their errors, panics and timeouts
//! are logged and never change the response sent to the peer.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::types::{Fault, Outcome, RequestEnvelope, ResponseEnvelope};
use crate::error::RpcError;
use crate::ocpp::{Action, ErrorCode};

/// Error returned by a business handler; becomes a CALLERROR on the wire
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerError {
    pub code: ErrorCode,
    pub description: String,
    pub details: Value,
}

impl HandlerError {
    /// Internal error with a description
    pub fn new(description: impl Into<String>) -> Self {
        Self::with_code(ErrorCode::InternalError, description)
    }

    pub fn with_code(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            details: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.description)
    }
}

impl std::error::Error for HandlerError {}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        HandlerError::with_code(ErrorCode::FormationViolation, e.to_string())
    }
}

impl From<HandlerError> for Fault {
    fn from(e: HandlerError) -> Self {
        Fault::new(e.code, e.description).with_details(e.details)
    }
}

/// Error type for observer hooks
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Future returned by a business handler
pub type HandlerFuture<'a> = BoxFuture<'a, Result<Value, HandlerError>>;

/// Business handler for one action.
///
/// Implemented for any `Fn(RequestEnvelope) -> impl Future` closure.
pub trait RequestHandler: Send + Sync {
    fn handle<'a>(&'a self, request: &'a RequestEnvelope) -> HandlerFuture<'a>;
}

impl<F, Fut> RequestHandler for F
where
    F: Fn(RequestEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    fn handle<'a>(&'a self, request: &'a RequestEnvelope) -> HandlerFuture<'a> {
        Box::pin((self)(request.clone()))
    }
}

/// Observer notified before and after every inbound request
#[async_trait]
pub trait RequestObserver: Send + Sync {
    async fn on_request(&self, _request: &RequestEnvelope) -> Result<(), HookError> {
        Ok(())
    }

    async fn on_response(
        &self,
        _request: &RequestEnvelope,
        _response: &ResponseEnvelope,
    ) -> Result<(), HookError> {
        Ok(())
    }
}

/// Runs the pre-hook / handler / post-hook chain for inbound requests
pub struct InboundDispatcher {
    handlers: RwLock<HashMap<String, Arc<dyn RequestHandler>>>,
    observers: RwLock<Vec<Arc<dyn RequestObserver>>>,
    hook_timeout: Duration,
}

impl InboundDispatcher {
    pub fn new(hook_timeout: Duration) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
            hook_timeout,
        }
    }

    /// Install the handler for `action`, replacing any previous one
    pub fn register_handler(&self, action: impl Into<String>, handler: Arc<dyn RequestHandler>) {
        let action = action.into();
        if self.handlers.write().insert(action.clone(), handler).is_some() {
            warn!("Replaced handler for {}", action);
        } else {
            debug!("Registered handler for {}", action);
        }
    }

    pub fn unregister_handler(&self, action: &str) -> bool {
        self.handlers.write().remove(action).is_some()
    }

    pub fn has_handler(&self, action: &str) -> bool {
        self.handlers.read().contains_key(action)
    }

    /// Append an observer; observers run in registration order
    pub fn add_observer(&self, observer: Arc<dyn RequestObserver>) {
        self.observers.write().push(observer);
    }

    /// Run the full chain for `request` and build its response
    pub async fn dispatch(&self, request: RequestEnvelope) -> ResponseEnvelope {
        let observers: Vec<Arc<dyn RequestObserver>> = self.observers.read().clone();
        let handler = self.handlers.read().get(&request.action).cloned();

        debug!(
            "Dispatching {} from {} [{}]",
            request.action, request.network_path, request.event_tracking_id
        );

        for observer in &observers {
            self.run_hook("pre", &request, observer.on_request(&request))
                .await;
        }

        let outcome = match handler {
            None => {
                info!("No handler for {} [{}]", request.action, request.event_tracking_id);
                Outcome::Fault(not_supported(&request.action))
            }
            Some(handler) => {
                match AssertUnwindSafe(handler.handle(&request)).catch_unwind().await {
                    Ok(Ok(payload)) => Outcome::Payload(payload),
                    Ok(Err(e)) => {
                        warn!(
                            "Handler for {} failed: {} [{}]",
                            request.action, e, request.event_tracking_id
                        );
                        Outcome::Fault(e.into())
                    }
                    Err(panic) => {
                        let reason = panic_message(&panic);
                        error!(
                            "Handler for {} panicked: {} [{}]",
                            request.action, reason, request.event_tracking_id
                        );
                        Outcome::Fault(Fault::new(
                            ErrorCode::InternalError,
                            format!("handler panicked: {}", reason),
                        ))
                    }
                }
            }
        };

        let response = ResponseEnvelope::for_request(&request, outcome);

        for observer in &observers {
            self.run_hook("post", &request, observer.on_response(&request, &response))
                .await;
        }

        response
    }

    async fn run_hook<F>(&self, stage: &str, request: &RequestEnvelope, hook: F)
    where
        F: Future<Output = Result<(), HookError>>,
    {
        let guarded = AssertUnwindSafe(hook).catch_unwind();
        match tokio::time::timeout(self.hook_timeout, guarded).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(
                "{}-hook for {} failed: {} [{}]",
                stage, request.action, e, request.event_tracking_id
            ),
            Ok(Err(panic)) => error!(
                "{}-hook for {} panicked: {} [{}]",
                stage,
                request.action,
                panic_message(&panic),
                request.event_tracking_id
            ),
            Err(_) => warn!(
                "{}-hook for {} timed out after {:?} [{}]",
                stage, request.action, self.hook_timeout, request.event_tracking_id
            ),
        }
    }
}

/// Fault for an action without a handler: `NotSupported` if OCPP 1.6 knows
/// the action, `NotImplemented` otherwise
fn not_supported(action: &str) -> Fault {
    let code = if Action::is_known(action) {
        ErrorCode::NotSupported
    } else {
        ErrorCode::NotImplemented
    };
    Fault::new(code, RpcError::NotSupportedAction(action.to_string()).to_string())
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingObserver {
        pre: AtomicUsize,
        post: AtomicUsize,
    }

    #[async_trait]
    impl RequestObserver for CountingObserver {
        async fn on_request(&self, _request: &RequestEnvelope) -> Result<(), HookError> {
            self.pre.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_response(
            &self,
            _request: &RequestEnvelope,
            _response: &ResponseEnvelope,
        ) -> Result<(), HookError> {
            self.post.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingObserver;

    #[async_trait]
    impl RequestObserver for FailingObserver {
        async fn on_request(&self, _request: &RequestEnvelope) -> Result<(), HookError> {
            Err("observer broke".into())
        }

        async fn on_response(
            &self,
            _request: &RequestEnvelope,
            _response: &ResponseEnvelope,
        ) -> Result<(), HookError> {
            panic!("observer panicked");
        }
    }

    struct StuckObserver;

    #[async_trait]
    impl RequestObserver for StuckObserver {
        async fn on_request(&self, _request: &RequestEnvelope) -> Result<(), HookError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn inbound(action: &str) -> RequestEnvelope {
        let mut request = RequestEnvelope::new("CSMS", action, json!({})).with_request_id("in-1");
        request.network_path.push("CP042".into()).unwrap();
        request
    }

    fn fault_code(response: &ResponseEnvelope) -> Option<ErrorCode> {
        match &response.outcome {
            Outcome::Fault(f) => Some(f.code),
            Outcome::Payload(_) => None,
        }
    }

    #[tokio::test]
    async fn test_unknown_action_not_implemented() {
        let dispatcher = InboundDispatcher::new(Duration::from_secs(5));
        let response = dispatcher.dispatch(inbound("Foo")).await;
        assert_eq!(fault_code(&response), Some(ErrorCode::NotImplemented));
    }

    #[tokio::test]
    async fn test_known_action_without_handler_not_supported() {
        let dispatcher = InboundDispatcher::new(Duration::from_secs(5));
        let response = dispatcher.dispatch(inbound("Reset")).await;
        assert_eq!(fault_code(&response), Some(ErrorCode::NotSupported));
    }

    #[tokio::test]
    async fn test_handler_payload() {
        let dispatcher = InboundDispatcher::new(Duration::from_secs(5));
        dispatcher.register_handler(
            "Heartbeat",
            Arc::new(|_req: RequestEnvelope| async {
                Ok::<_, HandlerError>(json!({"currentTime": "2026-01-20T12:00:00Z"}))
            }),
        );

        let response = dispatcher.dispatch(inbound("Heartbeat")).await;
        assert_eq!(response.destination, "CP042".into());
        assert_eq!(
            response.outcome,
            Outcome::Payload(json!({"currentTime": "2026-01-20T12:00:00Z"}))
        );
    }

    #[tokio::test]
    async fn test_handler_error_becomes_fault() {
        let dispatcher = InboundDispatcher::new(Duration::from_secs(5));
        dispatcher.register_handler(
            "ChangeConfiguration",
            Arc::new(|_req: RequestEnvelope| async {
                Err::<Value, _>(HandlerError::with_code(
                    ErrorCode::PropertyConstraintViolation,
                    "bad key",
                ))
            }),
        );

        let response = dispatcher.dispatch(inbound("ChangeConfiguration")).await;
        assert_eq!(fault_code(&response), Some(ErrorCode::PropertyConstraintViolation));
    }

    #[tokio::test]
    async fn test_hooks_fire_once_even_when_handler_panics() {
        let dispatcher = InboundDispatcher::new(Duration::from_secs(5));
        let observer = Arc::new(CountingObserver::default());
        dispatcher.add_observer(observer.clone());
        dispatcher.register_handler(
            "Reset",
            Arc::new(|_req: RequestEnvelope| async {
                if true {
                    panic!("boom");
                }
                Ok::<_, HandlerError>(Value::Null)
            }),
        );

        let response = dispatcher.dispatch(inbound("Reset")).await;
        assert_eq!(fault_code(&response), Some(ErrorCode::InternalError));
        assert_eq!(observer.pre.load(Ordering::SeqCst), 1);
        assert_eq!(observer.post.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hook_failures_do_not_change_response() {
        let dispatcher = InboundDispatcher::new(Duration::from_secs(5));
        let counting = Arc::new(CountingObserver::default());
        dispatcher.add_observer(Arc::new(FailingObserver));
        dispatcher.add_observer(counting.clone());
        dispatcher.register_handler(
            "Heartbeat",
            Arc::new(|_req: RequestEnvelope| async { Ok::<_, HandlerError>(json!({})) }),
        );

        let response = dispatcher.dispatch(inbound("Heartbeat")).await;
        assert_eq!(response.outcome, Outcome::Payload(json!({})));
        assert_eq!(counting.pre.load(Ordering::SeqCst), 1);
        assert_eq!(counting.post.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_hook_is_bounded() {
        let dispatcher = InboundDispatcher::new(Duration::from_millis(200));
        dispatcher.add_observer(Arc::new(StuckObserver));
        dispatcher.register_handler(
            "Heartbeat",
            Arc::new(|_req: RequestEnvelope| async { Ok::<_, HandlerError>(json!({})) }),
        );

        let response = dispatcher.dispatch(inbound("Heartbeat")).await;
        assert_eq!(response.outcome, Outcome::Payload(json!({})));
    }
}
