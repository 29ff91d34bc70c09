//! OCPP 1.6 wire layer
//!
//! - `actions`: OCPP 1.6 action catalog
//! - `messages`: OCPP-J framing (CALL, CALLRESULT, CALLERROR), direct and routed
//! - `ws`: WebSocket transport (accept and dial)

pub mod actions;
pub mod messages;
pub mod ws;

pub use actions::Action;
pub use messages::*;
pub use ws::{WsClientConfig, WsServerConfig, OCPP16_SUBPROTOCOL};
