//! OCPP-J message framing
//!
//! OCPP 1.6 JSON frames between directly connected endpoints:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//!
//! Between networking nodes the destination and network path follow the
//! message type:
//! - CALL: [2, destination, [path], messageId, action, payload, (signatures)]
//! - CALLRESULT: [3, destination, [path], messageId, payload]
//! - CALLERROR: [4, destination, [path], messageId, errorCode, errorDescription, errorDetails]
//!
//! A frame whose third element is an array is routed.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::rpc::types::{
    EventTrackingId, Fault, NetworkPath, NetworkingNodeId, Outcome, RequestEnvelope, RequestId,
    ResponseEnvelope,
};

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

/// OCPP 1.6 CALLERROR codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    OccurenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::FormationViolation => "FormationViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::OccurenceConstraintViolation => "OccurenceConstraintViolation",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            ErrorCode::GenericError => "GenericError",
        }
    }

    /// Decode a wire error code. OCPP 2.0.1 spellings are accepted, anything
    /// unknown becomes `GenericError`.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "NotImplemented" => ErrorCode::NotImplemented,
            "NotSupported" => ErrorCode::NotSupported,
            "InternalError" => ErrorCode::InternalError,
            "ProtocolError" => ErrorCode::ProtocolError,
            "SecurityError" => ErrorCode::SecurityError,
            "FormationViolation" | "FormatViolation" => ErrorCode::FormationViolation,
            "PropertyConstraintViolation" => ErrorCode::PropertyConstraintViolation,
            "OccurenceConstraintViolation" | "OccurrenceConstraintViolation" => {
                ErrorCode::OccurenceConstraintViolation
            }
            "TypeConstraintViolation" => ErrorCode::TypeConstraintViolation,
            _ => ErrorCode::GenericError,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors in OCPP frame handling
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid message format: {0}")]
    InvalidFormat(&'static str),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(i64),

    #[error("Routing loop: {0} appears twice in network path")]
    Loop(NetworkingNodeId),
}

/// Destination and path carried by routed frames
#[derive(Debug, Clone, PartialEq)]
pub struct Routing {
    pub destination: NetworkingNodeId,
    pub network_path: NetworkPath,
}

/// OCPP CALL message (request)
#[derive(Debug, Clone)]
pub struct Call {
    pub message_id: String,
    pub action: String,
    pub payload: Value,
    pub routing: Option<Routing>,
    pub signatures: Vec<Value>,
}

impl Call {
    /// Create a new direct CALL message with auto-generated ID
    pub fn new(action: impl Into<String>, payload: impl Serialize) -> Result<Self, FrameError> {
        Ok(Self {
            message_id: Uuid::new_v4().to_string(),
            action: action.into(),
            payload: serde_json::to_value(payload)?,
            routing: None,
            signatures: Vec::new(),
        })
    }

    /// Frame a request for the neighbour `next_hop`. The frame is direct when
    /// the neighbour is the destination and nothing but the origin is on the
    /// path.
    pub fn from_envelope(
        envelope: &RequestEnvelope,
        next_hop: &NetworkingNodeId,
    ) -> Result<Self, FrameError> {
        let message_id = envelope
            .request_id
            .as_ref()
            .ok_or(FrameError::InvalidFormat("request without message id"))?
            .to_string();

        Ok(Self {
            message_id,
            action: envelope.action.clone(),
            payload: envelope.payload.clone(),
            routing: routing_for(&envelope.destination, &envelope.network_path, next_hop),
            signatures: envelope.signatures.clone(),
        })
    }

    /// Lift a received CALL into an envelope. Direct frames are addressed to
    /// `local` and originate at the neighbour `remote`.
    pub fn into_envelope(
        self,
        local: &NetworkingNodeId,
        remote: &NetworkingNodeId,
    ) -> Result<RequestEnvelope, FrameError> {
        let (destination, network_path) = match self.routing {
            Some(routing) => (routing.destination, routing.network_path),
            None => (local.clone(), NetworkPath::from_hops([remote.clone()])?),
        };

        Ok(RequestEnvelope {
            request_id: Some(RequestId::from(self.message_id)),
            action: self.action,
            destination,
            network_path,
            payload: self.payload,
            signatures: self.signatures,
            created_at: Utc::now(),
            timeout: None,
            event_tracking_id: EventTrackingId::new(),
        })
    }

    /// Serialize to OCPP wire format
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        let array = match &self.routing {
            None => serde_json::json!([
                MessageType::Call as i32,
                &self.message_id,
                &self.action,
                &self.payload
            ]),
            Some(routing) => {
                let mut items = vec![
                    Value::from(MessageType::Call as i32),
                    Value::from(routing.destination.as_str()),
                    serde_json::to_value(&routing.network_path)?,
                    Value::from(self.message_id.as_str()),
                    Value::from(self.action.as_str()),
                    self.payload.clone(),
                ];
                if !self.signatures.is_empty() {
                    items.push(Value::Array(self.signatures.clone()));
                }
                Value::Array(items)
            }
        };
        Ok(serde_json::to_vec(&array)?)
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
    pub routing: Option<Routing>,
}

impl CallResult {
    /// Serialize to OCPP wire format
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        let array = match &self.routing {
            None => serde_json::json!([
                MessageType::CallResult as i32,
                &self.message_id,
                &self.payload
            ]),
            Some(routing) => serde_json::json!([
                MessageType::CallResult as i32,
                routing.destination.as_str(),
                &routing.network_path,
                &self.message_id,
                &self.payload
            ]),
        };
        Ok(serde_json::to_vec(&array)?)
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
    pub routing: Option<Routing>,
}

impl CallError {
    /// Create a new direct CALLERROR message
    pub fn new(
        message_id: String,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
            routing: None,
        }
    }

    /// Serialize to OCPP wire format
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        let array = match &self.routing {
            None => serde_json::json!([
                MessageType::CallError as i32,
                &self.message_id,
                self.error_code.as_str(),
                &self.error_description,
                &self.error_details
            ]),
            Some(routing) => serde_json::json!([
                MessageType::CallError as i32,
                routing.destination.as_str(),
                &routing.network_path,
                &self.message_id,
                self.error_code.as_str(),
                &self.error_description,
                &self.error_details
            ]),
        };
        Ok(serde_json::to_vec(&array)?)
    }
}

/// Parsed OCPP message (any type)
#[derive(Debug, Clone)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl OcppMessage {
    /// Parse an OCPP message from JSON bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        let array: Vec<Value> = serde_json::from_slice(bytes)?;

        let msg_type = array
            .first()
            .and_then(Value::as_i64)
            .ok_or(FrameError::InvalidFormat("missing message type"))?;

        let routed = array.get(2).map(Value::is_array).unwrap_or(false);
        let (routing, body) = if routed {
            let destination = NetworkingNodeId::from(str_at(&array, 1, "destination")?);
            let network_path: NetworkPath = serde_json::from_value(array[2].clone())?;
            (
                Some(Routing {
                    destination,
                    network_path,
                }),
                &array[3..],
            )
        } else {
            (None, &array[1..])
        };

        match msg_type {
            2 => {
                // CALL: messageId, action, payload, (signatures on routed frames)
                let max_len = if routed { 4 } else { 3 };
                if body.len() < 3 || body.len() > max_len {
                    return Err(FrameError::InvalidFormat("CALL arity"));
                }

                let signatures = match body.get(3) {
                    Some(Value::Array(signatures)) => signatures.clone(),
                    Some(_) => return Err(FrameError::InvalidFormat("signatures")),
                    None => Vec::new(),
                };

                Ok(OcppMessage::Call(Call {
                    message_id: str_at(body, 0, "message id")?,
                    action: str_at(body, 1, "action")?,
                    payload: body[2].clone(),
                    routing,
                    signatures,
                }))
            }
            3 => {
                // CALLRESULT: messageId, payload
                if body.len() != 2 {
                    return Err(FrameError::InvalidFormat("CALLRESULT arity"));
                }

                Ok(OcppMessage::CallResult(CallResult {
                    message_id: str_at(body, 0, "message id")?,
                    payload: body[1].clone(),
                    routing,
                }))
            }
            4 => {
                // CALLERROR: messageId, errorCode, errorDescription, errorDetails
                if body.len() != 4 {
                    return Err(FrameError::InvalidFormat("CALLERROR arity"));
                }

                let error_code = body[1]
                    .as_str()
                    .map(ErrorCode::from_wire)
                    .unwrap_or(ErrorCode::GenericError);

                Ok(OcppMessage::CallError(CallError {
                    message_id: str_at(body, 0, "message id")?,
                    error_code,
                    error_description: body[2].as_str().unwrap_or("").to_string(),
                    error_details: body[3].clone(),
                    routing,
                }))
            }
            _ => Err(FrameError::UnknownMessageType(msg_type)),
        }
    }

    /// Frame a response for the neighbour `next_hop`
    pub fn from_response(response: &ResponseEnvelope, next_hop: &NetworkingNodeId) -> Self {
        let message_id = response.request_id.to_string();
        let routing = routing_for(&response.destination, &response.network_path, next_hop);

        match &response.outcome {
            Outcome::Payload(payload) => OcppMessage::CallResult(CallResult {
                message_id,
                payload: payload.clone(),
                routing,
            }),
            Outcome::Fault(fault) => OcppMessage::CallError(CallError {
                message_id,
                error_code: fault.code,
                error_description: fault.description.clone(),
                error_details: fault.details.clone(),
                routing,
            }),
        }
    }

    /// Lift a received CALLRESULT or CALLERROR into a response envelope.
    /// Direct frames are addressed to `local`. Returns `None` for a CALL.
    pub fn into_response(self, local: &NetworkingNodeId) -> Option<ResponseEnvelope> {
        let (message_id, routing, outcome) = match self {
            OcppMessage::Call(_) => return None,
            OcppMessage::CallResult(r) => (r.message_id, r.routing, Outcome::Payload(r.payload)),
            OcppMessage::CallError(e) => (
                e.message_id,
                e.routing,
                Outcome::Fault(Fault {
                    code: e.error_code,
                    description: e.error_description,
                    details: e.error_details,
                }),
            ),
        };

        let (destination, network_path) = match routing {
            Some(routing) => (routing.destination, routing.network_path),
            None => {
                let mut path = NetworkPath::new();
                path.push(local.clone()).ok()?;
                (local.clone(), path)
            }
        };

        Some(ResponseEnvelope {
            request_id: RequestId::from(message_id),
            destination,
            network_path,
            outcome,
            responded_at: Utc::now(),
            runtime: None,
            event_tracking_id: EventTrackingId::new(),
        })
    }

    /// Get the message ID
    pub fn message_id(&self) -> &str {
        match self {
            OcppMessage::Call(c) => &c.message_id,
            OcppMessage::CallResult(r) => &r.message_id,
            OcppMessage::CallError(e) => &e.message_id,
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        match self {
            OcppMessage::Call(c) => c.to_bytes(),
            OcppMessage::CallResult(r) => r.to_bytes(),
            OcppMessage::CallError(e) => e.to_bytes(),
        }
    }

    /// Serialize to a WebSocket text payload
    pub fn to_text(&self) -> Result<String, FrameError> {
        let bytes = self.to_bytes()?;
        String::from_utf8(bytes).map_err(|_| FrameError::InvalidFormat("non UTF-8 frame"))
    }
}

/// Recover the message id and type of a frame that failed to parse, so the
/// sender of a broken CALL can still get a CALLERROR back
pub fn salvage_header(bytes: &[u8]) -> Option<(i64, String)> {
    let array: Vec<Value> = serde_json::from_slice(bytes).ok()?;
    let msg_type = array.first()?.as_i64()?;
    let id_index = if array.get(2).map(Value::is_array).unwrap_or(false) {
        3
    } else {
        1
    };
    let message_id = array.get(id_index)?.as_str()?.to_string();
    Some((msg_type, message_id))
}

fn routing_for(
    destination: &NetworkingNodeId,
    path: &NetworkPath,
    next_hop: &NetworkingNodeId,
) -> Option<Routing> {
    if destination == next_hop && path.len() <= 1 {
        None
    } else {
        Some(Routing {
            destination: destination.clone(),
            network_path: path.clone(),
        })
    }
}

fn str_at(array: &[Value], index: usize, what: &'static str) -> Result<String, FrameError> {
    array
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(FrameError::InvalidFormat(what))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> NetworkingNodeId {
        NetworkingNodeId::from(s)
    }

    #[test]
    fn test_message_id_of_each_kind() {
        let frames: [&[u8]; 3] = [
            br#"[2,"m-1","Heartbeat",{}]"#,
            br#"[3,"m-2",{}]"#,
            br#"[4,"CSMS",["CSMS"],"m-3","GenericError","",{}]"#,
        ];
        let ids: Vec<String> = frames
            .iter()
            .map(|f| OcppMessage::parse(f).unwrap().message_id().to_string())
            .collect();
        assert_eq!(ids, ["m-1", "m-2", "m-3"]);
    }

    #[test]
    fn test_call_serialization() {
        let call = Call::new("Heartbeat", serde_json::json!({})).unwrap();
        let bytes = call.to_bytes().unwrap();
        let text = String::from_utf8(bytes).unwrap();

        assert!(text.starts_with("[2,"));
        assert!(text.contains("\"Heartbeat\""));
    }

    #[test]
    fn test_call_parsing() {
        let json = r#"[2, "msg-123", "Heartbeat", {}]"#;
        let msg = OcppMessage::parse(json.as_bytes()).unwrap();

        match msg {
            OcppMessage::Call(call) => {
                assert_eq!(call.message_id, "msg-123");
                assert_eq!(call.action, "Heartbeat");
                assert!(call.routing.is_none());
            }
            _ => panic!("Expected Call"),
        }
    }

    #[test]
    fn test_unknown_action_still_parses() {
        // Unknown actions must reach the dispatcher so it can answer NotImplemented
        let json = r#"[2, "msg-9", "Foo", {}]"#;
        match OcppMessage::parse(json.as_bytes()).unwrap() {
            OcppMessage::Call(call) => assert_eq!(call.action, "Foo"),
            _ => panic!("Expected Call"),
        }
    }

    #[test]
    fn test_routed_call_parsing() {
        let json = r#"[2, "CP042", ["CSMS", "GW1"], "msg-7", "Reset", {"type": "Hard"}]"#;
        let msg = OcppMessage::parse(json.as_bytes()).unwrap();

        match msg {
            OcppMessage::Call(call) => {
                let routing = call.routing.unwrap();
                assert_eq!(routing.destination, id("CP042"));
                assert_eq!(routing.network_path.hops(), &[id("CSMS"), id("GW1")]);
                assert_eq!(call.message_id, "msg-7");
                assert_eq!(call.payload["type"], "Hard");
            }
            _ => panic!("Expected Call"),
        }
    }

    #[test]
    fn test_routed_call_with_looping_path_rejected() {
        let json = r#"[2, "CP042", ["CSMS", "GW1", "CSMS"], "msg-7", "Reset", {}]"#;
        assert!(OcppMessage::parse(json.as_bytes()).is_err());
    }

    #[test]
    fn test_call_result_parsing() {
        let json = r#"[3, "msg-123", {"currentTime": "2026-01-20T12:00:00Z"}]"#;
        let msg = OcppMessage::parse(json.as_bytes()).unwrap();

        match msg {
            OcppMessage::CallResult(result) => {
                assert_eq!(result.message_id, "msg-123");
            }
            _ => panic!("Expected CallResult"),
        }
    }

    #[test]
    fn test_call_error_parsing() {
        let json = r#"[4, "msg-123", "NotImplemented", "Action not supported", {}]"#;
        let msg = OcppMessage::parse(json.as_bytes()).unwrap();

        match msg {
            OcppMessage::CallError(error) => {
                assert_eq!(error.message_id, "msg-123");
                assert_eq!(error.error_code, ErrorCode::NotImplemented);
            }
            _ => panic!("Expected CallError"),
        }
    }

    #[test]
    fn test_error_code_spellings() {
        assert_eq!(ErrorCode::from_wire("FormatViolation"), ErrorCode::FormationViolation);
        assert_eq!(
            ErrorCode::from_wire("OccurrenceConstraintViolation"),
            ErrorCode::OccurenceConstraintViolation
        );
        assert_eq!(ErrorCode::from_wire("SomethingElse"), ErrorCode::GenericError);
        assert_eq!(ErrorCode::FormationViolation.to_string(), "FormationViolation");
    }

    #[test]
    fn test_bad_arity_rejected() {
        assert!(OcppMessage::parse(br#"[2, "id", "Heartbeat"]"#).is_err());
        assert!(OcppMessage::parse(br#"[3, "id"]"#).is_err());
        assert!(matches!(
            OcppMessage::parse(br#"[7, "id", {}]"#),
            Err(FrameError::UnknownMessageType(7))
        ));
    }

    #[test]
    fn test_salvage_header() {
        assert_eq!(
            salvage_header(br#"[2, "msg-1", 42]"#),
            Some((2, "msg-1".to_string()))
        );
        assert_eq!(
            salvage_header(br#"[2, "CP1", ["CSMS"], "msg-2"]"#),
            Some((2, "msg-2".to_string()))
        );
        assert_eq!(salvage_header(b"not json"), None);
    }

    #[test]
    fn test_direct_frame_for_neighbour_destination() {
        let mut envelope = RequestEnvelope::new("CP042", "Reset", serde_json::json!({}))
            .with_request_id("r1");
        envelope.network_path.push(id("CSMS")).unwrap();

        let call = Call::from_envelope(&envelope, &id("CP042")).unwrap();
        assert!(call.routing.is_none());

        let via_gateway = Call::from_envelope(&envelope, &id("GW1")).unwrap();
        assert_eq!(via_gateway.routing.unwrap().destination, id("CP042"));
    }

    #[test]
    fn test_direct_call_into_envelope() {
        let call = Call::new("Heartbeat", serde_json::json!({})).unwrap();
        let envelope = call.into_envelope(&id("CSMS"), &id("CP042")).unwrap();

        assert_eq!(envelope.destination, id("CSMS"));
        assert_eq!(envelope.network_path.hops(), &[id("CP042")]);
    }

    #[test]
    fn test_direct_response_into_envelope() {
        let json = r#"[3, "msg-1", {"status": "Accepted"}]"#;
        let response = OcppMessage::parse(json.as_bytes())
            .unwrap()
            .into_response(&id("CSMS"))
            .unwrap();

        assert_eq!(response.destination, id("CSMS"));
        assert_eq!(response.network_path.hops(), &[id("CSMS")]);
        assert_eq!(response.outcome, Outcome::Payload(serde_json::json!({"status": "Accepted"})));
    }
}
