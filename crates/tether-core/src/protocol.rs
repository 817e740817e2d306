//! Wire protocol between the bridge server and its controller clients.
//!
//! Every frame is a single JSON text message. Three shapes travel on the wire:
//!
//! - **Control** frames carry a `type` tag and no correlation id
//!   (`ping`, `pong`, `register_windows`, `window_created`, `window_removed`, `focused`).
//! - **Requests** (server -> client): `{"id", "action", "payload"}`.
//! - **Responses** (client -> server): `{"id", "ok", "data"?, "error"?}`.
//!
//! Parsing is split by direction: [`ClientFrame`] is what the server reads,
//! [`ServerFrame`] is what a client reads.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::ids::RequestId;

/// Browser window identifier as reported by the client.
pub type WindowId = i64;

/// Control frames exchanged outside the request/response path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Heartbeat ping (client -> server).
    Ping,
    /// Heartbeat reply (server -> client).
    Pong,
    /// Bulk ownership claim for every window the client currently has.
    RegisterWindows {
        /// Window ids owned by the sender.
        #[serde(rename = "windowIds")]
        window_ids: Vec<WindowId>,
    },
    /// A window was opened by the sender.
    WindowCreated {
        /// The new window.
        #[serde(rename = "windowId")]
        window_id: WindowId,
    },
    /// A window owned by the sender was closed.
    WindowRemoved {
        /// The closed window.
        #[serde(rename = "windowId")]
        window_id: WindowId,
    },
    /// The sender's browser gained focus, optionally naming the focused window.
    Focused {
        /// The focused window, when known.
        #[serde(rename = "windowId", default, skip_serializing_if = "Option::is_none")]
        window_id: Option<WindowId>,
    },
}

impl ControlMessage {
    /// Wire tag of this frame.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::RegisterWindows { .. } => "register_windows",
            Self::WindowCreated { .. } => "window_created",
            Self::WindowRemoved { .. } => "window_removed",
            Self::Focused { .. } => "focused",
        }
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// An action request sent from the server to a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProtocolRequest {
    /// Correlation id echoed back in the response.
    pub id: RequestId,
    /// Action name resolved by the client's dispatch table.
    pub action: String,
    /// Action-specific payload.
    #[serde(default)]
    pub payload: Value,
}

impl ProtocolRequest {
    /// Window named by the payload, used for ownership-based routing.
    pub fn window_id(&self) -> Option<WindowId> {
        window_id_of(&self.payload)
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// The outcome of an action, sent from a client back to the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProtocolResponse {
    /// Id of the request this answers.
    pub id: RequestId,
    /// Whether the action succeeded.
    pub ok: bool,
    /// Result payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProtocolResponse {
    /// Successful response carrying optional data.
    pub fn success(id: RequestId, data: Option<Value>) -> Self {
        Self {
            id,
            ok: true,
            data,
            error: None,
        }
    }

    /// Failed response carrying an error message.
    pub fn failure(id: RequestId, error: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Extract `payload.windowId` when it is an integer.
pub fn window_id_of(payload: &Value) -> Option<WindowId> {
    payload.get("windowId").and_then(Value::as_i64)
}

/// A malformed incoming frame. Logged and dropped; never fatal to the link.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The frame is not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    /// The frame is JSON but not an object.
    #[error("frame is not a JSON object")]
    NotAnObject,
    /// A control frame with an unrecognized `type`.
    #[error("unknown control message type: {0}")]
    UnknownControl(String),
    /// A known control frame with missing or mistyped fields.
    #[error("invalid {kind} message: {reason}")]
    InvalidControl {
        /// The control frame's `type`.
        kind: String,
        /// What was wrong.
        reason: String,
    },
    /// A request frame with missing or mistyped fields.
    #[error("invalid request: {reason}")]
    InvalidRequest {
        /// The request id, when one could be read.
        id: Option<String>,
        /// What was wrong.
        reason: String,
    },
    /// A response frame with missing or mistyped fields.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

const CONTROL_TYPES: [&str; 6] = [
    "ping",
    "pong",
    "register_windows",
    "window_created",
    "window_removed",
    "focused",
];

fn parse_object(text: &str) -> Result<Value, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    if value.is_object() {
        Ok(value)
    } else {
        Err(ProtocolError::NotAnObject)
    }
}

/// Parse a control frame if `value` carries a `type` tag.
fn parse_control(value: &Value) -> Option<Result<ControlMessage, ProtocolError>> {
    let kind = value.get("type")?.as_str().unwrap_or_default().to_owned();
    if !CONTROL_TYPES.contains(&kind.as_str()) {
        return Some(Err(ProtocolError::UnknownControl(kind)));
    }
    Some(
        serde_json::from_value(value.clone()).map_err(|e| ProtocolError::InvalidControl {
            kind,
            reason: e.to_string(),
        }),
    )
}

/// A frame received by the server from a client.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientFrame {
    /// Heartbeat or window/focus event.
    Control(ControlMessage),
    /// Answer to an earlier request.
    Response(ProtocolResponse),
}

impl ClientFrame {
    /// Parse a text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value = parse_object(text)?;
        if let Some(control) = parse_control(&value) {
            return control.map(Self::Control);
        }
        serde_json::from_value(value)
            .map(Self::Response)
            .map_err(|e| ProtocolError::InvalidResponse(e.to_string()))
    }
}

/// A frame received by a client from the server.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerFrame {
    /// Heartbeat reply (or any other control frame).
    Control(ControlMessage),
    /// An action to execute.
    Request(ProtocolRequest),
}

impl ServerFrame {
    /// Parse a text frame.
    ///
    /// A request whose `id` is readable but whose other fields are invalid
    /// yields [`ProtocolError::InvalidRequest`] with the id, so the caller can
    /// still answer it with an error response.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value = parse_object(text)?;
        if let Some(control) = parse_control(&value) {
            return control.map(Self::Control);
        }
        let id = value.get("id").and_then(Value::as_str).map(str::to_owned);
        let action_ok = value
            .get("action")
            .and_then(Value::as_str)
            .is_some_and(|a| !a.is_empty());
        if !action_ok {
            return Err(ProtocolError::InvalidRequest {
                id,
                reason: "action must be a non-empty string".into(),
            });
        }
        serde_json::from_value(value)
            .map(Self::Request)
            .map_err(|e| ProtocolError::InvalidRequest {
                id,
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn control_wire_format() {
        assert_eq!(ControlMessage::Ping.to_json().unwrap(), r#"{"type":"ping"}"#);
        let reg = ControlMessage::RegisterWindows {
            window_ids: vec![1, 2],
        };
        assert_eq!(
            reg.to_json().unwrap(),
            r#"{"type":"register_windows","windowIds":[1,2]}"#
        );
        let focused = ControlMessage::Focused { window_id: None };
        assert_eq!(focused.to_json().unwrap(), r#"{"type":"focused"}"#);
    }

    #[test]
    fn parses_client_control_frames() {
        let frame = ClientFrame::parse(r#"{"type":"window_created","windowId":7}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Control(ControlMessage::WindowCreated { window_id: 7 })
        );
        let frame = ClientFrame::parse(r#"{"type":"focused"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Control(ControlMessage::Focused { window_id: None })
        );
    }

    #[test]
    fn parses_response() {
        let frame = ClientFrame::parse(r#"{"id":"req_1","ok":true,"data":{"x":1}}"#).unwrap();
        assert_matches!(frame, ClientFrame::Response(r) if r.ok && r.data == Some(json!({"x": 1})));
    }

    #[test]
    fn failed_response_keeps_error() {
        let frame = ClientFrame::parse(r#"{"id":"req_2","ok":false,"error":"boom"}"#).unwrap();
        assert_matches!(frame, ClientFrame::Response(r) if !r.ok && r.error.as_deref() == Some("boom"));
    }

    #[test]
    fn rejects_garbage() {
        assert_matches!(ClientFrame::parse("not json"), Err(ProtocolError::InvalidJson(_)));
        assert_matches!(ClientFrame::parse("[1,2]"), Err(ProtocolError::NotAnObject));
    }

    #[test]
    fn rejects_unknown_control_type() {
        assert_matches!(
            ClientFrame::parse(r#"{"type":"shrug"}"#),
            Err(ProtocolError::UnknownControl(t)) if t == "shrug"
        );
    }

    #[test]
    fn register_windows_requires_array() {
        assert_matches!(
            ClientFrame::parse(r#"{"type":"register_windows","windowIds":"nope"}"#),
            Err(ProtocolError::InvalidControl { kind, .. }) if kind == "register_windows"
        );
    }

    #[test]
    fn window_created_requires_number() {
        assert_matches!(
            ClientFrame::parse(r#"{"type":"window_created","windowId":"3"}"#),
            Err(ProtocolError::InvalidControl { .. })
        );
    }

    #[test]
    fn response_missing_ok_is_invalid() {
        assert_matches!(
            ClientFrame::parse(r#"{"id":"req_3"}"#),
            Err(ProtocolError::InvalidResponse(_))
        );
    }

    #[test]
    fn parses_request_with_default_payload() {
        let frame = ServerFrame::parse(r#"{"id":"req_4","action":"getTabs"}"#).unwrap();
        assert_matches!(frame, ServerFrame::Request(r) if r.action == "getTabs" && r.payload.is_null());
    }

    #[test]
    fn request_with_empty_action_reports_id() {
        assert_matches!(
            ServerFrame::parse(r#"{"id":"req_5","action":""}"#),
            Err(ProtocolError::InvalidRequest { id: Some(id), .. }) if id == "req_5"
        );
    }

    #[test]
    fn request_with_numeric_id_is_invalid() {
        assert_matches!(
            ServerFrame::parse(r#"{"id":5,"action":"click"}"#),
            Err(ProtocolError::InvalidRequest { id: None, .. })
        );
    }

    #[test]
    fn pong_is_control_for_client() {
        assert_eq!(
            ServerFrame::parse(r#"{"type":"pong"}"#).unwrap(),
            ServerFrame::Control(ControlMessage::Pong)
        );
    }

    #[test]
    fn window_id_extracted_from_payload() {
        let req = ProtocolRequest {
            id: RequestId::from("req_6"),
            action: "click".into(),
            payload: json!({"windowId": 12, "nodeId": 3}),
        };
        assert_eq!(req.window_id(), Some(12));
        assert_eq!(window_id_of(&json!({"windowId": "12"})), None);
        assert_eq!(window_id_of(&Value::Null), None);
    }

    #[test]
    fn response_omits_absent_fields() {
        let resp = ProtocolResponse::success(RequestId::from("req_7"), None);
        assert_eq!(resp.to_json().unwrap(), r#"{"id":"req_7","ok":true}"#);
        let resp = ProtocolResponse::failure(RequestId::from("req_8"), "nope");
        assert_eq!(
            resp.to_json().unwrap(),
            r#"{"id":"req_8","ok":false,"error":"nope"}"#
        );
    }
}
