//! JSON-lines wire format between the bridge and the script
//!
//! One JSON object per line, in both directions.
//!
//! Script to bridge:
//! - requests: `{"id": 3, "method": "get_device_bank", "track": 12}`
//! - acks for bridge calls: `{"ack": 7}` or `{"ack": 7, "error": "..."}`
//!
//! Bridge to script:
//! - responses: `{"id": 3, "result": [...]}` or `{"id": 3, "error": "..."}`
//! - calls: `{"seq": 7, "call": "host_callback", "midi": [[144, 60, 100]]}`
//!
//! Lifecycle calls and `host_callback` wait for the matching ack; `listener`
//! calls do not.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::bridge::registry::ListenerId;
use crate::host::CapabilityId;
use crate::midi::RawEvent;

/// Operations the script can request
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Call {
    Register,
    AddListener {
        target: CapabilityId,
        property: String,
        listener: ListenerId,
    },
    RemoveListener {
        target: CapabilityId,
        property: String,
        listener: ListenerId,
    },
    GetTrackBank,
    GetDeviceBank {
        track: CapabilityId,
    },
    GetParameterBank {
        device: CapabilityId,
    },
    GetParameterRange {
        parameter: CapabilityId,
    },
    GetValue {
        target: CapabilityId,
        property: String,
    },
    GetRaw {
        target: CapabilityId,
        property: String,
    },
    SetValue {
        target: CapabilityId,
        property: String,
        value: Value,
    },
    Invoke {
        target: CapabilityId,
        action: String,
    },
    GetTransport,
    Log {
        message: String,
    },
    Notify {
        message: String,
    },
}

impl Call {
    /// Calls that may wait on the script and must not block the reader
    pub fn needs_task(&self) -> bool {
        matches!(self, Call::Register | Call::GetParameterRange { .. })
    }

    pub fn method(&self) -> &'static str {
        match self {
            Call::Register => "register",
            Call::AddListener { .. } => "add_listener",
            Call::RemoveListener { .. } => "remove_listener",
            Call::GetTrackBank => "get_track_bank",
            Call::GetDeviceBank { .. } => "get_device_bank",
            Call::GetParameterBank { .. } => "get_parameter_bank",
            Call::GetParameterRange { .. } => "get_parameter_range",
            Call::GetValue { .. } => "get_value",
            Call::GetRaw { .. } => "get_raw",
            Call::SetValue { .. } => "set_value",
            Call::Invoke { .. } => "invoke",
            Call::GetTransport => "get_transport",
            Call::Log { .. } => "log",
            Call::Notify { .. } => "notify",
        }
    }
}

/// A parsed line from the script
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Ack { seq: u64, error: Option<String> },
    Request { id: u64, call: Call },
}

/// A line that could not be understood
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ProtocolError {
    /// Request id, when the line got far enough to carry one
    pub id: Option<u64>,
    pub message: String,
}

impl Inbound {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(line).map_err(|e| ProtocolError {
            id: None,
            message: format!("malformed JSON: {}", e),
        })?;

        if let Some(seq) = value.get("ack") {
            let seq = seq.as_u64().ok_or_else(|| ProtocolError {
                id: None,
                message: "ack must be an unsigned integer".to_string(),
            })?;
            let error = value
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string);
            return Ok(Inbound::Ack { seq, error });
        }

        let id = value
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| ProtocolError {
                id: None,
                message: "request is missing a numeric id".to_string(),
            })?;

        let call = serde_json::from_value(value).map_err(|e| ProtocolError {
            id: Some(id),
            message: format!("invalid request: {}", e),
        })?;

        Ok(Inbound::Request { id, call })
    }
}

/// Calls made into the script
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum PeerEvent {
    OnScriptStart,
    OnScriptStop,
    OnProjectLoad,
    HostCallback { midi: Vec<RawEvent> },
    Listener { listener: ListenerId },
}

/// A line sent to the script
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    Response {
        id: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Call {
        seq: u64,
        #[serde(flatten)]
        event: PeerEvent,
    },
}

impl Outbound {
    pub fn result(id: u64, result: Value) -> Self {
        Outbound::Response {
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<u64>, message: impl Into<String>) -> Self {
        Outbound::Response {
            id,
            result: None,
            error: Some(message.into()),
        }
    }

    /// Serialize as one newline-terminated line
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_requests() {
        assert_eq!(
            Inbound::parse(r#"{"id": 1, "method": "register"}"#).unwrap(),
            Inbound::Request {
                id: 1,
                call: Call::Register
            }
        );

        let parsed = Inbound::parse(
            r#"{"id": 4, "method": "add_listener", "target": 12, "property": "mute", "listener": 3}"#,
        )
        .unwrap();
        assert_eq!(
            parsed,
            Inbound::Request {
                id: 4,
                call: Call::AddListener {
                    target: CapabilityId(12),
                    property: "mute".into(),
                    listener: 3
                }
            }
        );

        let parsed =
            Inbound::parse(r#"{"id": 5, "method": "set_value", "target": 2, "property": "value", "value": 0.5}"#)
                .unwrap();
        assert!(matches!(
            parsed,
            Inbound::Request { call: Call::SetValue { value, .. }, .. } if value == json!(0.5)
        ));
    }

    #[test]
    fn test_parse_acks() {
        assert_eq!(
            Inbound::parse(r#"{"ack": 9}"#).unwrap(),
            Inbound::Ack { seq: 9, error: None }
        );
        assert_eq!(
            Inbound::parse(r#"{"ack": 9, "error": "KeyError: 'x'"}"#).unwrap(),
            Inbound::Ack {
                seq: 9,
                error: Some("KeyError: 'x'".into())
            }
        );
    }

    #[test]
    fn test_parse_errors_keep_the_id() {
        let err = Inbound::parse(r#"{"id": 8, "method": "warp_drive"}"#).unwrap_err();
        assert_eq!(err.id, Some(8));

        let err = Inbound::parse(r#"{"id": 8, "method": "get_device_bank"}"#).unwrap_err();
        assert_eq!(err.id, Some(8));

        let err = Inbound::parse("not json").unwrap_err();
        assert_eq!(err.id, None);

        let err = Inbound::parse(r#"{"method": "register"}"#).unwrap_err();
        assert_eq!(err.id, None);
    }

    #[test]
    fn test_outbound_shapes() {
        let call = Outbound::Call {
            seq: 3,
            event: PeerEvent::HostCallback {
                midi: vec![RawEvent::new(0x90, 60, 100)],
            },
        };
        assert_eq!(
            serde_json::to_value(&call).unwrap(),
            json!({"seq": 3, "call": "host_callback", "midi": [[144, 60, 100]]})
        );

        let start = Outbound::Call {
            seq: 1,
            event: PeerEvent::OnScriptStart,
        };
        assert_eq!(
            serde_json::to_value(&start).unwrap(),
            json!({"seq": 1, "call": "on_script_start"})
        );

        assert_eq!(
            serde_json::to_value(Outbound::result(2, Value::Null)).unwrap(),
            json!({"id": 2, "result": null})
        );
        assert_eq!(
            serde_json::to_value(Outbound::error(None, "bad")).unwrap(),
            json!({"id": null, "error": "bad"})
        );
    }

    #[test]
    fn test_line_is_newline_terminated() {
        let line = Outbound::result(1, json!([1, 2])).to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn test_method_names_match_wire_tags() {
        let call = Call::GetParameterRange {
            parameter: CapabilityId(5),
        };
        let value = serde_json::to_value(&call).unwrap();
        assert_eq!(value["method"], call.method());
        assert!(call.needs_task());
        assert!(!Call::GetTransport.needs_task());
    }
}
