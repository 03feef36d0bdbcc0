use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorCode, ProtocolError};

/// First line an app sends after connecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub app_identifier: String,
    pub instance_id: String,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    pub handler_id: String,
    pub daemon_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ResponseFrame {
    pub fn ok(id: Option<String>, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Option<String>, error: &ProtocolError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error.to_body()),
        }
    }

    pub fn into_result(self) -> Result<Value, ProtocolError> {
        match (self.result, self.error) {
            (_, Some(body)) => Err(ProtocolError::from_body(body)),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn handshake_uses_camel_case() {
        let request: ConnectRequest = serde_json::from_value(json!({
            "appIdentifier": "gallery",
            "instanceId": "w1",
            "token": "abc"
        }))
        .unwrap();
        assert_eq!(request.app_identifier, "gallery");
        assert!(request.version.is_none());

        let ack = serde_json::to_value(ConnectResponse {
            handler_id: "gallery:w1".into(),
            daemon_version: "0.1.0".into(),
        })
        .unwrap();
        assert_eq!(ack, json!({ "handlerId": "gallery:w1", "daemonVersion": "0.1.0" }));
    }

    #[test]
    fn error_frame_round_trips_into_protocol_error() {
        let frame = ResponseFrame::err(Some("7".into()), &ProtocolError::Forbidden("nope".into()));
        let line = serde_json::to_string(&frame).unwrap();
        assert!(!line.contains("\"result\""));

        let parsed: ResponseFrame = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.id.as_deref(), Some("7"));
        assert_eq!(
            parsed.into_result(),
            Err(ProtocolError::Forbidden("nope".into()))
        );
    }
}
