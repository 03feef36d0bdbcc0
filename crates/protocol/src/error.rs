use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

use crate::envelope::ErrorBody;

/// Status codes carried in error frames. They mirror HTTP semantics so that
/// apps can share handling with their HTTP clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    Internal,
}

impl ErrorCode {
    pub const fn as_u16(self) -> u16 {
        match self {
            ErrorCode::BadRequest => 400,
            ErrorCode::Unauthorized => 401,
            ErrorCode::Forbidden => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::Conflict => 409,
            ErrorCode::Internal => 500,
        }
    }

    pub fn from_u16(code: u16) -> Option<Self> {
        Some(match code {
            400 => ErrorCode::BadRequest,
            401 => ErrorCode::Unauthorized,
            403 => ErrorCode::Forbidden,
            404 => ErrorCode::NotFound,
            409 => ErrorCode::Conflict,
            500 => ErrorCode::Internal,
            _ => return None,
        })
    }

    /// Only contention is worth retrying without changing the request.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorCode::Conflict)
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.as_u16())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = u16::deserialize(deserializer)?;
        ErrorCode::from_u16(raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown error code {raw}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("{message}")]
    Validation {
        message: String,
        issues: Vec<ValidationIssue>,
    },
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProtocolError {
    pub fn validation(message: impl Into<String>, issues: Vec<ValidationIssue>) -> Self {
        ProtocolError::Validation {
            message: message.into(),
            issues,
        }
    }

    /// A 400 that is about the request as a whole rather than a field.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::validation(message, Vec::new())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::Validation { .. } => ErrorCode::BadRequest,
            ProtocolError::Unauthorized(_) => ErrorCode::Unauthorized,
            ProtocolError::Forbidden(_) => ErrorCode::Forbidden,
            ProtocolError::NotFound(_) => ErrorCode::NotFound,
            ProtocolError::Conflict(_) => ErrorCode::Conflict,
            ProtocolError::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn issues(&self) -> &[ValidationIssue] {
        match self {
            ProtocolError::Validation { issues, .. } => issues,
            _ => &[],
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        let details = match self {
            ProtocolError::Validation { issues, .. } if !issues.is_empty() => {
                serde_json::to_value(issues).ok()
            }
            _ => None,
        };
        let message = match self {
            ProtocolError::Validation { message, .. }
            | ProtocolError::Unauthorized(message)
            | ProtocolError::Forbidden(message)
            | ProtocolError::NotFound(message)
            | ProtocolError::Conflict(message)
            | ProtocolError::Internal(message) => message.clone(),
        };
        ErrorBody {
            code: self.code(),
            message,
            details,
        }
    }

    pub fn from_body(body: ErrorBody) -> Self {
        let ErrorBody {
            code,
            message,
            details,
        } = body;
        match code {
            ErrorCode::BadRequest => {
                let issues = details
                    .and_then(|value: Value| serde_json::from_value(value).ok())
                    .unwrap_or_default();
                ProtocolError::Validation { message, issues }
            }
            ErrorCode::Unauthorized => ProtocolError::Unauthorized(message),
            ErrorCode::Forbidden => ProtocolError::Forbidden(message),
            ErrorCode::NotFound => ProtocolError::NotFound(message),
            ErrorCode::Conflict => ProtocolError::Conflict(message),
            ErrorCode::Internal => ProtocolError::Internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn codes_serialize_as_numbers() {
        assert_eq!(serde_json::to_value(ErrorCode::Conflict).unwrap(), json!(409));
        let parsed: ErrorCode = serde_json::from_value(json!(403)).unwrap();
        assert_eq!(parsed, ErrorCode::Forbidden);
        assert!(serde_json::from_value::<ErrorCode>(json!(418)).is_err());
    }

    #[test]
    fn validation_body_lists_issues() {
        let err = ProtocolError::validation(
            "payload rejected",
            vec![ValidationIssue::new("data.taskId", "must not be empty")],
        );
        let body = err.to_body();
        assert_eq!(body.code, ErrorCode::BadRequest);
        assert_eq!(
            body.details,
            Some(json!([{ "path": "data.taskId", "message": "must not be empty" }]))
        );
        assert_eq!(ProtocolError::from_body(body), err);
    }

    #[test]
    fn only_conflicts_are_retryable() {
        assert!(ProtocolError::Conflict("busy".into()).code().is_retryable());
        assert!(!ProtocolError::NotFound("none".into()).code().is_retryable());
    }
}
