//! Schema registry: the total mapping from [`MessageKind`] to a payload type
//! and its semantic checks.
//!
//! [`decode_payload`] matches exhaustively on the kind, so the registry can
//! never miss a message the router has to handle.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{ProtocolError, ValidationIssue};
use crate::kind::MessageKind;
use crate::message::AppMessage;
use crate::payloads::*;

/// Upper bound on the number of signed URLs a single request may ask for.
pub const MAX_URL_REQUESTS: usize = 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRequest {
    pub id: Option<String>,
    pub message: AppMessage,
}

/// A request that failed validation. `id` is kept when it could be read so
/// the error response can still be correlated.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRequest {
    pub id: Option<String>,
    pub error: ProtocolError,
}

/// Validates the envelope and the payload registered for its `name`.
pub fn parse_request(raw: &Value) -> Result<ParsedRequest, RejectedRequest> {
    let Some(envelope) = raw.as_object() else {
        return Err(RejectedRequest {
            id: None,
            error: ProtocolError::validation(
                "request envelope must be a JSON object",
                vec![ValidationIssue::new("", "expected object")],
            ),
        });
    };

    let mut issues = Vec::new();
    let id = match envelope.get("id") {
        None | Some(Value::Null) => None,
        Some(Value::String(id)) => Some(id.clone()),
        Some(_) => {
            issues.push(ValidationIssue::new("id", "expected string"));
            None
        }
    };

    for key in envelope.keys() {
        if !matches!(key.as_str(), "id" | "name" | "data") {
            issues.push(ValidationIssue::new(key.clone(), "unknown envelope field"));
        }
    }

    let kind = match envelope.get("name") {
        Some(Value::String(name)) => match MessageKind::from_name(name) {
            Some(kind) => Some(kind),
            None => {
                issues.push(ValidationIssue::new(
                    "name",
                    format!("unknown message kind `{name}`"),
                ));
                None
            }
        },
        Some(_) => {
            issues.push(ValidationIssue::new("name", "expected string"));
            None
        }
        None => {
            issues.push(ValidationIssue::new("name", "missing field"));
            None
        }
    };

    let data = envelope.get("data");
    if data.is_none() {
        issues.push(ValidationIssue::new("data", "missing field"));
    }

    match (kind, data) {
        (Some(kind), Some(data)) if issues.is_empty() => decode_payload(kind, data.clone())
            .map(|message| ParsedRequest {
                id: id.clone(),
                message,
            })
            .map_err(|error| RejectedRequest { id, error }),
        _ => Err(RejectedRequest {
            id,
            error: ProtocolError::validation("invalid request envelope", issues),
        }),
    }
}

/// Decodes `data` into the payload registered for `kind`.
pub fn decode_payload(kind: MessageKind, data: Value) -> Result<AppMessage, ProtocolError> {
    Ok(match kind {
        MessageKind::EmitEvent => AppMessage::EmitEvent(decode(kind, data)?),
        MessageKind::DbQuery => AppMessage::DbQuery(decode(kind, data)?),
        MessageKind::DbExec => AppMessage::DbExec(decode(kind, data)?),
        MessageKind::DbBatch => AppMessage::DbBatch(decode(kind, data)?),
        MessageKind::SaveLogEntry => AppMessage::SaveLogEntry(decode(kind, data)?),
        MessageKind::GetContentSignedUrls => AppMessage::GetContentSignedUrls(decode(kind, data)?),
        MessageKind::GetAppUserAccessToken => {
            AppMessage::GetAppUserAccessToken(decode(kind, data)?)
        }
        MessageKind::GetMetadataSignedUrls => {
            AppMessage::GetMetadataSignedUrls(decode(kind, data)?)
        }
        MessageKind::UpdateContentMetadata => {
            AppMessage::UpdateContentMetadata(decode(kind, data)?)
        }
        MessageKind::CompleteHandleTask => AppMessage::CompleteHandleTask(decode(kind, data)?),
        MessageKind::AttemptStartHandleAnyAvailableTask => {
            AppMessage::AttemptStartHandleAnyAvailableTask(decode(kind, data)?)
        }
        MessageKind::FailHandleTask => AppMessage::FailHandleTask(decode(kind, data)?),
        MessageKind::AttemptStartHandleWorkerTaskById => {
            AppMessage::AttemptStartHandleWorkerTaskById(decode(kind, data)?)
        }
        MessageKind::GetAppUiBundle => AppMessage::GetAppUiBundle(decode(kind, data)?),
        MessageKind::GetWorkerExecutionDetails => {
            AppMessage::GetWorkerExecutionDetails(decode(kind, data)?)
        }
        MessageKind::GetAppStorageSignedUrls => {
            AppMessage::GetAppStorageSignedUrls(decode(kind, data)?)
        }
        MessageKind::AuthenticateUser => AppMessage::AuthenticateUser(decode(kind, data)?),
    })
}

fn decode<T>(kind: MessageKind, data: Value) -> Result<T, ProtocolError>
where
    T: DeserializeOwned + Validate,
{
    let payload: T = serde_json::from_value(data).map_err(|err| {
        ProtocolError::validation(
            format!("invalid {kind} payload"),
            vec![ValidationIssue::new("data", err.to_string())],
        )
    })?;

    let mut issues = Vec::new();
    payload.validate("data", &mut issues);
    if issues.is_empty() {
        Ok(payload)
    } else {
        Err(ProtocolError::validation(
            format!("invalid {kind} payload"),
            issues,
        ))
    }
}

/// Semantic rules checked after a payload deserialized successfully.
pub trait Validate {
    fn validate(&self, path: &str, issues: &mut Vec<ValidationIssue>);
}

fn field(path: &str, name: &str) -> String {
    format!("{path}.{name}")
}

fn non_empty(value: &str, path: String, issues: &mut Vec<ValidationIssue>) {
    if value.trim().is_empty() {
        issues.push(ValidationIssue::new(path, "must not be empty"));
    }
}

fn object_key(key: &str, path: String, issues: &mut Vec<ValidationIssue>) {
    if key.is_empty() {
        issues.push(ValidationIssue::new(path, "must not be empty"));
    } else if key.starts_with('/') {
        issues.push(ValidationIssue::new(path, "must be relative"));
    } else if key.split('/').any(|segment| segment == "..") {
        issues.push(ValidationIssue::new(path, "must not contain `..` segments"));
    }
}

fn url_batch_len(len: usize, path: &str, issues: &mut Vec<ValidationIssue>) {
    if len == 0 {
        issues.push(ValidationIssue::new(path, "must contain at least one request"));
    } else if len > MAX_URL_REQUESTS {
        issues.push(ValidationIssue::new(
            path,
            format!("must contain at most {MAX_URL_REQUESTS} requests"),
        ));
    }
}

impl Validate for EmitEventPayload {
    fn validate(&self, path: &str, issues: &mut Vec<ValidationIssue>) {
        non_empty(&self.event_identifier, field(path, "eventIdentifier"), issues);
    }
}

impl Validate for DbQueryPayload {
    fn validate(&self, path: &str, issues: &mut Vec<ValidationIssue>) {
        non_empty(&self.sql, field(path, "sql"), issues);
    }
}

impl Validate for DbExecPayload {
    fn validate(&self, path: &str, issues: &mut Vec<ValidationIssue>) {
        non_empty(&self.sql, field(path, "sql"), issues);
    }
}

impl Validate for DbBatchPayload {
    fn validate(&self, path: &str, issues: &mut Vec<ValidationIssue>) {
        if self.steps.is_empty() {
            issues.push(ValidationIssue::new(
                field(path, "steps"),
                "must contain at least one step",
            ));
        }
        for (idx, step) in self.steps.iter().enumerate() {
            non_empty(&step.sql, format!("{path}.steps[{idx}].sql"), issues);
        }
    }
}

impl Validate for SaveLogEntryPayload {
    fn validate(&self, path: &str, issues: &mut Vec<ValidationIssue>) {
        non_empty(&self.message, field(path, "message"), issues);
    }
}

impl Validate for ContentUrlRequests {
    fn validate(&self, path: &str, issues: &mut Vec<ValidationIssue>) {
        url_batch_len(self.0.len(), path, issues);
        for (idx, request) in self.0.iter().enumerate() {
            non_empty(&request.folder_id, format!("{path}[{idx}].folderId"), issues);
            object_key(&request.object_key, format!("{path}[{idx}].objectKey"), issues);
        }
    }
}

impl Validate for MetadataUrlRequests {
    fn validate(&self, path: &str, issues: &mut Vec<ValidationIssue>) {
        url_batch_len(self.0.len(), path, issues);
        for (idx, request) in self.0.iter().enumerate() {
            non_empty(&request.folder_id, format!("{path}[{idx}].folderId"), issues);
            object_key(&request.object_key, format!("{path}[{idx}].objectKey"), issues);
            non_empty(&request.content_hash, format!("{path}[{idx}].contentHash"), issues);
            non_empty(&request.metadata_hash, format!("{path}[{idx}].metadataHash"), issues);
        }
    }
}

impl Validate for AppStorageUrlRequests {
    fn validate(&self, path: &str, issues: &mut Vec<ValidationIssue>) {
        url_batch_len(self.0.len(), path, issues);
        for (idx, request) in self.0.iter().enumerate() {
            object_key(&request.object_key, format!("{path}[{idx}].objectKey"), issues);
        }
    }
}

impl Validate for AppUserAccessTokenPayload {
    fn validate(&self, path: &str, issues: &mut Vec<ValidationIssue>) {
        non_empty(&self.user_id, field(path, "userId"), issues);
    }
}

impl Validate for ContentMetadataUpdates {
    fn validate(&self, path: &str, issues: &mut Vec<ValidationIssue>) {
        url_batch_len(self.0.len(), path, issues);
        for (idx, update) in self.0.iter().enumerate() {
            non_empty(&update.folder_id, format!("{path}[{idx}].folderId"), issues);
            object_key(&update.object_key, format!("{path}[{idx}].objectKey"), issues);
            non_empty(&update.hash, format!("{path}[{idx}].hash"), issues);
            for (name, entry) in &update.metadata {
                non_empty(name, format!("{path}[{idx}].metadata"), issues);
                non_empty(
                    &entry.mime_type,
                    format!("{path}[{idx}].metadata.{name}.mimeType"),
                    issues,
                );
                non_empty(
                    &entry.hash,
                    format!("{path}[{idx}].metadata.{name}.hash"),
                    issues,
                );
            }
        }
    }
}

impl Validate for TaskIdPayload {
    fn validate(&self, path: &str, issues: &mut Vec<ValidationIssue>) {
        non_empty(&self.task_id, field(path, "taskId"), issues);
    }
}

impl Validate for ClaimAnyTaskPayload {
    fn validate(&self, path: &str, issues: &mut Vec<ValidationIssue>) {
        if self.task_identifiers.is_empty() {
            issues.push(ValidationIssue::new(
                field(path, "taskIdentifiers"),
                "must contain at least one task identifier",
            ));
        }
        for (idx, identifier) in self.task_identifiers.iter().enumerate() {
            non_empty(identifier, format!("{path}.taskIdentifiers[{idx}]"), issues);
        }
    }
}

impl Validate for FailTaskPayload {
    fn validate(&self, path: &str, issues: &mut Vec<ValidationIssue>) {
        non_empty(&self.task_id, field(path, "taskId"), issues);
        non_empty(&self.error.code, field(path, "error.code"), issues);
    }
}

impl Validate for AppUiBundlePayload {
    fn validate(&self, path: &str, issues: &mut Vec<ValidationIssue>) {
        non_empty(&self.app_identifier, field(path, "appIdentifier"), issues);
    }
}

impl Validate for WorkerExecutionDetailsPayload {
    fn validate(&self, path: &str, issues: &mut Vec<ValidationIssue>) {
        non_empty(&self.app_identifier, field(path, "appIdentifier"), issues);
        non_empty(&self.worker_identifier, field(path, "workerIdentifier"), issues);
    }
}

impl Validate for AuthenticateUserPayload {
    fn validate(&self, path: &str, issues: &mut Vec<ValidationIssue>) {
        non_empty(&self.token, field(path, "token"), issues);
        non_empty(&self.app_identifier, field(path, "appIdentifier"), issues);
    }
}
