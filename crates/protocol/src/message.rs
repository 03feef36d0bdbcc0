use serde_json::Value;

use crate::envelope::RequestFrame;
use crate::kind::MessageKind;
use crate::payloads::*;

/// A request whose payload already passed schema validation.
///
/// Every [`MessageKind`] has exactly one variant here; adding a kind without a
/// variant (and a decoder in [`crate::schema`]) does not compile.
#[derive(Debug, Clone, PartialEq)]
pub enum AppMessage {
    EmitEvent(EmitEventPayload),
    DbQuery(DbQueryPayload),
    DbExec(DbExecPayload),
    DbBatch(DbBatchPayload),
    SaveLogEntry(SaveLogEntryPayload),
    GetContentSignedUrls(ContentUrlRequests),
    GetAppUserAccessToken(AppUserAccessTokenPayload),
    GetMetadataSignedUrls(MetadataUrlRequests),
    UpdateContentMetadata(ContentMetadataUpdates),
    CompleteHandleTask(TaskIdPayload),
    AttemptStartHandleAnyAvailableTask(ClaimAnyTaskPayload),
    FailHandleTask(FailTaskPayload),
    AttemptStartHandleWorkerTaskById(TaskIdPayload),
    GetAppUiBundle(AppUiBundlePayload),
    GetWorkerExecutionDetails(WorkerExecutionDetailsPayload),
    GetAppStorageSignedUrls(AppStorageUrlRequests),
    AuthenticateUser(AuthenticateUserPayload),
}

impl AppMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            AppMessage::EmitEvent(_) => MessageKind::EmitEvent,
            AppMessage::DbQuery(_) => MessageKind::DbQuery,
            AppMessage::DbExec(_) => MessageKind::DbExec,
            AppMessage::DbBatch(_) => MessageKind::DbBatch,
            AppMessage::SaveLogEntry(_) => MessageKind::SaveLogEntry,
            AppMessage::GetContentSignedUrls(_) => MessageKind::GetContentSignedUrls,
            AppMessage::GetAppUserAccessToken(_) => MessageKind::GetAppUserAccessToken,
            AppMessage::GetMetadataSignedUrls(_) => MessageKind::GetMetadataSignedUrls,
            AppMessage::UpdateContentMetadata(_) => MessageKind::UpdateContentMetadata,
            AppMessage::CompleteHandleTask(_) => MessageKind::CompleteHandleTask,
            AppMessage::AttemptStartHandleAnyAvailableTask(_) => {
                MessageKind::AttemptStartHandleAnyAvailableTask
            }
            AppMessage::FailHandleTask(_) => MessageKind::FailHandleTask,
            AppMessage::AttemptStartHandleWorkerTaskById(_) => {
                MessageKind::AttemptStartHandleWorkerTaskById
            }
            AppMessage::GetAppUiBundle(_) => MessageKind::GetAppUiBundle,
            AppMessage::GetWorkerExecutionDetails(_) => MessageKind::GetWorkerExecutionDetails,
            AppMessage::GetAppStorageSignedUrls(_) => MessageKind::GetAppStorageSignedUrls,
            AppMessage::AuthenticateUser(_) => MessageKind::AuthenticateUser,
        }
    }

    /// Serializes the payload back into the untyped `data` member.
    pub fn payload(&self) -> serde_json::Result<Value> {
        match self {
            AppMessage::EmitEvent(p) => serde_json::to_value(p),
            AppMessage::DbQuery(p) => serde_json::to_value(p),
            AppMessage::DbExec(p) => serde_json::to_value(p),
            AppMessage::DbBatch(p) => serde_json::to_value(p),
            AppMessage::SaveLogEntry(p) => serde_json::to_value(p),
            AppMessage::GetContentSignedUrls(p) => serde_json::to_value(p),
            AppMessage::GetAppUserAccessToken(p) => serde_json::to_value(p),
            AppMessage::GetMetadataSignedUrls(p) => serde_json::to_value(p),
            AppMessage::UpdateContentMetadata(p) => serde_json::to_value(p),
            AppMessage::CompleteHandleTask(p) => serde_json::to_value(p),
            AppMessage::AttemptStartHandleAnyAvailableTask(p) => serde_json::to_value(p),
            AppMessage::FailHandleTask(p) => serde_json::to_value(p),
            AppMessage::AttemptStartHandleWorkerTaskById(p) => serde_json::to_value(p),
            AppMessage::GetAppUiBundle(p) => serde_json::to_value(p),
            AppMessage::GetWorkerExecutionDetails(p) => serde_json::to_value(p),
            AppMessage::GetAppStorageSignedUrls(p) => serde_json::to_value(p),
            AppMessage::AuthenticateUser(p) => serde_json::to_value(p),
        }
    }

    pub fn to_frame(&self, id: Option<String>) -> serde_json::Result<RequestFrame> {
        Ok(RequestFrame {
            id,
            name: self.kind().as_str().to_string(),
            data: self.payload()?,
        })
    }
}
