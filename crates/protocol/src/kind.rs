use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Closed set of request names an app may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    EmitEvent,
    DbQuery,
    DbExec,
    DbBatch,
    SaveLogEntry,
    GetContentSignedUrls,
    GetAppUserAccessToken,
    GetMetadataSignedUrls,
    UpdateContentMetadata,
    CompleteHandleTask,
    AttemptStartHandleAnyAvailableTask,
    FailHandleTask,
    AttemptStartHandleWorkerTaskById,
    GetAppUiBundle,
    GetWorkerExecutionDetails,
    GetAppStorageSignedUrls,
    AuthenticateUser,
}

impl MessageKind {
    pub const ALL: [MessageKind; 17] = [
        MessageKind::EmitEvent,
        MessageKind::DbQuery,
        MessageKind::DbExec,
        MessageKind::DbBatch,
        MessageKind::SaveLogEntry,
        MessageKind::GetContentSignedUrls,
        MessageKind::GetAppUserAccessToken,
        MessageKind::GetMetadataSignedUrls,
        MessageKind::UpdateContentMetadata,
        MessageKind::CompleteHandleTask,
        MessageKind::AttemptStartHandleAnyAvailableTask,
        MessageKind::FailHandleTask,
        MessageKind::AttemptStartHandleWorkerTaskById,
        MessageKind::GetAppUiBundle,
        MessageKind::GetWorkerExecutionDetails,
        MessageKind::GetAppStorageSignedUrls,
        MessageKind::AuthenticateUser,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            MessageKind::EmitEvent => "EMIT_EVENT",
            MessageKind::DbQuery => "DB_QUERY",
            MessageKind::DbExec => "DB_EXEC",
            MessageKind::DbBatch => "DB_BATCH",
            MessageKind::SaveLogEntry => "SAVE_LOG_ENTRY",
            MessageKind::GetContentSignedUrls => "GET_CONTENT_SIGNED_URLS",
            MessageKind::GetAppUserAccessToken => "GET_APP_USER_ACCESS_TOKEN",
            MessageKind::GetMetadataSignedUrls => "GET_METADATA_SIGNED_URLS",
            MessageKind::UpdateContentMetadata => "UPDATE_CONTENT_METADATA",
            MessageKind::CompleteHandleTask => "COMPLETE_HANDLE_TASK",
            MessageKind::AttemptStartHandleAnyAvailableTask => {
                "ATTEMPT_START_HANDLE_ANY_AVAILABLE_TASK"
            }
            MessageKind::FailHandleTask => "FAIL_HANDLE_TASK",
            MessageKind::AttemptStartHandleWorkerTaskById => {
                "ATTEMPT_START_HANDLE_WORKER_TASK_BY_ID"
            }
            MessageKind::GetAppUiBundle => "GET_APP_UI_BUNDLE",
            MessageKind::GetWorkerExecutionDetails => "GET_WORKER_EXECUTION_DETAILS",
            MessageKind::GetAppStorageSignedUrls => "GET_APP_STORAGE_SIGNED_URLS",
            MessageKind::AuthenticateUser => "AUTHENTICATE_USER",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Requests only the privileged core app may issue.
    pub fn is_privileged(self) -> bool {
        matches!(
            self,
            MessageKind::GetAppUiBundle
                | MessageKind::GetWorkerExecutionDetails
                | MessageKind::AttemptStartHandleWorkerTaskById
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| format!("unknown message kind `{s}`"))
    }
}
