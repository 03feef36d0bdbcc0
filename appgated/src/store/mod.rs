//! Persistence seams. Each concern gets its own trait so components only see
//! the slice of the store they need; [`SqliteStore`] implements all of them.

pub mod app_data;
pub mod sqlite;

use appgate_protocol::payloads::{LogLevel, MetadataEntry, TaskFailure};
use appgate_protocol::{Event, HandlerKind, ProtocolError, Task};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::app::AppRecord;
use crate::permissions::{AppFolderSettings, AppUserSettings};
use crate::storage::StorageLocation;

pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("store connection poisoned")]
    Poisoned,
    #[error("blocking store call failed: {0}")]
    Join(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for ProtocolError {
    fn from(err: StoreError) -> Self {
        ProtocolError::Internal(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderRecord {
    pub id: String,
    pub owner_id: String,
    pub content_location: StorageLocation,
    pub metadata_location: StorageLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntryRecord {
    pub id: String,
    pub app_identifier: String,
    pub handler_id: String,
    pub level: LogLevel,
    pub message: String,
    pub data: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContentMetadataRecord {
    pub folder_id: String,
    pub object_key: String,
    pub content_hash: String,
    pub metadata: BTreeMap<String, MetadataEntry>,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait AppStore: Send + Sync {
    async fn get_app(&self, identifier: &str) -> StoreResult<Option<AppRecord>>;
    async fn upsert_app(&self, app: AppRecord) -> StoreResult<()>;
    async fn list_enabled_apps(&self) -> StoreResult<Vec<AppRecord>>;
}

#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn get_user(&self, id: &str) -> StoreResult<Option<UserRecord>>;
    async fn upsert_user(&self, user: UserRecord) -> StoreResult<()>;
    async fn get_folder(&self, id: &str) -> StoreResult<Option<FolderRecord>>;
    async fn upsert_folder(&self, folder: FolderRecord) -> StoreResult<()>;
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_user_app_settings(
        &self,
        user_id: &str,
        app_identifier: &str,
    ) -> StoreResult<Option<AppUserSettings>>;
    async fn upsert_user_app_settings(&self, settings: AppUserSettings) -> StoreResult<()>;
    async fn get_folder_app_settings(
        &self,
        folder_id: &str,
        app_identifier: &str,
    ) -> StoreResult<Option<AppFolderSettings>>;
    /// All entries land in one transaction or none do.
    async fn upsert_folder_app_settings(
        &self,
        folder_id: &str,
        entries: Vec<AppFolderSettings>,
    ) -> StoreResult<()>;
}

/// Task persistence. The `try_*` methods are single conditional updates;
/// `Ok(false)` means the precondition no longer held.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_task(&self, task: Task) -> StoreResult<()>;
    async fn get_task(&self, id: &str) -> StoreResult<Option<Task>>;
    /// Oldest `WAITING` task owned by `owner` whose type is in `task_identifiers`.
    async fn find_claimable_task(
        &self,
        owner: &str,
        task_identifiers: &[String],
        handler: Option<HandlerKind>,
    ) -> StoreResult<Option<Task>>;
    async fn try_start_task(
        &self,
        task_id: &str,
        handler_id: &str,
        started_at: DateTime<Utc>,
    ) -> StoreResult<bool>;
    async fn try_complete_task(
        &self,
        task_id: &str,
        handler_id: &str,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<bool>;
    async fn try_fail_task(
        &self,
        task_id: &str,
        handler_id: &str,
        failure: TaskFailure,
        error_at: DateTime<Utc>,
    ) -> StoreResult<bool>;
    async fn list_started_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Task>>;
    /// Fails a task only if it is still the same started lease that was observed.
    async fn try_expire_task(
        &self,
        task_id: &str,
        observed_started_at: DateTime<Utc>,
        failure: TaskFailure,
        error_at: DateTime<Utc>,
    ) -> StoreResult<bool>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn get_event(&self, id: &str) -> StoreResult<Option<Event>>;
    /// Persists the event and the tasks it triggered in one transaction.
    async fn record_event(&self, event: Event, triggered: Vec<Task>) -> StoreResult<()>;
}

#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append_log_entry(&self, entry: LogEntryRecord) -> StoreResult<()>;
}

#[async_trait]
pub trait ContentMetadataStore: Send + Sync {
    async fn write_content_metadata(
        &self,
        records: Vec<ContentMetadataRecord>,
    ) -> StoreResult<usize>;
    async fn get_content_metadata(
        &self,
        folder_id: &str,
        object_key: &str,
    ) -> StoreResult<Option<ContentMetadataRecord>>;
}

/// Everything the gateway needs from one backing store.
pub trait Store:
    AppStore
    + DirectoryStore
    + SettingsStore
    + TaskStore
    + EventStore
    + LogStore
    + ContentMetadataStore
{
}

impl<T> Store for T where
    T: AppStore
        + DirectoryStore
        + SettingsStore
        + TaskStore
        + EventStore
        + LogStore
        + ContentMetadataStore
{
}
