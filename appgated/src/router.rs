//! Request dispatch.
//!
//! Frames are validated into an [`AppMessage`] first; `dispatch` then matches
//! every variant exhaustively, so each kind carries exactly one authorization
//! rule and one handler.

use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use appgate_protocol::payloads::{
    AppUiBundlePayload, AuthenticateUserPayload, ContentMetadataUpdates, EmitEventPayload,
    LogLevel, SaveLogEntryPayload, StorageMethod, WorkerExecutionDetailsPayload,
};
use appgate_protocol::results::{
    AppUiBundle, EmitEventResult, SaveLogEntryResult, UpdateContentMetadataResult,
    WorkerExecutionDetails,
};
use appgate_protocol::{
    parse_request, AppMessage, ErrorCode, MessageKind, ParsedRequest, ProtocolError,
    RejectedRequest, ResponseFrame,
};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

use crate::app::AppRecord;
use crate::events::{EventSink, StoreEventSink};
use crate::identity::{AppUserTokens, CallerIdentity};
use crate::permissions::{FolderPermission, PermissionEngine};
use crate::storage::{FolderAccess, StorageBroker};
use crate::store::app_data::AppDataStore;
use crate::store::{
    ContentMetadataRecord, ContentMetadataStore, FolderRecord, LogEntryRecord, LogStore, Store,
};
use crate::tasks::{ClaimPolicy, LeaseManager};

pub const APP_LOG_TARGET: &str = "app_log";
pub const UI_BUNDLE_FILE: &str = "ui.zip";
pub const WORKER_BUNDLE_FILE: &str = "worker.zip";

pub struct Router {
    permissions: PermissionEngine,
    leases: LeaseManager,
    storage: StorageBroker,
    app_data: Arc<dyn AppDataStore>,
    events: Arc<dyn EventSink>,
    logs: Arc<dyn LogStore>,
    metadata: Arc<dyn ContentMetadataStore>,
    user_tokens: AppUserTokens,
}

/// Storage policy for one calling app.
struct AppFolderAccess<'a> {
    permissions: &'a PermissionEngine,
    app: &'a AppRecord,
}

#[async_trait]
impl FolderAccess for AppFolderAccess<'_> {
    async fn authorize(
        &self,
        folder_id: &str,
        methods: &[StorageMethod],
    ) -> Result<FolderRecord, ProtocolError> {
        self.permissions
            .check_storage_access(self.app, folder_id, methods)
            .await
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value, ProtocolError> {
    serde_json::to_value(value)
        .map_err(|err| ProtocolError::Internal(format!("failed to encode result: {err}")))
}

fn require_privileged(caller: &CallerIdentity, kind: MessageKind) -> Result<(), ProtocolError> {
    if !kind.is_privileged() || caller.privileged {
        Ok(())
    } else {
        Err(ProtocolError::Forbidden(format!(
            "{kind} is restricted to the privileged app"
        )))
    }
}

fn require_enabled(app: &AppRecord) -> Result<(), ProtocolError> {
    if app.enabled {
        Ok(())
    } else {
        Err(ProtocolError::Forbidden(format!(
            "app `{}` is disabled",
            app.identifier
        )))
    }
}

impl Router {
    pub fn new<S: Store + 'static>(
        store: Arc<S>,
        app_data: Arc<dyn AppDataStore>,
        storage: StorageBroker,
        user_tokens: AppUserTokens,
        policy: ClaimPolicy,
    ) -> Self {
        Self {
            permissions: PermissionEngine::new(store.clone(), store.clone(), store.clone()),
            leases: LeaseManager::new(store.clone(), store.clone(), policy),
            storage,
            app_data,
            events: Arc::new(StoreEventSink::new(store.clone(), store.clone())),
            logs: store.clone(),
            metadata: store,
            user_tokens,
        }
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn permissions(&self) -> &PermissionEngine {
        &self.permissions
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    /// Validates, dispatches and wraps the outcome. Never fails: panics and
    /// downstream errors come back as error frames.
    pub async fn handle_frame(&self, caller: &CallerIdentity, frame: &Value) -> ResponseFrame {
        let ParsedRequest { id, message } = match parse_request(frame) {
            Ok(parsed) => parsed,
            Err(RejectedRequest { id, error }) => {
                warn!(app = %caller.app_identifier, %error, "rejected malformed request");
                return ResponseFrame::err(id, &error);
            }
        };

        let kind = message.kind();
        let span = info_span!(
            "request",
            app = %caller.app_identifier,
            handler_id = %caller.handler_id(),
            kind = %kind
        );
        let outcome = AssertUnwindSafe(self.dispatch(caller, message))
            .catch_unwind()
            .instrument(span.clone())
            .await;

        let _entered = span.enter();
        match outcome {
            Ok(Ok(result)) => {
                debug!("request handled");
                ResponseFrame::ok(id, result)
            }
            Ok(Err(err)) => {
                if err.code() == ErrorCode::Internal {
                    error!(%err, "request failed");
                } else {
                    warn!(code = err.code().as_u16(), %err, "request refused");
                }
                ResponseFrame::err(id, &err)
            }
            Err(_) => {
                error!("handler panicked");
                ResponseFrame::err(
                    id,
                    &ProtocolError::Internal("internal error while handling request".into()),
                )
            }
        }
    }

    pub async fn dispatch(
        &self,
        caller: &CallerIdentity,
        message: AppMessage,
    ) -> Result<Value, ProtocolError> {
        require_privileged(caller, message.kind())?;
        match message {
            AppMessage::EmitEvent(payload) => self.emit_event(caller, payload).await,
            AppMessage::DbQuery(payload) => {
                to_value(self.app_data.query(&caller.app_identifier, payload).await?)
            }
            AppMessage::DbExec(payload) => {
                to_value(self.app_data.exec(&caller.app_identifier, payload).await?)
            }
            AppMessage::DbBatch(payload) => {
                to_value(self.app_data.batch(&caller.app_identifier, payload).await?)
            }
            AppMessage::SaveLogEntry(payload) => self.save_log_entry(caller, payload).await,
            AppMessage::GetContentSignedUrls(requests) => {
                let app = self.permissions.app(&caller.app_identifier).await?;
                let access = AppFolderAccess {
                    permissions: &self.permissions,
                    app: &app,
                };
                to_value(self.storage.content_urls(&requests.0, &access).await?)
            }
            AppMessage::GetMetadataSignedUrls(requests) => {
                let app = self.permissions.app(&caller.app_identifier).await?;
                let access = AppFolderAccess {
                    permissions: &self.permissions,
                    app: &app,
                };
                to_value(self.storage.metadata_urls(&requests.0, &access).await?)
            }
            AppMessage::GetAppStorageSignedUrls(requests) => {
                let app = self.permissions.app(&caller.app_identifier).await?;
                require_enabled(&app)?;
                to_value(
                    self.storage
                        .app_storage_urls(&app.identifier, &requests.0)?,
                )
            }
            AppMessage::GetAppUserAccessToken(payload) => {
                let app = self.permissions.app(&caller.app_identifier).await?;
                self.permissions
                    .check_user_access(&app, &payload.user_id)
                    .await?;
                let token = self
                    .user_tokens
                    .mint(&payload.user_id, &app.identifier)
                    .map_err(|err| ProtocolError::Internal(err.to_string()))?;
                to_value(token)
            }
            AppMessage::UpdateContentMetadata(updates) => {
                self.update_content_metadata(caller, updates).await
            }
            AppMessage::CompleteHandleTask(payload) => {
                to_value(self.leases.complete(caller, &payload.task_id).await?)
            }
            AppMessage::AttemptStartHandleAnyAvailableTask(payload) => to_value(
                self.leases
                    .claim_any_available(caller, &payload.task_identifiers)
                    .await?,
            ),
            AppMessage::FailHandleTask(payload) => to_value(
                self.leases
                    .fail(caller, &payload.task_id, payload.error)
                    .await?,
            ),
            AppMessage::AttemptStartHandleWorkerTaskById(payload) => {
                to_value(self.leases.claim_by_id(caller, &payload.task_id).await?)
            }
            AppMessage::GetAppUiBundle(payload) => self.app_ui_bundle(caller, payload).await,
            AppMessage::GetWorkerExecutionDetails(payload) => {
                self.worker_execution_details(caller, payload).await
            }
            AppMessage::AuthenticateUser(payload) => self.authenticate_user(caller, payload),
        }
    }

    async fn emit_event(
        &self,
        caller: &CallerIdentity,
        payload: EmitEventPayload,
    ) -> Result<Value, ProtocolError> {
        let app = self.permissions.app(&caller.app_identifier).await?;
        require_enabled(&app)?;
        if !app.can_emit(&payload.event_identifier) {
            return Err(ProtocolError::Forbidden(format!(
                "app `{}` may not emit `{}`",
                app.identifier, payload.event_identifier
            )));
        }
        let event_id = self
            .events
            .publish(&app, &payload.event_identifier, payload.data)
            .await?;
        to_value(EmitEventResult { event_id })
    }

    async fn save_log_entry(
        &self,
        caller: &CallerIdentity,
        payload: SaveLogEntryPayload,
    ) -> Result<Value, ProtocolError> {
        let handler_id = caller.handler_id();
        let entry = LogEntryRecord {
            id: Uuid::new_v4().to_string(),
            app_identifier: caller.app_identifier.clone(),
            handler_id: handler_id.clone(),
            level: payload.level,
            message: payload.message,
            data: payload.data,
            created_at: Utc::now(),
        };
        reemit(&entry);
        let log_entry_id = entry.id.clone();
        self.logs.append_log_entry(entry).await?;
        to_value(SaveLogEntryResult { log_entry_id })
    }

    async fn update_content_metadata(
        &self,
        caller: &CallerIdentity,
        updates: ContentMetadataUpdates,
    ) -> Result<Value, ProtocolError> {
        let app = self.permissions.app(&caller.app_identifier).await?;
        let required = BTreeSet::from([FolderPermission::WriteObjectsMetadata]);
        let folders: BTreeSet<&str> = updates.0.iter().map(|u| u.folder_id.as_str()).collect();
        for folder_id in folders {
            self.permissions
                .check_folder_access(&app, folder_id, &required)
                .await?;
        }

        let updated_by = caller.handler_id();
        let updated_at = Utc::now();
        let records = updates
            .0
            .into_iter()
            .map(|update| ContentMetadataRecord {
                folder_id: update.folder_id,
                object_key: update.object_key,
                content_hash: update.hash,
                metadata: update.metadata,
                updated_by: updated_by.clone(),
                updated_at,
            })
            .collect();
        let updated = self.metadata.write_content_metadata(records).await?;
        to_value(UpdateContentMetadataResult { updated })
    }

    async fn app_ui_bundle(
        &self,
        caller: &CallerIdentity,
        payload: AppUiBundlePayload,
    ) -> Result<Value, ProtocolError> {
        let app = self.permissions.app(&payload.app_identifier).await?;
        let ui = app.manifest.ui.as_ref().ok_or_else(|| {
            ProtocolError::NotFound(format!("app `{}` has no UI bundle", app.identifier))
        })?;
        let bundle_url = self
            .storage
            .bundle_url(&app.identifier, &ui.bundle_hash, UI_BUNDLE_FILE)?;
        to_value(AppUiBundle {
            app_identifier: app.identifier.clone(),
            bundle_hash: ui.bundle_hash.clone(),
            bundle_url,
        })
    }

    async fn worker_execution_details(
        &self,
        caller: &CallerIdentity,
        payload: WorkerExecutionDetailsPayload,
    ) -> Result<Value, ProtocolError> {
        let app = self.permissions.app(&payload.app_identifier).await?;
        let worker = app
            .manifest
            .workers
            .get(&payload.worker_identifier)
            .ok_or_else(|| {
                ProtocolError::NotFound(format!(
                    "app `{}` has no worker `{}`",
                    app.identifier, payload.worker_identifier
                ))
            })?;
        let bundle_url =
            self.storage
                .bundle_url(&app.identifier, &worker.bundle_hash, WORKER_BUNDLE_FILE)?;
        to_value(WorkerExecutionDetails {
            app_identifier: app.identifier.clone(),
            worker_identifier: payload.worker_identifier,
            bundle_hash: worker.bundle_hash.clone(),
            entrypoint: worker.entrypoint.clone(),
            bundle_url,
            environment_variables: worker.environment.clone(),
        })
    }

    fn authenticate_user(
        &self,
        caller: &CallerIdentity,
        payload: AuthenticateUserPayload,
    ) -> Result<Value, ProtocolError> {
        if !caller.privileged && payload.app_identifier != caller.app_identifier {
            return Err(ProtocolError::Forbidden(format!(
                "`{}` may only authenticate its own users",
                caller.app_identifier
            )));
        }
        let user = self
            .user_tokens
            .authenticate(&payload.token, &payload.app_identifier)?;
        to_value(user)
    }
}

fn reemit(entry: &LogEntryRecord) {
    let app = entry.app_identifier.as_str();
    let handler_id = entry.handler_id.as_str();
    let data = entry.data.as_ref();
    let message = entry.message.as_str();
    match entry.level {
        LogLevel::Trace => {
            trace!(target: APP_LOG_TARGET, %app, %handler_id, ?data, "{}", message)
        }
        LogLevel::Debug => {
            debug!(target: APP_LOG_TARGET, %app, %handler_id, ?data, "{}", message)
        }
        LogLevel::Info => {
            info!(target: APP_LOG_TARGET, %app, %handler_id, ?data, "{}", message)
        }
        LogLevel::Warn => {
            warn!(target: APP_LOG_TARGET, %app, %handler_id, ?data, "{}", message)
        }
        LogLevel::Error => {
            error!(target: APP_LOG_TARGET, %app, %handler_id, ?data, "{}", message)
        }
    }
}
