//! appgate Client Library
//!
//! Apps hold one [`AppClient`] per connection: it performs the session
//! handshake and then issues typed requests, one at a time, over the same
//! stream.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use appgate_protocol::payloads::{
    AppStorageUrlRequest, AppStorageUrlRequests, AppUiBundlePayload, AppUserAccessTokenPayload,
    AuthenticateUserPayload, ClaimAnyTaskPayload, ContentMetadataUpdate, ContentMetadataUpdates,
    ContentUrlRequest, ContentUrlRequests, DbBatchPayload, DbExecPayload, DbQueryPayload,
    EmitEventPayload, FailTaskPayload, LogLevel, MetadataUrlRequest, MetadataUrlRequests,
    RowMode, SaveLogEntryPayload, SqlParam, TaskFailure, TaskIdPayload,
    WorkerExecutionDetailsPayload,
};
use appgate_protocol::results::{
    AppUiBundle, AppUserAccessToken, AuthenticatedUser, ClaimedTask, DbBatchResult,
    DbExecResult, DbQueryResult, EmitEventResult, SaveLogEntryResult, SignedUrl, TaskResult,
    UpdateContentMetadataResult, WorkerExecutionDetails,
};
use appgate_protocol::{
    AppMessage, ConnectRequest, ConnectResponse, ErrorBody, ErrorCode, ProtocolError,
    ResponseFrame, Task, PROTOCOL_VERSION,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

pub use appgate_protocol::session::{mint_app_session_token, mint_privileged_session_token};
pub use appgate_protocol::DEFAULT_SOCK;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("disconnected")]
    Disconnected,
    #[error("handshake rejected: {0}")]
    Handshake(ProtocolError),
    #[error("request rejected: {0}")]
    Rejected(ProtocolError),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("timeout")]
    Timeout,
}

impl ClientError {
    /// Status code when the daemon answered with an error frame.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Handshake(err) | ClientError::Rejected(err) => Some(err.code()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    // Survives a cancelled read so the next call resumes the same line.
    buf: Vec<u8>,
}

impl Connection {
    async fn send(&mut self, value: &impl serde::Serialize) -> Result<()> {
        let line = serde_json::to_string(value)? + "\n";
        self.writer.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<String> {
        loop {
            if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
                return Err(ClientError::Disconnected);
            }
            let line = String::from_utf8(std::mem::take(&mut self.buf))
                .map_err(|err| ClientError::InvalidResponse(err.to_string()))?;
            let raw = line.trim();
            if !raw.is_empty() {
                return Ok(raw.to_string());
            }
        }
    }

    /// Waits for the response to request `expected`, dropping responses to
    /// earlier requests that timed out.
    async fn receive_response(&mut self, expected: u64) -> Result<ResponseFrame> {
        loop {
            let raw = self.receive().await?;
            let response: ResponseFrame = serde_json::from_str(&raw)?;
            match response.id.as_deref().map(str::parse::<u64>) {
                Some(Ok(id)) if id == expected => return Ok(response),
                Some(Ok(id)) if id < expected => {
                    debug!(id, expected, "discarding late response");
                }
                _ => {
                    return Err(ClientError::InvalidResponse(format!(
                        "expected response {expected}, got {:?}",
                        response.id
                    )));
                }
            }
        }
    }
}

#[derive(Deserialize)]
struct HandshakeError {
    error: ErrorBody,
}

/// A connected, authenticated app session.
pub struct AppClient {
    handler_id: String,
    daemon_version: String,
    request_timeout: Option<Duration>,
    next_id: AtomicU64,
    conn: Mutex<Connection>,
}

impl AppClient {
    /// Connects and completes the session handshake.
    pub async fn connect<P: AsRef<Path>>(
        sock: P,
        app_identifier: &str,
        instance_id: &str,
        token: &str,
    ) -> Result<Self> {
        let stream = UnixStream::connect(sock.as_ref()).await?;
        let (reader, writer) = stream.into_split();
        let mut conn = Connection {
            reader: BufReader::new(reader),
            writer,
            buf: Vec::new(),
        };

        conn.send(&ConnectRequest {
            app_identifier: app_identifier.to_string(),
            instance_id: instance_id.to_string(),
            token: token.to_string(),
            version: Some(PROTOCOL_VERSION.to_string()),
        })
        .await?;

        let raw = conn.receive().await?;
        if let Ok(rejected) = serde_json::from_str::<HandshakeError>(&raw) {
            return Err(ClientError::Handshake(ProtocolError::from_body(rejected.error)));
        }
        let accepted: ConnectResponse = serde_json::from_str(&raw)
            .map_err(|err| ClientError::InvalidResponse(format!("handshake: {err}")))?;
        debug!(
            handler_id = %accepted.handler_id,
            "connected to appgated {}",
            accepted.daemon_version
        );

        Ok(Self {
            handler_id: accepted.handler_id,
            daemon_version: accepted.daemon_version,
            request_timeout: None,
            next_id: AtomicU64::new(1),
            conn: Mutex::new(conn),
        })
    }

    /// Fails requests whose response takes longer than `limit`.
    pub fn with_request_timeout(mut self, limit: Duration) -> Self {
        self.request_timeout = Some(limit);
        self
    }

    /// `<appIdentifier>:<instanceId>` as assigned by the daemon.
    pub fn handler_id(&self) -> &str {
        &self.handler_id
    }

    pub fn daemon_version(&self) -> &str {
        &self.daemon_version
    }

    /// Sends one request and waits for its response. After a timeout the
    /// late response is skipped by the next request.
    pub async fn request(&self, message: AppMessage) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = message.to_frame(Some(id.to_string()))?;

        let mut conn = self.conn.lock().await;
        conn.send(&frame).await?;
        let response = match self.request_timeout {
            Some(limit) => timeout(limit, conn.receive_response(id))
                .await
                .map_err(|_| ClientError::Timeout)??,
            None => conn.receive_response(id).await?,
        };
        drop(conn);

        response.into_result().map_err(ClientError::Rejected)
    }

    async fn call<T: DeserializeOwned>(&self, message: AppMessage) -> Result<T> {
        let value = self.request(message).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn emit_event(
        &self,
        event_identifier: &str,
        data: Map<String, Value>,
    ) -> Result<EmitEventResult> {
        self.call(AppMessage::EmitEvent(EmitEventPayload {
            event_identifier: event_identifier.to_string(),
            data,
        }))
        .await
    }

    pub async fn db_query(
        &self,
        sql: &str,
        params: Vec<SqlParam>,
        row_mode: RowMode,
    ) -> Result<DbQueryResult> {
        self.call(AppMessage::DbQuery(DbQueryPayload {
            sql: sql.to_string(),
            params,
            row_mode,
        }))
        .await
    }

    pub async fn db_exec(&self, sql: &str, params: Vec<SqlParam>) -> Result<DbExecResult> {
        self.call(AppMessage::DbExec(DbExecPayload {
            sql: sql.to_string(),
            params,
        }))
        .await
    }

    pub async fn db_batch(&self, batch: DbBatchPayload) -> Result<DbBatchResult> {
        self.call(AppMessage::DbBatch(batch)).await
    }

    pub async fn save_log_entry(
        &self,
        level: LogLevel,
        message: &str,
        data: Option<Value>,
    ) -> Result<SaveLogEntryResult> {
        self.call(AppMessage::SaveLogEntry(SaveLogEntryPayload {
            message: message.to_string(),
            level,
            data,
        }))
        .await
    }

    pub async fn content_signed_urls(
        &self,
        requests: Vec<ContentUrlRequest>,
    ) -> Result<Vec<SignedUrl>> {
        self.call(AppMessage::GetContentSignedUrls(ContentUrlRequests(requests)))
            .await
    }

    pub async fn metadata_signed_urls(
        &self,
        requests: Vec<MetadataUrlRequest>,
    ) -> Result<Vec<SignedUrl>> {
        self.call(AppMessage::GetMetadataSignedUrls(MetadataUrlRequests(
            requests,
        )))
        .await
    }

    pub async fn app_storage_signed_urls(
        &self,
        requests: Vec<AppStorageUrlRequest>,
    ) -> Result<Vec<SignedUrl>> {
        self.call(AppMessage::GetAppStorageSignedUrls(AppStorageUrlRequests(
            requests,
        )))
        .await
    }

    pub async fn app_user_access_token(&self, user_id: &str) -> Result<AppUserAccessToken> {
        self.call(AppMessage::GetAppUserAccessToken(AppUserAccessTokenPayload {
            user_id: user_id.to_string(),
        }))
        .await
    }

    pub async fn update_content_metadata(
        &self,
        updates: Vec<ContentMetadataUpdate>,
    ) -> Result<UpdateContentMetadataResult> {
        self.call(AppMessage::UpdateContentMetadata(ContentMetadataUpdates(
            updates,
        )))
        .await
    }

    pub async fn claim_any_task(&self, task_identifiers: &[String]) -> Result<ClaimedTask> {
        self.call(AppMessage::AttemptStartHandleAnyAvailableTask(
            ClaimAnyTaskPayload {
                task_identifiers: task_identifiers.to_vec(),
            },
        ))
        .await
    }

    pub async fn claim_worker_task(&self, task_id: &str) -> Result<ClaimedTask> {
        self.call(AppMessage::AttemptStartHandleWorkerTaskById(TaskIdPayload {
            task_id: task_id.to_string(),
        }))
        .await
    }

    pub async fn complete_task(&self, task_id: &str) -> Result<Task> {
        let result: TaskResult = self
            .call(AppMessage::CompleteHandleTask(TaskIdPayload {
                task_id: task_id.to_string(),
            }))
            .await?;
        Ok(result.task)
    }

    pub async fn fail_task(&self, task_id: &str, error: TaskFailure) -> Result<Task> {
        let result: TaskResult = self
            .call(AppMessage::FailHandleTask(FailTaskPayload {
                task_id: task_id.to_string(),
                error,
            }))
            .await?;
        Ok(result.task)
    }

    pub async fn app_ui_bundle(&self, app_identifier: &str) -> Result<AppUiBundle> {
        self.call(AppMessage::GetAppUiBundle(AppUiBundlePayload {
            app_identifier: app_identifier.to_string(),
        }))
        .await
    }

    pub async fn worker_execution_details(
        &self,
        app_identifier: &str,
        worker_identifier: &str,
    ) -> Result<WorkerExecutionDetails> {
        self.call(AppMessage::GetWorkerExecutionDetails(
            WorkerExecutionDetailsPayload {
                app_identifier: app_identifier.to_string(),
                worker_identifier: worker_identifier.to_string(),
            },
        ))
        .await
    }

    pub async fn authenticate_user(
        &self,
        token: &str,
        app_identifier: &str,
    ) -> Result<AuthenticatedUser> {
        self.call(AppMessage::AuthenticateUser(AuthenticateUserPayload {
            token: token.to_string(),
            app_identifier: app_identifier.to_string(),
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::UnixListener;

    /// Accepts one connection, answers the handshake with `handshake`, then
    /// replies to every request line with `respond(frame)`.
    async fn fake_daemon<F>(
        dir: &tempfile::TempDir,
        handshake: Value,
        respond: F,
    ) -> std::path::PathBuf
    where
        F: Fn(Value) -> Value + Send + 'static,
    {
        fake_daemon_paced(dir, handshake, respond, |_| Duration::ZERO).await
    }

    /// Like [`fake_daemon`], sleeping `pace(frame)` before each reply.
    async fn fake_daemon_paced<F, P>(
        dir: &tempfile::TempDir,
        handshake: Value,
        respond: F,
        pace: P,
    ) -> std::path::PathBuf
    where
        F: Fn(Value) -> Value + Send + 'static,
        P: Fn(&Value) -> Duration + Send + 'static,
    {
        let path = dir.path().join("fake.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            writer
                .write_all(format!("{handshake}\n").as_bytes())
                .await
                .unwrap();
            loop {
                line.clear();
                if reader.read_line(&mut line).await.unwrap() == 0 {
                    break;
                }
                let frame: Value = serde_json::from_str(line.trim()).unwrap();
                tokio::time::sleep(pace(&frame)).await;
                let reply = respond(frame);
                writer
                    .write_all(format!("{reply}\n").as_bytes())
                    .await
                    .unwrap();
            }
        });
        path
    }

    #[tokio::test]
    async fn handshake_error_is_surfaced_with_code() {
        let dir = tempfile::tempdir().unwrap();
        let sock = fake_daemon(
            &dir,
            json!({ "error": { "code": 401, "message": "bad token" } }),
            |_| json!({}),
        )
        .await;

        let err = AppClient::connect(&sock, "gallery", "w1", "t")
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), Some(ErrorCode::Unauthorized));
    }

    #[tokio::test]
    async fn typed_helpers_decode_results_and_errors() {
        let dir = tempfile::tempdir().unwrap();
        let sock = fake_daemon(
            &dir,
            json!({ "handlerId": "gallery:w1", "daemonVersion": "0.1.0" }),
            |frame| match frame["name"].as_str() {
                Some("EMIT_EVENT") => json!({ "id": frame["id"], "result": { "eventId": "e1" } }),
                _ => json!({
                    "id": frame["id"],
                    "error": { "code": 409, "message": "lost the claim race 5 times" }
                }),
            },
        )
        .await;

        let client = AppClient::connect(&sock, "gallery", "w1", "t").await.unwrap();
        assert_eq!(client.handler_id(), "gallery:w1");

        let emitted = client.emit_event("photo_tagged", Map::new()).await.unwrap();
        assert_eq!(emitted.event_id, "e1");

        let err = client
            .claim_any_task(&["thumbnail".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::Conflict));
    }

    #[tokio::test]
    async fn mismatched_response_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sock = fake_daemon(
            &dir,
            json!({ "handlerId": "gallery:w1", "daemonVersion": "0.1.0" }),
            |_| json!({ "id": "999", "result": {} }),
        )
        .await;

        let client = AppClient::connect(&sock, "gallery", "w1", "t").await.unwrap();
        let err = client.complete_task("t1").await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn late_responses_are_skipped_after_a_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let sock = fake_daemon_paced(
            &dir,
            json!({ "handlerId": "gallery:w1", "daemonVersion": "0.1.0" }),
            |frame| json!({ "id": frame["id"], "result": { "eventId": frame["id"] } }),
            |frame| {
                if frame["id"] == json!("1") {
                    Duration::from_millis(200)
                } else {
                    Duration::ZERO
                }
            },
        )
        .await;

        let client = AppClient::connect(&sock, "gallery", "w1", "t")
            .await
            .unwrap()
            .with_request_timeout(Duration::from_millis(50));
        let first = client.emit_event("photo_tagged", Map::new()).await;
        assert!(matches!(first, Err(ClientError::Timeout)));

        // Let the reply to request 1 land in the stream before asking again.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let second = client.emit_event("photo_tagged", Map::new()).await.unwrap();
        assert_eq!(second.event_id, "2");
        let third = client.emit_event("photo_tagged", Map::new()).await.unwrap();
        assert_eq!(third.event_id, "3");
    }
}
