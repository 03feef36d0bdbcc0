//! SQLite-backed [`Store`](super::Store). One connection behind a mutex; every
//! call hops onto the blocking pool so the event loop never waits on disk.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use appgate_protocol::payloads::TaskFailure;
use appgate_protocol::{Event, HandlerKind, Task};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tokio::task;

use super::*;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS apps (
    identifier TEXT PRIMARY KEY,
    enabled INTEGER NOT NULL,
    manifest TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    username TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS folders (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    content_location TEXT NOT NULL,
    metadata_location TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS app_user_settings (
    user_id TEXT NOT NULL,
    app_identifier TEXT NOT NULL,
    enabled INTEGER,
    folder_scope_enabled_default INTEGER,
    folder_scope_permissions_default TEXT,
    permissions TEXT,
    PRIMARY KEY (user_id, app_identifier)
);
CREATE TABLE IF NOT EXISTS app_folder_settings (
    folder_id TEXT NOT NULL,
    app_identifier TEXT NOT NULL,
    enabled INTEGER,
    permissions TEXT,
    PRIMARY KEY (folder_id, app_identifier)
);
CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    emitter_identifier TEXT NOT NULL,
    event_identifier TEXT NOT NULL,
    data TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    owner_identifier TEXT NOT NULL,
    handler_identifier TEXT NOT NULL,
    handler_id TEXT,
    task_identifier TEXT NOT NULL,
    triggering_event_id TEXT,
    input_data TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER,
    error_at INTEGER,
    error_code TEXT,
    error_message TEXT,
    error_details TEXT
);
CREATE INDEX IF NOT EXISTS tasks_claimable
    ON tasks (owner_identifier, task_identifier, started_at, created_at);
CREATE TABLE IF NOT EXISTS log_entries (
    id TEXT PRIMARY KEY,
    app_identifier TEXT NOT NULL,
    handler_id TEXT NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    data TEXT,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS content_metadata (
    folder_id TEXT NOT NULL,
    object_key TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    metadata TEXT NOT NULL,
    updated_by TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (folder_id, object_key)
);
"#;

const TASK_COLUMNS: &str = "id, owner_identifier, handler_identifier, handler_id, \
     task_identifier, triggering_event_id, input_data, created_at, started_at, \
     completed_at, error_at, error_code, error_message, error_details";

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|err| StoreError::Join(err.to_string()))?
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(raw: i64) -> StoreResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(raw)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {raw} out of range")))
}

fn opt_from_millis(raw: Option<i64>) -> StoreResult<Option<DateTime<Utc>>> {
    raw.map(from_millis).transpose()
}

fn opt_json<T: serde::Serialize>(value: &Option<T>) -> StoreResult<Option<String>> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(StoreError::from)
}

fn parse_opt_json<T: serde::de::DeserializeOwned>(raw: Option<String>) -> StoreResult<Option<T>> {
    raw.map(|text| serde_json::from_str(&text))
        .transpose()
        .map_err(StoreError::from)
}

struct TaskRow {
    id: String,
    owner_identifier: String,
    handler_identifier: String,
    handler_id: Option<String>,
    task_identifier: String,
    triggering_event_id: Option<String>,
    input_data: String,
    created_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    error_at: Option<i64>,
    error_code: Option<String>,
    error_message: Option<String>,
    error_details: Option<String>,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_identifier: row.get(1)?,
            handler_identifier: row.get(2)?,
            handler_id: row.get(3)?,
            task_identifier: row.get(4)?,
            triggering_event_id: row.get(5)?,
            input_data: row.get(6)?,
            created_at: row.get(7)?,
            started_at: row.get(8)?,
            completed_at: row.get(9)?,
            error_at: row.get(10)?,
            error_code: row.get(11)?,
            error_message: row.get(12)?,
            error_details: row.get(13)?,
        })
    }

    fn into_task(self) -> StoreResult<Task> {
        let handler_identifier = HandlerKind::parse(&self.handler_identifier).ok_or_else(|| {
            StoreError::Corrupt(format!(
                "task {} has handler kind `{}`",
                self.id, self.handler_identifier
            ))
        })?;
        Ok(Task {
            handler_identifier,
            handler_id: self.handler_id,
            owner_identifier: self.owner_identifier,
            task_identifier: self.task_identifier,
            triggering_event_id: self.triggering_event_id,
            input_data: serde_json::from_str(&self.input_data)?,
            created_at: from_millis(self.created_at)?,
            started_at: opt_from_millis(self.started_at)?,
            completed_at: opt_from_millis(self.completed_at)?,
            error_at: opt_from_millis(self.error_at)?,
            error_code: self.error_code,
            error_message: self.error_message,
            error_details: parse_opt_json(self.error_details)?,
            id: self.id,
        })
    }
}

fn insert_task_row(conn: &Connection, task: &Task) -> StoreResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO tasks ({TASK_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
        ),
        params![
            task.id,
            task.owner_identifier,
            task.handler_identifier.as_str(),
            task.handler_id,
            task.task_identifier,
            task.triggering_event_id,
            serde_json::to_string(&task.input_data)?,
            to_millis(task.created_at),
            task.started_at.map(to_millis),
            task.completed_at.map(to_millis),
            task.error_at.map(to_millis),
            task.error_code,
            task.error_message,
            opt_json(&task.error_details)?,
        ],
    )?;
    Ok(())
}

fn query_tasks(conn: &Connection, sql: &str, values: Vec<SqlValue>) -> StoreResult<Vec<Task>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), TaskRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(TaskRow::into_task).collect()
}

fn app_from_parts(identifier: String, enabled: bool, manifest: String) -> StoreResult<AppRecord> {
    Ok(AppRecord {
        identifier,
        enabled,
        manifest: serde_json::from_str(&manifest)?,
    })
}

#[async_trait]
impl AppStore for SqliteStore {
    async fn get_app(&self, identifier: &str) -> StoreResult<Option<AppRecord>> {
        let identifier = identifier.to_string();
        self.call(move |conn| {
            let row = conn
                .query_row(
                    "SELECT identifier, enabled, manifest FROM apps WHERE identifier = ?1",
                    params![identifier],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, bool>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()?;
            row.map(|(id, enabled, manifest)| app_from_parts(id, enabled, manifest))
                .transpose()
        })
        .await
    }

    async fn upsert_app(&self, app: AppRecord) -> StoreResult<()> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO apps (identifier, enabled, manifest) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(identifier) DO UPDATE SET \
                 enabled = excluded.enabled, manifest = excluded.manifest",
                params![
                    app.identifier,
                    app.enabled,
                    serde_json::to_string(&app.manifest)?
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_enabled_apps(&self) -> StoreResult<Vec<AppRecord>> {
        self.call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT identifier, enabled, manifest FROM apps WHERE enabled = 1 \
                 ORDER BY identifier",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<rusqlite::Result<Vec<(String, bool, String)>>>()?;
            rows.into_iter()
                .map(|(id, enabled, manifest)| app_from_parts(id, enabled, manifest))
                .collect()
        })
        .await
    }
}

#[async_trait]
impl DirectoryStore for SqliteStore {
    async fn get_user(&self, id: &str) -> StoreResult<Option<UserRecord>> {
        let id = id.to_string();
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, username FROM users WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok(UserRecord {
                            id: row.get(0)?,
                            username: row.get(1)?,
                        })
                    },
                )
                .optional()?)
        })
        .await
    }

    async fn upsert_user(&self, user: UserRecord) -> StoreResult<()> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO users (id, username) VALUES (?1, ?2) \
                 ON CONFLICT(id) DO UPDATE SET username = excluded.username",
                params![user.id, user.username],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_folder(&self, id: &str) -> StoreResult<Option<FolderRecord>> {
        let id = id.to_string();
        self.call(move |conn| {
            let row = conn
                .query_row(
                    "SELECT id, owner_id, content_location, metadata_location \
                     FROM folders WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()?;
            row.map(|(id, owner_id, content, metadata)| {
                Ok(FolderRecord {
                    id,
                    owner_id,
                    content_location: serde_json::from_str(&content)?,
                    metadata_location: serde_json::from_str(&metadata)?,
                })
            })
            .transpose()
        })
        .await
    }

    async fn upsert_folder(&self, folder: FolderRecord) -> StoreResult<()> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO folders (id, owner_id, content_location, metadata_location) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(id) DO UPDATE SET owner_id = excluded.owner_id, \
                 content_location = excluded.content_location, \
                 metadata_location = excluded.metadata_location",
                params![
                    folder.id,
                    folder.owner_id,
                    serde_json::to_string(&folder.content_location)?,
                    serde_json::to_string(&folder.metadata_location)?,
                ],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl SettingsStore for SqliteStore {
    async fn get_user_app_settings(
        &self,
        user_id: &str,
        app_identifier: &str,
    ) -> StoreResult<Option<AppUserSettings>> {
        let user_id = user_id.to_string();
        let app_identifier = app_identifier.to_string();
        self.call(move |conn| {
            let row = conn
                .query_row(
                    "SELECT enabled, folder_scope_enabled_default, \
                     folder_scope_permissions_default, permissions \
                     FROM app_user_settings WHERE user_id = ?1 AND app_identifier = ?2",
                    params![user_id, app_identifier],
                    |row| {
                        Ok((
                            row.get::<_, Option<bool>>(0)?,
                            row.get::<_, Option<bool>>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, Option<String>>(3)?,
                        ))
                    },
                )
                .optional()?;
            row.map(|(enabled, folder_enabled, folder_permissions, permissions)| {
                Ok(AppUserSettings {
                    user_id: user_id.clone(),
                    app_identifier: app_identifier.clone(),
                    enabled,
                    folder_scope_enabled_default: folder_enabled,
                    folder_scope_permissions_default: parse_opt_json(folder_permissions)?,
                    permissions: parse_opt_json(permissions)?,
                })
            })
            .transpose()
        })
        .await
    }

    async fn upsert_user_app_settings(&self, settings: AppUserSettings) -> StoreResult<()> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO app_user_settings (user_id, app_identifier, enabled, \
                 folder_scope_enabled_default, folder_scope_permissions_default, permissions) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(user_id, app_identifier) DO UPDATE SET \
                 enabled = excluded.enabled, \
                 folder_scope_enabled_default = excluded.folder_scope_enabled_default, \
                 folder_scope_permissions_default = excluded.folder_scope_permissions_default, \
                 permissions = excluded.permissions",
                params![
                    settings.user_id,
                    settings.app_identifier,
                    settings.enabled,
                    settings.folder_scope_enabled_default,
                    opt_json(&settings.folder_scope_permissions_default)?,
                    opt_json(&settings.permissions)?,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_folder_app_settings(
        &self,
        folder_id: &str,
        app_identifier: &str,
    ) -> StoreResult<Option<AppFolderSettings>> {
        let folder_id = folder_id.to_string();
        let app_identifier = app_identifier.to_string();
        self.call(move |conn| {
            let row = conn
                .query_row(
                    "SELECT enabled, permissions FROM app_folder_settings \
                     WHERE folder_id = ?1 AND app_identifier = ?2",
                    params![folder_id, app_identifier],
                    |row| {
                        Ok((
                            row.get::<_, Option<bool>>(0)?,
                            row.get::<_, Option<String>>(1)?,
                        ))
                    },
                )
                .optional()?;
            row.map(|(enabled, permissions)| {
                Ok(AppFolderSettings {
                    folder_id: folder_id.clone(),
                    app_identifier: app_identifier.clone(),
                    enabled,
                    permissions: parse_opt_json(permissions)?,
                })
            })
            .transpose()
        })
        .await
    }

    async fn upsert_folder_app_settings(
        &self,
        folder_id: &str,
        entries: Vec<AppFolderSettings>,
    ) -> StoreResult<()> {
        let folder_id = folder_id.to_string();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            for entry in &entries {
                tx.execute(
                    "INSERT INTO app_folder_settings \
                     (folder_id, app_identifier, enabled, permissions) \
                     VALUES (?1, ?2, ?3, ?4) \
                     ON CONFLICT(folder_id, app_identifier) DO UPDATE SET \
                     enabled = excluded.enabled, permissions = excluded.permissions",
                    params![
                        folder_id,
                        entry.app_identifier,
                        entry.enabled,
                        opt_json(&entry.permissions)?,
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn insert_task(&self, task: Task) -> StoreResult<()> {
        self.call(move |conn| insert_task_row(conn, &task)).await
    }

    async fn get_task(&self, id: &str) -> StoreResult<Option<Task>> {
        let id = id.to_string();
        self.call(move |conn| {
            conn.query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
                TaskRow::from_row,
            )
            .optional()?
            .map(TaskRow::into_task)
            .transpose()
        })
        .await
    }

    async fn find_claimable_task(
        &self,
        owner: &str,
        task_identifiers: &[String],
        handler: Option<HandlerKind>,
    ) -> StoreResult<Option<Task>> {
        if task_identifiers.is_empty() {
            return Ok(None);
        }

        let mut values = vec![SqlValue::Text(owner.to_string())];
        values.extend(task_identifiers.iter().cloned().map(SqlValue::Text));
        let placeholders = (2..=task_identifiers.len() + 1)
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE owner_identifier = ?1 \
             AND started_at IS NULL AND completed_at IS NULL AND error_at IS NULL \
             AND task_identifier IN ({placeholders})"
        );
        if let Some(kind) = handler {
            values.push(SqlValue::Text(kind.as_str().to_string()));
            sql.push_str(&format!(" AND handler_identifier = ?{}", values.len()));
        }
        sql.push_str(" ORDER BY created_at ASC, rowid ASC LIMIT 1");

        self.call(move |conn| Ok(query_tasks(conn, &sql, values)?.into_iter().next()))
            .await
    }

    async fn try_start_task(
        &self,
        task_id: &str,
        handler_id: &str,
        started_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let task_id = task_id.to_string();
        let handler_id = handler_id.to_string();
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE tasks SET handler_id = ?2, started_at = ?3 \
                 WHERE id = ?1 AND started_at IS NULL \
                 AND completed_at IS NULL AND error_at IS NULL",
                params![task_id, handler_id, to_millis(started_at)],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn try_complete_task(
        &self,
        task_id: &str,
        handler_id: &str,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let task_id = task_id.to_string();
        let handler_id = handler_id.to_string();
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE tasks SET completed_at = ?3 \
                 WHERE id = ?1 AND handler_id = ?2 AND started_at IS NOT NULL \
                 AND completed_at IS NULL AND error_at IS NULL",
                params![task_id, handler_id, to_millis(completed_at)],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn try_fail_task(
        &self,
        task_id: &str,
        handler_id: &str,
        failure: TaskFailure,
        error_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let task_id = task_id.to_string();
        let handler_id = handler_id.to_string();
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE tasks SET error_at = ?3, error_code = ?4, error_message = ?5, \
                 error_details = ?6 \
                 WHERE id = ?1 AND handler_id = ?2 AND started_at IS NOT NULL \
                 AND completed_at IS NULL AND error_at IS NULL",
                params![
                    task_id,
                    handler_id,
                    to_millis(error_at),
                    failure.code,
                    failure.message,
                    opt_json(&failure.details)?,
                ],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn list_started_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Task>> {
        self.call(move |conn| {
            query_tasks(
                conn,
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE started_at IS NOT NULL \
                     AND started_at < ?1 AND completed_at IS NULL AND error_at IS NULL \
                     ORDER BY started_at ASC"
                ),
                vec![SqlValue::Integer(to_millis(cutoff))],
            )
        })
        .await
    }

    async fn try_expire_task(
        &self,
        task_id: &str,
        observed_started_at: DateTime<Utc>,
        failure: TaskFailure,
        error_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let task_id = task_id.to_string();
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE tasks SET error_at = ?3, error_code = ?4, error_message = ?5, \
                 error_details = ?6 \
                 WHERE id = ?1 AND started_at = ?2 \
                 AND completed_at IS NULL AND error_at IS NULL",
                params![
                    task_id,
                    to_millis(observed_started_at),
                    to_millis(error_at),
                    failure.code,
                    failure.message,
                    opt_json(&failure.details)?,
                ],
            )?;
            Ok(changed == 1)
        })
        .await
    }
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn get_event(&self, id: &str) -> StoreResult<Option<Event>> {
        let id = id.to_string();
        self.call(move |conn| {
            let row = conn
                .query_row(
                    "SELECT id, emitter_identifier, event_identifier, data, created_at \
                     FROM events WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, i64>(4)?,
                        ))
                    },
                )
                .optional()?;
            row.map(|(id, emitter, identifier, data, created_at)| {
                Ok(Event {
                    id,
                    emitter_identifier: emitter,
                    event_identifier: identifier,
                    data: serde_json::from_str(&data)?,
                    created_at: from_millis(created_at)?,
                })
            })
            .transpose()
        })
        .await
    }

    async fn record_event(&self, event: Event, triggered: Vec<Task>) -> StoreResult<()> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO events (id, emitter_identifier, event_identifier, data, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event.id,
                    event.emitter_identifier,
                    event.event_identifier,
                    serde_json::to_string(&event.data)?,
                    to_millis(event.created_at),
                ],
            )?;
            for task in &triggered {
                insert_task_row(&tx, task)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl LogStore for SqliteStore {
    async fn append_log_entry(&self, entry: LogEntryRecord) -> StoreResult<()> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO log_entries \
                 (id, app_identifier, handler_id, level, message, data, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.id,
                    entry.app_identifier,
                    entry.handler_id,
                    entry.level.as_str(),
                    entry.message,
                    opt_json(&entry.data)?,
                    to_millis(entry.created_at),
                ],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ContentMetadataStore for SqliteStore {
    async fn write_content_metadata(
        &self,
        records: Vec<ContentMetadataRecord>,
    ) -> StoreResult<usize> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            for record in &records {
                tx.execute(
                    "INSERT INTO content_metadata \
                     (folder_id, object_key, content_hash, metadata, updated_by, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                     ON CONFLICT(folder_id, object_key) DO UPDATE SET \
                     content_hash = excluded.content_hash, metadata = excluded.metadata, \
                     updated_by = excluded.updated_by, updated_at = excluded.updated_at",
                    params![
                        record.folder_id,
                        record.object_key,
                        record.content_hash,
                        serde_json::to_string(&record.metadata)?,
                        record.updated_by,
                        to_millis(record.updated_at),
                    ],
                )?;
            }
            tx.commit()?;
            Ok(records.len())
        })
        .await
    }

    async fn get_content_metadata(
        &self,
        folder_id: &str,
        object_key: &str,
    ) -> StoreResult<Option<ContentMetadataRecord>> {
        let folder_id = folder_id.to_string();
        let object_key = object_key.to_string();
        self.call(move |conn| {
            let row = conn
                .query_row(
                    "SELECT content_hash, metadata, updated_by, updated_at \
                     FROM content_metadata WHERE folder_id = ?1 AND object_key = ?2",
                    params![folder_id, object_key],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    },
                )
                .optional()?;
            row.map(|(content_hash, metadata, updated_by, updated_at)| {
                Ok(ContentMetadataRecord {
                    folder_id: folder_id.clone(),
                    object_key: object_key.clone(),
                    content_hash,
                    metadata: serde_json::from_str(&metadata)?,
                    updated_by,
                    updated_at: from_millis(updated_at)?,
                })
            })
            .transpose()
        })
        .await
    }
}
