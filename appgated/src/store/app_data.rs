//! Per-app isolated databases behind `DB_QUERY`, `DB_EXEC` and `DB_BATCH`.
//!
//! Each app gets its own SQLite file; attaching other databases is disabled
//! so an app cannot reach outside its own file.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use appgate_protocol::payloads::{
    DbBatchPayload, DbBatchStep, DbExecPayload, DbQueryPayload, DbStepKind, RowMode, SqlParam,
};
use appgate_protocol::results::{DbBatchResult, DbExecResult, DbQueryResult, DbStepResult};
use appgate_protocol::{ProtocolError, ValidationIssue};
use async_trait::async_trait;
use rusqlite::limits::Limit;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::{Map, Value};
use tokio::task;
use tracing::debug;

use crate::app::validate_identifier;

#[async_trait]
pub trait AppDataStore: Send + Sync {
    async fn query(
        &self,
        app_identifier: &str,
        payload: DbQueryPayload,
    ) -> Result<DbQueryResult, ProtocolError>;

    async fn exec(
        &self,
        app_identifier: &str,
        payload: DbExecPayload,
    ) -> Result<DbExecResult, ProtocolError>;

    async fn batch(
        &self,
        app_identifier: &str,
        payload: DbBatchPayload,
    ) -> Result<DbBatchResult, ProtocolError>;
}

type Databases = Arc<Mutex<HashMap<String, Arc<Mutex<Connection>>>>>;

pub struct SqliteAppData {
    root: Option<PathBuf>,
    databases: Databases,
}

impl SqliteAppData {
    /// Databases live under `root` as `<appIdentifier>.sqlite`.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root: Some(root),
            databases: Arc::default(),
        })
    }

    /// Every app gets a private in-memory database. Used by tests.
    pub fn in_memory() -> Self {
        Self {
            root: None,
            databases: Arc::default(),
        }
    }

    async fn with_db<F, T>(&self, app_identifier: &str, f: F) -> Result<T, ProtocolError>
    where
        F: FnOnce(&mut Connection) -> Result<T, ProtocolError> + Send + 'static,
        T: Send + 'static,
    {
        validate_identifier(app_identifier).map_err(ProtocolError::bad_request)?;
        let databases = Arc::clone(&self.databases);
        let root = self.root.clone();
        let app_identifier = app_identifier.to_string();

        task::spawn_blocking(move || {
            let db = open_database(&databases, root.as_deref(), &app_identifier)?;
            let mut conn = db
                .lock()
                .map_err(|_| ProtocolError::Internal("app database poisoned".to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|err| ProtocolError::Internal(format!("app database task failed: {err}")))?
    }
}

fn open_database(
    databases: &Databases,
    root: Option<&Path>,
    app_identifier: &str,
) -> Result<Arc<Mutex<Connection>>, ProtocolError> {
    let mut open = databases
        .lock()
        .map_err(|_| ProtocolError::Internal("app database registry poisoned".to_string()))?;
    if let Some(existing) = open.get(app_identifier) {
        return Ok(Arc::clone(existing));
    }

    let conn = match root {
        Some(root) => Connection::open(root.join(format!("{app_identifier}.sqlite"))),
        None => Connection::open_in_memory(),
    }
    .map_err(|err| {
        ProtocolError::Internal(format!("cannot open database for `{app_identifier}`: {err}"))
    })?;
    let _ = conn.set_limit(Limit::SQLITE_LIMIT_ATTACHED, 0);
    conn.busy_timeout(Duration::from_secs(5))
        .map_err(|err| ProtocolError::Internal(err.to_string()))?;
    debug!(app = %app_identifier, "opened app database");

    let db = Arc::new(Mutex::new(conn));
    open.insert(app_identifier.to_string(), Arc::clone(&db));
    Ok(db)
}

/// Bad SQL is the caller's fault; I/O and corruption are ours.
fn statement_error(path: String, err: rusqlite::Error) -> ProtocolError {
    use rusqlite::ErrorCode as Code;

    let operational = matches!(
        &err,
        rusqlite::Error::SqliteFailure(failure, _) if matches!(
            failure.code,
            Code::CannotOpen
                | Code::SystemIoFailure
                | Code::DiskFull
                | Code::DatabaseCorrupt
                | Code::NotADatabase
                | Code::OutOfMemory
                | Code::DatabaseBusy
                | Code::DatabaseLocked
        )
    );
    if operational {
        ProtocolError::Internal(err.to_string())
    } else {
        ProtocolError::validation(
            "statement failed",
            vec![ValidationIssue::new(path, err.to_string())],
        )
    }
}

fn bind(params: &[SqlParam]) -> Vec<SqlValue> {
    params
        .iter()
        .map(|param| match param {
            SqlParam::Null => SqlValue::Null,
            SqlParam::Bool(value) => SqlValue::Integer(i64::from(*value)),
            SqlParam::Integer(value) => SqlValue::Integer(*value),
            SqlParam::Real(value) => SqlValue::Real(*value),
            SqlParam::Text(value) => SqlValue::Text(value.clone()),
        })
        .collect()
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(hex::encode(bytes)),
    }
}

fn run_query(
    conn: &Connection,
    sql: &str,
    params: &[SqlParam],
    row_mode: RowMode,
) -> rusqlite::Result<DbQueryResult> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(String::from)
        .collect();

    let mut rows = stmt.query(params_from_iter(bind(params)))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(columns.len());
        for idx in 0..columns.len() {
            values.push(to_json(row.get_ref(idx)?));
        }
        out.push(match row_mode {
            RowMode::Array => Value::Array(values),
            RowMode::Object => Value::Object(
                columns
                    .iter()
                    .cloned()
                    .zip(values)
                    .collect::<Map<String, Value>>(),
            ),
        });
    }
    Ok(DbQueryResult { columns, rows: out })
}

fn run_exec(conn: &Connection, sql: &str, params: &[SqlParam]) -> rusqlite::Result<DbExecResult> {
    let row_count = conn.execute(sql, params_from_iter(bind(params)))?;
    Ok(DbExecResult { row_count })
}

fn run_steps(conn: &Connection, steps: &[DbBatchStep]) -> Result<Vec<DbStepResult>, ProtocolError> {
    steps
        .iter()
        .enumerate()
        .map(|(idx, step)| {
            let outcome = match step.kind {
                DbStepKind::Query => {
                    run_query(conn, &step.sql, &step.params, step.row_mode).map(DbStepResult::Query)
                }
                DbStepKind::Exec => run_exec(conn, &step.sql, &step.params).map(DbStepResult::Exec),
            };
            outcome.map_err(|err| statement_error(format!("data.steps[{idx}].sql"), err))
        })
        .collect()
}

#[async_trait]
impl AppDataStore for SqliteAppData {
    async fn query(
        &self,
        app_identifier: &str,
        payload: DbQueryPayload,
    ) -> Result<DbQueryResult, ProtocolError> {
        self.with_db(app_identifier, move |conn| {
            run_query(conn, &payload.sql, &payload.params, payload.row_mode)
                .map_err(|err| statement_error("data.sql".to_string(), err))
        })
        .await
    }

    async fn exec(
        &self,
        app_identifier: &str,
        payload: DbExecPayload,
    ) -> Result<DbExecResult, ProtocolError> {
        self.with_db(app_identifier, move |conn| {
            run_exec(conn, &payload.sql, &payload.params)
                .map_err(|err| statement_error("data.sql".to_string(), err))
        })
        .await
    }

    async fn batch(
        &self,
        app_identifier: &str,
        payload: DbBatchPayload,
    ) -> Result<DbBatchResult, ProtocolError> {
        self.with_db(app_identifier, move |conn| {
            let results = if payload.atomic {
                let tx = conn
                    .transaction()
                    .map_err(|err| ProtocolError::Internal(err.to_string()))?;
                let results = run_steps(&tx, &payload.steps)?;
                tx.commit()
                    .map_err(|err| ProtocolError::Internal(err.to_string()))?;
                results
            } else {
                run_steps(conn, &payload.steps)?
            };
            Ok(DbBatchResult { results })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appgate_protocol::ErrorCode;
    use serde_json::json;

    fn exec_step(sql: &str) -> DbBatchStep {
        DbBatchStep {
            kind: DbStepKind::Exec,
            sql: sql.to_string(),
            params: vec![],
            row_mode: RowMode::Object,
        }
    }

    async fn count(store: &SqliteAppData, app: &str) -> Value {
        let result = store
            .query(
                app,
                DbQueryPayload {
                    sql: "SELECT count(*) AS n FROM notes".into(),
                    params: vec![],
                    row_mode: RowMode::Object,
                },
            )
            .await
            .unwrap();
        result.rows[0]["n"].clone()
    }

    async fn with_notes_table(store: &SqliteAppData, app: &str) {
        store
            .exec(
                app,
                DbExecPayload {
                    sql: "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL)".into(),
                    params: vec![],
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn query_binds_params_and_shapes_rows() {
        let store = SqliteAppData::in_memory();
        with_notes_table(&store, "gallery").await;
        let inserted = store
            .exec(
                "gallery",
                DbExecPayload {
                    sql: "INSERT INTO notes (body) VALUES (?1), (?2)".into(),
                    params: vec![SqlParam::Text("a".into()), SqlParam::Text("b".into())],
                },
            )
            .await
            .unwrap();
        assert_eq!(inserted.row_count, 2);

        let rows = store
            .query(
                "gallery",
                DbQueryPayload {
                    sql: "SELECT id, body FROM notes WHERE body = ?1".into(),
                    params: vec![SqlParam::Text("b".into())],
                    row_mode: RowMode::Array,
                },
            )
            .await
            .unwrap();
        assert_eq!(rows.columns, vec!["id", "body"]);
        assert_eq!(rows.rows, vec![json!([2, "b"])]);
    }

    #[tokio::test]
    async fn apps_do_not_share_databases() {
        let store = SqliteAppData::in_memory();
        with_notes_table(&store, "gallery").await;

        let err = store
            .query(
                "notes-app",
                DbQueryPayload {
                    sql: "SELECT * FROM notes".into(),
                    params: vec![],
                    row_mode: RowMode::Object,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadRequest);
        assert_eq!(err.issues()[0].path, "data.sql");
    }

    #[tokio::test]
    async fn attach_is_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteAppData::new(dir.path()).unwrap();
        let target = dir.path().join("core.sqlite");
        let err = store
            .exec(
                "gallery",
                DbExecPayload {
                    sql: format!("ATTACH DATABASE '{}' AS core", target.display()),
                    params: vec![],
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadRequest);
        assert!(dir.path().join("gallery.sqlite").exists());
    }

    #[tokio::test]
    async fn atomic_batch_rolls_back_on_failure() {
        let store = SqliteAppData::in_memory();
        with_notes_table(&store, "gallery").await;

        let err = store
            .batch(
                "gallery",
                DbBatchPayload {
                    steps: vec![
                        exec_step("INSERT INTO notes (body) VALUES ('kept?')"),
                        exec_step("INSERT INTO notes (body) VALUES (NULL)"),
                    ],
                    atomic: true,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.issues()[0].path, "data.steps[1].sql");
        assert_eq!(count(&store, "gallery").await, json!(0));
    }

    #[tokio::test]
    async fn plain_batch_keeps_earlier_steps() {
        let store = SqliteAppData::in_memory();
        with_notes_table(&store, "gallery").await;

        let err = store
            .batch(
                "gallery",
                DbBatchPayload {
                    steps: vec![
                        exec_step("INSERT INTO notes (body) VALUES ('kept')"),
                        exec_step("INSERT INTO notes (body) VALUES (NULL)"),
                        exec_step("INSERT INTO notes (body) VALUES ('never')"),
                    ],
                    atomic: false,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadRequest);
        assert_eq!(count(&store, "gallery").await, json!(1));
    }

    #[tokio::test]
    async fn batch_results_are_positional() {
        let store = SqliteAppData::in_memory();
        with_notes_table(&store, "gallery").await;

        let result = store
            .batch(
                "gallery",
                DbBatchPayload {
                    steps: vec![
                        exec_step("INSERT INTO notes (body) VALUES ('x')"),
                        DbBatchStep {
                            kind: DbStepKind::Query,
                            sql: "SELECT body FROM notes".into(),
                            params: vec![],
                            row_mode: RowMode::Object,
                        },
                    ],
                    atomic: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({ "results": [
                { "rowCount": 1 },
                { "columns": ["body"], "rows": [{ "body": "x" }] }
            ] })
        );
    }
}
