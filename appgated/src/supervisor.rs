//! Worker process supervisor.
//!
//! Owns every worker process the daemon launched, keyed by worker id. The
//! monitor task health-checks on an interval and respawns workers whose spec
//! asks for it.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub const SOCKET_ENV: &str = "APPGATE_SOCKET";
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// One `[[workers]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub restart_on_exit: bool,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("worker `{0}` is already running")]
    AlreadyRunning(String),
    #[error("unknown worker `{0}`")]
    UnknownWorker(String),
    #[error("failed to spawn worker `{id}`: {source}")]
    Spawn {
        id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to signal worker `{id}`: {source}")]
    Signal {
        id: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerHealth {
    Running { pid: Option<u32> },
    Exited { code: Option<i32> },
}

#[derive(Debug)]
struct WorkerHandle {
    spec: WorkerSpec,
    child: Child,
    started_at: DateTime<Utc>,
    restarts: u32,
    exit_code: Option<Option<i32>>,
}

/// Snapshot of one supervised worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub id: String,
    pub health: WorkerHealth,
    pub started_at: DateTime<Utc>,
    pub restarts: u32,
}

pub struct WorkerSupervisor {
    socket: PathBuf,
    workers: Mutex<HashMap<String, WorkerHandle>>,
}

impl WorkerSupervisor {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            workers: Mutex::new(HashMap::new()),
        }
    }

    fn launch(&self, spec: &WorkerSpec) -> Result<Child, SupervisorError> {
        let mut command = TokioCommand::new(&spec.command);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .env(SOCKET_ENV, &self.socket)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command.spawn().map_err(|source| SupervisorError::Spawn {
            id: spec.id.clone(),
            source,
        })
    }

    pub async fn spawn(&self, spec: WorkerSpec) -> Result<Option<u32>, SupervisorError> {
        let mut workers = self.workers.lock().await;
        if let Some(existing) = workers.get_mut(&spec.id) {
            if existing.exit_code.is_none() && existing.child.try_wait().ok().flatten().is_none() {
                return Err(SupervisorError::AlreadyRunning(spec.id));
            }
        }

        let child = self.launch(&spec)?;
        let pid = child.id();
        info!(worker = %spec.id, ?pid, command = %spec.command, "worker spawned");
        workers.insert(
            spec.id.clone(),
            WorkerHandle {
                spec,
                child,
                started_at: Utc::now(),
                restarts: 0,
                exit_code: None,
            },
        );
        Ok(pid)
    }

    pub async fn health_check(&self, id: &str) -> Result<WorkerHealth, SupervisorError> {
        let mut workers = self.workers.lock().await;
        let handle = workers
            .get_mut(id)
            .ok_or_else(|| SupervisorError::UnknownWorker(id.to_string()))?;
        Ok(poll_health(id, handle))
    }

    pub async fn health_check_all(&self) -> Vec<WorkerStatus> {
        let mut workers = self.workers.lock().await;
        let mut statuses: Vec<WorkerStatus> = workers
            .iter_mut()
            .map(|(id, handle)| WorkerStatus {
                id: id.clone(),
                health: poll_health(id, handle),
                started_at: handle.started_at,
                restarts: handle.restarts,
            })
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Kills the worker and forgets it.
    pub async fn terminate(&self, id: &str) -> Result<(), SupervisorError> {
        let mut handle = self
            .workers
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| SupervisorError::UnknownWorker(id.to_string()))?;
        stop(id, &mut handle).await
    }

    pub async fn terminate_all(&self) {
        let drained: Vec<(String, WorkerHandle)> =
            self.workers.lock().await.drain().collect();
        for (id, mut handle) in drained {
            if let Err(err) = stop(&id, &mut handle).await {
                error!("Failed to terminate worker {}: {}", id, err);
            }
        }
    }

    /// Respawns exited workers with `restart_on_exit`. Returns the ids restarted.
    pub async fn restart_exited(&self) -> Vec<String> {
        let mut workers = self.workers.lock().await;
        let mut restarted = Vec::new();
        for (id, handle) in workers.iter_mut() {
            if !matches!(poll_health(id, handle), WorkerHealth::Exited { .. })
                || !handle.spec.restart_on_exit
            {
                continue;
            }
            match self.launch(&handle.spec) {
                Ok(child) => {
                    handle.child = child;
                    handle.started_at = Utc::now();
                    handle.restarts += 1;
                    handle.exit_code = None;
                    info!(worker = %id, restarts = handle.restarts, "worker restarted");
                    restarted.push(id.clone());
                }
                Err(err) => warn!("Worker {} restart failed: {}", id, err),
            }
        }
        restarted
    }
}

fn poll_health(id: &str, handle: &mut WorkerHandle) -> WorkerHealth {
    if let Some(code) = handle.exit_code {
        return WorkerHealth::Exited { code };
    }
    match handle.child.try_wait() {
        Ok(Some(status)) => {
            debug!(worker = %id, ?status, "worker exited");
            handle.exit_code = Some(status.code());
            WorkerHealth::Exited {
                code: status.code(),
            }
        }
        Ok(None) => WorkerHealth::Running {
            pid: handle.child.id(),
        },
        Err(err) => {
            warn!("Worker {} status unavailable: {}", id, err);
            handle.exit_code = Some(None);
            WorkerHealth::Exited { code: None }
        }
    }
}

async fn stop(id: &str, handle: &mut WorkerHandle) -> Result<(), SupervisorError> {
    if handle.exit_code.is_some() || handle.child.try_wait().ok().flatten().is_some() {
        return Ok(());
    }
    handle
        .child
        .kill()
        .await
        .map_err(|source| SupervisorError::Signal {
            id: id.to_string(),
            source,
        })?;
    info!(worker = %id, "worker terminated");
    Ok(())
}

/// Periodically restarts exited workers until the runtime shuts down.
pub fn spawn_monitor(supervisor: Arc<WorkerSupervisor>, interval: Duration) {
    tokio::spawn(async move {
        debug!("Worker monitor started");
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            for status in supervisor.health_check_all().await {
                if let WorkerHealth::Exited { code } = status.health {
                    debug!(worker = %status.id, ?code, "worker not running");
                }
            }
            supervisor.restart_exited().await;
        }
    });
}
