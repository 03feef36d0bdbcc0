//! appgate Worker
//!
//! Connects as one app instance, claims tasks of the configured types and
//! runs a command for each. The task's input is written to the command's
//! stdin as JSON; exit status decides complete vs fail.

use anyhow::{bail, Context, Result};
use appgate_protocol::payloads::TaskFailure;
use appgate_protocol::results::ClaimedTask;
use appgate_protocol::ErrorCode;
use appgated_client::{
    mint_app_session_token, mint_privileged_session_token, AppClient, DEFAULT_SOCK,
};
use serde_json::json;
use std::env;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as TokioCommand;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

const IDLE_DELAY: Duration = Duration::from_secs(2);
const STDERR_SNIPPET_LIMIT: usize = 512;

struct WorkerEnv {
    socket: String,
    app: String,
    instance: String,
    task_identifiers: Vec<String>,
    command: String,
}

fn required(name: &str) -> Result<String> {
    env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .with_context(|| format!("{name} must be set"))
}

fn session_token(app: &str) -> Result<String> {
    let ttl = chrono::Duration::hours(12);
    if let Ok(path) = env::var("APPGATE_PRIVATE_KEY") {
        let pem = std::fs::read(&path)
            .with_context(|| format!("Failed to read private key {path}"))?;
        return mint_app_session_token(&pem, app, ttl).context("Failed to sign session token");
    }
    if let Ok(secret) = env::var("APPGATE_SECRET") {
        return mint_privileged_session_token(&secret, app, ttl)
            .context("Failed to sign session token");
    }
    bail!("set APPGATE_PRIVATE_KEY (apps) or APPGATE_SECRET (privileged app)")
}

fn load_env() -> Result<WorkerEnv> {
    let task_identifiers: Vec<String> = required("APPGATE_TASKS")?
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    Ok(WorkerEnv {
        socket: env::var("APPGATE_SOCKET").unwrap_or_else(|_| DEFAULT_SOCK.to_string()),
        app: required("APPGATE_APP")?,
        instance: env::var("APPGATE_INSTANCE")
            .unwrap_or_else(|_| format!("worker-{}", std::process::id())),
        task_identifiers,
        command: required("APPGATE_TASK_COMMAND")?,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let worker = load_env()?;
    let token = session_token(&worker.app)?;

    info!("Starting appgate worker for {}", worker.app);
    let client = AppClient::connect(&worker.socket, &worker.app, &worker.instance, &token)
        .await
        .context("Failed to connect to appgated")?;
    info!(
        handler_id = client.handler_id(),
        "Worker ready, claiming {:?}", worker.task_identifiers
    );

    loop {
        match client.claim_any_task(&worker.task_identifiers).await {
            Ok(claimed) => run_claimed(&client, &worker.command, claimed).await?,
            Err(err) if matches!(err.code(), Some(ErrorCode::NotFound | ErrorCode::Conflict)) => {
                debug!("Nothing to claim: {}", err);
                sleep(IDLE_DELAY).await;
            }
            Err(err) => return Err(err).context("Claim failed"),
        }
    }
}

async fn run_claimed(client: &AppClient, command: &str, claimed: ClaimedTask) -> Result<()> {
    let task = claimed.task;
    info!(task_id = %task.id, task_identifier = %task.task_identifier, "Running task");

    let outcome = execute(command, &task.id, &task.task_identifier, &json!({
        "task": &task,
        "event": &claimed.event,
    }))
    .await;

    let result = match outcome {
        Ok(()) => client.complete_task(&task.id).await,
        Err(failure) => {
            warn!(task_id = %task.id, code = %failure.code, "Task failed: {}", failure.message);
            client.fail_task(&task.id, failure).await
        }
    };
    match result {
        Ok(_) => Ok(()),
        Err(err) if err.code().is_some() => {
            error!(task_id = %task.id, "Daemon refused task result: {}", err);
            Ok(())
        }
        Err(err) => Err(err).context("Lost connection while reporting task"),
    }
}

async fn execute(
    command: &str,
    task_id: &str,
    task_identifier: &str,
    input: &serde_json::Value,
) -> std::result::Result<(), TaskFailure> {
    let spawn_failure = |message: String| TaskFailure {
        code: "SPAWN_FAILED".to_string(),
        message,
        details: None,
    };

    let mut child = TokioCommand::new("sh")
        .arg("-c")
        .arg(command)
        .env("APPGATE_TASK_ID", task_id)
        .env("APPGATE_TASK_IDENTIFIER", task_identifier)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| spawn_failure(err.to_string()))?;

    if let Some(mut stdin) = child.stdin.take() {
        let body = input.to_string();
        if let Err(err) = stdin.write_all(body.as_bytes()).await {
            debug!("Task command closed stdin early: {}", err);
        }
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|err| spawn_failure(err.to_string()))?;
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let snippet: String = stderr.chars().take(STDERR_SNIPPET_LIMIT).collect();
    let code = output.status.code();
    Err(TaskFailure {
        code: code
            .map(|c| format!("EXIT_{c}"))
            .unwrap_or_else(|| "SIGNALED".to_string()),
        message: if snippet.trim().is_empty() {
            format!("command exited with {}", output.status)
        } else {
            snippet.trim().to_string()
        },
        details: Some(json!({ "exitCode": code })),
    })
}
