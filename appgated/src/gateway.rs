//! Connection-level entry point: the connect handshake and per-line dispatch.

use std::sync::Arc;

use anyhow::{Context, Result};
use appgate_protocol::{
    ConnectRequest, ConnectResponse, ProtocolError, ResponseFrame, ValidationIssue,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::DaemonConfig;
use crate::identity::{AppUserTokens, CallerIdentity, IdentityError, SessionVerifier};
use crate::permissions::PermissionEngine;
use crate::router::Router;
use crate::storage::{HmacUrlSigner, StorageBroker};
use crate::store::app_data::AppDataStore;
use crate::store::{AppStore, Store};
use crate::DAEMON_VERSION;

pub struct Gateway {
    apps: Arc<dyn AppStore>,
    verifier: SessionVerifier,
    expected_app_version: Option<String>,
    max_frame_bytes: usize,
    router: Router,
}

impl Gateway {
    pub fn new<S: Store + 'static>(
        store: Arc<S>,
        app_data: Arc<dyn AppDataStore>,
        config: &DaemonConfig,
        secret: &str,
    ) -> Self {
        let storage = StorageBroker::new(
            Arc::new(HmacUrlSigner),
            config.storage.app_storage.clone(),
            config.storage.bundle_storage.clone(),
        );
        let user_tokens = AppUserTokens::new(
            secret,
            config.tokens.audience.clone(),
            config.tokens.app_user_ttl(),
        );
        let router = Router::new(
            store.clone(),
            app_data,
            storage,
            user_tokens,
            config.tasks.claim_policy(),
        );
        Self {
            apps: store,
            verifier: SessionVerifier::new(config.daemon.privileged_app.clone(), secret),
            expected_app_version: config.daemon.expected_app_version.clone(),
            max_frame_bytes: config.daemon.max_frame_bytes,
            router,
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Handles the first line of a connection.
    pub async fn accept(
        &self,
        line: &str,
    ) -> Result<(CallerIdentity, ConnectResponse), ProtocolError> {
        let request: ConnectRequest = serde_json::from_str(line).map_err(|err| {
            ProtocolError::validation(
                "malformed connect request",
                vec![ValidationIssue::new("$", err.to_string())],
            )
        })?;
        if request.instance_id.is_empty() || request.instance_id.contains(':') {
            return Err(ProtocolError::validation(
                "invalid connect request",
                vec![ValidationIssue::new(
                    "instanceId",
                    "must be non-empty and must not contain ':'",
                )],
            ));
        }

        let app = self
            .apps
            .get_app(&request.app_identifier)
            .await?
            .ok_or_else(|| IdentityError::UnknownApp(request.app_identifier.clone()))?;
        if let Err(err) = self.verifier.verify(&app, &request.token) {
            warn!(
                app = %app.identifier,
                instance = %request.instance_id,
                "session rejected: {}",
                err
            );
            return Err(err.into());
        }

        if let Some(expected) = self.expected_app_version.as_deref() {
            if request.version.as_deref() != Some(expected) {
                return Err(ProtocolError::bad_request(format!(
                    "app protocol version {} does not match expected {}",
                    request.version.as_deref().unwrap_or("<none>"),
                    expected
                )));
            }
        }

        let caller = CallerIdentity::new(
            &app.identifier,
            &request.instance_id,
            self.verifier.is_privileged(&app.identifier),
        );
        info!(
            app = %caller.app_identifier,
            handler_id = %caller.handler_id(),
            privileged = caller.privileged,
            "app session established"
        );
        let response = ConnectResponse {
            handler_id: caller.handler_id(),
            daemon_version: DAEMON_VERSION.to_string(),
        };
        Ok((caller, response))
    }

    /// Handles one request line after the handshake.
    pub async fn handle_line(&self, caller: &CallerIdentity, line: &str) -> ResponseFrame {
        match serde_json::from_str::<Value>(line) {
            Ok(frame) => self.router.handle_frame(caller, &frame).await,
            Err(err) => {
                debug!(app = %caller.app_identifier, "unparseable request line: {}", err);
                unreadable_line(err.to_string())
            }
        }
    }
}

/// The 400 frame for a line that cannot be read as a JSON request.
pub fn unreadable_line(detail: impl Into<String>) -> ResponseFrame {
    ResponseFrame::err(
        None,
        &ProtocolError::validation(
            "request is not valid JSON",
            vec![ValidationIssue::new("$", detail)],
        ),
    )
}

/// Installs the apps, users, folders and app settings listed in the
/// configuration. Settings that name unknown apps, users or folders are
/// skipped with a warning.
pub async fn seed_store<S: Store + 'static>(store: &Arc<S>, config: &DaemonConfig) -> Result<()> {
    for seed in config.apps.iter().cloned() {
        let identifier = seed.identifier.clone();
        store
            .upsert_app(seed.into_record())
            .await
            .with_context(|| format!("Failed to install app {identifier}"))?;
    }
    for user in config.users.iter().cloned() {
        let id = user.id.clone();
        store
            .upsert_user(user)
            .await
            .with_context(|| format!("Failed to seed user {id}"))?;
    }
    for folder in config.folders.iter().cloned() {
        let id = folder.id.clone();
        store
            .upsert_folder(folder)
            .await
            .with_context(|| format!("Failed to seed folder {id}"))?;
    }

    let permissions = PermissionEngine::new(store.clone(), store.clone(), store.clone());
    let mut settings = 0;
    for seed in config.user_settings.iter().cloned() {
        let label = format!("{}/{}", seed.user_id, seed.app);
        let outcome = permissions
            .set_user_app_settings(seed.into_settings())
            .await;
        settings += settings_seeded("user", &label, outcome)?;
    }
    for seed in config.folder_settings.iter().cloned() {
        let folder_id = seed.folder_id.clone();
        let outcome = permissions
            .set_folder_app_settings(&folder_id, seed.into_entries())
            .await;
        settings += settings_seeded("folder", &folder_id, outcome)?;
    }

    info!(
        apps = config.apps.len(),
        users = config.users.len(),
        folders = config.folders.len(),
        settings,
        "Seeded store from configuration"
    );
    Ok(())
}

fn settings_seeded(scope: &str, label: &str, outcome: Result<(), ProtocolError>) -> Result<usize> {
    match outcome {
        Ok(()) => Ok(1),
        Err(ProtocolError::Internal(message)) => {
            anyhow::bail!("Failed to seed {scope} settings {label}: {message}")
        }
        Err(err) => {
            warn!("{} settings '{}' skipped: {}", scope, label, err);
            Ok(0)
        }
    }
}
