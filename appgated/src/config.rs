//! `appgate.toml` loading.
//!
//! Scalar sections must parse or startup fails. List entries (`[[apps]]`,
//! `[[users]]`, `[[folders]]`, `[[user_settings]]`, `[[folder_settings]]`,
//! `[[workers]]`) are validated one by one and skipped with a warning when
//! invalid.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{info, warn};

use crate::app::{validate_identifier, AppManifest, AppRecord};
use crate::permissions::{AppFolderSettings, AppUserSettings, FolderPermission, UserPermission};
use crate::storage::StorageLocation;
use crate::store::{FolderRecord, UserRecord};
use crate::supervisor::WorkerSpec;
use crate::tasks::ClaimPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "appgate.toml";
pub const DEFAULT_PRIVILEGED_APP: &str = "core";
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    pub privileged_app: String,
    /// When set, connecting apps must declare exactly this version.
    pub expected_app_version: Option<String>,
    /// Longest request line accepted, newline excluded.
    pub max_frame_bytes: usize,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            privileged_app: DEFAULT_PRIVILEGED_APP.to_string(),
            expected_app_version: None,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TaskSection {
    pub claim_max_attempts: u32,
    pub claim_backoff_ms: u64,
    /// Leases are never expired unless this is set.
    pub lease_ttl_secs: Option<u64>,
    pub sweep_interval_secs: u64,
}

impl Default for TaskSection {
    fn default() -> Self {
        Self {
            claim_max_attempts: 5,
            claim_backoff_ms: 0,
            lease_ttl_secs: None,
            sweep_interval_secs: 30,
        }
    }
}

impl TaskSection {
    pub fn claim_policy(&self) -> ClaimPolicy {
        ClaimPolicy {
            max_attempts: self.claim_max_attempts,
            backoff: Duration::from_millis(self.claim_backoff_ms),
        }
    }

    pub fn lease_ttl(&self) -> Option<Duration> {
        self.lease_ttl_secs.map(Duration::from_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TokenSection {
    pub app_user_ttl_secs: u64,
    pub audience: String,
}

impl Default for TokenSection {
    fn default() -> Self {
        Self {
            app_user_ttl_secs: 3600,
            audience: "appgate".to_string(),
        }
    }
}

impl TokenSection {
    pub fn app_user_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.app_user_ttl_secs).unwrap_or(3600))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub app_storage: Option<StorageLocation>,
    pub bundle_storage: Option<StorageLocation>,
}

/// An app installed at startup.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AppSeed {
    pub identifier: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// PEM file with the app's public key, relative to the config file.
    #[serde(default)]
    pub public_key_file: Option<PathBuf>,
    #[serde(flatten)]
    pub manifest: AppManifest,
}

fn enabled_by_default() -> bool {
    true
}

impl AppSeed {
    pub fn into_record(self) -> AppRecord {
        AppRecord {
            identifier: self.identifier,
            enabled: self.enabled,
            manifest: self.manifest,
        }
    }
}

/// A user's overrides for one app.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserSettingsSeed {
    pub user_id: String,
    pub app: String,
    pub enabled: Option<bool>,
    pub folder_scope_enabled_default: Option<bool>,
    pub folder_scope_permissions_default: Option<Vec<FolderPermission>>,
    pub permissions: Option<Vec<UserPermission>>,
}

impl UserSettingsSeed {
    pub fn into_settings(self) -> AppUserSettings {
        AppUserSettings {
            user_id: self.user_id,
            app_identifier: self.app,
            enabled: self.enabled,
            folder_scope_enabled_default: self.folder_scope_enabled_default,
            folder_scope_permissions_default: self.folder_scope_permissions_default,
            permissions: self.permissions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FolderAppOverride {
    pub app: String,
    pub enabled: Option<bool>,
    pub permissions: Option<Vec<FolderPermission>>,
}

/// Every app override for one folder. The entries are written together.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FolderSettingsSeed {
    pub folder_id: String,
    #[serde(default)]
    pub apps: Vec<FolderAppOverride>,
}

impl FolderSettingsSeed {
    pub fn into_entries(self) -> Vec<AppFolderSettings> {
        let folder_id = self.folder_id;
        self.apps
            .into_iter()
            .map(|entry| AppFolderSettings {
                folder_id: folder_id.clone(),
                app_identifier: entry.app,
                enabled: entry.enabled,
                permissions: entry.permissions,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DaemonConfig {
    pub source: Option<PathBuf>,
    pub daemon: DaemonSection,
    pub tasks: TaskSection,
    pub tokens: TokenSection,
    pub storage: StorageSection,
    pub apps: Vec<AppSeed>,
    pub users: Vec<UserRecord>,
    pub folders: Vec<FolderRecord>,
    pub user_settings: Vec<UserSettingsSeed>,
    pub folder_settings: Vec<FolderSettingsSeed>,
    pub workers: Vec<WorkerSpec>,
}

/// `--config`, then `APPGATE_CONFIG`, then `./appgate.toml` if present.
pub fn resolve_config_path(cli: Option<PathBuf>) -> Option<PathBuf> {
    cli.or_else(|| std::env::var_os("APPGATE_CONFIG").map(PathBuf::from))
        .or_else(|| {
            let local = PathBuf::from(DEFAULT_CONFIG_FILE);
            local.is_file().then_some(local)
        })
}

pub fn load_config(path: Option<&Path>) -> Result<DaemonConfig> {
    let Some(path) = path else {
        warn!("No configuration file found; using defaults with no apps installed");
        return Ok(DaemonConfig::default());
    };

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let mut config = parse_config(&contents, path.parent())
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    config.source = Some(path.to_path_buf());

    info!(
        apps = config.apps.len(),
        workers = config.workers.len(),
        "Loaded configuration from {}",
        path.display()
    );
    Ok(config)
}

/// `base_dir` resolves relative `public_key_file` entries.
pub fn parse_config(contents: &str, base_dir: Option<&Path>) -> Result<DaemonConfig> {
    let value: toml::Value = contents.parse().context("invalid TOML")?;

    let daemon: DaemonSection = section(&value, "daemon")?;
    if let Err(err) = validate_identifier(&daemon.privileged_app) {
        bail!("[daemon] privileged_app: {err}");
    }
    if daemon.max_frame_bytes == 0 {
        bail!("[daemon] max_frame_bytes must be greater than zero");
    }
    let tasks: TaskSection = section(&value, "tasks")?;
    if tasks.claim_max_attempts == 0 {
        bail!("[tasks] claim_max_attempts must be greater than zero");
    }

    let mut apps: Vec<AppSeed> = entries(&value, "apps", |seed: &AppSeed| {
        validate_identifier(&seed.identifier)?;
        Ok(seed.identifier.clone())
    });
    for seed in &mut apps {
        load_public_key(seed, base_dir);
    }

    Ok(DaemonConfig {
        source: None,
        daemon,
        tasks,
        tokens: section(&value, "tokens")?,
        storage: section(&value, "storage")?,
        apps,
        users: entries(&value, "users", |user: &UserRecord| {
            non_empty("id", &user.id)?;
            Ok(user.id.clone())
        }),
        folders: entries(&value, "folders", |folder: &FolderRecord| {
            non_empty("id", &folder.id)?;
            non_empty("owner_id", &folder.owner_id)?;
            Ok(folder.id.clone())
        }),
        user_settings: entries(&value, "user_settings", |seed: &UserSettingsSeed| {
            non_empty("user_id", &seed.user_id)?;
            non_empty("app", &seed.app)?;
            Ok(format!("{}/{}", seed.user_id, seed.app))
        }),
        folder_settings: entries(&value, "folder_settings", |seed: &FolderSettingsSeed| {
            non_empty("folder_id", &seed.folder_id)?;
            Ok(seed.folder_id.clone())
        }),
        workers: entries(&value, "workers", |spec: &WorkerSpec| {
            non_empty("id", &spec.id)?;
            non_empty("command", &spec.command)?;
            Ok(spec.id.clone())
        }),
    })
}

fn section<T: DeserializeOwned + Default>(value: &toml::Value, name: &str) -> Result<T> {
    match value.get(name) {
        Some(raw) => raw
            .clone()
            .try_into()
            .with_context(|| format!("invalid [{name}] section")),
        None => Ok(T::default()),
    }
}

/// Deserializes every entry of `[[name]]`, keeping the first entry per key.
fn entries<T, F>(value: &toml::Value, name: &str, validate: F) -> Vec<T>
where
    T: DeserializeOwned,
    F: Fn(&T) -> std::result::Result<String, String>,
{
    let Some(raw) = value.get(name) else {
        return Vec::new();
    };
    let Some(items) = raw.as_array() else {
        warn!("[[{}]] must be an array of tables; ignored", name);
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for (index, item) in items.iter().enumerate() {
        let parsed: T = match item.clone().try_into() {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!("{} entry #{} skipped: {}", name, index, err);
                continue;
            }
        };
        match validate(&parsed) {
            Ok(key) if seen.insert(key.clone()) => out.push(parsed),
            Ok(key) => warn!("{} entry '{}' skipped: duplicate", name, key),
            Err(err) => warn!("{} entry #{} skipped: {}", name, index, err),
        }
    }
    out
}

fn non_empty(field: &str, value: &str) -> std::result::Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("{field} must not be empty"))
    } else {
        Ok(())
    }
}

fn load_public_key(seed: &mut AppSeed, base_dir: Option<&Path>) {
    let Some(file) = seed.public_key_file.as_ref() else {
        return;
    };
    let path = match base_dir {
        Some(dir) if file.is_relative() => dir.join(file),
        _ => file.clone(),
    };
    match fs::read_to_string(&path) {
        Ok(pem) => seed.manifest.public_key = Some(pem),
        Err(err) => warn!(
            "Public key for app '{}' unreadable at {}: {}",
            seed.identifier,
            path.display(),
            err
        ),
    }
}
