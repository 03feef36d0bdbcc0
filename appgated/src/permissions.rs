//! Cascading resolution of app enablement and permissions.
//!
//! User level has two tiers (user override, app default). Folder level has
//! three (folder override, the user's folder-scope default, app default).
//! `None` at any tier always means "ask the next tier".

use std::collections::BTreeSet;
use std::sync::Arc;

use appgate_protocol::payloads::StorageMethod;
use appgate_protocol::ProtocolError;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::app::AppRecord;
use crate::store::{AppStore, DirectoryStore, FolderRecord, SettingsStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlatformPermission {
    ServeWebApp,
    ReadServerSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserPermission {
    ReadUser,
    ReadFolders,
    CreateFolders,
    ReadFolderAcl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FolderPermission {
    ReadObjects,
    WriteObjects,
    WriteObjectsMetadata,
    ReindexFolder,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppPermissions {
    #[serde(default)]
    pub platform: Vec<PlatformPermission>,
    #[serde(default)]
    pub user: Vec<UserPermission>,
    #[serde(default)]
    pub folder: Vec<FolderPermission>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppUserSettings {
    pub user_id: String,
    pub app_identifier: String,
    pub enabled: Option<bool>,
    pub folder_scope_enabled_default: Option<bool>,
    pub folder_scope_permissions_default: Option<Vec<FolderPermission>>,
    pub permissions: Option<Vec<UserPermission>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppFolderSettings {
    pub folder_id: String,
    pub app_identifier: String,
    pub enabled: Option<bool>,
    pub permissions: Option<Vec<FolderPermission>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingsSource {
    User,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fallback<T> {
    pub value: T,
    pub source: SettingsSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedUserAppSettings {
    pub enabled: Option<bool>,
    pub enabled_fallback: bool,
    pub permissions: Option<Vec<UserPermission>>,
    pub permissions_fallback: Vec<UserPermission>,
}

impl ResolvedUserAppSettings {
    pub fn effective_enabled(&self) -> bool {
        self.enabled.unwrap_or(self.enabled_fallback)
    }

    pub fn effective_permissions(&self) -> &[UserPermission] {
        self.permissions
            .as_deref()
            .unwrap_or(&self.permissions_fallback)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedFolderAppSettings {
    pub enabled: Option<bool>,
    pub enabled_fallback: Fallback<bool>,
    pub permissions: Option<Vec<FolderPermission>>,
    pub permissions_fallback: Fallback<Vec<FolderPermission>>,
}

impl ResolvedFolderAppSettings {
    pub fn effective_enabled(&self) -> bool {
        self.enabled.unwrap_or(self.enabled_fallback.value)
    }

    pub fn effective_permissions(&self) -> &[FolderPermission] {
        self.permissions
            .as_deref()
            .unwrap_or(&self.permissions_fallback.value)
    }
}

pub fn resolve_user_app_settings(
    app: &AppRecord,
    user: Option<&AppUserSettings>,
) -> ResolvedUserAppSettings {
    ResolvedUserAppSettings {
        enabled: user.and_then(|u| u.enabled),
        enabled_fallback: app.manifest.user_scope_enabled_default,
        permissions: user.and_then(|u| u.permissions.clone()),
        permissions_fallback: app.manifest.permissions.user.clone(),
    }
}

pub fn resolve_folder_app_settings(
    app: &AppRecord,
    user: Option<&AppUserSettings>,
    folder: Option<&AppFolderSettings>,
) -> ResolvedFolderAppSettings {
    let disabled_by_user = user.and_then(|u| u.enabled) == Some(false);
    // A folder-level `true` does not survive an explicit user-level `false`.
    let enabled = if disabled_by_user {
        None
    } else {
        folder.and_then(|f| f.enabled)
    };

    let enabled_fallback = match user.and_then(|u| u.folder_scope_enabled_default) {
        Some(value) => Fallback {
            value,
            source: SettingsSource::User,
        },
        None => Fallback {
            value: app.manifest.user_scope_enabled_default
                && app.manifest.folder_scope_enabled_default,
            source: SettingsSource::System,
        },
    };

    let permissions_fallback = match user.and_then(|u| u.folder_scope_permissions_default.clone())
    {
        Some(value) => Fallback {
            value,
            source: SettingsSource::User,
        },
        None => Fallback {
            value: app.manifest.permissions.folder.clone(),
            source: SettingsSource::System,
        },
    };

    ResolvedFolderAppSettings {
        enabled,
        enabled_fallback,
        permissions: folder.and_then(|f| f.permissions.clone()),
        permissions_fallback,
    }
}

/// Folder permissions needed to perform `methods` on a folder's objects.
pub fn required_folder_permissions(methods: &[StorageMethod]) -> BTreeSet<FolderPermission> {
    methods
        .iter()
        .map(|method| {
            if method.is_read() {
                FolderPermission::ReadObjects
            } else {
                FolderPermission::WriteObjects
            }
        })
        .collect()
}

/// Enforcement sites for the resolution rules above, backed by the store.
#[derive(Clone)]
pub struct PermissionEngine {
    apps: Arc<dyn AppStore>,
    directory: Arc<dyn DirectoryStore>,
    settings: Arc<dyn SettingsStore>,
}

impl PermissionEngine {
    pub fn new(
        apps: Arc<dyn AppStore>,
        directory: Arc<dyn DirectoryStore>,
        settings: Arc<dyn SettingsStore>,
    ) -> Self {
        Self {
            apps,
            directory,
            settings,
        }
    }

    pub async fn app(&self, identifier: &str) -> Result<AppRecord, ProtocolError> {
        self.apps
            .get_app(identifier)
            .await?
            .ok_or_else(|| ProtocolError::NotFound(format!("app `{identifier}`")))
    }

    /// User-scope access: the app may act on behalf of `user_id`.
    pub async fn check_user_access(
        &self,
        app: &AppRecord,
        user_id: &str,
    ) -> Result<ResolvedUserAppSettings, ProtocolError> {
        ensure_enabled(app)?;
        if self.directory.get_user(user_id).await?.is_none() {
            return Err(ProtocolError::NotFound(format!("user `{user_id}`")));
        }

        let user_settings = self
            .settings
            .get_user_app_settings(user_id, &app.identifier)
            .await?;
        let resolved = resolve_user_app_settings(app, user_settings.as_ref());
        if !resolved.effective_enabled() {
            debug!(app = %app.identifier, %user_id, "app not enabled for user");
            return Err(ProtocolError::Forbidden(format!(
                "app `{}` is not enabled for user `{user_id}`",
                app.identifier
            )));
        }
        Ok(resolved)
    }

    /// Folder-scope access with every permission in `required`.
    pub async fn check_folder_access(
        &self,
        app: &AppRecord,
        folder_id: &str,
        required: &BTreeSet<FolderPermission>,
    ) -> Result<FolderRecord, ProtocolError> {
        ensure_enabled(app)?;
        let folder = self
            .directory
            .get_folder(folder_id)
            .await?
            .ok_or_else(|| ProtocolError::NotFound(format!("folder `{folder_id}`")))?;
        if self.directory.get_user(&folder.owner_id).await?.is_none() {
            return Err(ProtocolError::NotFound(format!(
                "owner of folder `{folder_id}`"
            )));
        }

        let user_settings = self
            .settings
            .get_user_app_settings(&folder.owner_id, &app.identifier)
            .await?;
        if user_settings.as_ref().and_then(|u| u.enabled) == Some(false) {
            return Err(ProtocolError::Forbidden(format!(
                "app `{}` is disabled by the folder owner",
                app.identifier
            )));
        }

        let folder_settings = self
            .settings
            .get_folder_app_settings(folder_id, &app.identifier)
            .await?;
        let resolved =
            resolve_folder_app_settings(app, user_settings.as_ref(), folder_settings.as_ref());
        if !resolved.effective_enabled() {
            return Err(ProtocolError::Forbidden(format!(
                "app `{}` is not enabled for folder `{folder_id}`",
                app.identifier
            )));
        }

        let granted = resolved.effective_permissions();
        let missing: Vec<_> = required
            .iter()
            .filter(|permission| !granted.contains(*permission))
            .collect();
        if !missing.is_empty() {
            debug!(app = %app.identifier, %folder_id, ?missing, "folder permission denied");
            return Err(ProtocolError::Forbidden(format!(
                "app `{}` lacks {:?} on folder `{folder_id}`",
                app.identifier, missing
            )));
        }
        Ok(folder)
    }

    pub async fn check_storage_access(
        &self,
        app: &AppRecord,
        folder_id: &str,
        methods: &[StorageMethod],
    ) -> Result<FolderRecord, ProtocolError> {
        let required = required_folder_permissions(methods);
        self.check_folder_access(app, folder_id, &required).await
    }

    pub async fn set_user_app_settings(
        &self,
        settings: AppUserSettings,
    ) -> Result<(), ProtocolError> {
        self.app(&settings.app_identifier).await?;
        if self.directory.get_user(&settings.user_id).await?.is_none() {
            return Err(ProtocolError::NotFound(format!(
                "user `{}`",
                settings.user_id
            )));
        }
        self.settings.upsert_user_app_settings(settings).await?;
        Ok(())
    }

    /// Writes every entry for one folder in a single transaction.
    pub async fn set_folder_app_settings(
        &self,
        folder_id: &str,
        entries: Vec<AppFolderSettings>,
    ) -> Result<(), ProtocolError> {
        if self.directory.get_folder(folder_id).await?.is_none() {
            return Err(ProtocolError::NotFound(format!("folder `{folder_id}`")));
        }
        for entry in &entries {
            if entry.folder_id != folder_id {
                return Err(ProtocolError::bad_request(format!(
                    "settings for folder `{}` submitted under `{folder_id}`",
                    entry.folder_id
                )));
            }
            self.app(&entry.app_identifier).await?;
        }
        self.settings
            .upsert_folder_app_settings(folder_id, entries)
            .await?;
        Ok(())
    }
}

fn ensure_enabled(app: &AppRecord) -> Result<(), ProtocolError> {
    if app.enabled {
        Ok(())
    } else {
        Err(ProtocolError::Forbidden(format!(
            "app `{}` is disabled",
            app.identifier
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppManifest;

    fn app(user_default: bool, folder_default: bool) -> AppRecord {
        AppRecord {
            identifier: "gallery".into(),
            enabled: true,
            manifest: AppManifest {
                label: None,
                public_key: None,
                user_scope_enabled_default: user_default,
                folder_scope_enabled_default: folder_default,
                permissions: AppPermissions {
                    platform: vec![],
                    user: vec![UserPermission::ReadUser],
                    folder: vec![FolderPermission::ReadObjects],
                },
                emittable_events: vec![],
                tasks: vec![],
                workers: Default::default(),
                ui: None,
            },
        }
    }

    fn user(
        enabled: Option<bool>,
        folder_enabled: Option<bool>,
        folder_permissions: Option<Vec<FolderPermission>>,
    ) -> AppUserSettings {
        AppUserSettings {
            user_id: "u1".into(),
            app_identifier: "gallery".into(),
            enabled,
            folder_scope_enabled_default: folder_enabled,
            folder_scope_permissions_default: folder_permissions,
            permissions: None,
        }
    }

    fn folder(
        enabled: Option<bool>,
        permissions: Option<Vec<FolderPermission>>,
    ) -> AppFolderSettings {
        AppFolderSettings {
            folder_id: "f1".into(),
            app_identifier: "gallery".into(),
            enabled,
            permissions,
        }
    }

    #[test]
    fn user_level_without_record_is_all_system_defaults() {
        for default in [true, false] {
            let app = app(default, true);
            let resolved = resolve_user_app_settings(&app, None);
            assert_eq!(resolved.enabled, None);
            assert_eq!(resolved.permissions, None);
            assert_eq!(resolved.enabled_fallback, default);
            assert_eq!(resolved.permissions_fallback, app.manifest.permissions.user);
            assert_eq!(resolved.effective_enabled(), default);
        }
    }

    #[test]
    fn user_override_wins_over_default() {
        let app = app(false, false);
        let mut settings = user(Some(true), None, None);
        settings.permissions = Some(vec![]);
        let resolved = resolve_user_app_settings(&app, Some(&settings));
        assert!(resolved.effective_enabled());
        assert!(resolved.effective_permissions().is_empty());
        assert!(!resolved.enabled_fallback);
    }

    #[test]
    fn folder_defaults_fall_back_to_system() {
        let app = app(true, false);
        let resolved = resolve_folder_app_settings(&app, None, None);
        assert_eq!(resolved.enabled, None);
        assert_eq!(
            resolved.enabled_fallback,
            Fallback {
                value: false,
                source: SettingsSource::System
            }
        );
        assert_eq!(resolved.permissions_fallback.source, SettingsSource::System);
        assert!(!resolved.effective_enabled());
    }

    #[test]
    fn fallback_sources_are_chosen_independently() {
        let app = app(true, true);

        let only_enabled = user(None, Some(false), None);
        let resolved = resolve_folder_app_settings(&app, Some(&only_enabled), None);
        assert_eq!(resolved.enabled_fallback.source, SettingsSource::User);
        assert!(!resolved.enabled_fallback.value);
        assert_eq!(resolved.permissions_fallback.source, SettingsSource::System);

        let only_permissions = user(None, None, Some(vec![FolderPermission::WriteObjects]));
        let resolved = resolve_folder_app_settings(&app, Some(&only_permissions), None);
        assert_eq!(resolved.enabled_fallback.source, SettingsSource::System);
        assert_eq!(resolved.permissions_fallback.source, SettingsSource::User);
        assert_eq!(
            resolved.effective_permissions(),
            &[FolderPermission::WriteObjects]
        );
    }

    #[test]
    fn explicit_user_disable_suppresses_folder_enable() {
        let app = app(true, true);
        let resolved = resolve_folder_app_settings(
            &app,
            Some(&user(Some(false), None, None)),
            Some(&folder(Some(true), None)),
        );
        assert_eq!(resolved.enabled, None);

        let resolved = resolve_folder_app_settings(
            &app,
            Some(&user(Some(true), None, None)),
            Some(&folder(Some(true), None)),
        );
        assert_eq!(resolved.enabled, Some(true));
    }

    #[test]
    fn folder_permissions_override_everything() {
        let app = app(true, true);
        let resolved = resolve_folder_app_settings(
            &app,
            Some(&user(None, None, Some(vec![FolderPermission::WriteObjects]))),
            Some(&folder(None, Some(vec![FolderPermission::WriteObjectsMetadata]))),
        );
        assert_eq!(
            resolved.effective_permissions(),
            &[FolderPermission::WriteObjectsMetadata]
        );
    }

    #[test]
    fn methods_map_to_read_and_write() {
        let required =
            required_folder_permissions(&[StorageMethod::Get, StorageMethod::Head]);
        assert_eq!(
            required.into_iter().collect::<Vec<_>>(),
            vec![FolderPermission::ReadObjects]
        );

        let required = required_folder_permissions(&[StorageMethod::Delete, StorageMethod::Get]);
        assert_eq!(
            required.into_iter().collect::<Vec<_>>(),
            vec![FolderPermission::ReadObjects, FolderPermission::WriteObjects]
        );
    }
}
