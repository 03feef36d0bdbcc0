use std::collections::BTreeMap;

use appgate_protocol::HandlerKind;
use serde::{Deserialize, Serialize};

use crate::permissions::AppPermissions;

/// Installed app as the core sees it. The manifest is what the app declared;
/// `enabled` is platform state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppRecord {
    pub identifier: String,
    pub enabled: bool,
    pub manifest: AppManifest,
}

impl AppRecord {
    pub fn can_emit(&self, event_identifier: &str) -> bool {
        self.manifest
            .emittable_events
            .iter()
            .any(|allowed| allowed == event_identifier)
    }

    /// Task definitions that should be scheduled when `event_identifier` fires.
    pub fn tasks_triggered_by<'a>(
        &'a self,
        event_identifier: &'a str,
    ) -> impl Iterator<Item = &'a TaskDefinition> + 'a {
        self.manifest
            .tasks
            .iter()
            .filter(move |task| task.triggers.iter().any(|t| t == event_identifier))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppManifest {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub user_scope_enabled_default: bool,
    #[serde(default)]
    pub folder_scope_enabled_default: bool,
    #[serde(default)]
    pub permissions: AppPermissions,
    #[serde(default)]
    pub emittable_events: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
    #[serde(default)]
    pub workers: BTreeMap<String, WorkerBundle>,
    #[serde(default)]
    pub ui: Option<UiBundle>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub identifier: String,
    pub handler: HandlerKind,
    #[serde(default)]
    pub triggers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerBundle {
    pub entrypoint: String,
    pub bundle_hash: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiBundle {
    pub bundle_hash: String,
}

/// App identifiers end up in file names and object keys, so they are kept to
/// a conservative alphabet.
pub fn validate_identifier(identifier: &str) -> Result<(), String> {
    if identifier.is_empty() || identifier.len() > 64 {
        return Err("identifier must be 1-64 characters".to_string());
    }
    if !identifier
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        return Err(format!(
            "identifier `{identifier}` may only contain a-z, 0-9, '-' and '_'"
        ));
    }
    Ok(())
}
