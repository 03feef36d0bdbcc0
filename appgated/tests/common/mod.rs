#![allow(dead_code)]

use std::sync::Arc;

use appgate_protocol::{HandlerKind, ResponseFrame, Task};
use appgated::config::{parse_config, DaemonConfig};
use appgated::gateway::{seed_store, Gateway};
use appgated::identity::CallerIdentity;
use appgated::store::app_data::SqliteAppData;
use appgated::store::SqliteStore;
use chrono::Utc;
use serde_json::{json, Value};

pub const CORE_SECRET: &str = "test-core-secret";
pub const GALLERY_PRIVATE: &[u8] = include_bytes!("../fixtures/gallery_private.pem");
pub const GALLERY_PUBLIC: &str = include_str!("../fixtures/gallery_public.pem");
pub const ROGUE_PRIVATE: &[u8] = include_bytes!("../fixtures/rogue_private.pem");

pub const CONFIG: &str = r#"
[daemon]
privileged_app = "core"

[tokens]
audience = "appgate-tests"

[storage.app_storage]
endpoint = "https://objects.example.com"
bucket = "app-storage"
prefix = "apps"
access_key_id = "AK-APP"
secret_access_key = "app-secret"

[storage.bundle_storage]
endpoint = "https://objects.example.com"
bucket = "bundles"
access_key_id = "AK-BUNDLE"
secret_access_key = "bundle-secret"

[[apps]]
identifier = "core"
user_scope_enabled_default = true
folder_scope_enabled_default = true

[[apps.tasks]]
identifier = "reindex"
handler = "worker"
triggers = ["folder_moved"]

[[apps]]
identifier = "gallery"
user_scope_enabled_default = true
folder_scope_enabled_default = true
emittable_events = ["photo_tagged"]

[apps.permissions]
user = ["READ_USER"]
folder = ["READ_OBJECTS", "WRITE_OBJECTS_METADATA"]

[[apps.tasks]]
identifier = "thumbnail"
handler = "external"
triggers = ["photo_tagged"]

[[apps.tasks]]
identifier = "resize"
handler = "worker"
triggers = ["photo_tagged"]

[apps.workers.resize]
entrypoint = "resize.js"
bundle_hash = "w-hash"

[apps.workers.resize.environment]
MAX_EDGE = "2048"

[apps.ui]
bundle_hash = "ui-hash"

[[apps]]
identifier = "notes"
enabled = false
emittable_events = ["note_saved"]

[[users]]
id = "u1"
username = "ada"

[[folders]]
id = "f1"
owner_id = "u1"

[folders.content_location]
endpoint = "https://objects.example.com"
bucket = "content"
prefix = "users/u1/"
access_key_id = "AK-CONTENT"
secret_access_key = "content-secret"

[folders.metadata_location]
endpoint = "https://objects.example.com"
bucket = "metadata"
prefix = "users/u1"
access_key_id = "AK-META"
secret_access_key = "meta-secret"
"#;

pub fn config() -> DaemonConfig {
    let mut config = parse_config(CONFIG, None).unwrap();
    for seed in &mut config.apps {
        if seed.identifier == "gallery" {
            seed.manifest.public_key = Some(GALLERY_PUBLIC.to_string());
        }
    }
    config
}

pub struct Harness {
    pub store: Arc<SqliteStore>,
    pub gateway: Gateway,
    pub config: DaemonConfig,
}

pub async fn harness() -> Harness {
    harness_with(config()).await
}

pub async fn harness_with(config: DaemonConfig) -> Harness {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    seed_store(&store, &config).await.unwrap();
    let gateway = Gateway::new(
        store.clone(),
        Arc::new(SqliteAppData::in_memory()),
        &config,
        CORE_SECRET,
    );
    Harness {
        store,
        gateway,
        config,
    }
}

pub fn core(instance: &str) -> CallerIdentity {
    CallerIdentity::new("core", instance, true)
}

pub fn gallery(instance: &str) -> CallerIdentity {
    CallerIdentity::new("gallery", instance, false)
}

pub fn notes(instance: &str) -> CallerIdentity {
    CallerIdentity::new("notes", instance, false)
}

impl Harness {
    pub async fn call(&self, caller: &CallerIdentity, name: &str, data: Value) -> ResponseFrame {
        let frame = json!({ "id": "r1", "name": name, "data": data });
        let response = self.gateway.router().handle_frame(caller, &frame).await;
        assert_eq!(response.id.as_deref(), Some("r1"));
        response
    }

    pub async fn ok(&self, caller: &CallerIdentity, name: &str, data: Value) -> Value {
        let response = self.call(caller, name, data).await;
        match (response.result, response.error) {
            (Some(result), None) => result,
            (_, error) => panic!("{name} failed: {error:?}"),
        }
    }

    /// Numeric error code of a request expected to fail.
    pub async fn code(&self, caller: &CallerIdentity, name: &str, data: Value) -> u16 {
        let response = self.call(caller, name, data).await;
        match response.error {
            Some(error) => error.code.as_u16(),
            None => panic!("{name} unexpectedly succeeded: {:?}", response.result),
        }
    }
}

pub fn waiting_task(id: &str, owner: &str, handler: HandlerKind, identifier: &str) -> Task {
    Task {
        id: id.to_string(),
        owner_identifier: owner.to_string(),
        handler_identifier: handler,
        handler_id: None,
        task_identifier: identifier.to_string(),
        triggering_event_id: None,
        input_data: json!({}),
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
        error_at: None,
        error_code: None,
        error_message: None,
        error_details: None,
    }
}
