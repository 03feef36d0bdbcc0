//! Event publication and trigger fan-out.

use std::sync::Arc;

use appgate_protocol::{Event, ProtocolError, Task};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::app::AppRecord;
use crate::store::{AppStore, EventStore};

#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publishes an event already authorized for `emitter`. Returns the event id.
    async fn publish(
        &self,
        emitter: &AppRecord,
        event_identifier: &str,
        data: Map<String, Value>,
    ) -> Result<String, ProtocolError>;
}

/// Persists events in the core store and schedules one `WAITING` task per
/// matching trigger across enabled apps.
pub struct StoreEventSink {
    apps: Arc<dyn AppStore>,
    events: Arc<dyn EventStore>,
}

impl StoreEventSink {
    pub fn new(apps: Arc<dyn AppStore>, events: Arc<dyn EventStore>) -> Self {
        Self { apps, events }
    }
}

/// Tasks each enabled app declared for `event`, in app then manifest order.
pub fn triggered_tasks(apps: &[AppRecord], event: &Event) -> Vec<Task> {
    apps.iter()
        .filter(|app| app.enabled)
        .flat_map(|app| {
            app.tasks_triggered_by(&event.event_identifier)
                .map(move |definition| Task {
                    id: Uuid::new_v4().to_string(),
                    owner_identifier: app.identifier.clone(),
                    handler_identifier: definition.handler,
                    handler_id: None,
                    task_identifier: definition.identifier.clone(),
                    triggering_event_id: Some(event.id.clone()),
                    input_data: event.data.clone(),
                    created_at: event.created_at,
                    started_at: None,
                    completed_at: None,
                    error_at: None,
                    error_code: None,
                    error_message: None,
                    error_details: None,
                })
        })
        .collect()
}

#[async_trait]
impl EventSink for StoreEventSink {
    async fn publish(
        &self,
        emitter: &AppRecord,
        event_identifier: &str,
        data: Map<String, Value>,
    ) -> Result<String, ProtocolError> {
        let event = Event {
            id: Uuid::new_v4().to_string(),
            emitter_identifier: emitter.identifier.clone(),
            event_identifier: event_identifier.to_string(),
            data: Value::Object(data),
            created_at: Utc::now(),
        };

        let apps = self.apps.list_enabled_apps().await?;
        let triggered = triggered_tasks(&apps, &event);
        for task in &triggered {
            debug!(
                event_id = %event.id,
                task_id = %task.id,
                owner = %task.owner_identifier,
                task_identifier = %task.task_identifier,
                "scheduling triggered task"
            );
        }

        let event_id = event.id.clone();
        let scheduled = triggered.len();
        self.events.record_event(event, triggered).await?;
        info!(
            %event_id,
            emitter = %emitter.identifier,
            %event_identifier,
            scheduled,
            "event published"
        );
        Ok(event_id)
    }
}
