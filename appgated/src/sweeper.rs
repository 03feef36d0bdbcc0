//! Background expiry of abandoned task leases.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::tasks::LeaseManager;

/// Fails `STARTED` tasks older than `ttl` every `interval`.
pub fn spawn_lease_sweeper(
    leases: LeaseManager,
    ttl: Duration,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    tokio::spawn(async move {
        debug!(ttl_secs = ttl.num_seconds(), "Lease sweeper started");
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match leases.sweep_expired(ttl).await {
                Ok(0) => {}
                Ok(expired) => info!(expired, "Expired abandoned task leases"),
                Err(err) => warn!("Lease sweep failed: {}", err),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SqliteStore, TaskStore};
    use crate::tasks::ClaimPolicy;
    use appgate_protocol::{HandlerKind, Task, TaskState};
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn sweeper_expires_stale_lease_in_background() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .insert_task(Task {
                id: "t1".into(),
                owner_identifier: "gallery".into(),
                handler_identifier: HandlerKind::External,
                handler_id: None,
                task_identifier: "thumbnail".into(),
                triggering_event_id: None,
                input_data: json!({}),
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                error_at: None,
                error_code: None,
                error_message: None,
                error_details: None,
            })
            .await
            .unwrap();
        store
            .try_start_task("t1", "gallery:w1", Utc::now() - chrono::Duration::seconds(5))
            .await
            .unwrap();

        let leases = LeaseManager::new(store.clone(), store.clone(), ClaimPolicy::default());
        let handle = spawn_lease_sweeper(leases, Duration::from_secs(1), Duration::from_millis(20));

        let mut state = TaskState::Started;
        for _ in 0..50 {
            state = store.get_task("t1").await.unwrap().unwrap().state();
            if state == TaskState::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.abort();
        assert_eq!(state, TaskState::Failed);
    }
}
