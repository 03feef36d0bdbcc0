//! Task leases.
//!
//! A task moves `WAITING -> STARTED -> COMPLETED | FAILED`. Every transition
//! is one conditional update in the store; nothing here takes a lock, since
//! competing claimants live in other processes.

use std::sync::Arc;
use std::time::Duration;

use appgate_protocol::payloads::TaskFailure;
use appgate_protocol::results::{ClaimedTask, TaskResult};
use appgate_protocol::{HandlerKind, ProtocolError, Task, TaskState};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::identity::CallerIdentity;
use crate::store::{EventStore, StoreError, TaskStore};

pub const LEASE_EXPIRED_CODE: &str = "LEASE_EXPIRED";

/// Bounds the lookup-then-update loop of claim-any-available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimPolicy {
    pub max_attempts: u32,
    /// Delay before attempt `n` is `backoff * (n - 1)`.
    pub backoff: Duration,
}

impl Default for ClaimPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::ZERO,
        }
    }
}

impl ClaimPolicy {
    fn delay_before(&self, attempt: u32) -> Duration {
        self.backoff * attempt.saturating_sub(1)
    }
}

#[derive(Debug)]
enum ClaimOutcome {
    Claimed(Task),
    NoneAvailable,
    Exhausted { attempts: u32 },
}

#[derive(Clone)]
pub struct LeaseManager {
    tasks: Arc<dyn TaskStore>,
    events: Arc<dyn EventStore>,
    policy: ClaimPolicy,
}

impl LeaseManager {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        events: Arc<dyn EventStore>,
        policy: ClaimPolicy,
    ) -> Self {
        Self {
            tasks,
            events,
            policy,
        }
    }

    pub fn policy(&self) -> &ClaimPolicy {
        &self.policy
    }

    pub async fn claim_any_available(
        &self,
        caller: &CallerIdentity,
        task_identifiers: &[String],
    ) -> Result<ClaimedTask, ProtocolError> {
        match self.try_claim_any(caller, task_identifiers).await? {
            ClaimOutcome::Claimed(task) => {
                info!(task_id = %task.id, handler_id = %caller.handler_id(), "task claimed");
                self.with_event(task).await
            }
            ClaimOutcome::NoneAvailable => Err(ProtocolError::NotFound(
                "no task available".to_string(),
            )),
            ClaimOutcome::Exhausted { attempts } => {
                warn!(handler_id = %caller.handler_id(), attempts, "claim retries exhausted");
                Err(ProtocolError::Conflict(format!(
                    "lost the claim race {attempts} times"
                )))
            }
        }
    }

    async fn try_claim_any(
        &self,
        caller: &CallerIdentity,
        task_identifiers: &[String],
    ) -> Result<ClaimOutcome, ProtocolError> {
        let handler_id = caller.handler_id();
        let visible = if caller.privileged {
            None
        } else {
            Some(HandlerKind::External)
        };
        let attempts = self.policy.max_attempts.max(1);
        let mut saw_candidate = false;

        for attempt in 1..=attempts {
            let delay = self.policy.delay_before(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let candidate = self
                .tasks
                .find_claimable_task(&caller.app_identifier, task_identifiers, visible)
                .await?;
            let Some(candidate) = candidate else {
                if !saw_candidate {
                    return Ok(ClaimOutcome::NoneAvailable);
                }
                debug!(%handler_id, attempt, "candidate taken before lookup");
                continue;
            };
            saw_candidate = true;

            if self
                .tasks
                .try_start_task(&candidate.id, &handler_id, Utc::now())
                .await?
            {
                let task = self.reload(&candidate.id).await?;
                return Ok(ClaimOutcome::Claimed(task));
            }
            debug!(%handler_id, task_id = %candidate.id, attempt, "lost claim race");
        }

        Ok(ClaimOutcome::Exhausted { attempts })
    }

    /// Delegation of a specific task to the shared worker pool. The router
    /// only dispatches this for the privileged app.
    pub async fn claim_by_id(
        &self,
        caller: &CallerIdentity,
        task_id: &str,
    ) -> Result<ClaimedTask, ProtocolError> {
        let task = self.find(task_id).await?;
        if task.owner_identifier != caller.app_identifier
            && task.handler_identifier != HandlerKind::Worker
        {
            return Err(ProtocolError::Forbidden(format!(
                "task `{task_id}` is neither owned by `{}` nor worker-class",
                caller.app_identifier
            )));
        }
        if task.state() != TaskState::Waiting {
            return Err(ProtocolError::bad_request(format!(
                "task `{task_id}` is already {}",
                state_label(task.state())
            )));
        }

        let handler_id = caller.handler_id();
        if !self
            .tasks
            .try_start_task(task_id, &handler_id, Utc::now())
            .await?
        {
            return Err(ProtocolError::bad_request(format!(
                "task `{task_id}` was already claimed"
            )));
        }
        info!(%task_id, %handler_id, "worker task claimed by id");
        let task = self.reload(task_id).await?;
        self.with_event(task).await
    }

    pub async fn complete(
        &self,
        caller: &CallerIdentity,
        task_id: &str,
    ) -> Result<TaskResult, ProtocolError> {
        let handler_id = self.authorize_finish(caller, task_id).await?;
        if !self
            .tasks
            .try_complete_task(task_id, &handler_id, Utc::now())
            .await?
        {
            return Err(ProtocolError::Conflict(format!(
                "task `{task_id}` was finished concurrently"
            )));
        }
        info!(%task_id, %handler_id, "task completed");
        Ok(TaskResult {
            task: self.reload(task_id).await?,
        })
    }

    pub async fn fail(
        &self,
        caller: &CallerIdentity,
        task_id: &str,
        failure: TaskFailure,
    ) -> Result<TaskResult, ProtocolError> {
        let handler_id = self.authorize_finish(caller, task_id).await?;
        let code = failure.code.clone();
        if !self
            .tasks
            .try_fail_task(task_id, &handler_id, failure, Utc::now())
            .await?
        {
            return Err(ProtocolError::Conflict(format!(
                "task `{task_id}` was finished concurrently"
            )));
        }
        info!(%task_id, %handler_id, error_code = %code, "task failed");
        Ok(TaskResult {
            task: self.reload(task_id).await?,
        })
    }

    /// Ownership, state, then lease holder. Returns the caller's handler id.
    async fn authorize_finish(
        &self,
        caller: &CallerIdentity,
        task_id: &str,
    ) -> Result<String, ProtocolError> {
        let task = self.find(task_id).await?;
        let owns = task.owner_identifier == caller.app_identifier;
        let allowed = if caller.privileged {
            owns || task.handler_identifier == HandlerKind::Worker
        } else {
            owns && task.handler_identifier == HandlerKind::External
        };
        if !allowed {
            return Err(ProtocolError::Forbidden(format!(
                "`{}` may not finish task `{task_id}`",
                caller.app_identifier
            )));
        }

        if task.state() != TaskState::Started {
            return Err(ProtocolError::Conflict(format!(
                "task `{task_id}` is {}",
                state_label(task.state())
            )));
        }

        let handler_id = caller.handler_id();
        if task.handler_id.as_deref() != Some(handler_id.as_str()) {
            return Err(ProtocolError::Forbidden(format!(
                "task `{task_id}` is held by another handler"
            )));
        }
        Ok(handler_id)
    }

    /// Fails every lease started more than `ttl` ago. Returns how many expired.
    pub async fn sweep_expired(&self, ttl: chrono::Duration) -> Result<usize, StoreError> {
        let now = Utc::now();
        let stale = self.tasks.list_started_before(now - ttl).await?;
        let mut expired = 0;
        for task in stale {
            let Some(started_at) = task.started_at else {
                continue;
            };
            let failure = TaskFailure {
                code: LEASE_EXPIRED_CODE.to_string(),
                message: format!(
                    "lease held by {} expired",
                    task.handler_id.as_deref().unwrap_or("unknown handler")
                ),
                details: None,
            };
            if self
                .tasks
                .try_expire_task(&task.id, started_at, failure, now)
                .await?
            {
                warn!(task_id = %task.id, handler_id = ?task.handler_id, "task lease expired");
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn find(&self, task_id: &str) -> Result<Task, ProtocolError> {
        self.tasks
            .get_task(task_id)
            .await?
            .ok_or_else(|| ProtocolError::NotFound(format!("task `{task_id}`")))
    }

    async fn reload(&self, task_id: &str) -> Result<Task, ProtocolError> {
        self.tasks.get_task(task_id).await?.ok_or_else(|| {
            ProtocolError::Internal(format!("task `{task_id}` vanished after update"))
        })
    }

    async fn with_event(&self, task: Task) -> Result<ClaimedTask, ProtocolError> {
        let event = match task.triggering_event_id.as_deref() {
            Some(event_id) => self.events.get_event(event_id).await?,
            None => None,
        };
        Ok(ClaimedTask { task, event })
    }
}

fn state_label(state: TaskState) -> &'static str {
    match state {
        TaskState::Waiting => "waiting",
        TaskState::Started => "started",
        TaskState::Completed => "completed",
        TaskState::Failed => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use appgate_protocol::{ErrorCode, Event};
    use chrono::{DateTime, Duration as ChronoDuration};
    use serde_json::json;

    fn task(id: &str, owner: &str, handler: HandlerKind, created_at: DateTime<Utc>) -> Task {
        Task {
            id: id.to_string(),
            owner_identifier: owner.to_string(),
            handler_identifier: handler,
            handler_id: None,
            task_identifier: "thumbnail".into(),
            triggering_event_id: None,
            input_data: json!({}),
            created_at,
            started_at: None,
            completed_at: None,
            error_at: None,
            error_code: None,
            error_message: None,
            error_details: None,
        }
    }

    fn manager(store: &Arc<SqliteStore>) -> LeaseManager {
        LeaseManager::new(store.clone(), store.clone(), ClaimPolicy::default())
    }

    fn thumbnail() -> Vec<String> {
        vec!["thumbnail".to_string()]
    }

    fn core(instance: &str) -> CallerIdentity {
        CallerIdentity::new("core", instance, true)
    }

    fn gallery(instance: &str) -> CallerIdentity {
        CallerIdentity::new("gallery", instance, false)
    }

    #[tokio::test]
    async fn claim_any_attaches_triggering_event() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let event = Event {
            id: "e1".into(),
            emitter_identifier: "core".into(),
            event_identifier: "object_added".into(),
            data: json!({ "objectKey": "a.jpg" }),
            created_at: Utc::now(),
        };
        let mut t = task("t1", "gallery", HandlerKind::External, Utc::now());
        t.triggering_event_id = Some("e1".into());
        store.record_event(event.clone(), vec![t]).await.unwrap();

        let claimed = manager(&store)
            .claim_any_available(&gallery("w1"), &thumbnail())
            .await
            .unwrap();
        assert_eq!(claimed.task.handler_id.as_deref(), Some("gallery:w1"));
        assert_eq!(claimed.task.state(), TaskState::Started);
        assert_eq!(claimed.event, Some(event));
    }

    #[tokio::test]
    async fn claim_any_with_nothing_waiting_is_not_found() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let err = manager(&store)
            .claim_any_available(&gallery("w1"), &thumbnail())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn apps_only_see_their_external_tasks() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .insert_task(task("w", "gallery", HandlerKind::Worker, Utc::now()))
            .await
            .unwrap();
        let leases = manager(&store);

        let err = leases
            .claim_any_available(&gallery("w1"), &thumbnail())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);

        let notes = CallerIdentity::new("notes", "w1", false);
        store
            .insert_task(task("x", "gallery", HandlerKind::External, Utc::now()))
            .await
            .unwrap();
        let err = leases
            .claim_any_available(&notes, &thumbnail())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn claim_by_id_is_single_shot() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .insert_task(task("w", "gallery", HandlerKind::Worker, Utc::now()))
            .await
            .unwrap();
        let leases = manager(&store);

        let claimed = leases.claim_by_id(&core("pool-1"), "w").await.unwrap();
        assert_eq!(claimed.task.handler_id.as_deref(), Some("core:pool-1"));

        let err = leases.claim_by_id(&core("pool-2"), "w").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadRequest);

        let err = leases.claim_by_id(&core("pool-2"), "ghost").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn claim_by_id_rejects_foreign_external_tasks() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .insert_task(task("x", "gallery", HandlerKind::External, Utc::now()))
            .await
            .unwrap();
        let err = manager(&store)
            .claim_by_id(&core("pool-1"), "x")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);
    }

    #[tokio::test]
    async fn complete_twice_conflicts() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .insert_task(task("t1", "gallery", HandlerKind::External, Utc::now()))
            .await
            .unwrap();
        let leases = manager(&store);
        let caller = gallery("w1");
        leases.claim_any_available(&caller, &thumbnail()).await.unwrap();

        let done = leases.complete(&caller, "t1").await.unwrap();
        assert_eq!(done.task.state(), TaskState::Completed);

        let err = leases.complete(&caller, "t1").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);
        let err = leases
            .fail(
                &caller,
                "t1",
                TaskFailure {
                    code: "BOOM".into(),
                    message: "late".into(),
                    details: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);
    }

    #[tokio::test]
    async fn finishing_requires_the_lease_holder() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .insert_task(task("t1", "gallery", HandlerKind::External, Utc::now()))
            .await
            .unwrap();
        let leases = manager(&store);
        leases
            .claim_any_available(&gallery("w1"), &thumbnail())
            .await
            .unwrap();

        let err = leases.complete(&gallery("w2"), "t1").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);

        let err = leases.complete(&gallery("w1"), "ghost").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn completing_a_waiting_task_conflicts() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .insert_task(task("t1", "gallery", HandlerKind::External, Utc::now()))
            .await
            .unwrap();
        let err = manager(&store)
            .complete(&gallery("w1"), "t1")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);
    }

    #[tokio::test]
    async fn ownership_rule_is_asymmetric() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .insert_task(task("w", "gallery", HandlerKind::Worker, Utc::now()))
            .await
            .unwrap();
        let leases = manager(&store);
        let pool = core("pool-1");
        leases.claim_by_id(&pool, "w").await.unwrap();

        // gallery owns it but worker-class tasks are not theirs to finish
        let err = leases.complete(&gallery("w1"), "w").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);

        let failed = leases
            .fail(
                &pool,
                "w",
                TaskFailure {
                    code: "EXIT_1".into(),
                    message: "worker exited".into(),
                    details: Some(json!({ "status": 1 })),
                },
            )
            .await
            .unwrap();
        assert_eq!(failed.task.state(), TaskState::Failed);
        assert_eq!(failed.task.error_code.as_deref(), Some("EXIT_1"));
        assert_eq!(failed.task.error_details, Some(json!({ "status": 1 })));
    }

    #[tokio::test]
    async fn sweep_expires_only_stale_leases() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let leases = manager(&store);
        for id in ["old", "fresh"] {
            store
                .insert_task(task(id, "gallery", HandlerKind::External, Utc::now()))
                .await
                .unwrap();
        }
        store
            .try_start_task("old", "gallery:w1", Utc::now() - ChronoDuration::minutes(30))
            .await
            .unwrap();
        store
            .try_start_task("fresh", "gallery:w2", Utc::now())
            .await
            .unwrap();

        let expired = leases
            .sweep_expired(ChronoDuration::minutes(10))
            .await
            .unwrap();
        assert_eq!(expired, 1);

        let old = store.get_task("old").await.unwrap().unwrap();
        assert_eq!(old.state(), TaskState::Failed);
        assert_eq!(old.error_code.as_deref(), Some(LEASE_EXPIRED_CODE));
        assert_eq!(old.handler_id.as_deref(), Some("gallery:w1"));

        let fresh = store.get_task("fresh").await.unwrap().unwrap();
        assert_eq!(fresh.state(), TaskState::Started);
    }

    #[test]
    fn backoff_is_linear() {
        let policy = ClaimPolicy {
            max_attempts: 5,
            backoff: Duration::from_millis(10),
        };
        assert_eq!(policy.delay_before(1), Duration::ZERO);
        assert_eq!(policy.delay_before(3), Duration::from_millis(20));
    }
}
