mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use appgate_protocol::payloads::TaskFailure;
use appgate_protocol::{HandlerKind, ProtocolError, Task};
use appgated::store::{SqliteStore, StoreResult, TaskStore};
use appgated::tasks::{ClaimPolicy, LeaseManager};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{gallery, waiting_task};
use tokio::sync::Barrier;

/// Holds the first `gated` candidate lookups at a barrier so every claimant
/// sees the same waiting task before anyone updates it.
struct GatedTasks {
    inner: Arc<SqliteStore>,
    barrier: Barrier,
    gated: usize,
    lookups: AtomicUsize,
    starts: AtomicUsize,
}

impl GatedTasks {
    fn new(inner: Arc<SqliteStore>, gated: usize) -> Self {
        Self {
            inner,
            barrier: Barrier::new(gated.max(1)),
            gated,
            lookups: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TaskStore for GatedTasks {
    async fn insert_task(&self, task: Task) -> StoreResult<()> {
        self.inner.insert_task(task).await
    }

    async fn get_task(&self, id: &str) -> StoreResult<Option<Task>> {
        self.inner.get_task(id).await
    }

    async fn find_claimable_task(
        &self,
        owner: &str,
        task_identifiers: &[String],
        handler: Option<HandlerKind>,
    ) -> StoreResult<Option<Task>> {
        let found = self
            .inner
            .find_claimable_task(owner, task_identifiers, handler)
            .await;
        if self.lookups.fetch_add(1, Ordering::SeqCst) < self.gated {
            self.barrier.wait().await;
        }
        found
    }

    async fn try_start_task(
        &self,
        task_id: &str,
        handler_id: &str,
        started_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.inner
            .try_start_task(task_id, handler_id, started_at)
            .await
    }

    async fn try_complete_task(
        &self,
        task_id: &str,
        handler_id: &str,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.inner
            .try_complete_task(task_id, handler_id, completed_at)
            .await
    }

    async fn try_fail_task(
        &self,
        task_id: &str,
        handler_id: &str,
        failure: TaskFailure,
        error_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.inner
            .try_fail_task(task_id, handler_id, failure, error_at)
            .await
    }

    async fn list_started_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Task>> {
        self.inner.list_started_before(cutoff).await
    }

    async fn try_expire_task(
        &self,
        task_id: &str,
        observed_started_at: DateTime<Utc>,
        failure: TaskFailure,
        error_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.inner
            .try_expire_task(task_id, observed_started_at, failure, error_at)
            .await
    }
}

fn manager(gated: &Arc<GatedTasks>, store: &Arc<SqliteStore>) -> LeaseManager {
    LeaseManager::new(gated.clone(), store.clone(), ClaimPolicy::default())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn racing_claimants_get_one_lease_and_one_conflict() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    store
        .insert_task(waiting_task("t1", "gallery", HandlerKind::External, "thumbnail"))
        .await
        .unwrap();
    let gated = Arc::new(GatedTasks::new(store.clone(), 2));
    let leases = manager(&gated, &store);
    let wanted = vec!["thumbnail".to_string()];

    let (caller_a, caller_b) = (gallery("a"), gallery("b"));
    let (a, b) = tokio::join!(
        leases.claim_any_available(&caller_a, &wanted),
        leases.claim_any_available(&caller_b, &wanted),
    );

    let (winner, loser) = match (a, b) {
        (Ok(claimed), Err(err)) | (Err(err), Ok(claimed)) => (claimed, err),
        other => panic!("expected exactly one winner, got {other:?}"),
    };
    assert_eq!(winner.task.id, "t1");
    assert!(matches!(loser, ProtocolError::Conflict(_)));

    // Both tried the conditional update once; the loser then found nothing
    // on each of its remaining attempts.
    assert_eq!(gated.starts.load(Ordering::SeqCst), 2);
    assert_eq!(gated.lookups.load(Ordering::SeqCst), 2 + 4);

    let stored = store.get_task("t1").await.unwrap().unwrap();
    assert_eq!(stored.handler_id, winner.task.handler_id);
}

#[tokio::test]
async fn single_claimant_with_nothing_waiting_gets_not_found() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let gated = Arc::new(GatedTasks::new(store.clone(), 0));
    let leases = manager(&gated, &store);

    let err = leases
        .claim_any_available(&gallery("a"), &["thumbnail".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::NotFound(_)));
    assert_eq!(gated.lookups.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_claimants_never_share_a_task() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    for n in 0..3 {
        store
            .insert_task(waiting_task(
                &format!("t{n}"),
                "gallery",
                HandlerKind::External,
                "thumbnail",
            ))
            .await
            .unwrap();
    }
    let leases = LeaseManager::new(store.clone(), store.clone(), ClaimPolicy::default());

    let mut handles = Vec::new();
    for n in 0..8 {
        let leases = leases.clone();
        handles.push(tokio::spawn(async move {
            leases
                .claim_any_available(&gallery(&format!("w{n}")), &["thumbnail".to_string()])
                .await
        }));
    }

    let mut claimed = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(task) => claimed.push(task.task.id),
            Err(ProtocolError::NotFound(_)) | Err(ProtocolError::Conflict(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(claimed.len(), 3, "one lease per task");
    claimed.sort();
    claimed.dedup();
    assert_eq!(claimed.len(), 3, "no task leased twice");

    for n in 0..3 {
        let task = store.get_task(&format!("t{n}")).await.unwrap().unwrap();
        assert!(task.handler_id.is_some());
    }
}
