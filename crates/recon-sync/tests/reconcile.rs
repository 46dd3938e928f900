use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recon_core::{
    ExistingRecord, ExternalRecord, Post, PostDraft, RecordRef, ScopeFilter, SyncRequest,
    SyncStage,
};
use recon_storage::{ContentStore, MemoryContentStore, StoreError};
use recon_sync::{RevalidationHook, SyncConfig, SyncEngine};

/// Memory store with switchable failures for the write and load paths.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryContentStore,
    reject_ids: Mutex<BTreeSet<String>>,
    reject_batch_deletes: AtomicBool,
    outage: AtomicBool,
    fail_load: AtomicBool,
    writes: AtomicUsize,
}

impl FlakyStore {
    fn reject(&self, id: &str) {
        self.reject_ids.lock().unwrap().insert(id.to_string());
    }

    fn check(&self, reference: &RecordRef) -> Result<(), StoreError> {
        if self.outage.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        if self.reject_ids.lock().unwrap().contains(&reference.identity) {
            return Err(StoreError::Rejected {
                reference: reference.clone(),
                message: "constraint violation".into(),
            });
        }
        Ok(())
    }

    fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentStore for FlakyStore {
    async fn load_existing(&self, filter: &ScopeFilter) -> Result<Vec<ExistingRecord>, StoreError> {
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("read timed out".into()));
        }
        self.inner.load_existing(filter).await
    }

    async fn insert(&self, draft: &PostDraft, updated_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.check(&draft.reference())?;
        self.inner.insert(draft, updated_at).await
    }

    async fn update(
        &self,
        target: &RecordRef,
        draft: &PostDraft,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.check(target)?;
        self.inner.update(target, draft, updated_at).await
    }

    async fn delete(&self, targets: &[RecordRef]) -> Result<u64, StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if targets.len() > 1 && self.reject_batch_deletes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("batch delete not supported".into()));
        }
        for target in targets {
            self.check(target)?;
        }
        self.inner.delete(targets).await
    }

    async fn list(&self, filter: &ScopeFilter) -> Result<Vec<Post>, StoreError> {
        self.inner.list(filter).await
    }
}

#[derive(Default)]
struct RecordingHook {
    calls: Mutex<Vec<(BTreeSet<String>, Option<String>)>>,
}

#[async_trait]
impl RevalidationHook for RecordingHook {
    async fn revalidate(&self, slugs: &[String], scope: Option<&str>) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push((
            slugs.iter().cloned().collect(),
            scope.map(ToString::to_string),
        ));
        Ok(())
    }
}

impl RecordingHook {
    /// Revalidation runs on a detached task; wait until `count` calls landed.
    async fn wait_for(&self, count: usize) -> Vec<(BTreeSet<String>, Option<String>)> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let calls = self.calls.lock().unwrap().clone();
                if calls.len() >= count {
                    return calls;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("revalidation hook was not called")
    }
}

fn record(id: usize) -> ExternalRecord {
    ExternalRecord::new()
        .with("id", id.to_string())
        .with("title", format!("Post number {id}"))
        .with("body", "Hello")
        .with("categories", "news|rust")
        .with("last_modified", "2024-05-01 10:00")
}

fn setup(batch_size: usize) -> (Arc<FlakyStore>, Arc<RecordingHook>, SyncEngine) {
    let store = Arc::new(FlakyStore::default());
    let hook = Arc::new(RecordingHook::default());
    let config = SyncConfig {
        batch_size,
        ..SyncConfig::default()
    };
    let engine = SyncEngine::new(store.clone(), &config).with_hook(hook.clone());
    (store, hook, engine)
}

#[tokio::test]
async fn one_failing_record_does_not_stop_the_rest() {
    let (store, _hook, engine) = setup(3);
    store.reject("5");
    let records = (1..=10).map(record).collect();

    let result = engine.run(SyncRequest::new(Some("alice"), records)).await;

    assert!(result.success());
    assert_eq!(result.stats.inserted, 9);
    assert_eq!(result.stats.errors, 1);
    assert_eq!(result.error_details.len(), 1);
    assert!(result.error_details[0].starts_with("insert 5:"));
    assert_eq!(store.inner.len().await, 9);
    assert!(store.inner.get(&RecordRef::new(Some("alice"), "5")).await.is_none());
}

#[tokio::test]
async fn total_outage_fails_the_request() {
    let (store, hook, engine) = setup(20);
    store.outage.store(true, Ordering::SeqCst);

    let result = engine
        .run(SyncRequest::new(Some("alice"), (1..=4).map(record).collect()))
        .await;

    assert!(!result.success());
    assert_eq!(result.stage, SyncStage::Failed);
    assert_eq!(result.failed_stage, Some(SyncStage::Executing));
    assert_eq!(result.stats.errors, 4);
    assert!(hook.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn load_failure_is_fatal_and_writes_nothing() {
    let (store, hook, engine) = setup(20);
    store.fail_load.store(true, Ordering::SeqCst);

    let result = engine
        .run(SyncRequest::new(Some("alice"), vec![record(1)]))
        .await;

    assert!(!result.success());
    assert_eq!(result.failed_stage, Some(SyncStage::Normalized));
    assert!(result.error.unwrap().contains("failed to load existing records"));
    assert_eq!(store.writes(), 0);
    assert!(hook.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn blank_scope_is_rejected_before_any_io() {
    let (store, _hook, engine) = setup(20);

    let result = engine.run(SyncRequest::new(Some("   "), vec![record(1)])).await;

    assert!(!result.success());
    assert_eq!(result.failed_stage, Some(SyncStage::Received));
    assert_eq!(store.writes(), 0);
}

#[tokio::test]
async fn replaying_the_same_payload_skips_everything() {
    let (store, hook, engine) = setup(20);
    let request = SyncRequest::new(Some("alice"), (1..=5).map(record).collect()).optimize_by_date(true);

    let first = engine.run(request.clone()).await;
    assert_eq!(first.stats.inserted, 5);
    hook.wait_for(1).await;
    let writes_after_first = store.writes();

    let second = engine.run(request).await;
    assert!(second.success());
    assert_eq!(second.stats.skipped, 5);
    assert_eq!(
        (second.stats.inserted, second.stats.updated, second.stats.deleted),
        (0, 0, 0)
    );
    assert_eq!(store.writes(), writes_after_first);
    assert_eq!(hook.wait_for(1).await.len(), 1);
}

#[tokio::test]
async fn revalidation_gets_affected_slugs_and_scope() {
    let (_store, hook, engine) = setup(20);
    engine
        .run(SyncRequest::new(Some("alice"), vec![record(1), record(2)]))
        .await;

    let calls = hook.wait_for(1).await;
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0].0,
        BTreeSet::from(["post-number-1".to_string(), "post-number-2".to_string()])
    );
    assert_eq!(calls[0].1.as_deref(), Some("alice"));
}

#[tokio::test]
async fn scopes_are_isolated_from_each_other() {
    let (store, _hook, engine) = setup(20);
    engine
        .run(SyncRequest::new(Some("alice"), vec![record(1), record(2)]))
        .await;

    let result = engine
        .run(SyncRequest::new(Some("bob"), vec![record(1)]))
        .await;

    assert_eq!(result.stats.inserted, 1);
    assert_eq!(result.stats.deleted, 0);
    assert_eq!(store.inner.len().await, 3);
}

#[tokio::test]
async fn explicit_and_absent_records_are_deleted() {
    let (store, _hook, engine) = setup(20);
    engine
        .run(SyncRequest::new(Some("alice"), vec![record(1), record(2)]))
        .await;

    let unpublish = record(1).with("publish", false);
    let result = engine
        .run(SyncRequest::new(Some("alice"), vec![unpublish]))
        .await;

    assert!(result.success());
    assert_eq!(result.stats.deleted, 2);
    assert!(store.inner.is_empty().await);
}

#[tokio::test]
async fn failed_batch_delete_is_retried_per_record() {
    let (store, _hook, engine) = setup(20);
    engine
        .run(SyncRequest::new(Some("alice"), (1..=3).map(record).collect()))
        .await;
    store.reject_batch_deletes.store(true, Ordering::SeqCst);
    store.reject("2");

    let result = engine.run(SyncRequest::new(Some("alice"), vec![])).await;

    assert!(result.success());
    assert_eq!(result.stats.deleted, 2);
    assert_eq!(result.stats.errors, 1);
    assert!(result.error_details[0].starts_with("delete 2:"));
    assert_eq!(store.inner.len().await, 1);
}

#[tokio::test]
async fn global_sync_matches_by_slug() {
    let (store, _hook, engine) = setup(20);
    engine
        .run(SyncRequest::new(Some("alice"), vec![record(1)]))
        .await;

    let renamed_id = ExternalRecord::new()
        .with("id", "legacy-7")
        .with("title", "Post number 1")
        .with("body", "Updated");
    let result = engine.run(SyncRequest::new(None, vec![renamed_id])).await;

    assert_eq!(result.stats.updated, 1);
    assert_eq!(result.stats.inserted, 0);
    let post = store
        .inner
        .get(&RecordRef::new(Some("alice"), "1"))
        .await
        .unwrap();
    assert_eq!(post.body, "Updated");
    assert_eq!(post.owner_scope.as_deref(), Some("alice"));
}

fn titled(id: &str, title: &str) -> ExternalRecord {
    ExternalRecord::new().with("id", id).with("title", title)
}

#[tokio::test]
async fn global_rename_updates_in_place() {
    let (store, hook, engine) = setup(20);
    engine.run(SyncRequest::new(None, vec![titled("1", "Hello")])).await;
    hook.wait_for(1).await;

    let result = engine
        .run(SyncRequest::new(None, vec![titled("1", "Hello World")]))
        .await;

    assert!(result.success());
    assert_eq!(
        (result.stats.inserted, result.stats.updated, result.stats.deleted),
        (0, 1, 0)
    );
    assert_eq!(result.stats.errors, 0);
    assert_eq!(store.inner.len().await, 1);
    let post = store.inner.get(&RecordRef::new(None, "1")).await.unwrap();
    assert_eq!(post.slug, "hello-world");

    let calls = hook.wait_for(2).await;
    assert_eq!(
        calls[1].0,
        BTreeSet::from(["hello".to_string(), "hello-world".to_string()])
    );
}

#[tokio::test]
async fn global_sync_deletes_every_owner_sharing_a_slug() {
    let (store, _hook, engine) = setup(20);
    engine.run(SyncRequest::new(Some("alice"), vec![titled("10", "Hello")])).await;
    engine.run(SyncRequest::new(Some("bob"), vec![titled("20", "Hello")])).await;
    assert_eq!(store.inner.len().await, 2);

    let result = engine.run(SyncRequest::new(None, vec![])).await;

    assert!(result.success());
    assert_eq!(result.stats.deleted, 2);
    assert!(result.warnings.iter().any(|w| w.contains("duplicate existing key hello")));
    assert!(store.inner.is_empty().await);
}

#[tokio::test]
async fn global_sync_deletes_absent_records_across_owners() {
    let (store, _hook, engine) = setup(20);
    engine.run(SyncRequest::new(Some("alice"), vec![record(1), record(2)])).await;
    engine.run(SyncRequest::new(Some("bob"), vec![record(3)])).await;

    let result = engine.run(SyncRequest::new(None, vec![record(2)])).await;

    assert_eq!(
        (result.stats.inserted, result.stats.updated, result.stats.deleted),
        (0, 1, 2)
    );
    assert_eq!(store.inner.len().await, 1);
    assert!(store
        .inner
        .get(&RecordRef::new(Some("alice"), "2"))
        .await
        .is_some());
}

#[tokio::test]
async fn unparseable_last_modified_is_treated_as_changed() {
    let (store, _hook, engine) = setup(20);
    let first = engine
        .run(SyncRequest::new(Some("alice"), vec![record(1)]).optimize_by_date(true))
        .await;
    assert_eq!(first.stats.inserted, 1);

    let garbled = record(1).with("last_modified", "not a date").with("body", "Edited");
    let second = engine
        .run(SyncRequest::new(Some("alice"), vec![garbled]).optimize_by_date(true))
        .await;

    assert!(second.success());
    assert_eq!((second.stats.updated, second.stats.skipped), (1, 0));
    assert!(!second.warnings.is_empty());
    let post = store
        .inner
        .get(&RecordRef::new(Some("alice"), "1"))
        .await
        .unwrap();
    assert_eq!(post.body, "Edited");
}
