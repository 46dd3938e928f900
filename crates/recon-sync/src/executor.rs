use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use recon_core::RecordRef;
use recon_storage::{ContentStore, StoreError};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::clamp_batch_size;
use crate::plan::{PlannedDelete, PlannedInsert, PlannedUpdate, SyncPlan};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Insert,
    Update,
    Delete,
}

impl WriteOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// What the executor actually managed to write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// `"<op> <identity>: <error>"`, in execution order.
    pub errors: Vec<String>,
    /// Slugs to revalidate: every written record, the previous slug of a
    /// renamed one, and every delete target the store accepted. A target that
    /// was already gone still counts here but not in `deleted`.
    pub affected_slugs: Vec<String>,
    pub attempted: usize,
    pub unavailable: usize,
}

impl ExecutionOutcome {
    /// Every attempted write failed because the store could not be reached.
    pub fn is_total_outage(&self) -> bool {
        self.attempted > 0 && self.unavailable == self.attempted
    }

    fn record_failure(&mut self, op: WriteOp, identity: &str, err: &WriteFailure) {
        warn!(op = op.as_str(), identity, error = %err, "write failed");
        if err.is_unavailable() {
            self.unavailable += 1;
        }
        self.errors.push(format!("{} {identity}: {err}", op.as_str()));
    }
}

#[derive(Debug)]
enum WriteFailure {
    Store(StoreError),
    Aborted(String),
}

impl WriteFailure {
    fn is_unavailable(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_unavailable())
    }
}

impl std::fmt::Display for WriteFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(err) => write!(f, "{err}"),
            Self::Aborted(reason) => write!(f, "write task aborted: {reason}"),
        }
    }
}

/// Applies a [`SyncPlan`] in fixed-size batches: inserts, then updates, then deletes.
///
/// Writes inside a batch run concurrently; a failed item never stops its
/// siblings or later batches, and nothing is rolled back.
#[derive(Clone)]
pub struct BatchExecutor {
    store: Arc<dyn ContentStore>,
    batch_size: usize,
}

impl BatchExecutor {
    pub fn new(store: Arc<dyn ContentStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: clamp_batch_size(batch_size),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub async fn execute(&self, plan: &SyncPlan, now: DateTime<Utc>) -> ExecutionOutcome {
        let mut outcome = ExecutionOutcome::default();
        self.run_inserts(&plan.to_insert, now, &mut outcome).await;
        self.run_updates(&plan.to_update, now, &mut outcome).await;
        self.run_deletes(&plan.to_delete, &mut outcome).await;
        outcome
    }

    async fn run_inserts(&self, ops: &[PlannedInsert], now: DateTime<Utc>, outcome: &mut ExecutionOutcome) {
        for (batch_no, batch) in ops.chunks(self.batch_size).enumerate() {
            debug!(batch = batch_no, size = batch.len(), "insert batch");
            let results = self
                .run_batch(batch.to_vec(), move |store, op: PlannedInsert| async move {
                    let updated_at = op.draft.last_modified.unwrap_or(now);
                    store.insert(&op.draft, updated_at).await
                })
                .await;
            for (op, result) in batch.iter().zip(results) {
                outcome.attempted += 1;
                match result {
                    Ok(()) => {
                        outcome.inserted += 1;
                        outcome.affected_slugs.push(op.draft.slug.clone());
                    }
                    Err(err) => outcome.record_failure(WriteOp::Insert, &op.draft.id, &err),
                }
            }
        }
    }

    async fn run_updates(&self, ops: &[PlannedUpdate], now: DateTime<Utc>, outcome: &mut ExecutionOutcome) {
        for (batch_no, batch) in ops.chunks(self.batch_size).enumerate() {
            debug!(batch = batch_no, size = batch.len(), "update batch");
            let results = self
                .run_batch(batch.to_vec(), move |store, op: PlannedUpdate| async move {
                    let updated_at = update_timestamp(op.draft.last_modified, op.existing_updated_at, now);
                    store.update(&op.target, &op.draft, updated_at).await
                })
                .await;
            for (op, result) in batch.iter().zip(results) {
                outcome.attempted += 1;
                match result {
                    Ok(()) => {
                        outcome.updated += 1;
                        if op.previous_slug != op.draft.slug {
                            outcome.affected_slugs.push(op.previous_slug.clone());
                        }
                        outcome.affected_slugs.push(op.draft.slug.clone());
                    }
                    Err(err) => outcome.record_failure(WriteOp::Update, &op.target.identity, &err),
                }
            }
        }
    }

    async fn run_deletes(&self, ops: &[PlannedDelete], outcome: &mut ExecutionOutcome) {
        for (batch_no, batch) in ops.chunks(self.batch_size).enumerate() {
            debug!(batch = batch_no, size = batch.len(), "delete batch");
            let refs: Vec<RecordRef> = batch.iter().map(|op| op.target.clone()).collect();
            match self.store.delete(&refs).await {
                Ok(removed) => {
                    outcome.attempted += batch.len();
                    outcome.deleted += usize::try_from(removed).unwrap_or(usize::MAX).min(batch.len());
                    outcome
                        .affected_slugs
                        .extend(batch.iter().map(|op| op.slug.clone()));
                }
                Err(err) => {
                    warn!(batch = batch_no, error = %err, "batch delete failed, retrying per record");
                    self.isolate_deletes(batch, outcome).await;
                }
            }
        }
    }

    async fn isolate_deletes(&self, batch: &[PlannedDelete], outcome: &mut ExecutionOutcome) {
        let results = self
            .run_batch(batch.to_vec(), |store, op: PlannedDelete| async move {
                store.delete(std::slice::from_ref(&op.target)).await
            })
            .await;
        for (op, result) in batch.iter().zip(results) {
            outcome.attempted += 1;
            match result {
                Ok(removed) => {
                    outcome.deleted += usize::from(removed > 0);
                    outcome.affected_slugs.push(op.slug.clone());
                }
                Err(err) => outcome.record_failure(WriteOp::Delete, &op.target.identity, &err),
            }
        }
    }

    /// Run one write per item concurrently; results come back in input order.
    async fn run_batch<T, R, F, Fut>(&self, items: Vec<T>, write: F) -> Vec<Result<R, WriteFailure>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(Arc<dyn ContentStore>, T) -> Fut,
        Fut: Future<Output = Result<R, StoreError>> + Send + 'static,
    {
        let len = items.len();
        let mut set = JoinSet::new();
        for (idx, item) in items.into_iter().enumerate() {
            let fut = write(Arc::clone(&self.store), item);
            set.spawn(async move { (idx, fut.await) });
        }

        let mut slots: Vec<Option<Result<R, WriteFailure>>> = (0..len).map(|_| None).collect();
        let mut aborted = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, result)) => slots[idx] = Some(result.map_err(WriteFailure::Store)),
                Err(err) => aborted = Some(err.to_string()),
            }
        }

        slots
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    Err(WriteFailure::Aborted(
                        aborted.clone().unwrap_or_else(|| "unknown".to_string()),
                    ))
                })
            })
            .collect()
    }
}

/// Incoming `last_modified` (or now), never moved behind the stored value.
pub fn update_timestamp(
    last_modified: Option<DateTime<Utc>>,
    existing: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let candidate = last_modified.unwrap_or(now);
    match existing {
        Some(existing) if existing > candidate => existing,
        _ => candidate,
    }
}
