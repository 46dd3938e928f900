use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use recon_core::{SyncResult, SyncStage, SyncStats};
use recon_storage::{PostCache, ReportArchive, StoreError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::executor::ExecutionOutcome;
use crate::hooks::{NoopRevalidationHook, RevalidationHook};

/// Request-level failures; each one stops the pipeline in a known stage.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid scope {0:?}: must be non-empty when provided")]
    InvalidScope(String),
    #[error("failed to load existing records: {0}")]
    LoadExisting(#[source] StoreError),
    #[error("store unavailable: all {attempted} attempted writes failed")]
    StoreUnavailable { attempted: usize },
}

impl SyncError {
    pub fn stage(&self) -> SyncStage {
        match self {
            Self::InvalidScope(_) => SyncStage::Received,
            Self::LoadExisting(_) => SyncStage::Normalized,
            Self::StoreUnavailable { .. } => SyncStage::Executing,
        }
    }
}

/// Per-request accumulator threaded through the pipeline stages.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub scope: Option<String>,
    pub stage: SyncStage,
    pub stats: SyncStats,
    pub error_details: Vec<String>,
    pub warnings: Vec<String>,
    started: Instant,
}

impl RunContext {
    pub fn new(scope: Option<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            scope,
            stage: SyncStage::Received,
            stats: SyncStats::default(),
            error_details: Vec::new(),
            warnings: Vec::new(),
            started: Instant::now(),
        }
    }

    pub fn advance(&mut self, stage: SyncStage) {
        info!(from = %self.stage, to = %stage, "sync stage");
        self.stage = stage;
    }

    pub fn record_error(&mut self, detail: String) {
        self.stats.errors += 1;
        self.error_details.push(detail);
    }

    fn elapsed_seconds(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

pub struct SyncReporter {
    hook: Arc<dyn RevalidationHook>,
    cache: Option<Arc<PostCache>>,
    archive: Option<ReportArchive>,
}

impl Default for SyncReporter {
    fn default() -> Self {
        Self::new(Arc::new(NoopRevalidationHook))
    }
}

impl SyncReporter {
    pub fn new(hook: Arc<dyn RevalidationHook>) -> Self {
        Self {
            hook,
            cache: None,
            archive: None,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn RevalidationHook>) -> Self {
        self.hook = hook;
        self
    }

    /// In-process listing cache, invalidated before `publish` returns.
    pub fn with_cache(mut self, cache: Arc<PostCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_archive(mut self, archive: ReportArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn archive(&self) -> Option<&ReportArchive> {
        self.archive.as_ref()
    }

    /// Fold the executor outcome into the context's stats and errors.
    pub fn absorb(&self, ctx: &mut RunContext, outcome: &ExecutionOutcome) {
        ctx.stats.inserted += outcome.inserted;
        ctx.stats.updated += outcome.updated;
        ctx.stats.deleted += outcome.deleted;
        ctx.stats.errors += outcome.errors.len();
        ctx.error_details.extend(outcome.errors.iter().cloned());
    }

    pub fn success(&self, mut ctx: RunContext) -> SyncResult {
        ctx.advance(SyncStage::Reported);
        let duration_seconds = ctx.elapsed_seconds();
        info!(
            inserted = ctx.stats.inserted,
            updated = ctx.stats.updated,
            deleted = ctx.stats.deleted,
            skipped = ctx.stats.skipped,
            errors = ctx.stats.errors,
            duration_seconds,
            "sync complete"
        );
        SyncResult {
            request_id: ctx.request_id,
            timestamp: ctx.timestamp,
            scope: ctx.scope,
            stage: SyncStage::Reported,
            stats: ctx.stats,
            error_details: ctx.error_details,
            warnings: ctx.warnings,
            error: None,
            failed_stage: None,
            duration_seconds,
        }
    }

    pub fn failure(&self, ctx: RunContext, err: &SyncError) -> SyncResult {
        let failed_stage = err.stage();
        let duration_seconds = ctx.elapsed_seconds();
        warn!(error = %err, stage = %failed_stage, "sync failed");
        SyncResult {
            request_id: ctx.request_id,
            timestamp: ctx.timestamp,
            scope: ctx.scope,
            stage: SyncStage::Failed,
            stats: ctx.stats,
            error_details: ctx.error_details,
            warnings: ctx.warnings,
            error: Some(err.to_string()),
            failed_stage: Some(failed_stage),
            duration_seconds,
        }
    }

    /// Invalidate and revalidate affected slugs (only when there are any), then
    /// archive the report.
    ///
    /// The revalidation hook runs on a detached task; the handle is returned
    /// for callers that want to wait on it, and its errors are only logged.
    pub async fn publish(&self, result: &SyncResult, affected_slugs: &[String]) -> Option<JoinHandle<()>> {
        let mut pending = None;
        if !affected_slugs.is_empty() {
            if let Some(cache) = &self.cache {
                cache.invalidate(result.scope.as_deref()).await;
            }
            let hook = Arc::clone(&self.hook);
            let slugs = affected_slugs.to_vec();
            let scope = result.scope.clone();
            pending = Some(tokio::spawn(async move {
                if let Err(err) = hook.revalidate(&slugs, scope.as_deref()).await {
                    warn!(error = %err, slugs = slugs.len(), "revalidation failed");
                }
            }));
        }

        if let Some(archive) = &self.archive {
            match archive.store_report(result).await {
                Ok(stored) => info!(path = %stored.relative_path.display(), "sync report archived"),
                Err(err) => warn!(error = %err, "failed to archive sync report"),
            }
        }
        pending
    }
}
