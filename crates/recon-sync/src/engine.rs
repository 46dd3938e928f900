use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use recon_core::{PostDraft, ScopeFilter, SyncRequest, SyncResult, SyncStage};
use recon_normalize::{FieldMapping, Normalizer};
use recon_storage::{
    BackoffPolicy, ContentStore, HttpRevalidator, PostCache, ReportArchive, RevalidatorConfig,
};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::config::SyncConfig;
use crate::executor::BatchExecutor;
use crate::hooks::{FanoutHook, RevalidationHook};
use crate::plan::{plan_sync, strategy_for, ExistingIndex, KeyStrategy, SyncPlan};
use crate::report::{RunContext, SyncError, SyncReporter};

/// Result of running normalize, load and plan without writing anything.
#[derive(Debug, Clone, Serialize)]
pub struct DryRun {
    pub scope: Option<String>,
    pub strategy: String,
    pub optimize_by_date: bool,
    pub plan: SyncPlan,
    pub error_details: Vec<String>,
    pub warnings: Vec<String>,
}

/// Hooks implied by configuration: the HTTP webhook when a URL is set.
fn revalidation_hooks_from_config(config: &SyncConfig) -> anyhow::Result<FanoutHook> {
    let mut hooks = FanoutHook::new();
    if let Some(endpoint) = &config.revalidate_url {
        let revalidator = HttpRevalidator::new(RevalidatorConfig {
            endpoint: endpoint.clone(),
            timeout: config.http_timeout(),
            user_agent: Some(config.user_agent.clone()),
            backoff: BackoffPolicy::default(),
        })
        .context("building revalidation client")?;
        hooks = hooks.with(Arc::new(revalidator));
    }
    Ok(hooks)
}

pub struct SyncEngine {
    store: Arc<dyn ContentStore>,
    normalizer: Normalizer,
    key_strategy: Option<Arc<dyn KeyStrategy>>,
    executor: BatchExecutor,
    reporter: SyncReporter,
    optimize_by_date: bool,
}

impl SyncEngine {
    /// Engine with the built-in mapping, no revalidation and no archive.
    pub fn new(store: Arc<dyn ContentStore>, config: &SyncConfig) -> Self {
        Self {
            executor: BatchExecutor::new(Arc::clone(&store), config.batch_size),
            store,
            normalizer: Normalizer::new(FieldMapping::default()),
            key_strategy: None,
            reporter: SyncReporter::default(),
            optimize_by_date: config.optimize_by_date,
        }
    }

    /// Engine wired from configuration: mapping file, webhook and report archive.
    pub fn from_config(store: Arc<dyn ContentStore>, config: &SyncConfig) -> anyhow::Result<Self> {
        let mut engine = Self::new(store, config)
            .with_mapping(config.field_mapping()?)
            .with_hook(Arc::new(revalidation_hooks_from_config(config)?));
        if let Some(dir) = &config.reports_dir {
            engine = engine.with_archive(ReportArchive::new(dir));
        }
        Ok(engine)
    }

    pub fn with_mapping(mut self, mapping: FieldMapping) -> Self {
        self.normalizer = Normalizer::new(mapping);
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn RevalidationHook>) -> Self {
        self.reporter = self.reporter.with_hook(hook);
        self
    }

    pub fn with_archive(mut self, archive: ReportArchive) -> Self {
        self.reporter = self.reporter.with_archive(archive);
        self
    }

    /// Listing cache dropped for the synced scope as soon as a run changes anything.
    pub fn with_cache(mut self, cache: Arc<PostCache>) -> Self {
        self.reporter = self.reporter.with_cache(cache);
        self
    }

    /// Force one matching strategy regardless of the request scope.
    pub fn with_key_strategy(mut self, strategy: Arc<dyn KeyStrategy>) -> Self {
        self.key_strategy = Some(strategy);
        self
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    pub fn batch_size(&self) -> usize {
        self.executor.batch_size()
    }

    pub async fn plan(&self, request: &SyncRequest) -> Result<DryRun, SyncError> {
        let mut ctx = RunContext::new(request.scope.clone());
        let plan = self.prepare(request, &mut ctx).await?;
        Ok(DryRun {
            scope: ctx.scope,
            strategy: self.strategy(request.scope.as_deref()).name().to_string(),
            optimize_by_date: self.optimize_for(request),
            plan,
            error_details: ctx.error_details,
            warnings: ctx.warnings,
        })
    }

    /// Run one request end to end. Never returns `Err`: fatal problems become
    /// a failed [`SyncResult`].
    pub async fn run(&self, request: SyncRequest) -> SyncResult {
        let ctx = RunContext::new(request.scope.clone());
        let span = info_span!(
            "sync",
            request_id = %ctx.request_id,
            scope = request.scope.as_deref().unwrap_or("*"),
            records = request.records.len(),
        );
        self.run_with(ctx, &request).instrument(span).await
    }

    async fn run_with(&self, mut ctx: RunContext, request: &SyncRequest) -> SyncResult {
        let plan = match self.prepare(request, &mut ctx).await {
            Ok(plan) => plan,
            Err(err) => {
                let result = self.reporter.failure(ctx, &err);
                self.reporter.publish(&result, &[]).await;
                return result;
            }
        };

        ctx.advance(SyncStage::Executing);
        let outcome = self.executor.execute(&plan, Utc::now()).await;
        self.reporter.absorb(&mut ctx, &outcome);

        let result = if outcome.is_total_outage() {
            self.reporter.failure(
                ctx,
                &SyncError::StoreUnavailable {
                    attempted: outcome.attempted,
                },
            )
        } else {
            self.reporter.success(ctx)
        };
        self.reporter.publish(&result, &outcome.affected_slugs).await;
        result
    }

    async fn prepare(&self, request: &SyncRequest, ctx: &mut RunContext) -> Result<SyncPlan, SyncError> {
        let scope = validate_scope(request.scope.as_deref())?;

        let drafts = self.normalize_all(request, scope, ctx.timestamp, ctx);
        ctx.advance(SyncStage::Normalized);

        let strategy = self.strategy(scope);
        let filter = ScopeFilter::from_scope(scope);
        let index = ExistingIndex::load(self.store.as_ref(), &filter, strategy)
            .await
            .map_err(SyncError::LoadExisting)?;
        ctx.warnings.extend(index.warnings().iter().cloned());

        let optimize_by_date = self.optimize_for(request);
        let plan = plan_sync(drafts, &index, strategy, optimize_by_date);
        ctx.warnings.extend(plan.warnings.iter().cloned());
        ctx.stats.skipped += plan.to_skip.len();
        info!(
            strategy = strategy.name(),
            existing = index.len(),
            insert = plan.to_insert.len(),
            update = plan.to_update.len(),
            skip = plan.to_skip.len(),
            delete = plan.to_delete.len(),
            "sync planned"
        );
        ctx.advance(SyncStage::Planned);
        Ok(plan)
    }

    fn normalize_all(
        &self,
        request: &SyncRequest,
        scope: Option<&str>,
        now: DateTime<Utc>,
        ctx: &mut RunContext,
    ) -> Vec<PostDraft> {
        let mut drafts = Vec::with_capacity(request.records.len());
        for (row, raw) in request.records.iter().enumerate() {
            match self.normalizer.normalize(raw, scope, now) {
                Ok(normalized) => {
                    ctx.warnings.extend(normalized.warnings);
                    drafts.push(normalized.draft);
                }
                Err(err) => {
                    warn!(row = row + 1, error = %err, "skipping unnormalizable record");
                    ctx.record_error(format!("normalize row {}: {err}", row + 1));
                }
            }
        }
        drafts
    }

    fn strategy<'a>(&'a self, scope: Option<&str>) -> &'a dyn KeyStrategy {
        match &self.key_strategy {
            Some(strategy) => strategy.as_ref(),
            None => strategy_for(scope),
        }
    }

    fn optimize_for(&self, request: &SyncRequest) -> bool {
        request.optimize_by_date.unwrap_or(self.optimize_by_date)
    }
}

/// A provided scope must contain something other than whitespace.
pub fn validate_scope(scope: Option<&str>) -> Result<Option<&str>, SyncError> {
    match scope {
        Some(value) if value.trim().is_empty() => Err(SyncError::InvalidScope(value.to_string())),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recon_core::ExternalRecord;
    use recon_storage::MemoryContentStore;

    fn engine(store: Arc<MemoryContentStore>) -> SyncEngine {
        SyncEngine::new(store, &SyncConfig::default())
    }

    fn record(id: &str, title: &str) -> ExternalRecord {
        ExternalRecord::new().with("id", id).with("title", title)
    }

    #[test]
    fn blank_scopes_are_rejected() {
        assert!(validate_scope(None).unwrap().is_none());
        assert_eq!(validate_scope(Some("alice")).unwrap(), Some("alice"));
        assert!(matches!(validate_scope(Some("")), Err(SyncError::InvalidScope(_))));
        assert!(matches!(validate_scope(Some("  \t")), Err(SyncError::InvalidScope(_))));
    }

    #[tokio::test]
    async fn dry_run_does_not_write() {
        let store = Arc::new(MemoryContentStore::new());
        let engine = engine(store.clone());
        let request = SyncRequest::new(Some("alice"), vec![record("1", "One"), record("2", "Two")]);

        let dry = engine.plan(&request).await.unwrap();
        assert_eq!(dry.strategy, "id");
        assert_eq!(dry.plan.to_insert.len(), 2);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn normalization_errors_are_counted_not_fatal() {
        let store = Arc::new(MemoryContentStore::new());
        let engine = engine(store.clone());
        let request = SyncRequest::new(
            Some("alice"),
            vec![
                record("1", "One"),
                ExternalRecord(serde_json::json!("not an object")),
                ExternalRecord::new().with("body", "no identity"),
            ],
        );

        let result = engine.run(request).await;
        assert!(result.success());
        assert_eq!(result.stats.inserted, 1);
        assert_eq!(result.stats.errors, 2);
        assert!(result.error_details[0].starts_with("normalize row 2:"));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn scope_is_forced_onto_written_records() {
        let store = Arc::new(MemoryContentStore::new());
        let engine = engine(store.clone());
        let request = SyncRequest::new(
            Some("alice"),
            vec![record("1", "One").with("owner_scope", "mallory")],
        );

        engine.run(request).await;
        let post = store
            .get(&recon_core::RecordRef::new(Some("alice"), "1"))
            .await
            .unwrap();
        assert_eq!(post.owner_scope.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn from_config_archives_reports_and_invalidates_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryContentStore::new());
        let config = SyncConfig {
            reports_dir: Some(dir.path().to_path_buf()),
            ..SyncConfig::default()
        };
        let cache = Arc::new(PostCache::new(config.cache_ttl()));
        let alice = ScopeFilter::Owner("alice".into());
        cache.get_or_load(store.as_ref(), &alice).await.unwrap();

        let engine = SyncEngine::from_config(store, &config)
            .unwrap()
            .with_cache(cache.clone());
        let result = engine
            .run(SyncRequest::new(Some("alice"), vec![record("1", "One")]))
            .await;

        assert!(result.success());
        assert!(cache.get(&alice).await.is_none());
        let archived = dir.path().join(ReportArchive::report_relative_path(&result));
        assert!(archived.exists());
    }

    #[tokio::test]
    async fn key_strategy_override_applies() {
        let store = Arc::new(MemoryContentStore::new());
        let engine = engine(store).with_key_strategy(Arc::new(crate::plan::SlugKey));
        let dry = engine
            .plan(&SyncRequest::new(Some("alice"), vec![record("1", "Hello World")]))
            .await
            .unwrap();
        assert_eq!(dry.strategy, "slug");
        assert_eq!(dry.plan.to_insert[0].key, "hello-world");
    }
}
