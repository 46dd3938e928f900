use std::sync::Arc;

use async_trait::async_trait;
use recon_storage::HttpRevalidator;
use tracing::warn;

/// Downstream invalidation, called with the slugs a sync actually changed.
///
/// Fire-and-forget: the reporter logs errors and never fails the sync on them.
#[async_trait]
pub trait RevalidationHook: Send + Sync {
    async fn revalidate(&self, slugs: &[String], scope: Option<&str>) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct NoopRevalidationHook;

#[async_trait]
impl RevalidationHook for NoopRevalidationHook {
    async fn revalidate(&self, _slugs: &[String], _scope: Option<&str>) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl RevalidationHook for HttpRevalidator {
    async fn revalidate(&self, slugs: &[String], scope: Option<&str>) -> anyhow::Result<()> {
        HttpRevalidator::revalidate(self, slugs, scope).await?;
        Ok(())
    }
}

/// Calls every inner hook in order; one failing hook does not stop the rest.
#[derive(Default)]
pub struct FanoutHook {
    hooks: Vec<Arc<dyn RevalidationHook>>,
}

impl FanoutHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, hook: Arc<dyn RevalidationHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

#[async_trait]
impl RevalidationHook for FanoutHook {
    async fn revalidate(&self, slugs: &[String], scope: Option<&str>) -> anyhow::Result<()> {
        let mut failures = Vec::new();
        for hook in &self.hooks {
            if let Err(err) = hook.revalidate(slugs, scope).await {
                warn!(error = %err, "revalidation hook failed");
                failures.push(err.to_string());
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("{} revalidation hook(s) failed: {}", failures.len(), failures.join("; "))
        }
    }
}
