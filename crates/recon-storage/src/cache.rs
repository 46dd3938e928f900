use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use recon_core::{Post, ScopeFilter};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{ContentStore, StoreError};

#[derive(Debug, Clone)]
struct CachedPosts {
    loaded_at: Instant,
    posts: Arc<Vec<Post>>,
}

/// Read-path cache of listed posts, one entry per scope filter.
///
/// Injected wherever it is used so each owner (and each test) gets its own
/// state; entries expire after `ttl` or on [`PostCache::invalidate`].
#[derive(Debug)]
pub struct PostCache {
    ttl: Duration,
    entries: Mutex<HashMap<ScopeFilter, CachedPosts>>,
}

impl PostCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fresh cached entry, if any.
    pub async fn get(&self, filter: &ScopeFilter) -> Option<Arc<Vec<Post>>> {
        let entries = self.entries.lock().await;
        entries
            .get(filter)
            .filter(|cached| cached.loaded_at.elapsed() < self.ttl)
            .map(|cached| Arc::clone(&cached.posts))
    }

    pub async fn get_or_load<S>(&self, store: &S, filter: &ScopeFilter) -> Result<Arc<Vec<Post>>, StoreError>
    where
        S: ContentStore + ?Sized,
    {
        if let Some(posts) = self.get(filter).await {
            return Ok(posts);
        }
        debug!(scope = %filter, "post cache miss");
        let posts = Arc::new(store.list(filter).await?);
        self.entries.lock().await.insert(
            filter.clone(),
            CachedPosts {
                loaded_at: Instant::now(),
                posts: Arc::clone(&posts),
            },
        );
        Ok(posts)
    }

    /// Drop entries that may contain records from `scope`.
    ///
    /// A scoped change stales that owner's entry and the global listing; a
    /// global change (`None`) can touch any owner, so everything goes.
    pub async fn invalidate(&self, scope: Option<&str>) {
        let mut entries = self.entries.lock().await;
        match scope {
            Some(owner) => {
                entries.remove(&ScopeFilter::Owner(owner.to_string()));
                entries.remove(&ScopeFilter::All);
            }
            None => entries.clear(),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
