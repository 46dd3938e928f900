//! Canonical post store, read-path cache, revalidation webhook and report archive.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recon_core::{ExistingRecord, Post, PostDraft, RecordRef, ScopeFilter};
use thiserror::Error;
use tokio::sync::Mutex;

mod archive;
mod cache;
mod pg;
mod revalidate;

pub use archive::{ReportArchive, StoredReport};
pub use cache::PostCache;
pub use pg::PgContentStore;
pub use revalidate::{
    classify_reqwest_error, classify_status, BackoffPolicy, HttpRevalidator, RevalidateError,
    RevalidatorConfig, RetryDisposition,
};

pub const CRATE_NAME: &str = "recon-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached at all; not specific to one record.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("write rejected for {reference}: {message}")]
    Rejected { reference: RecordRef, message: String },
    #[error("record not found: {0}")]
    NotFound(RecordRef),
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Outbound store boundary. No multi-row transactional guarantees are assumed.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Single bulk read of identity, slug and `updated_at` for every record in scope.
    async fn load_existing(&self, filter: &ScopeFilter) -> Result<Vec<ExistingRecord>, StoreError>;

    /// Create a record; `created_at` is assigned by the store.
    async fn insert(&self, draft: &PostDraft, updated_at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Overwrite the record at `target`, keeping its identity, scope and `created_at`.
    async fn update(
        &self,
        target: &RecordRef,
        draft: &PostDraft,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Physically remove records, returning how many existed.
    async fn delete(&self, targets: &[RecordRef]) -> Result<u64, StoreError>;

    async fn list(&self, filter: &ScopeFilter) -> Result<Vec<Post>, StoreError>;
}

/// In-process store used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    posts: Mutex<BTreeMap<RecordRef, Post>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, posts: impl IntoIterator<Item = Post>) {
        let mut map = self.posts.lock().await;
        for post in posts {
            map.insert(post.reference(), post);
        }
    }

    pub async fn get(&self, reference: &RecordRef) -> Option<Post> {
        self.posts.lock().await.get(reference).cloned()
    }

    pub async fn len(&self) -> usize {
        self.posts.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.posts.lock().await.is_empty()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn load_existing(&self, filter: &ScopeFilter) -> Result<Vec<ExistingRecord>, StoreError> {
        let map = self.posts.lock().await;
        Ok(map
            .values()
            .filter(|post| filter.matches(post.owner_scope.as_deref()))
            .map(Post::existing)
            .collect())
    }

    async fn insert(&self, draft: &PostDraft, updated_at: DateTime<Utc>) -> Result<(), StoreError> {
        let reference = draft.reference();
        let mut map = self.posts.lock().await;
        if map.contains_key(&reference) {
            return Err(StoreError::Rejected {
                reference,
                message: "identity already exists".to_string(),
            });
        }
        let post = Post::from_draft(draft, draft.owner_scope.clone(), Utc::now(), updated_at);
        map.insert(reference, post);
        Ok(())
    }

    async fn update(
        &self,
        target: &RecordRef,
        draft: &PostDraft,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut map = self.posts.lock().await;
        let Some(current) = map.get_mut(target) else {
            return Err(StoreError::NotFound(target.clone()));
        };
        let mut post = Post::from_draft(
            draft,
            target.owner_scope.clone(),
            current.created_at,
            updated_at.max(current.updated_at),
        );
        post.id = target.identity.clone();
        *current = post;
        Ok(())
    }

    async fn delete(&self, targets: &[RecordRef]) -> Result<u64, StoreError> {
        let mut map = self.posts.lock().await;
        Ok(targets
            .iter()
            .filter(|target| map.remove(*target).is_some())
            .count() as u64)
    }

    async fn list(&self, filter: &ScopeFilter) -> Result<Vec<Post>, StoreError> {
        let map = self.posts.lock().await;
        let mut posts = map
            .values()
            .filter(|post| filter.matches(post.owner_scope.as_deref()))
            .cloned()
            .collect::<Vec<_>>();
        posts.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.id.cmp(&b.id)));
        Ok(posts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::Map;

    pub(crate) fn draft(id: &str, scope: Option<&str>) -> PostDraft {
        PostDraft {
            id: id.to_string(),
            owner_scope: scope.map(ToString::to_string),
            title: format!("Post {id}"),
            slug: format!("post-{id}"),
            body: String::new(),
            excerpt: String::new(),
            date: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap(),
            categories: vec![],
            featured: false,
            commentable: false,
            shareable: false,
            published: true,
            extra: Map::new(),
            last_modified: None,
            publish: true,
        }
    }

    fn ts(y: i32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, 1, 1, 0, 0, 0).single().unwrap()
    }

    #[tokio::test]
    async fn memory_store_scopes_existing_state() {
        let store = MemoryContentStore::new();
        store.insert(&draft("1", Some("alice")), ts(2024)).await.unwrap();
        store.insert(&draft("1", Some("bob")), ts(2024)).await.unwrap();
        store.insert(&draft("2", None), ts(2024)).await.unwrap();

        let alice = store
            .load_existing(&ScopeFilter::Owner("alice".into()))
            .await
            .unwrap();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].reference, RecordRef::new(Some("alice"), "1"));
        assert_eq!(alice[0].updated_at, Some(ts(2024)));

        let all = store.load_existing(&ScopeFilter::All).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn memory_store_rejects_duplicate_insert() {
        let store = MemoryContentStore::new();
        store.insert(&draft("1", None), ts(2024)).await.unwrap();
        let err = store.insert(&draft("1", None), ts(2024)).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected { .. }));
        assert!(!err.is_unavailable());
    }

    #[tokio::test]
    async fn memory_store_update_keeps_created_at_and_monotonic_updated_at() {
        let store = MemoryContentStore::new();
        store.insert(&draft("1", Some("alice")), ts(2024)).await.unwrap();
        let target = RecordRef::new(Some("alice"), "1");
        let created_at = store.get(&target).await.unwrap().created_at;

        let mut changed = draft("1", Some("alice"));
        changed.title = "Renamed".into();
        store.update(&target, &changed, ts(2020)).await.unwrap();

        let post = store.get(&target).await.unwrap();
        assert_eq!(post.title, "Renamed");
        assert_eq!(post.created_at, created_at);
        assert_eq!(post.updated_at, ts(2024));

        let missing = RecordRef::new(Some("alice"), "404");
        assert!(matches!(
            store.update(&missing, &changed, ts(2025)).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn memory_store_delete_counts_existing_only() {
        let store = MemoryContentStore::new();
        store.insert(&draft("1", None), ts(2024)).await.unwrap();
        store.insert(&draft("2", None), ts(2024)).await.unwrap();
        let removed = store
            .delete(&[RecordRef::new(None, "1"), RecordRef::new(None, "9")])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len().await, 1);
    }
}
