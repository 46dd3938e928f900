use std::collections::BTreeMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recon_core::{ExistingRecord, Post, PostDraft, RecordRef, ScopeFilter};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

use crate::{ContentStore, StoreError};

/// Global records are stored under the empty owner scope.
const GLOBAL_SCOPE: &str = "";

#[derive(Debug, Clone)]
pub struct PgContentStore {
    pool: PgPool,
}

impl PgContentStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(classify_sqlx_error)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running posts migrations")
    }
}

fn scope_column(owner_scope: Option<&str>) -> &str {
    owner_scope.unwrap_or(GLOBAL_SCOPE)
}

fn scope_from_column(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn scope_bind(filter: &ScopeFilter) -> Option<&str> {
    filter.owner()
}

pub(crate) fn classify_sqlx_error(err: sqlx::Error) -> StoreError {
    if matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    ) {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Database(err)
    }
}

fn classify_write_error(reference: &RecordRef, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::Rejected {
            reference: reference.clone(),
            message: db_err.to_string(),
        },
        other => classify_sqlx_error(other),
    }
}

fn post_from_row(row: &PgRow) -> Result<Post, StoreError> {
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(classify_sqlx_error)?;
    let updated_at: Option<DateTime<Utc>> = row.try_get("updated_at").map_err(classify_sqlx_error)?;
    let extra: JsonValue = row.try_get("extra").map_err(classify_sqlx_error)?;
    Ok(Post {
        id: row.try_get("identity").map_err(classify_sqlx_error)?,
        owner_scope: scope_from_column(row.try_get("owner_scope").map_err(classify_sqlx_error)?),
        title: row.try_get("title").map_err(classify_sqlx_error)?,
        slug: row.try_get("slug").map_err(classify_sqlx_error)?,
        body: row.try_get("body").map_err(classify_sqlx_error)?,
        excerpt: row.try_get("excerpt").map_err(classify_sqlx_error)?,
        date: row.try_get("date").map_err(classify_sqlx_error)?,
        categories: row.try_get("categories").map_err(classify_sqlx_error)?,
        featured: row.try_get("featured").map_err(classify_sqlx_error)?,
        commentable: row.try_get("commentable").map_err(classify_sqlx_error)?,
        shareable: row.try_get("shareable").map_err(classify_sqlx_error)?,
        published: row.try_get("published").map_err(classify_sqlx_error)?,
        extra: extra_from_column(extra)?,
        created_at,
        updated_at: updated_at.unwrap_or(created_at),
    })
}

/// The column is constrained to JSONB but not to objects; anything else is a corrupt row.
fn extra_from_column(extra: JsonValue) -> Result<serde_json::Map<String, JsonValue>, StoreError> {
    Ok(serde_json::from_value(extra)?)
}

#[async_trait]
impl ContentStore for PgContentStore {
    async fn load_existing(&self, filter: &ScopeFilter) -> Result<Vec<ExistingRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT owner_scope, identity, slug, updated_at
              FROM posts
             WHERE ($1::text IS NULL OR owner_scope = $1)
             ORDER BY owner_scope, identity
            "#,
        )
        .bind(scope_bind(filter))
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let owner_scope: String = row.try_get("owner_scope").map_err(classify_sqlx_error)?;
            let identity: String = row.try_get("identity").map_err(classify_sqlx_error)?;
            out.push(ExistingRecord {
                reference: RecordRef {
                    owner_scope: scope_from_column(owner_scope),
                    identity,
                },
                slug: row.try_get("slug").map_err(classify_sqlx_error)?,
                updated_at: row.try_get("updated_at").map_err(classify_sqlx_error)?,
            });
        }
        Ok(out)
    }

    async fn insert(&self, draft: &PostDraft, updated_at: DateTime<Utc>) -> Result<(), StoreError> {
        let reference = draft.reference();
        sqlx::query(
            r#"
            INSERT INTO posts (
                owner_scope, identity, slug, title, body, excerpt, date, categories,
                featured, commentable, shareable, published, extra, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NOW(), $14)
            "#,
        )
        .bind(scope_column(draft.owner_scope.as_deref()))
        .bind(&draft.id)
        .bind(&draft.slug)
        .bind(&draft.title)
        .bind(&draft.body)
        .bind(&draft.excerpt)
        .bind(draft.date)
        .bind(&draft.categories)
        .bind(draft.featured)
        .bind(draft.commentable)
        .bind(draft.shareable)
        .bind(draft.published)
        .bind(JsonValue::Object(draft.extra.clone()))
        .bind(updated_at)
        .execute(&self.pool)
        .await
        .map_err(|err| classify_write_error(&reference, err))?;
        Ok(())
    }

    async fn update(
        &self,
        target: &RecordRef,
        draft: &PostDraft,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE posts
               SET slug = $3,
                   title = $4,
                   body = $5,
                   excerpt = $6,
                   date = $7,
                   categories = $8,
                   featured = $9,
                   commentable = $10,
                   shareable = $11,
                   published = $12,
                   extra = $13,
                   updated_at = GREATEST(COALESCE(updated_at, $14), $14)
             WHERE owner_scope = $1
               AND identity = $2
            "#,
        )
        .bind(scope_column(target.owner_scope.as_deref()))
        .bind(&target.identity)
        .bind(&draft.slug)
        .bind(&draft.title)
        .bind(&draft.body)
        .bind(&draft.excerpt)
        .bind(draft.date)
        .bind(&draft.categories)
        .bind(draft.featured)
        .bind(draft.commentable)
        .bind(draft.shareable)
        .bind(draft.published)
        .bind(JsonValue::Object(draft.extra.clone()))
        .bind(updated_at)
        .execute(&self.pool)
        .await
        .map_err(|err| classify_write_error(target, err))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(target.clone()));
        }
        Ok(())
    }

    async fn delete(&self, targets: &[RecordRef]) -> Result<u64, StoreError> {
        let mut by_scope: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for target in targets {
            by_scope
                .entry(scope_column(target.owner_scope.as_deref()))
                .or_default()
                .push(target.identity.clone());
        }

        let mut removed = 0u64;
        for (owner_scope, identities) in by_scope {
            let result = sqlx::query(
                r#"
                DELETE FROM posts
                 WHERE owner_scope = $1
                   AND identity = ANY($2)
                "#,
            )
            .bind(owner_scope)
            .bind(identities)
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
            removed += result.rows_affected();
        }
        Ok(removed)
    }

    async fn list(&self, filter: &ScopeFilter) -> Result<Vec<Post>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT owner_scope, identity, slug, title, body, excerpt, date, categories,
                   featured, commentable, shareable, published, extra, created_at, updated_at
              FROM posts
             WHERE ($1::text IS NULL OR owner_scope = $1)
             ORDER BY date DESC, identity
            "#,
        )
        .bind(scope_bind(filter))
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        rows.iter().map(post_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_scope_round_trips_through_empty_column() {
        assert_eq!(scope_column(None), "");
        assert_eq!(scope_column(Some("alice")), "alice");
        assert_eq!(scope_from_column(String::new()), None);
        assert_eq!(scope_from_column("alice".into()), Some("alice".to_string()));
    }

    #[test]
    fn non_object_extra_is_a_serialization_error() {
        let map = extra_from_column(serde_json::json!({ "legacy_id": 7 })).unwrap();
        assert_eq!(map["legacy_id"], 7);

        let err = extra_from_column(serde_json::json!(["not", "an", "object"])).unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));
        assert!(!err.is_unavailable());
    }

    #[test]
    fn connection_failures_classify_as_unavailable() {
        assert!(classify_sqlx_error(sqlx::Error::PoolTimedOut).is_unavailable());
        assert!(classify_sqlx_error(sqlx::Error::PoolClosed).is_unavailable());
        assert!(!classify_sqlx_error(sqlx::Error::RowNotFound).is_unavailable());
    }
}
