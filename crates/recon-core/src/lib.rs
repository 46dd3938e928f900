//! Core domain model for post reconciliation.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const CRATE_NAME: &str = "recon-core";

/// One caller-submitted row in loose, spreadsheet-like form.
///
/// Kept as a raw JSON value so a single malformed row (not an object) fails
/// on its own instead of rejecting the whole request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalRecord(pub Value);

impl ExternalRecord {
    pub fn new() -> Self {
        Self(Value::Object(Map::new()))
    }

    /// Builder used by callers and tests to assemble a record field by field.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if let Value::Object(map) = &mut self.0 {
            map.insert(key.into(), value.into());
        }
        self
    }

    pub fn as_object(&self) -> Option<&Map<String, Value>> {
        self.0.as_object()
    }
}

impl Default for ExternalRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Map<String, Value>> for ExternalRecord {
    fn from(map: Map<String, Value>) -> Self {
        Self(Value::Object(map))
    }
}

/// Isolation boundary applied to existing-state loading and deletion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScopeFilter {
    /// Global matching across every owner.
    All,
    /// Only records owned by this scope.
    Owner(String),
}

impl ScopeFilter {
    pub fn from_scope(scope: Option<&str>) -> Self {
        match scope {
            Some(owner) => Self::Owner(owner.to_string()),
            None => Self::All,
        }
    }

    pub fn owner(&self) -> Option<&str> {
        match self {
            Self::All => None,
            Self::Owner(owner) => Some(owner.as_str()),
        }
    }

    pub fn matches(&self, owner_scope: Option<&str>) -> bool {
        match self {
            Self::All => true,
            Self::Owner(owner) => owner_scope == Some(owner.as_str()),
        }
    }
}

impl fmt::Display for ScopeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("*"),
            Self::Owner(owner) => f.write_str(owner),
        }
    }
}

/// Store address of one record: identity is unique within its owner scope.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordRef {
    pub owner_scope: Option<String>,
    pub identity: String,
}

impl RecordRef {
    pub fn new(owner_scope: Option<&str>, identity: impl Into<String>) -> Self {
        Self {
            owner_scope: owner_scope.map(ToString::to_string),
            identity: identity.into(),
        }
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.owner_scope {
            Some(owner) => write!(f, "{owner}/{}", self.identity),
            None => f.write_str(&self.identity),
        }
    }
}

/// Slim view of a stored record returned by the bulk existing-state read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingRecord {
    pub reference: RecordRef,
    pub slug: String,
    /// `None` for rows written outside the engine without a timestamp.
    pub updated_at: Option<DateTime<Utc>>,
}

/// Normalized post awaiting a write; carries no store-assigned timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostDraft {
    pub id: String,
    pub owner_scope: Option<String>,
    pub title: String,
    pub slug: String,
    pub body: String,
    pub excerpt: String,
    pub date: DateTime<Utc>,
    pub categories: Vec<String>,
    pub featured: bool,
    pub commentable: bool,
    pub shareable: bool,
    pub published: bool,
    /// Unmapped, non-excluded source fields passed through untouched.
    pub extra: Map<String, Value>,
    /// Parsed incoming last-modified instant, if present and parseable.
    pub last_modified: Option<DateTime<Utc>>,
    /// `false` when the source explicitly asked for removal.
    pub publish: bool,
}

impl PostDraft {
    pub fn reference(&self) -> RecordRef {
        RecordRef::new(self.owner_scope.as_deref(), self.id.clone())
    }
}

/// Canonical, store-resident post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub owner_scope: Option<String>,
    pub title: String,
    pub slug: String,
    pub body: String,
    pub excerpt: String,
    pub date: DateTime<Utc>,
    pub categories: Vec<String>,
    pub featured: bool,
    pub commentable: bool,
    pub shareable: bool,
    pub published: bool,
    pub extra: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Post {
    pub fn from_draft(
        draft: &PostDraft,
        owner_scope: Option<String>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: draft.id.clone(),
            owner_scope,
            title: draft.title.clone(),
            slug: draft.slug.clone(),
            body: draft.body.clone(),
            excerpt: draft.excerpt.clone(),
            date: draft.date,
            categories: draft.categories.clone(),
            featured: draft.featured,
            commentable: draft.commentable,
            shareable: draft.shareable,
            published: draft.published,
            extra: draft.extra.clone(),
            created_at,
            updated_at,
        }
    }

    pub fn reference(&self) -> RecordRef {
        RecordRef::new(self.owner_scope.as_deref(), self.id.clone())
    }

    pub fn existing(&self) -> ExistingRecord {
        ExistingRecord {
            reference: self.reference(),
            slug: self.slug.clone(),
            updated_at: Some(self.updated_at),
        }
    }
}

/// Inbound sync call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    /// `None` selects global slug matching; `Some` forces owner-scoped ID matching.
    #[serde(default)]
    pub scope: Option<String>,
    /// Falls back to the engine's configured default when omitted.
    #[serde(default)]
    pub optimize_by_date: Option<bool>,
    #[serde(default)]
    pub records: Vec<ExternalRecord>,
}

impl SyncRequest {
    pub fn new(scope: Option<&str>, records: Vec<ExternalRecord>) -> Self {
        Self {
            scope: scope.map(ToString::to_string),
            optimize_by_date: None,
            records,
        }
    }

    pub fn optimize_by_date(mut self, enabled: bool) -> Self {
        self.optimize_by_date = Some(enabled);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Per-request pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    Received,
    Normalized,
    Planned,
    Executing,
    Reported,
    Failed,
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Received => "received",
            Self::Normalized => "normalized",
            Self::Planned => "planned",
            Self::Executing => "executing",
            Self::Reported => "reported",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Aggregated outcome of one sync request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub scope: Option<String>,
    pub stage: SyncStage,
    pub stats: SyncStats,
    pub error_details: Vec<String>,
    pub warnings: Vec<String>,
    /// Top-level error for fatal failures; record errors live in `error_details`.
    pub error: Option<String>,
    /// Stage the pipeline was in when a fatal error stopped it.
    pub failed_stage: Option<SyncStage>,
    pub duration_seconds: f64,
}

impl SyncResult {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}

/// Caller-facing response shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub success: bool,
    pub stats: SyncStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub duration_seconds: f64,
}

impl From<&SyncResult> for SyncResponse {
    fn from(result: &SyncResult) -> Self {
        Self {
            success: result.success(),
            stats: result.stats,
            error_details: non_empty(&result.error_details),
            warnings: non_empty(&result.warnings),
            error: result.error.clone(),
            request_id: result.request_id.to_string(),
            timestamp: result.timestamp,
            duration_seconds: result.duration_seconds,
        }
    }
}

fn non_empty(items: &[String]) -> Option<Vec<String>> {
    if items.is_empty() {
        None
    } else {
        Some(items.to_vec())
    }
}
