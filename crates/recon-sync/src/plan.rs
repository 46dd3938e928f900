use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use recon_core::{ExistingRecord, PostDraft, RecordRef, ScopeFilter};
use recon_storage::{ContentStore, StoreError};
use serde::Serialize;
use tracing::{debug, warn};

/// Derives the matching key shared by incoming drafts and stored records.
pub trait KeyStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn draft_key(&self, draft: &PostDraft) -> String;
    fn existing_key(&self, existing: &ExistingRecord) -> String;
}

/// Canonical strategy: identity within one owner scope.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdKey;

impl KeyStrategy for IdKey {
    fn name(&self) -> &'static str {
        "id"
    }

    fn draft_key(&self, draft: &PostDraft) -> String {
        draft.id.clone()
    }

    fn existing_key(&self, existing: &ExistingRecord) -> String {
        existing.reference.identity.clone()
    }
}

/// Legacy global strategy: slug across every owner.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlugKey;

impl KeyStrategy for SlugKey {
    fn name(&self) -> &'static str {
        "slug"
    }

    fn draft_key(&self, draft: &PostDraft) -> String {
        draft.slug.clone()
    }

    fn existing_key(&self, existing: &ExistingRecord) -> String {
        existing.slug.clone()
    }
}

/// Strategy selected by the request scope when no override is configured.
pub fn strategy_for(scope: Option<&str>) -> &'static dyn KeyStrategy {
    match scope {
        Some(_) => &IdKey,
        None => &SlugKey,
    }
}

/// Existing store state keyed by the active strategy.
///
/// Every loaded record stays addressable by reference. When several records
/// share a key, the most recently updated one is the key's match and the rest
/// are shadowed.
#[derive(Debug, Clone, Default)]
pub struct ExistingIndex {
    matched: BTreeMap<String, RecordRef>,
    records: BTreeMap<RecordRef, (String, ExistingRecord)>,
    warnings: Vec<String>,
}

impl ExistingIndex {
    /// One bulk read of the store, then indexing.
    pub async fn load<S>(store: &S, filter: &ScopeFilter, strategy: &dyn KeyStrategy) -> Result<Self, StoreError>
    where
        S: ContentStore + ?Sized,
    {
        let records = store.load_existing(filter).await?;
        Ok(Self::from_records(records, strategy))
    }

    pub fn from_records(records: impl IntoIterator<Item = ExistingRecord>, strategy: &dyn KeyStrategy) -> Self {
        let mut index = Self::default();
        for record in records {
            let key = strategy.existing_key(&record);
            let reference = record.reference.clone();
            match index.matched.entry(key.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(reference.clone());
                }
                Entry::Occupied(mut slot) => {
                    let current = index
                        .records
                        .get(slot.get())
                        .and_then(|(_, existing)| existing.updated_at);
                    let (kept, shadowed) = if record.updated_at > current {
                        (reference.clone(), slot.insert(reference.clone()))
                    } else {
                        (slot.get().clone(), reference.clone())
                    };
                    warn!(key = %slot.key(), %kept, %shadowed, "duplicate existing key");
                    index.warnings.push(format!(
                        "duplicate existing key {}: matched {kept}, shadowed {shadowed}",
                        slot.key()
                    ));
                }
            }
            index.records.insert(reference, (key, record));
        }
        index
    }

    /// The record matched by `key`.
    pub fn get(&self, key: &str) -> Option<&ExistingRecord> {
        self.matched
            .get(key)
            .and_then(|reference| self.records.get(reference))
            .map(|(_, record)| record)
    }

    /// Any loaded record, matched or shadowed, with its key.
    pub fn get_by_ref(&self, reference: &RecordRef) -> Option<(&str, &ExistingRecord)> {
        self.records
            .get(reference)
            .map(|(key, record)| (key.as_str(), record))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.matched.contains_key(key)
    }

    /// Number of loaded records, shadowed duplicates included.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Distinct keys present in the store.
    pub fn key_count(&self) -> usize {
        self.matched.len()
    }

    /// Every loaded record with its key, ordered by reference.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ExistingRecord)> {
        self.records.values().map(|(key, record)| (key.as_str(), record))
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedInsert {
    pub key: String,
    pub draft: PostDraft,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedUpdate {
    pub key: String,
    pub target: RecordRef,
    pub existing_updated_at: Option<DateTime<Utc>>,
    /// Slug stored on the target before this write.
    pub previous_slug: String,
    pub draft: PostDraft,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedSkip {
    pub key: String,
    pub target: RecordRef,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedDelete {
    pub key: String,
    pub target: RecordRef,
    pub slug: String,
    /// `true` when the source asked for removal, `false` when the record was not claimed.
    pub explicit: bool,
}

/// Pure diff of one request against existing state. Every list is ordered by key.
///
/// Each stored record is the target of at most one operation, and inserts
/// never address a record that was loaded.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncPlan {
    pub to_insert: Vec<PlannedInsert>,
    pub to_update: Vec<PlannedUpdate>,
    pub to_skip: Vec<PlannedSkip>,
    pub to_delete: Vec<PlannedDelete>,
    pub warnings: Vec<String>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.write_count() == 0 && self.to_skip.is_empty()
    }

    pub fn write_count(&self) -> usize {
        self.to_insert.len() + self.to_update.len() + self.to_delete.len()
    }

    pub fn insert_keys(&self) -> BTreeSet<&str> {
        self.to_insert.iter().map(|op| op.key.as_str()).collect()
    }

    pub fn update_keys(&self) -> BTreeSet<&str> {
        self.to_update.iter().map(|op| op.key.as_str()).collect()
    }

    pub fn skip_keys(&self) -> BTreeSet<&str> {
        self.to_skip.iter().map(|op| op.key.as_str()).collect()
    }

    pub fn delete_keys(&self) -> BTreeSet<&str> {
        self.to_delete.iter().map(|op| op.key.as_str()).collect()
    }

    /// Store references written or skipped by each set: insert, update, skip, delete.
    pub fn targets(&self) -> [BTreeSet<RecordRef>; 4] {
        [
            self.to_insert.iter().map(|op| op.draft.reference()).collect(),
            self.to_update.iter().map(|op| op.target.clone()).collect(),
            self.to_skip.iter().map(|op| op.target.clone()).collect(),
            self.to_delete.iter().map(|op| op.target.clone()).collect(),
        ]
    }
}

/// Diff `drafts` against `index`.
///
/// Drafts claim stored records by key first. A draft whose key misses falls
/// back to its own store reference, so a renamed slug updates the record in
/// place instead of inserting a duplicate identity. Every loaded record left
/// unclaimed, shadowed duplicates included, is deleted.
pub fn plan_sync(
    drafts: Vec<PostDraft>,
    index: &ExistingIndex,
    strategy: &dyn KeyStrategy,
    optimize_by_date: bool,
) -> SyncPlan {
    let mut plan = SyncPlan::default();

    let mut incoming: BTreeMap<String, PostDraft> = BTreeMap::new();
    for draft in drafts {
        let key = strategy.draft_key(&draft);
        if incoming.insert(key.clone(), draft).is_some() {
            warn!(%key, "duplicate incoming key, last occurrence wins");
            plan.warnings
                .push(format!("duplicate incoming key {key}: last occurrence wins"));
        }
    }

    let mut claimed: BTreeSet<RecordRef> = BTreeSet::new();
    let mut deletes: BTreeMap<(String, RecordRef), PlannedDelete> = BTreeMap::new();
    let mut unmatched = Vec::new();

    for (key, draft) in incoming.iter() {
        match index.get(key) {
            Some(existing) => {
                claimed.insert(existing.reference.clone());
                plan_matched(&mut plan, &mut deletes, key, draft, existing, optimize_by_date);
            }
            None => unmatched.push((key, draft)),
        }
    }

    for (key, draft) in unmatched {
        let reference = draft.reference();
        let by_reference = index
            .get_by_ref(&reference)
            .filter(|_| !claimed.contains(&reference));
        match by_reference {
            Some((previous_key, existing)) => {
                debug!(%key, %previous_key, target = %reference, "matched by identity");
                claimed.insert(reference);
                plan_matched(&mut plan, &mut deletes, key, draft, existing, optimize_by_date);
            }
            None if draft.publish => plan.to_insert.push(PlannedInsert {
                key: key.clone(),
                draft: draft.clone(),
            }),
            None => {}
        }
    }

    for (key, existing) in index.iter() {
        if !claimed.contains(&existing.reference) {
            deletes
                .entry((key.to_string(), existing.reference.clone()))
                .or_insert_with(|| delete_of(key, existing, false));
        }
    }

    plan.to_update.sort_by(|a, b| a.key.cmp(&b.key));
    plan.to_skip.sort_by(|a, b| a.key.cmp(&b.key));
    plan.to_delete = deletes.into_values().collect();
    plan
}

fn plan_matched(
    plan: &mut SyncPlan,
    deletes: &mut BTreeMap<(String, RecordRef), PlannedDelete>,
    key: &str,
    draft: &PostDraft,
    existing: &ExistingRecord,
    optimize_by_date: bool,
) {
    if !draft.publish {
        deletes.insert(
            (key.to_string(), existing.reference.clone()),
            delete_of(key, existing, true),
        );
        return;
    }

    let stale = match (optimize_by_date, existing.updated_at, draft.last_modified) {
        (true, Some(current), Some(incoming_at)) => current >= incoming_at,
        _ => false,
    };

    if stale {
        plan.to_skip.push(PlannedSkip {
            key: key.to_string(),
            target: existing.reference.clone(),
        });
    } else {
        plan.to_update.push(PlannedUpdate {
            key: key.to_string(),
            target: existing.reference.clone(),
            existing_updated_at: existing.updated_at,
            previous_slug: existing.slug.clone(),
            draft: draft.clone(),
        });
    }
}

fn delete_of(key: &str, existing: &ExistingRecord, explicit: bool) -> PlannedDelete {
    PlannedDelete {
        key: key.to_string(),
        target: existing.reference.clone(),
        slug: existing.slug.clone(),
        explicit,
    }
}
