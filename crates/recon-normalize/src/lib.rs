//! Field normalization: loose external rows into canonical post drafts.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use recon_core::{ExternalRecord, PostDraft};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "recon-normalize";

pub const FIELD_ID: &str = "id";
pub const FIELD_SLUG: &str = "slug";
pub const FIELD_TITLE: &str = "title";
pub const FIELD_BODY: &str = "body";
pub const FIELD_EXCERPT: &str = "excerpt";
pub const FIELD_DATE: &str = "date";
pub const FIELD_CATEGORIES: &str = "categories";
pub const FIELD_FEATURED: &str = "featured";
pub const FIELD_COMMENTABLE: &str = "commentable";
pub const FIELD_SHAREABLE: &str = "shareable";
pub const FIELD_PUBLISHED: &str = "published";
pub const FIELD_LAST_MODIFIED: &str = "last_modified";
pub const FIELD_PUBLISH: &str = "publish";
pub const FIELD_OWNER_SCOPE: &str = "owner_scope";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("record is not an object (got {0})")]
    NotAnObject(&'static str),
    #[error("record has no identity: expected `id`, `slug` or `title`")]
    MissingIdentity,
    #[error("record identity must be a string or number (got {0})")]
    InvalidIdentity(&'static str),
}

/// External-to-canonical field lookup table plus an exclusion list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub exclude: BTreeSet<String>,
}

impl Default for FieldMapping {
    /// Column names used by the spreadsheet authoring feed.
    fn default() -> Self {
        let fields = [
            ("ID", FIELD_ID),
            ("Id", FIELD_ID),
            ("post_id", FIELD_ID),
            ("Slug", FIELD_SLUG),
            ("Title", FIELD_TITLE),
            ("Content", FIELD_BODY),
            ("content", FIELD_BODY),
            ("Body", FIELD_BODY),
            ("Excerpt", FIELD_EXCERPT),
            ("Date", FIELD_DATE),
            ("Categories", FIELD_CATEGORIES),
            ("Category", FIELD_CATEGORIES),
            ("Featured", FIELD_FEATURED),
            ("Comment", FIELD_COMMENTABLE),
            ("comment", FIELD_COMMENTABLE),
            ("Socmed", FIELD_SHAREABLE),
            ("socmed", FIELD_SHAREABLE),
            ("Published", FIELD_PUBLISHED),
            ("Publish", FIELD_PUBLISH),
            ("Last Modified", FIELD_LAST_MODIFIED),
            ("lastModified", FIELD_LAST_MODIFIED),
            ("updated", FIELD_LAST_MODIFIED),
        ]
        .into_iter()
        .map(|(external, canonical)| (external.to_string(), canonical.to_string()))
        .collect();
        let exclude = [
            "author",
            "author_id",
            "owner",
            "scope",
            FIELD_OWNER_SCOPE,
            "created_at",
            "createdAt",
            "updated_at",
            "updatedAt",
        ]
        .into_iter()
        .map(ToString::to_string)
        .collect();
        Self { fields, exclude }
    }
}

impl FieldMapping {
    pub fn empty() -> Self {
        Self {
            fields: BTreeMap::new(),
            exclude: BTreeSet::new(),
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing field mapping yaml")
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn with_field(mut self, external: impl Into<String>, canonical: impl Into<String>) -> Self {
        self.fields.insert(external.into(), canonical.into());
        self
    }

    pub fn with_exclusion(mut self, name: impl Into<String>) -> Self {
        self.exclude.insert(name.into());
        self
    }

    pub fn canonical_name<'a>(&'a self, external: &'a str) -> &'a str {
        self.fields.get(external).map(String::as_str).unwrap_or(external)
    }

    pub fn is_excluded(&self, external: &str, canonical: &str) -> bool {
        self.exclude.contains(external) || self.exclude.contains(canonical)
    }
}

/// A normalized draft plus any non-fatal warnings raised while producing it.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub draft: PostDraft,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    mapping: FieldMapping,
}

impl Normalizer {
    pub fn new(mapping: FieldMapping) -> Self {
        Self { mapping }
    }

    pub fn mapping(&self) -> &FieldMapping {
        &self.mapping
    }

    /// Map one external record onto a [`PostDraft`].
    ///
    /// `scope` is always written to `owner_scope`; scope-like fields in the
    /// payload are never read. `now` stands in for unparseable dates.
    pub fn normalize(
        &self,
        raw: &ExternalRecord,
        scope: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<NormalizedRecord, NormalizeError> {
        let object = raw
            .as_object()
            .ok_or_else(|| NormalizeError::NotAnObject(json_kind(&raw.0)))?;

        let mut canonical: BTreeMap<&str, &Value> = BTreeMap::new();
        let mut extra = Map::new();
        for (external, value) in object {
            let name = self.mapping.canonical_name(external);
            if self.mapping.is_excluded(external, name) || name == FIELD_OWNER_SCOPE {
                continue;
            }
            if is_canonical_field(name) {
                canonical.insert(name, value);
            } else {
                extra.insert(name.to_string(), value.clone());
            }
        }

        let field = |name: &str| canonical.get(name).copied();

        let title = field(FIELD_TITLE).map(text_value).unwrap_or_default().trim().to_string();
        let slug = field(FIELD_SLUG)
            .map(text_value)
            .map(|s| slugify(&s))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| slugify(&title));
        let id = match field(FIELD_ID).map(identity_value).transpose()?.flatten() {
            Some(id) => id,
            None if !slug.is_empty() => slug.clone(),
            None => return Err(NormalizeError::MissingIdentity),
        };

        let mut warnings = Vec::new();
        let date = match field(FIELD_DATE) {
            Some(value) if !is_blank(value) => timestamp_value(value).unwrap_or_else(|| {
                let message = format!(
                    "record {id}: date {} could not be parsed; using current time",
                    value
                );
                warn!(record = %id, raw = %value, "falling back to current time for unparseable date");
                warnings.push(message);
                now
            }),
            _ => now,
        };
        let last_modified = match field(FIELD_LAST_MODIFIED) {
            Some(value) if !is_blank(value) => {
                let parsed = timestamp_value(value);
                if parsed.is_none() {
                    warn!(record = %id, raw = %value, "ignoring unparseable last-modified timestamp");
                    warnings.push(format!(
                        "record {id}: last_modified {} could not be parsed; treating as changed",
                        value
                    ));
                }
                parsed
            }
            _ => None,
        };

        let draft = PostDraft {
            id,
            owner_scope: scope.map(ToString::to_string),
            title,
            slug,
            body: field(FIELD_BODY).map(text_value).unwrap_or_default(),
            excerpt: field(FIELD_EXCERPT)
                .map(text_value)
                .unwrap_or_default()
                .trim()
                .to_string(),
            date,
            categories: field(FIELD_CATEGORIES).map(parse_categories).unwrap_or_default(),
            featured: field(FIELD_FEATURED).is_some_and(coerce_bool),
            commentable: field(FIELD_COMMENTABLE).is_some_and(coerce_bool),
            shareable: field(FIELD_SHAREABLE).is_some_and(coerce_bool),
            published: field(FIELD_PUBLISHED).is_some_and(coerce_bool),
            extra,
            last_modified,
            publish: !field(FIELD_PUBLISH).is_some_and(is_explicit_false),
        };

        Ok(NormalizedRecord { draft, warnings })
    }
}

fn is_canonical_field(name: &str) -> bool {
    matches!(
        name,
        FIELD_ID
            | FIELD_SLUG
            | FIELD_TITLE
            | FIELD_BODY
            | FIELD_EXCERPT
            | FIELD_DATE
            | FIELD_CATEGORIES
            | FIELD_FEATURED
            | FIELD_COMMENTABLE
            | FIELD_SHAREABLE
            | FIELD_PUBLISHED
            | FIELD_LAST_MODIFIED
            | FIELD_PUBLISH
    )
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn number_text(number: &serde_json::Number) -> String {
    if let Some(i) = number.as_i64() {
        return i.to_string();
    }
    if let Some(u) = number.as_u64() {
        return u.to_string();
    }
    match number.as_f64() {
        // Spreadsheets hand back whole numbers as floats.
        Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 => format!("{}", f as i64),
        _ => number.to_string(),
    }
}

fn text_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => number_text(n),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

fn identity_value(value: &Value) -> Result<Option<String>, NormalizeError> {
    let text = match value {
        Value::Null => return Ok(None),
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => number_text(n),
        other => return Err(NormalizeError::InvalidIdentity(json_kind(other))),
    };
    Ok(if text.is_empty() { None } else { Some(text) })
}

fn timestamp_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp(s),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

/// `true` for the boolean `true` and the literal strings `"TRUE"`/`"true"`; `false` otherwise.
pub fn coerce_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s == "TRUE" || s == "true",
        _ => false,
    }
}

fn is_explicit_false(value: &Value) -> bool {
    match value {
        Value::Bool(b) => !*b,
        Value::String(s) => s.trim().eq_ignore_ascii_case("false"),
        _ => false,
    }
}

/// Split a free-text category list on `|`, else `,`, dropping empty segments.
pub fn parse_categories(value: &Value) -> Vec<String> {
    match value {
        Value::Null => Vec::new(),
        Value::String(s) => split_categories(s),
        Value::Array(items) => items
            .iter()
            .filter(|item| is_truthy(item))
            .map(|item| text_value(item).trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
        other if is_truthy(other) => vec![text_value(other)],
        _ => Vec::new(),
    }
}

pub fn split_categories(raw: &str) -> Vec<String> {
    let delimiter = if raw.contains('|') {
        '|'
    } else if raw.contains(',') {
        ','
    } else {
        let single = raw.trim();
        return if single.is_empty() {
            Vec::new()
        } else {
            vec![single.to_string()]
        };
    };
    raw.split(delimiter)
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Lowercase, alphanumeric runs joined by single dashes.
pub fn slugify(input: &str) -> String {
    input
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Tolerant ISO-8601 parsing for hand-typed spreadsheet timestamps.
///
/// Direct parse first; otherwise `"YYYY-MM-DD HH:MM"` style input is
/// repaired (space to `T`, missing seconds, missing zone as UTC, bare hour
/// offsets) and parsed again. Returns `None` rather than failing.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    parse_iso(trimmed).or_else(|| parse_iso(&repair_timestamp(trimmed)))
}

fn parse_iso(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn repair_timestamp(input: &str) -> String {
    let mut value = input.to_string();
    if value.contains(' ') && !value.contains('T') {
        value = value.replacen(' ', "T", 1);
    }
    let value: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    let Some((date, time)) = value.split_once('T') else {
        return value;
    };

    let (clock, zone) = split_zone(time);
    let mut clock = clock.to_string();
    if clock.matches(':').count() == 1 {
        clock.push_str(":00");
    }
    let zone = if zone.is_empty() {
        "Z".to_string()
    } else {
        normalize_offset(zone)
    };
    format!("{date}T{clock}{zone}")
}

fn split_zone(time: &str) -> (&str, &str) {
    if let Some(clock) = time.strip_suffix(|c: char| c == 'Z' || c == 'z') {
        return (clock, "Z");
    }
    match time.find(|c: char| c == '+' || c == '-') {
        Some(idx) => time.split_at(idx),
        None => (time, ""),
    }
}

fn normalize_offset(zone: &str) -> String {
    if zone == "Z" {
        return zone.to_string();
    }
    let (sign, digits) = zone.split_at(1);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return zone.to_string();
    }
    match digits.len() {
        1 | 2 => format!("{sign}{digits:0>2}:00"),
        4 => format!("{sign}{}:{}", &digits[..2], &digits[2..]),
        _ => zone.to_string(),
    }
}
