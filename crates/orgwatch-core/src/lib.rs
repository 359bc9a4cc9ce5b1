//! Core domain model for orgwatch: the tracked record shape, its versions and
//! the pure functions (fingerprint, change detection, scoring) the ingest
//! pipeline composes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub mod changes;
pub mod fingerprint;
pub mod scores;

pub use changes::{detect_changes, ChangeType, FieldChange};
pub use fingerprint::{canonical_json, fingerprint, ContentHash};
pub use scores::{compute_scores, days_between, ScorePair};

pub const CRATE_NAME: &str = "orgwatch-core";

/// Record as delivered by a source adapter, before validation.
///
/// Field names follow the upstream company directory where it differs from
/// ours (`slug`, `website`, `one_liner`, `team_size`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingRecord {
    #[serde(default, alias = "slug")]
    pub external_key: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "website")]
    pub domain: Option<String>,
    #[serde(default)]
    pub batch: Option<String>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default, alias = "one_liner")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default, alias = "team_size", deserialize_with = "string_or_number")]
    pub size_bucket: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("record is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("record could not be decoded: {0}")]
    Malformed(String),
}

/// One element of a source page. Elements that do not decode travel with
/// the page and are counted as failed records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRecord {
    Decoded(IncomingRecord),
    Undecodable(RecordError),
}

impl SourceRecord {
    /// Decode one raw array element on its own.
    pub fn from_json(value: JsonValue) -> Self {
        match serde_json::from_value::<IncomingRecord>(value) {
            Ok(record) => Self::Decoded(record),
            Err(err) => Self::Undecodable(RecordError::Malformed(err.to_string())),
        }
    }

    pub fn validate(self) -> Result<OrgRecord, RecordError> {
        match self {
            Self::Decoded(record) => record.validate(),
            Self::Undecodable(err) => Err(err),
        }
    }
}

impl From<IncomingRecord> for SourceRecord {
    fn from(record: IncomingRecord) -> Self {
        Self::Decoded(record)
    }
}

impl IncomingRecord {
    /// Reject records without an external key or name before anything is
    /// hashed or written.
    pub fn validate(self) -> Result<OrgRecord, RecordError> {
        let external_key =
            non_blank(self.external_key).ok_or(RecordError::MissingField("external_key"))?;
        let name = non_blank(self.name).ok_or(RecordError::MissingField("name"))?;

        Ok(OrgRecord {
            external_key,
            name,
            domain: non_blank(self.domain),
            fields: TrackedFields {
                batch: self.batch,
                stage: self.stage,
                location: self.location,
                description: self.description,
                tags: self.tags.unwrap_or_default(),
                size_bucket: self.size_bucket,
            },
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<JsonValue>::deserialize(deserializer)? {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) => Ok(Some(s)),
        Some(JsonValue::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(de::Error::custom(format!(
            "expected string or number for size bucket, got {other}"
        ))),
    }
}

/// Validated record: identity plus the hashable, diffable payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgRecord {
    pub external_key: String,
    pub name: String,
    pub domain: Option<String>,
    pub fields: TrackedFields,
}

/// The mutable fields versioned by snapshots. Tag order is preserved as
/// delivered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedFields {
    pub batch: Option<String>,
    pub stage: Option<String>,
    pub location: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub size_bucket: Option<String>,
}

/// One tracked organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: Uuid,
    pub external_key: String,
    pub name: String,
    pub domain: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub is_active: bool,
}

/// Immutable version of an entity's tracked fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: Uuid,
    pub entity_id: Uuid,
    pub fields: TrackedFields,
    pub captured_at: DateTime<Utc>,
    pub content_hash: ContentHash,
}

/// Persisted field transition between two consecutive snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub entity_id: Uuid,
    pub snapshot_id: Uuid,
    pub change_type: ChangeType,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub detected_at: DateTime<Utc>,
}

/// Current derived metrics for an entity. Overwritten on recompute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub entity_id: Uuid,
    pub momentum_score: i32,
    pub stability_score: i32,
    pub last_computed_at: DateTime<Utc>,
}

impl ScoreRecord {
    pub fn pair(&self) -> ScorePair {
        ScorePair {
            momentum: self.momentum_score,
            stability: self.stability_score,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InsightKind {
    Summary,
    Change,
}

impl InsightKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summary => "SUMMARY",
            Self::Change => "CHANGE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SUMMARY" => Some(Self::Summary),
            "CHANGE" => Some(Self::Change),
            _ => None,
        }
    }
}

/// Narrative stored next to the snapshot that triggered it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsightRecord {
    pub entity_id: Uuid,
    pub snapshot_id: Uuid,
    pub kind: InsightKind,
    pub content: String,
    pub model_name: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of ingesting one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    New,
    Updated,
    Unchanged,
    Failed,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
            Self::Failed => "failed",
        }
    }
}

/// Aggregate counters for a page or a whole run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub pages: usize,
    pub total: usize,
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub total_ms: f64,
    pub slowest_ms: f64,
}

impl RunStats {
    pub fn record(&mut self, classification: Classification, elapsed: Duration) {
        self.total += 1;
        match classification {
            Classification::New => self.new += 1,
            Classification::Updated => self.updated += 1,
            Classification::Unchanged => self.unchanged += 1,
            Classification::Failed => self.failed += 1,
        }
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.total_ms += ms;
        if ms > self.slowest_ms {
            self.slowest_ms = ms;
        }
    }

    pub fn merge(&mut self, other: &RunStats) {
        self.pages += other.pages;
        self.total += other.total;
        self.new += other.new;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.failed += other.failed;
        self.total_ms += other.total_ms;
        self.slowest_ms = self.slowest_ms.max(other.slowest_ms);
    }

    pub fn avg_ms(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.total_ms / self.total as f64
        }
    }

    pub fn count(&self, classification: Classification) -> usize {
        match classification {
            Classification::New => self.new,
            Classification::Updated => self.updated,
            Classification::Unchanged => self.unchanged,
            Classification::Failed => self.failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_field_names_deserialize_into_incoming_record() {
        let raw = serde_json::json!({
            "slug": "acme",
            "name": "Acme",
            "website": "https://acme.dev",
            "batch": "W21",
            "stage": "Seed",
            "one_liner": "Anvils as a service",
            "tags": ["b2b", "saas"],
            "team_size": 12,
            "objectID": "123"
        });
        let record: IncomingRecord = serde_json::from_value(raw).expect("deserialize");
        assert_eq!(record.external_key.as_deref(), Some("acme"));
        assert_eq!(record.domain.as_deref(), Some("https://acme.dev"));
        assert_eq!(record.description.as_deref(), Some("Anvils as a service"));
        assert_eq!(record.size_bucket.as_deref(), Some("12"));
    }

    #[test]
    fn validate_rejects_missing_or_blank_identity() {
        let missing_key = IncomingRecord {
            name: Some("Acme".into()),
            ..Default::default()
        };
        assert_eq!(
            missing_key.validate(),
            Err(RecordError::MissingField("external_key"))
        );

        let blank_name = IncomingRecord {
            external_key: Some("acme".into()),
            name: Some("   ".into()),
            ..Default::default()
        };
        assert_eq!(blank_name.validate(), Err(RecordError::MissingField("name")));
    }

    #[test]
    fn mistyped_element_decodes_to_a_malformed_record() {
        let bad = SourceRecord::from_json(serde_json::json!({"slug": "bad", "tags": "b2b"}));
        match &bad {
            SourceRecord::Undecodable(RecordError::Malformed(message)) => {
                assert!(message.contains("invalid type"), "{message}");
            }
            other => panic!("expected an undecodable element, got {other:?}"),
        }
        assert!(matches!(bad.validate(), Err(RecordError::Malformed(_))));

        let good = SourceRecord::from_json(serde_json::json!({"slug": "acme", "name": "Acme"}));
        assert_eq!(good.validate().expect("valid").external_key, "acme");
    }

    #[test]
    fn validate_defaults_missing_tags_to_empty() {
        let record = IncomingRecord {
            external_key: Some(" acme ".into()),
            name: Some("Acme".into()),
            stage: Some("Seed".into()),
            ..Default::default()
        }
        .validate()
        .expect("valid");
        assert_eq!(record.external_key, "acme");
        assert!(record.fields.tags.is_empty());
        assert_eq!(record.domain, None);
    }

    #[test]
    fn run_stats_aggregate_per_classification() {
        let mut page = RunStats::default();
        page.record(Classification::New, Duration::from_millis(10));
        page.record(Classification::Unchanged, Duration::from_millis(30));
        page.record(Classification::Failed, Duration::from_millis(20));

        let mut run = RunStats::default();
        run.merge(&page);
        run.merge(&page);

        assert_eq!(run.total, 6);
        assert_eq!(run.count(Classification::New), 2);
        assert_eq!(run.count(Classification::Failed), 2);
        assert!((run.avg_ms() - 20.0).abs() < 1e-6);
        assert!((run.slowest_ms - 30.0).abs() < 1e-6);
    }
}
