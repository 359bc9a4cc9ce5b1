//! Relational ledger for orgwatch: entity registry, snapshot history, change
//! records, scores, insights and run records.
//!
//! Everything one ingested record writes goes through a [`LedgerTx`]; the
//! store's transaction and the uniqueness constraint on `external_key` are
//! the only conflict resolution.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orgwatch_core::{
    ChangeRecord, ChangeType, ContentHash, Entity, FieldChange, InsightKind, InsightRecord,
    RunStats, ScorePair, ScoreRecord, Snapshot, TrackedFields,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod memory;
mod pg;

pub use memory::MemoryLedgerStore;
pub use pg::PgLedgerStore;

pub const CRATE_NAME: &str = "orgwatch-storage";

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error("store connection is closed")]
    Closed,
    #[error("store unreachable: {0}")]
    Unreachable(String),
    #[error("corrupt row in {table}: {message}")]
    Corrupt {
        table: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
    /// The store is gone; nothing else in the run can succeed.
    Fatal,
}

impl StoreError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Database(err) => classify_sqlx_error(err),
            Self::Transient(_) | Self::Unreachable(_) => RetryDisposition::Retryable,
            Self::Closed => RetryDisposition::Fatal,
            Self::Migrate(_) | Self::Corrupt { .. } => RetryDisposition::NonRetryable,
        }
    }

    /// The store itself cannot be reached, as opposed to one statement
    /// failing. Connection errors are retryable, but once retries run out
    /// nothing else in the run can succeed either.
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::Closed | Self::Unreachable(_) => true,
            Self::Database(err) => matches!(
                err,
                sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)
            ),
            Self::Transient(_) | Self::Migrate(_) | Self::Corrupt { .. } => false,
        }
    }
}

pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::PoolClosed => RetryDisposition::Fatal,
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => RetryDisposition::Retryable,
        // serialization_failure, deadlock_detected
        sqlx::Error::Database(db) if matches!(db.code().as_deref(), Some("40001" | "40P01")) => {
            RetryDisposition::Retryable
        }
        _ => RetryDisposition::NonRetryable,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Result of an idempotent entity insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(Entity),
    /// Another transaction committed the same external key first.
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// The source failed mid-run; cleanup was skipped.
    Partial,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Partial => "partial",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "completed" => Some(Self::Completed),
            "partial" => Some(Self::Partial),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub stats: RunStats,
    pub deactivated: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDetail {
    pub entity: Entity,
    /// Newest first.
    pub snapshots: Vec<Snapshot>,
    /// Newest first.
    pub changes: Vec<ChangeRecord>,
    pub score: Option<ScoreRecord>,
    pub latest_insight: Option<InsightRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub external_key: String,
    pub name: String,
    pub domain: Option<String>,
    pub momentum_score: i32,
    pub stability_score: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentChange {
    pub external_key: String,
    pub name: String,
    pub change_type: ChangeType,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leaderboard {
    pub top_momentum: Vec<LeaderboardEntry>,
    pub most_stable: Vec<LeaderboardEntry>,
    /// Latest change per entity, newest first.
    pub recently_changed: Vec<RecentChange>,
}

/// Shared handle to the ledger. Cheap to clone behind an `Arc`.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open the transaction that scopes one record's ingestion.
    async fn begin(&self) -> StoreResult<Box<dyn LedgerTx>>;

    /// Current time on the store's clock.
    async fn now(&self) -> StoreResult<DateTime<Utc>>;

    /// Mark every active entity last seen before `threshold` inactive.
    /// Returns the number of entities deactivated.
    async fn deactivate_stale(&self, threshold: DateTime<Utc>) -> StoreResult<u64>;

    async fn record_run(&self, run: &RunRecord) -> StoreResult<()>;

    async fn entity_detail(
        &self,
        external_key: &str,
        history_limit: i64,
    ) -> StoreResult<Option<EntityDetail>>;

    async fn leaderboard(&self, limit: i64) -> StoreResult<Leaderboard>;

    async fn recent_runs(&self, limit: i64) -> StoreResult<Vec<RunRecord>>;
}

/// One open transaction. Dropping it without [`LedgerTx::commit`] rolls
/// everything back.
#[async_trait]
pub trait LedgerTx: Send {
    /// Look up by external key, locking the row for the rest of the
    /// transaction.
    async fn lookup_entity(&mut self, external_key: &str) -> StoreResult<Option<Entity>>;

    async fn create_entity(
        &mut self,
        external_key: &str,
        name: &str,
        domain: Option<&str>,
    ) -> StoreResult<CreateOutcome>;

    /// Set `is_active` if it was false. Returns whether anything changed.
    async fn reactivate(&mut self, entity_id: Uuid) -> StoreResult<bool>;

    async fn touch(&mut self, entity_id: Uuid) -> StoreResult<()>;

    async fn latest_snapshot(&mut self, entity_id: Uuid) -> StoreResult<Option<Snapshot>>;

    /// Always inserts; `captured_at` comes from the store clock.
    async fn append_snapshot(
        &mut self,
        entity_id: Uuid,
        fields: &TrackedFields,
        content_hash: &ContentHash,
    ) -> StoreResult<Snapshot>;

    async fn insert_changes(
        &mut self,
        entity_id: Uuid,
        snapshot_id: Uuid,
        changes: &[FieldChange],
    ) -> StoreResult<Vec<ChangeRecord>>;

    /// Insert the baseline score unless the entity already has one.
    async fn insert_baseline_score(&mut self, entity_id: Uuid) -> StoreResult<bool>;

    async fn upsert_score(&mut self, entity_id: Uuid, scores: ScorePair)
        -> StoreResult<ScoreRecord>;

    async fn insert_insight(
        &mut self,
        entity_id: Uuid,
        snapshot_id: Uuid,
        kind: InsightKind,
        content: &str,
        model_name: &str,
    ) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn pool_failures_are_classified_by_recoverability() {
        assert_eq!(
            StoreError::from(sqlx::Error::PoolTimedOut).disposition(),
            RetryDisposition::Retryable
        );
        assert_eq!(
            StoreError::from(sqlx::Error::PoolClosed).disposition(),
            RetryDisposition::Fatal
        );
        assert_eq!(
            StoreError::from(sqlx::Error::RowNotFound).disposition(),
            RetryDisposition::NonRetryable
        );
        assert_eq!(StoreError::Closed.disposition(), RetryDisposition::Fatal);
        assert_eq!(
            StoreError::Transient("flaky".into()).disposition(),
            RetryDisposition::Retryable
        );
    }

    #[test]
    fn connection_loss_is_unavailable_but_statement_failures_are_not() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(StoreError::from(sqlx::Error::Io(io)).is_unavailable());
        assert!(StoreError::from(sqlx::Error::PoolTimedOut).is_unavailable());
        assert!(StoreError::from(sqlx::Error::PoolClosed).is_unavailable());
        assert!(StoreError::Unreachable("down".into()).is_unavailable());
        assert!(StoreError::Closed.is_unavailable());

        assert!(!StoreError::Transient("flaky".into()).is_unavailable());
        assert!(!StoreError::from(sqlx::Error::RowNotFound).is_unavailable());
    }

    #[test]
    fn run_status_round_trips() {
        for status in [RunStatus::Completed, RunStatus::Partial] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("running"), None);
    }
}
