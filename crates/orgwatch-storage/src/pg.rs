//! Postgres ledger (sqlx, runtime-checked queries).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orgwatch_core::{
    ChangeRecord, ContentHash, Entity, FieldChange, InsightKind, InsightRecord, RunStats,
    ScorePair, ScoreRecord, Snapshot, TrackedFields,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::{
    CreateOutcome, EntityDetail, Leaderboard, LeaderboardEntry, LedgerStore, LedgerTx,
    RecentChange, RunRecord, RunStatus, StoreError, StoreResult,
};

const ENTITY_COLUMNS: &str =
    "entity_id, external_key, name, domain, first_seen_at, last_seen_at, is_active";
const SNAPSHOT_COLUMNS: &str = "snapshot_id, entity_id, batch, stage, location, description, \
     tags, size_bucket, captured_at, content_hash";

#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("ledger migrations applied");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[derive(sqlx::FromRow)]
struct EntityRow {
    entity_id: Uuid,
    external_key: String,
    name: String,
    domain: Option<String>,
    first_seen_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    is_active: bool,
}

impl From<EntityRow> for Entity {
    fn from(row: EntityRow) -> Self {
        Self {
            entity_id: row.entity_id,
            external_key: row.external_key,
            name: row.name,
            domain: row.domain,
            first_seen_at: row.first_seen_at,
            last_seen_at: row.last_seen_at,
            is_active: row.is_active,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    snapshot_id: Uuid,
    entity_id: Uuid,
    batch: Option<String>,
    stage: Option<String>,
    location: Option<String>,
    description: Option<String>,
    tags: Json<Vec<String>>,
    size_bucket: Option<String>,
    captured_at: DateTime<Utc>,
    content_hash: String,
}

impl From<SnapshotRow> for Snapshot {
    fn from(row: SnapshotRow) -> Self {
        Self {
            snapshot_id: row.snapshot_id,
            entity_id: row.entity_id,
            fields: TrackedFields {
                batch: row.batch,
                stage: row.stage,
                location: row.location,
                description: row.description,
                tags: row.tags.0,
                size_bucket: row.size_bucket,
            },
            captured_at: row.captured_at,
            content_hash: ContentHash::from_hex(row.content_hash),
        }
    }
}

#[derive(sqlx::FromRow)]
struct ChangeRow {
    entity_id: Uuid,
    snapshot_id: Uuid,
    change_type: String,
    old_value: Option<String>,
    new_value: Option<String>,
    detected_at: DateTime<Utc>,
}

impl TryFrom<ChangeRow> for ChangeRecord {
    type Error = StoreError;

    fn try_from(row: ChangeRow) -> Result<Self, Self::Error> {
        let change_type = row.change_type.parse().map_err(|message| StoreError::Corrupt {
            table: "change_records",
            message,
        })?;
        Ok(Self {
            entity_id: row.entity_id,
            snapshot_id: row.snapshot_id,
            change_type,
            old_value: row.old_value,
            new_value: row.new_value,
            detected_at: row.detected_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ScoreRow {
    entity_id: Uuid,
    momentum_score: i32,
    stability_score: i32,
    last_computed_at: DateTime<Utc>,
}

impl From<ScoreRow> for ScoreRecord {
    fn from(row: ScoreRow) -> Self {
        Self {
            entity_id: row.entity_id,
            momentum_score: row.momentum_score,
            stability_score: row.stability_score,
            last_computed_at: row.last_computed_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct InsightRow {
    entity_id: Uuid,
    snapshot_id: Uuid,
    insight_type: String,
    content: String,
    model_name: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<InsightRow> for InsightRecord {
    type Error = StoreError;

    fn try_from(row: InsightRow) -> Result<Self, Self::Error> {
        let kind = InsightKind::parse(&row.insight_type).ok_or_else(|| StoreError::Corrupt {
            table: "insights",
            message: format!("unknown insight type {}", row.insight_type),
        })?;
        Ok(Self {
            entity_id: row.entity_id,
            snapshot_id: row.snapshot_id,
            kind,
            content: row.content,
            model_name: row.model_name,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    status: String,
    pages: i32,
    total: i32,
    new_count: i32,
    updated_count: i32,
    unchanged_count: i32,
    failed_count: i32,
    deactivated: i64,
    avg_ms: f64,
    slowest_ms: f64,
}

impl TryFrom<RunRow> for RunRecord {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let status = RunStatus::parse(&row.status).ok_or_else(|| StoreError::Corrupt {
            table: "ingest_runs",
            message: format!("unknown run status {}", row.status),
        })?;
        let total = row.total.max(0) as usize;
        Ok(Self {
            run_id: row.run_id,
            started_at: row.started_at,
            finished_at: row.finished_at,
            status,
            stats: RunStats {
                pages: row.pages.max(0) as usize,
                total,
                new: row.new_count.max(0) as usize,
                updated: row.updated_count.max(0) as usize,
                unchanged: row.unchanged_count.max(0) as usize,
                failed: row.failed_count.max(0) as usize,
                total_ms: row.avg_ms * total as f64,
                slowest_ms: row.slowest_ms,
            },
            deactivated: row.deactivated.max(0) as u64,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LeaderboardRow {
    external_key: String,
    name: String,
    domain: Option<String>,
    momentum_score: i32,
    stability_score: i32,
}

impl From<LeaderboardRow> for LeaderboardEntry {
    fn from(row: LeaderboardRow) -> Self {
        Self {
            external_key: row.external_key,
            name: row.name,
            domain: row.domain,
            momentum_score: row.momentum_score,
            stability_score: row.stability_score,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RecentChangeRow {
    external_key: String,
    name: String,
    change_type: String,
    detected_at: DateTime<Utc>,
}

impl TryFrom<RecentChangeRow> for RecentChange {
    type Error = StoreError;

    fn try_from(row: RecentChangeRow) -> Result<Self, Self::Error> {
        let change_type = row.change_type.parse().map_err(|message| StoreError::Corrupt {
            table: "change_records",
            message,
        })?;
        Ok(Self {
            external_key: row.external_key,
            name: row.name,
            change_type,
            detected_at: row.detected_at,
        })
    }
}

fn as_i32(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn begin(&self) -> StoreResult<Box<dyn LedgerTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgLedgerTx { tx }))
    }

    async fn now(&self) -> StoreResult<DateTime<Utc>> {
        let now = sqlx::query_scalar::<_, DateTime<Utc>>("SELECT NOW()")
            .fetch_one(&self.pool)
            .await?;
        Ok(now)
    }

    async fn deactivate_stale(&self, threshold: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE entities
               SET is_active = FALSE
             WHERE is_active
               AND last_seen_at < $1
            "#,
        )
        .bind(threshold)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn record_run(&self, run: &RunRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ingest_runs
                (run_id, started_at, finished_at, status, pages, total, new_count,
                 updated_count, unchanged_count, failed_count, deactivated, avg_ms, slowest_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(run.run_id)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.status.as_str())
        .bind(as_i32(run.stats.pages))
        .bind(as_i32(run.stats.total))
        .bind(as_i32(run.stats.new))
        .bind(as_i32(run.stats.updated))
        .bind(as_i32(run.stats.unchanged))
        .bind(as_i32(run.stats.failed))
        .bind(i64::try_from(run.deactivated).unwrap_or(i64::MAX))
        .bind(run.stats.avg_ms())
        .bind(run.stats.slowest_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn entity_detail(
        &self,
        external_key: &str,
        history_limit: i64,
    ) -> StoreResult<Option<EntityDetail>> {
        let entity = sqlx::query_as::<_, EntityRow>(&format!(
            "SELECT {ENTITY_COLUMNS} FROM entities WHERE external_key = $1"
        ))
        .bind(external_key)
        .fetch_optional(&self.pool)
        .await?;
        let Some(entity) = entity.map(Entity::from) else {
            return Ok(None);
        };

        let snapshots = sqlx::query_as::<_, SnapshotRow>(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE entity_id = $1 \
             ORDER BY captured_at DESC LIMIT $2"
        ))
        .bind(entity.entity_id)
        .bind(history_limit)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Snapshot::from)
        .collect();

        let changes = sqlx::query_as::<_, ChangeRow>(
            r#"
            SELECT entity_id, snapshot_id, change_type, old_value, new_value, detected_at
              FROM change_records
             WHERE entity_id = $1
             ORDER BY detected_at DESC, change_seq DESC
             LIMIT $2
            "#,
        )
        .bind(entity.entity_id)
        .bind(history_limit)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(ChangeRecord::try_from)
        .collect::<StoreResult<Vec<_>>>()?;

        let score = sqlx::query_as::<_, ScoreRow>(
            r#"
            SELECT entity_id, momentum_score, stability_score, last_computed_at
              FROM scores
             WHERE entity_id = $1
            "#,
        )
        .bind(entity.entity_id)
        .fetch_optional(&self.pool)
        .await?
        .map(ScoreRecord::from);

        let latest_insight = sqlx::query_as::<_, InsightRow>(
            r#"
            SELECT entity_id, snapshot_id, insight_type, content, model_name, created_at
              FROM insights
             WHERE entity_id = $1
             ORDER BY created_at DESC
             LIMIT 1
            "#,
        )
        .bind(entity.entity_id)
        .fetch_optional(&self.pool)
        .await?
        .map(InsightRecord::try_from)
        .transpose()?;

        Ok(Some(EntityDetail {
            entity,
            snapshots,
            changes,
            score,
            latest_insight,
        }))
    }

    async fn leaderboard(&self, limit: i64) -> StoreResult<Leaderboard> {
        let top_momentum = sqlx::query_as::<_, LeaderboardRow>(
            r#"
            SELECT e.external_key, e.name, e.domain, s.momentum_score, s.stability_score
              FROM scores s
              JOIN entities e ON e.entity_id = s.entity_id
             ORDER BY s.momentum_score DESC, e.external_key
             LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let most_stable = sqlx::query_as::<_, LeaderboardRow>(
            r#"
            SELECT e.external_key, e.name, e.domain, s.momentum_score, s.stability_score
              FROM scores s
              JOIN entities e ON e.entity_id = s.entity_id
             ORDER BY s.stability_score DESC, e.external_key
             LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let recently_changed = sqlx::query_as::<_, RecentChangeRow>(
            r#"
            SELECT external_key, name, change_type, detected_at
              FROM (
                    SELECT DISTINCT ON (c.entity_id)
                           e.external_key, e.name, c.change_type, c.detected_at
                      FROM change_records c
                      JOIN entities e ON e.entity_id = c.entity_id
                     ORDER BY c.entity_id, c.detected_at DESC, c.change_seq DESC
                   ) latest
             ORDER BY detected_at DESC
             LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(RecentChange::try_from)
        .collect::<StoreResult<Vec<_>>>()?;

        Ok(Leaderboard {
            top_momentum: top_momentum.into_iter().map(Into::into).collect(),
            most_stable: most_stable.into_iter().map(Into::into).collect(),
            recently_changed,
        })
    }

    async fn recent_runs(&self, limit: i64) -> StoreResult<Vec<RunRecord>> {
        sqlx::query_as::<_, RunRow>(
            r#"
            SELECT run_id, started_at, finished_at, status, pages, total, new_count,
                   updated_count, unchanged_count, failed_count, deactivated, avg_ms, slowest_ms
              FROM ingest_runs
             ORDER BY started_at DESC
             LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(RunRecord::try_from)
        .collect()
    }
}

struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn lookup_entity(&mut self, external_key: &str) -> StoreResult<Option<Entity>> {
        let row = sqlx::query_as::<_, EntityRow>(&format!(
            "SELECT {ENTITY_COLUMNS} FROM entities WHERE external_key = $1 FOR UPDATE"
        ))
        .bind(external_key)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(Entity::from))
    }

    async fn create_entity(
        &mut self,
        external_key: &str,
        name: &str,
        domain: Option<&str>,
    ) -> StoreResult<CreateOutcome> {
        // Blocks on a concurrent uncommitted insert of the same key, then
        // returns no row once that insert commits.
        let row = sqlx::query_as::<_, EntityRow>(&format!(
            r#"
            INSERT INTO entities
                (entity_id, external_key, name, domain, first_seen_at, last_seen_at, is_active)
            VALUES ($1, $2, $3, $4, NOW(), NOW(), TRUE)
            ON CONFLICT (external_key) DO NOTHING
            RETURNING {ENTITY_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(external_key)
        .bind(name)
        .bind(domain)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(match row {
            Some(row) => CreateOutcome::Created(row.into()),
            None => CreateOutcome::AlreadyExists,
        })
    }

    async fn reactivate(&mut self, entity_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE entities SET is_active = TRUE WHERE entity_id = $1 AND NOT is_active",
        )
        .bind(entity_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn touch(&mut self, entity_id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE entities SET last_seen_at = NOW() WHERE entity_id = $1")
            .bind(entity_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn latest_snapshot(&mut self, entity_id: Uuid) -> StoreResult<Option<Snapshot>> {
        let row = sqlx::query_as::<_, SnapshotRow>(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE entity_id = $1 \
             ORDER BY captured_at DESC LIMIT 1"
        ))
        .bind(entity_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(Snapshot::from))
    }

    async fn append_snapshot(
        &mut self,
        entity_id: Uuid,
        fields: &TrackedFields,
        content_hash: &ContentHash,
    ) -> StoreResult<Snapshot> {
        // clock_timestamp(), not NOW(): the entity lock may have been
        // acquired long after this transaction started.
        let row = sqlx::query_as::<_, SnapshotRow>(&format!(
            r#"
            INSERT INTO snapshots
                (snapshot_id, entity_id, batch, stage, location, description, tags,
                 size_bucket, captured_at, content_hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, clock_timestamp(), $9)
            RETURNING {SNAPSHOT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(entity_id)
        .bind(&fields.batch)
        .bind(&fields.stage)
        .bind(&fields.location)
        .bind(&fields.description)
        .bind(Json(&fields.tags))
        .bind(&fields.size_bucket)
        .bind(content_hash.as_str())
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row.into())
    }

    async fn insert_changes(
        &mut self,
        entity_id: Uuid,
        snapshot_id: Uuid,
        changes: &[FieldChange],
    ) -> StoreResult<Vec<ChangeRecord>> {
        let mut records = Vec::with_capacity(changes.len());
        for change in changes {
            let detected_at = sqlx::query_scalar::<_, DateTime<Utc>>(
                r#"
                INSERT INTO change_records
                    (change_id, entity_id, snapshot_id, change_type, old_value, new_value, detected_at)
                VALUES ($1, $2, $3, $4, $5, $6, NOW())
                RETURNING detected_at
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(entity_id)
            .bind(snapshot_id)
            .bind(change.change_type.as_str())
            .bind(&change.old_value)
            .bind(&change.new_value)
            .fetch_one(&mut *self.tx)
            .await?;

            records.push(ChangeRecord {
                entity_id,
                snapshot_id,
                change_type: change.change_type,
                old_value: change.old_value.clone(),
                new_value: change.new_value.clone(),
                detected_at,
            });
        }
        Ok(records)
    }

    async fn insert_baseline_score(&mut self, entity_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO scores (entity_id, momentum_score, stability_score, last_computed_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (entity_id) DO NOTHING
            "#,
        )
        .bind(entity_id)
        .bind(ScorePair::BASELINE.momentum)
        .bind(ScorePair::BASELINE.stability)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_score(
        &mut self,
        entity_id: Uuid,
        scores: ScorePair,
    ) -> StoreResult<ScoreRecord> {
        let row = sqlx::query_as::<_, ScoreRow>(
            r#"
            INSERT INTO scores (entity_id, momentum_score, stability_score, last_computed_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (entity_id)
            DO UPDATE SET
                momentum_score = EXCLUDED.momentum_score,
                stability_score = EXCLUDED.stability_score,
                last_computed_at = EXCLUDED.last_computed_at
            RETURNING entity_id, momentum_score, stability_score, last_computed_at
            "#,
        )
        .bind(entity_id)
        .bind(scores.momentum)
        .bind(scores.stability)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row.into())
    }

    async fn insert_insight(
        &mut self,
        entity_id: Uuid,
        snapshot_id: Uuid,
        kind: InsightKind,
        content: &str,
        model_name: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO insights
                (insight_id, entity_id, snapshot_id, insight_type, content, model_name, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entity_id)
        .bind(snapshot_id)
        .bind(kind.as_str())
        .bind(content)
        .bind(model_name)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
