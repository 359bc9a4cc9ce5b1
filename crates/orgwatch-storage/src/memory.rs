//! In-process ledger for dry runs and tests. Committed state is locked per
//! operation only; a transaction stages its writes in a delta applied on
//! commit and rolls back on drop. Row locks by external key play the part
//! of `FOR UPDATE` and the unique index, so transactions on different keys
//! interleave while two creates of one key still race.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use orgwatch_core::{
    ChangeRecord, ContentHash, Entity, FieldChange, InsightKind, InsightRecord, ScorePair,
    ScoreRecord, Snapshot, TrackedFields,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::{
    CreateOutcome, EntityDetail, Leaderboard, LeaderboardEntry, LedgerStore, LedgerTx,
    RecentChange, RunRecord, StoreError, StoreResult,
};

#[derive(Debug, Default)]
struct MemoryState {
    entities: BTreeMap<Uuid, Entity>,
    keys: HashMap<String, Uuid>,
    /// Per entity, in capture order.
    snapshots: HashMap<Uuid, Vec<Snapshot>>,
    /// Per entity, in insert order.
    changes: HashMap<Uuid, Vec<ChangeRecord>>,
    scores: HashMap<Uuid, ScoreRecord>,
    insights: HashMap<Uuid, Vec<InsightRecord>>,
    runs: Vec<RunRecord>,
}

impl MemoryState {
    fn entity_by_key(&self, external_key: &str) -> Option<&Entity> {
        self.keys
            .get(external_key)
            .and_then(|id| self.entities.get(id))
    }

    fn entity_id(&self, external_key: &str) -> Option<Uuid> {
        self.keys.get(external_key).copied()
    }

    fn leaderboard_entry(&self, score: &ScoreRecord) -> Option<LeaderboardEntry> {
        self.entities.get(&score.entity_id).map(|e| LeaderboardEntry {
            external_key: e.external_key.clone(),
            name: e.name.clone(),
            domain: e.domain.clone(),
            momentum_score: score.momentum_score,
            stability_score: score.stability_score,
        })
    }
}

fn missing_entity(entity_id: Uuid) -> StoreError {
    StoreError::Corrupt {
        table: "entities",
        message: format!("no entity {entity_id}"),
    }
}

/// Monotonic clock with an adjustable offset from wall time.
#[derive(Debug, Default)]
struct MemoryClock {
    state: StdMutex<ClockState>,
}

#[derive(Debug)]
struct ClockState {
    offset: Duration,
    last: Option<DateTime<Utc>>,
}

impl Default for ClockState {
    fn default() -> Self {
        Self {
            offset: Duration::zero(),
            last: None,
        }
    }
}

impl MemoryClock {
    fn now(&self) -> DateTime<Utc> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let mut now = Utc::now() + state.offset;
        if let Some(last) = state.last {
            if now <= last {
                now = last + Duration::microseconds(1);
            }
        }
        state.last = Some(now);
        now
    }

    fn advance(&self, by: Duration) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.offset += by;
    }
}

/// One lock per external key, held until the owning transaction ends.
#[derive(Debug, Default)]
struct RowLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RowLocks {
    async fn acquire(&self, external_key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            locks.entry(external_key.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[derive(Debug, Default)]
struct Faults {
    transient_begins: AtomicUsize,
    closed: AtomicBool,
    unreachable: AtomicBool,
    create_conflicts: AtomicUsize,
}

impl Faults {
    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::Closed)
        } else if self.unreachable.load(Ordering::SeqCst) {
            Err(StoreError::Unreachable("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryLedgerStore {
    state: Arc<Mutex<MemoryState>>,
    row_locks: Arc<RowLocks>,
    clock: Arc<MemoryClock>,
    faults: Arc<Faults>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the store clock forward.
    pub fn advance_clock(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// Make the next `count` calls to `begin` fail with a transient error.
    pub fn fail_next_transactions(&self, count: usize) {
        self.faults.transient_begins.store(count, Ordering::SeqCst);
    }

    /// Simulate losing the connection: every later call fails fatally.
    pub fn close(&self) {
        self.faults.closed.store(true, Ordering::SeqCst);
    }

    /// Simulate a database outage: while set, every call fails with a
    /// retryable connection error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.faults.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Creates that found their key already committed by another
    /// transaction.
    pub fn create_conflicts(&self) -> usize {
        self.faults.create_conflicts.load(Ordering::SeqCst)
    }

    /// Insert an entity with no snapshot, as left behind by an interrupted
    /// run.
    pub async fn seed_bare_entity(&self, external_key: &str, name: &str) -> Entity {
        let now = self.clock.now();
        let entity = Entity {
            entity_id: Uuid::new_v4(),
            external_key: external_key.to_string(),
            name: name.to_string(),
            domain: None,
            first_seen_at: now,
            last_seen_at: now,
            is_active: true,
        };
        let mut state = self.state.lock().await;
        state
            .keys
            .insert(entity.external_key.clone(), entity.entity_id);
        state.entities.insert(entity.entity_id, entity.clone());
        entity
    }

    pub async fn entity(&self, external_key: &str) -> Option<Entity> {
        self.state.lock().await.entity_by_key(external_key).cloned()
    }

    pub async fn entity_count(&self) -> usize {
        self.state.lock().await.entities.len()
    }

    /// Oldest first.
    pub async fn snapshots(&self, external_key: &str) -> Vec<Snapshot> {
        let state = self.state.lock().await;
        state
            .entity_id(external_key)
            .and_then(|id| state.snapshots.get(&id).cloned())
            .unwrap_or_default()
    }

    /// Oldest first.
    pub async fn changes(&self, external_key: &str) -> Vec<ChangeRecord> {
        let state = self.state.lock().await;
        state
            .entity_id(external_key)
            .and_then(|id| state.changes.get(&id).cloned())
            .unwrap_or_default()
    }

    pub async fn score(&self, external_key: &str) -> Option<ScoreRecord> {
        let state = self.state.lock().await;
        let id = state.entity_id(external_key)?;
        state.scores.get(&id).copied()
    }

    /// Oldest first.
    pub async fn insights(&self, external_key: &str) -> Vec<InsightRecord> {
        let state = self.state.lock().await;
        state
            .entity_id(external_key)
            .and_then(|id| state.insights.get(&id).cloned())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn begin(&self) -> StoreResult<Box<dyn LedgerTx>> {
        self.faults.ensure_open()?;
        let injected = self
            .faults
            .transient_begins
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Transient("injected failure".into()));
        }

        Ok(Box::new(MemoryTx {
            state: self.state.clone(),
            row_locks: self.row_locks.clone(),
            held: HashMap::new(),
            staged: StagedWrites::default(),
            clock: self.clock.clone(),
            faults: self.faults.clone(),
        }))
    }

    async fn now(&self) -> StoreResult<DateTime<Utc>> {
        self.faults.ensure_open()?;
        Ok(self.clock.now())
    }

    async fn deactivate_stale(&self, threshold: DateTime<Utc>) -> StoreResult<u64> {
        self.faults.ensure_open()?;
        let mut state = self.state.lock().await;
        let mut count = 0;
        for entity in state.entities.values_mut() {
            if entity.is_active && entity.last_seen_at < threshold {
                entity.is_active = false;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn record_run(&self, run: &RunRecord) -> StoreResult<()> {
        self.faults.ensure_open()?;
        self.state.lock().await.runs.push(run.clone());
        Ok(())
    }

    async fn entity_detail(
        &self,
        external_key: &str,
        history_limit: i64,
    ) -> StoreResult<Option<EntityDetail>> {
        self.faults.ensure_open()?;
        let limit = usize::try_from(history_limit).unwrap_or(0);
        let state = self.state.lock().await;
        let Some(entity) = state.entity_by_key(external_key).cloned() else {
            return Ok(None);
        };
        let id = entity.entity_id;

        let snapshots = state
            .snapshots
            .get(&id)
            .map(|s| s.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default();
        let changes = state
            .changes
            .get(&id)
            .map(|c| c.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default();
        let latest_insight = state.insights.get(&id).and_then(|i| i.last()).cloned();

        Ok(Some(EntityDetail {
            entity,
            snapshots,
            changes,
            score: state.scores.get(&id).copied(),
            latest_insight,
        }))
    }

    async fn leaderboard(&self, limit: i64) -> StoreResult<Leaderboard> {
        self.faults.ensure_open()?;
        let limit = usize::try_from(limit).unwrap_or(0);
        let state = self.state.lock().await;

        let mut entries = state
            .scores
            .values()
            .filter_map(|s| state.leaderboard_entry(s))
            .collect::<Vec<_>>();

        entries.sort_by(|a, b| {
            b.momentum_score
                .cmp(&a.momentum_score)
                .then_with(|| a.external_key.cmp(&b.external_key))
        });
        let top_momentum = entries.iter().take(limit).cloned().collect();

        entries.sort_by(|a, b| {
            b.stability_score
                .cmp(&a.stability_score)
                .then_with(|| a.external_key.cmp(&b.external_key))
        });
        let most_stable = entries.into_iter().take(limit).collect();

        let mut recently_changed = state
            .changes
            .iter()
            .filter_map(|(id, changes)| {
                let change = changes.last()?;
                state.entities.get(id).map(|e| RecentChange {
                    external_key: e.external_key.clone(),
                    name: e.name.clone(),
                    change_type: change.change_type,
                    detected_at: change.detected_at,
                })
            })
            .collect::<Vec<_>>();
        recently_changed.sort_by(|a, b| {
            b.detected_at
                .cmp(&a.detected_at)
                .then_with(|| a.external_key.cmp(&b.external_key))
        });
        recently_changed.truncate(limit);

        Ok(Leaderboard {
            top_momentum,
            most_stable,
            recently_changed,
        })
    }

    async fn recent_runs(&self, limit: i64) -> StoreResult<Vec<RunRecord>> {
        self.faults.ensure_open()?;
        let limit = usize::try_from(limit).unwrap_or(0);
        let state = self.state.lock().await;
        let mut runs = state.runs.clone();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }
}

/// Writes of one open transaction, applied to the committed state on
/// commit.
#[derive(Debug, Default)]
struct StagedWrites {
    /// Inserted or updated rows.
    entities: HashMap<Uuid, Entity>,
    snapshots: Vec<Snapshot>,
    changes: Vec<ChangeRecord>,
    scores: HashMap<Uuid, ScoreRecord>,
    insights: Vec<InsightRecord>,
}

impl StagedWrites {
    fn entity_by_key(&self, external_key: &str) -> Option<&Entity> {
        self.entities
            .values()
            .find(|e| e.external_key == external_key)
    }
}

struct MemoryTx {
    state: Arc<Mutex<MemoryState>>,
    row_locks: Arc<RowLocks>,
    held: HashMap<String, OwnedMutexGuard<()>>,
    staged: StagedWrites,
    clock: Arc<MemoryClock>,
    faults: Arc<Faults>,
}

impl MemoryTx {
    async fn lock_row(&mut self, external_key: &str) {
        if !self.held.contains_key(external_key) {
            let guard = self.row_locks.acquire(external_key).await;
            self.held.insert(external_key.to_string(), guard);
        }
    }

    /// Staged copy of an entity row, pulled from committed state on first
    /// write.
    async fn entity_for_update(&mut self, entity_id: Uuid) -> StoreResult<&mut Entity> {
        if !self.staged.entities.contains_key(&entity_id) {
            let committed = self
                .state
                .lock()
                .await
                .entities
                .get(&entity_id)
                .cloned()
                .ok_or_else(|| missing_entity(entity_id))?;
            self.staged.entities.insert(entity_id, committed);
        }
        self.staged
            .entities
            .get_mut(&entity_id)
            .ok_or_else(|| missing_entity(entity_id))
    }
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn lookup_entity(&mut self, external_key: &str) -> StoreResult<Option<Entity>> {
        self.faults.ensure_open()?;
        if let Some(entity) = self.staged.entity_by_key(external_key) {
            return Ok(Some(entity.clone()));
        }
        // only existing rows are locked
        if self.state.lock().await.entity_id(external_key).is_none() {
            return Ok(None);
        }
        self.lock_row(external_key).await;
        Ok(self.state.lock().await.entity_by_key(external_key).cloned())
    }

    async fn create_entity(
        &mut self,
        external_key: &str,
        name: &str,
        domain: Option<&str>,
    ) -> StoreResult<CreateOutcome> {
        self.faults.ensure_open()?;
        if self.staged.entity_by_key(external_key).is_some() {
            return Ok(CreateOutcome::AlreadyExists);
        }
        // waits for a concurrent insert of the same key to commit or roll back
        self.lock_row(external_key).await;
        if self.state.lock().await.entity_id(external_key).is_some() {
            self.faults.create_conflicts.fetch_add(1, Ordering::SeqCst);
            return Ok(CreateOutcome::AlreadyExists);
        }

        let now = self.clock.now();
        let entity = Entity {
            entity_id: Uuid::new_v4(),
            external_key: external_key.to_string(),
            name: name.to_string(),
            domain: domain.map(str::to_string),
            first_seen_at: now,
            last_seen_at: now,
            is_active: true,
        };
        self.staged.entities.insert(entity.entity_id, entity.clone());
        Ok(CreateOutcome::Created(entity))
    }

    async fn reactivate(&mut self, entity_id: Uuid) -> StoreResult<bool> {
        self.faults.ensure_open()?;
        let entity = self.entity_for_update(entity_id).await?;
        let changed = !entity.is_active;
        entity.is_active = true;
        Ok(changed)
    }

    async fn touch(&mut self, entity_id: Uuid) -> StoreResult<()> {
        self.faults.ensure_open()?;
        let now = self.clock.now();
        self.entity_for_update(entity_id).await?.last_seen_at = now;
        Ok(())
    }

    async fn latest_snapshot(&mut self, entity_id: Uuid) -> StoreResult<Option<Snapshot>> {
        self.faults.ensure_open()?;
        if let Some(staged) = self
            .staged
            .snapshots
            .iter()
            .rev()
            .find(|s| s.entity_id == entity_id)
        {
            return Ok(Some(staged.clone()));
        }
        Ok(self
            .state
            .lock()
            .await
            .snapshots
            .get(&entity_id)
            .and_then(|s| s.last())
            .cloned())
    }

    async fn append_snapshot(
        &mut self,
        entity_id: Uuid,
        fields: &TrackedFields,
        content_hash: &ContentHash,
    ) -> StoreResult<Snapshot> {
        self.faults.ensure_open()?;
        let snapshot = Snapshot {
            snapshot_id: Uuid::new_v4(),
            entity_id,
            fields: fields.clone(),
            captured_at: self.clock.now(),
            content_hash: content_hash.clone(),
        };
        self.staged.snapshots.push(snapshot.clone());
        Ok(snapshot)
    }

    async fn insert_changes(
        &mut self,
        entity_id: Uuid,
        snapshot_id: Uuid,
        changes: &[FieldChange],
    ) -> StoreResult<Vec<ChangeRecord>> {
        self.faults.ensure_open()?;
        let detected_at = self.clock.now();
        let records = changes
            .iter()
            .map(|change| ChangeRecord {
                entity_id,
                snapshot_id,
                change_type: change.change_type,
                old_value: change.old_value.clone(),
                new_value: change.new_value.clone(),
                detected_at,
            })
            .collect::<Vec<_>>();
        self.staged.changes.extend(records.iter().cloned());
        Ok(records)
    }

    async fn insert_baseline_score(&mut self, entity_id: Uuid) -> StoreResult<bool> {
        self.faults.ensure_open()?;
        if self.staged.scores.contains_key(&entity_id)
            || self.state.lock().await.scores.contains_key(&entity_id)
        {
            return Ok(false);
        }
        let record = ScoreRecord {
            entity_id,
            momentum_score: ScorePair::BASELINE.momentum,
            stability_score: ScorePair::BASELINE.stability,
            last_computed_at: self.clock.now(),
        };
        self.staged.scores.insert(entity_id, record);
        Ok(true)
    }

    async fn upsert_score(
        &mut self,
        entity_id: Uuid,
        scores: ScorePair,
    ) -> StoreResult<ScoreRecord> {
        self.faults.ensure_open()?;
        let record = ScoreRecord {
            entity_id,
            momentum_score: scores.momentum,
            stability_score: scores.stability,
            last_computed_at: self.clock.now(),
        };
        self.staged.scores.insert(entity_id, record);
        Ok(record)
    }

    async fn insert_insight(
        &mut self,
        entity_id: Uuid,
        snapshot_id: Uuid,
        kind: InsightKind,
        content: &str,
        model_name: &str,
    ) -> StoreResult<()> {
        self.faults.ensure_open()?;
        self.staged.insights.push(InsightRecord {
            entity_id,
            snapshot_id,
            kind,
            content: content.to_string(),
            model_name: model_name.to_string(),
            created_at: self.clock.now(),
        });
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.faults.ensure_open()?;
        let MemoryTx {
            state,
            held,
            staged,
            ..
        } = *self;

        let mut state = state.lock().await;
        for (entity_id, entity) in staged.entities {
            state.keys.insert(entity.external_key.clone(), entity_id);
            state.entities.insert(entity_id, entity);
        }
        for snapshot in staged.snapshots {
            state
                .snapshots
                .entry(snapshot.entity_id)
                .or_default()
                .push(snapshot);
        }
        for change in staged.changes {
            state.changes.entry(change.entity_id).or_default().push(change);
        }
        state.scores.extend(staged.scores);
        for insight in staged.insights {
            state
                .insights
                .entry(insight.entity_id)
                .or_default()
                .push(insight);
        }
        drop(state);
        drop(held);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RetryDisposition;
    use orgwatch_core::{fingerprint, ChangeType};

    fn fields(stage: &str) -> TrackedFields {
        TrackedFields {
            stage: Some(stage.into()),
            tags: vec!["b2b".into()],
            ..Default::default()
        }
    }

    async fn create(tx: &mut Box<dyn LedgerTx>, key: &str) -> Entity {
        match tx.create_entity(key, key, None).await.expect("create") {
            CreateOutcome::Created(entity) => entity,
            CreateOutcome::AlreadyExists => panic!("expected a new entity for {key}"),
        }
    }

    #[tokio::test]
    async fn uncommitted_transaction_is_rolled_back_on_drop() {
        let store = MemoryLedgerStore::new();
        {
            let mut tx = store.begin().await.expect("begin");
            create(&mut tx, "acme").await;
        }
        assert_eq!(store.entity_count().await, 0);

        // the dropped transaction released its row lock
        let mut tx = store.begin().await.expect("begin");
        create(&mut tx, "acme").await;
        tx.commit().await.expect("commit");
        assert_eq!(store.entity_count().await, 1);
    }

    #[tokio::test]
    async fn create_is_idempotent_on_external_key() {
        let store = MemoryLedgerStore::new();
        let mut tx = store.begin().await.expect("begin");
        tx.create_entity("acme", "Acme", Some("acme.dev"))
            .await
            .expect("create");
        tx.commit().await.expect("commit");

        let mut tx = store.begin().await.expect("begin");
        assert_eq!(
            tx.create_entity("acme", "Acme", None).await.expect("create"),
            CreateOutcome::AlreadyExists
        );
        let found = tx.lookup_entity("acme").await.expect("lookup").expect("row");
        assert_eq!(found.domain.as_deref(), Some("acme.dev"));
    }

    #[tokio::test]
    async fn transactions_on_different_keys_interleave() {
        let store = MemoryLedgerStore::new();
        let mut first = store.begin().await.expect("begin");
        let mut second = store.begin().await.expect("begin");

        create(&mut first, "acme").await;
        create(&mut second, "globex").await;
        assert_eq!(store.entity_count().await, 0);

        second.commit().await.expect("commit");
        assert!(store.entity("globex").await.is_some());
        assert!(store.entity("acme").await.is_none());
        first.commit().await.expect("commit");
        assert_eq!(store.entity_count().await, 2);
    }

    #[tokio::test]
    async fn racing_create_waits_for_the_winner_then_conflicts() {
        let store = MemoryLedgerStore::new();
        let mut winner = store.begin().await.expect("begin");
        let mut loser = store.begin().await.expect("begin");

        assert!(winner.lookup_entity("acme").await.expect("lookup").is_none());
        assert!(loser.lookup_entity("acme").await.expect("lookup").is_none());
        let created = create(&mut winner, "acme").await;

        let waiting = tokio::spawn(async move {
            let outcome = loser.create_entity("acme", "Acme", None).await.expect("create");
            let row = loser.lookup_entity("acme").await.expect("lookup");
            (outcome, row)
        });
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        winner.commit().await.expect("commit");
        let (outcome, row) = waiting.await.expect("join");
        assert_eq!(outcome, CreateOutcome::AlreadyExists);
        assert_eq!(row.expect("committed row").entity_id, created.entity_id);
        assert_eq!(store.create_conflicts(), 1);
        assert_eq!(store.entity_count().await, 1);
    }

    #[tokio::test]
    async fn latest_snapshot_follows_append_order_and_clock() {
        let store = MemoryLedgerStore::new();
        let mut tx = store.begin().await.expect("begin");
        let entity = create(&mut tx, "acme").await;
        let first = tx
            .append_snapshot(entity.entity_id, &fields("Seed"), &fingerprint(&fields("Seed")))
            .await
            .expect("append");
        tx.commit().await.expect("commit");

        let mut tx = store.begin().await.expect("begin");
        let latest = tx
            .latest_snapshot(entity.entity_id)
            .await
            .expect("latest")
            .expect("committed");
        assert_eq!(latest.snapshot_id, first.snapshot_id);

        let second = tx
            .append_snapshot(
                entity.entity_id,
                &fields("Series A"),
                &fingerprint(&fields("Series A")),
            )
            .await
            .expect("append");
        assert!(second.captured_at > first.captured_at);
        let latest = tx
            .latest_snapshot(entity.entity_id)
            .await
            .expect("latest")
            .expect("staged");
        assert_eq!(latest.snapshot_id, second.snapshot_id);
    }

    #[tokio::test]
    async fn changes_sharing_a_detection_time_list_latest_insert_first() {
        let store = MemoryLedgerStore::new();
        let mut tx = store.begin().await.expect("begin");
        let entity = create(&mut tx, "acme").await;
        let snapshot = tx
            .append_snapshot(entity.entity_id, &fields("Seed"), &fingerprint(&fields("Seed")))
            .await
            .expect("append");
        let inserted = tx
            .insert_changes(
                entity.entity_id,
                snapshot.snapshot_id,
                &[
                    FieldChange {
                        change_type: ChangeType::StageChange,
                        old_value: Some("Pre-seed".into()),
                        new_value: Some("Seed".into()),
                    },
                    FieldChange {
                        change_type: ChangeType::LocationChange,
                        old_value: None,
                        new_value: Some("Berlin".into()),
                    },
                ],
            )
            .await
            .expect("changes");
        assert_eq!(inserted[0].detected_at, inserted[1].detected_at);
        tx.commit().await.expect("commit");

        for _ in 0..3 {
            let detail = store
                .entity_detail("acme", 10)
                .await
                .expect("detail")
                .expect("entity");
            let kinds: Vec<ChangeType> = detail.changes.iter().map(|c| c.change_type).collect();
            assert_eq!(kinds, vec![ChangeType::LocationChange, ChangeType::StageChange]);
        }
    }

    #[tokio::test]
    async fn deactivate_stale_only_counts_entities_not_seen_since_threshold() {
        let store = MemoryLedgerStore::new();
        store.seed_bare_entity("old", "Old").await;
        store.advance_clock(Duration::hours(1));
        let threshold = store.now().await.expect("now");
        store.seed_bare_entity("fresh", "Fresh").await;

        assert_eq!(store.deactivate_stale(threshold).await.expect("sweep"), 1);
        assert!(!store.entity("old").await.expect("old").is_active);
        assert!(store.entity("fresh").await.expect("fresh").is_active);
        assert_eq!(store.deactivate_stale(threshold).await.expect("sweep"), 0);
    }

    #[tokio::test]
    async fn injected_faults_surface_with_their_disposition() {
        let store = MemoryLedgerStore::new();
        store.fail_next_transactions(1);
        let err = store.begin().await.err().expect("transient");
        assert_eq!(err.disposition(), RetryDisposition::Retryable);
        assert!(!err.is_unavailable());
        assert!(store.begin().await.is_ok());

        store.set_unreachable(true);
        let err = store.begin().await.err().expect("unreachable");
        assert_eq!(err.disposition(), RetryDisposition::Retryable);
        assert!(err.is_unavailable());
        store.set_unreachable(false);
        assert!(store.now().await.is_ok());

        store.close();
        let err = store.now().await.expect_err("closed");
        assert_eq!(err.disposition(), RetryDisposition::Fatal);
    }
}
