//! Ingestion orchestration: the per-record transaction, the bounded batch
//! driver and the run driver with its cleanup sweep.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use orgwatch_adapters::{AbsenceReason, Insight, InsightGenerator, InsightRequest, RecordSource};
use orgwatch_core::{
    compute_scores, days_between, detect_changes, fingerprint, Classification, FieldChange,
    InsightKind, OrgRecord, RecordError, RunStats, ScorePair, SourceRecord,
};
use orgwatch_storage::{
    BackoffPolicy, CreateOutcome, LedgerStore, LedgerTx, RetryDisposition, RunRecord, RunStatus,
    StoreError, StoreResult,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod config;

pub use config::TrackerConfig;

pub const CRATE_NAME: &str = "orgwatch-sync";

/// Stored on creation when no insight could be generated.
pub const SUMMARY_PLACEHOLDER: &str = "AI summary not available.";
pub const PLACEHOLDER_MODEL: &str = "disabled";

#[derive(Debug, Clone, Copy)]
pub struct IngestSettings {
    /// Records of one page ingested at the same time.
    pub concurrency: usize,
    pub insight_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            concurrency: 10,
            insight_timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Invalid(#[from] RecordError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IngestError {
    /// Whether the failure outlives this record: the store itself is gone.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_unavailable())
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    /// The store connection is gone. Carries everything counted so far.
    #[error("store unavailable after {} records: {source}", .stats.total)]
    StoreUnavailable {
        stats: RunStats,
        #[source]
        source: StoreError,
    },
    #[error("run bookkeeping failed after {} records: {source}", .stats.total)]
    Bookkeeping {
        stats: RunStats,
        #[source]
        source: StoreError,
    },
}

impl RunError {
    fn from_store(stats: RunStats, source: StoreError) -> Self {
        if source.is_unavailable() {
            Self::StoreUnavailable { stats, source }
        } else {
            Self::Bookkeeping { stats, source }
        }
    }

    pub fn stats(&self) -> &RunStats {
        match self {
            Self::StoreUnavailable { stats, .. } | Self::Bookkeeping { stats, .. } => stats,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run: RunRecord,
    /// Why paging stopped early, for `partial` runs.
    pub source_error: Option<String>,
}

/// Ask `generator` for an insight, treating a slow answer as absent.
pub async fn narrate(
    generator: &dyn InsightGenerator,
    request: &InsightRequest,
    timeout: Duration,
) -> Insight {
    let insight = match tokio::time::timeout(timeout, generator.generate(request)).await {
        Ok(insight) => insight,
        Err(_) => Insight::Absent(AbsenceReason::TimedOut),
    };
    match &insight {
        Insight::Absent(AbsenceReason::Disabled) | Insight::Generated { .. } => {}
        Insight::Absent(reason) => {
            warn!(external_key = %request.external_key, ?reason, "insight unavailable");
        }
    }
    insight
}

#[derive(Clone)]
pub struct IngestPipeline {
    store: Arc<dyn LedgerStore>,
    insights: Arc<dyn InsightGenerator>,
    settings: IngestSettings,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        insights: Arc<dyn InsightGenerator>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            store,
            insights,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Ingest one record. Anything short of losing the store is reported as
    /// [`Classification::Failed`]; an unreachable store is returned once
    /// retries are exhausted.
    pub async fn ingest(
        &self,
        record: impl Into<SourceRecord>,
    ) -> Result<Classification, StoreError> {
        match self.try_ingest(record).await {
            Ok(classification) => Ok(classification),
            Err(IngestError::Store(err)) if err.is_unavailable() => {
                error!(error = %err, "store unavailable");
                Err(err)
            }
            Err(err) => {
                warn!(error = %err, "record failed");
                Ok(Classification::Failed)
            }
        }
    }

    /// Validate, then run the record's transaction, retrying transient
    /// store failures.
    pub async fn try_ingest(
        &self,
        record: impl Into<SourceRecord>,
    ) -> Result<Classification, IngestError> {
        let record = record.into().validate()?;
        let classification = self
            .with_retries("ingest", |attempt| {
                let span = info_span!(
                    "ingest_record",
                    external_key = %record.external_key,
                    attempt
                );
                self.process_record(&record).instrument(span)
            })
            .await?;
        debug!(
            external_key = %record.external_key,
            classification = classification.as_str(),
            "record ingested"
        );
        Ok(classification)
    }

    /// One transaction: lookup, branch, then every write for the record.
    /// Dropping the transaction on any error rolls all of it back.
    pub async fn process_record(&self, record: &OrgRecord) -> StoreResult<Classification> {
        let hash = fingerprint(&record.fields);
        let mut tx = self.store.begin().await?;

        let entity = match tx.lookup_entity(&record.external_key).await? {
            Some(entity) => entity,
            None => {
                let outcome = tx
                    .create_entity(&record.external_key, &record.name, record.domain.as_deref())
                    .await?;
                match outcome {
                    CreateOutcome::Created(entity) => {
                        let snapshot = tx
                            .append_snapshot(entity.entity_id, &record.fields, &hash)
                            .await?;
                        tx.insert_baseline_score(entity.entity_id).await?;
                        let (content, model) =
                            match self.insight_for(record, &[], ScorePair::BASELINE).await {
                                Insight::Generated { content, model } => (content, model),
                                Insight::Absent(_) => (
                                    SUMMARY_PLACEHOLDER.to_string(),
                                    PLACEHOLDER_MODEL.to_string(),
                                ),
                            };
                        tx.insert_insight(
                            entity.entity_id,
                            snapshot.snapshot_id,
                            InsightKind::Summary,
                            &content,
                            &model,
                        )
                        .await?;
                        tx.commit().await?;
                        return Ok(Classification::New);
                    }
                    // Lost the race for this key; continue against the
                    // winner's committed row.
                    CreateOutcome::AlreadyExists => tx
                        .lookup_entity(&record.external_key)
                        .await?
                        .ok_or_else(|| {
                            StoreError::Transient(format!(
                                "entity {} not visible after conflicting create",
                                record.external_key
                            ))
                        })?,
                }
            }
        };

        if !entity.is_active && tx.reactivate(entity.entity_id).await? {
            info!(external_key = %record.external_key, "entity reactivated");
        }

        let classification = match tx.latest_snapshot(entity.entity_id).await? {
            None => {
                let snapshot = tx
                    .append_snapshot(entity.entity_id, &record.fields, &hash)
                    .await?;
                tx.insert_baseline_score(entity.entity_id).await?;
                let insight = self.insight_for(record, &[], ScorePair::BASELINE).await;
                store_insight(
                    &mut tx,
                    entity.entity_id,
                    snapshot.snapshot_id,
                    InsightKind::Summary,
                    insight,
                )
                .await?;
                Classification::Updated
            }
            Some(latest) if latest.content_hash == hash => Classification::Unchanged,
            Some(latest) => {
                let snapshot = tx
                    .append_snapshot(entity.entity_id, &record.fields, &hash)
                    .await?;
                let changes = detect_changes(&latest.fields, &record.fields);
                tx.insert_changes(entity.entity_id, snapshot.snapshot_id, &changes)
                    .await?;
                let days = days_between(latest.captured_at, snapshot.captured_at);
                let scores = compute_scores(changes.len(), days);
                tx.upsert_score(entity.entity_id, scores).await?;
                let insight = self.insight_for(record, &changes, scores).await;
                store_insight(
                    &mut tx,
                    entity.entity_id,
                    snapshot.snapshot_id,
                    InsightKind::Change,
                    insight,
                )
                .await?;
                Classification::Updated
            }
        };

        tx.touch(entity.entity_id).await?;
        tx.commit().await?;
        Ok(classification)
    }

    async fn insight_for(
        &self,
        record: &OrgRecord,
        changes: &[FieldChange],
        scores: ScorePair,
    ) -> Insight {
        let request = InsightRequest {
            external_key: record.external_key.clone(),
            name: record.name.clone(),
            domain: record.domain.clone(),
            fields: record.fields.clone(),
            changes: changes.to_vec(),
            scores,
            question: None,
        };
        narrate(self.insights.as_ref(), &request, self.settings.insight_timeout).await
    }

    /// Ingest one page with at most `concurrency` records in flight. A
    /// failing record never stops its siblings; losing the store stops the
    /// run once the page has drained.
    pub async fn ingest_page(
        &self,
        records: impl IntoIterator<Item = impl Into<SourceRecord>>,
    ) -> Result<RunStats, RunError> {
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for record in records {
            let record: SourceRecord = record.into();
            let pipeline = self.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let started = Instant::now();
                let result = pipeline.ingest(record).await;
                (result, started.elapsed())
            });
        }

        let mut stats = RunStats {
            pages: 1,
            ..Default::default()
        };
        let mut fatal = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((Ok(classification), elapsed)) => stats.record(classification, elapsed),
                Ok((Err(err), elapsed)) => {
                    stats.record(Classification::Failed, elapsed);
                    fatal.get_or_insert(err);
                }
                Err(join_err) => {
                    error!(error = %join_err, "ingest task panicked");
                    stats.record(Classification::Failed, Duration::ZERO);
                }
            }
        }

        match fatal {
            Some(source) => Err(RunError::StoreUnavailable { stats, source }),
            None => Ok(stats),
        }
    }

    /// Deactivate every entity not touched since `run_start`.
    pub async fn run_cleanup(&self, run_start: DateTime<Utc>) -> StoreResult<u64> {
        let deactivated = self
            .with_retries("cleanup", |_| self.store.deactivate_stale(run_start))
            .await?;
        info!(deactivated, %run_start, "cleanup sweep finished");
        Ok(deactivated)
    }

    /// Drain `source`, ingest every page, sweep and record the run.
    pub async fn run(&self, source: &mut dyn RecordSource) -> Result<RunSummary, RunError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_run", %run_id, source = source.source_id());
        self.run_inner(run_id, source).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        source: &mut dyn RecordSource,
    ) -> Result<RunSummary, RunError> {
        let mut stats = RunStats::default();
        let started_at = self
            .store
            .now()
            .await
            .map_err(|err| RunError::from_store(RunStats::default(), err))?;

        let mut source_error = None;
        let mut page_no = 0usize;
        loop {
            let records = match source.next_page().await {
                Ok(Some(records)) => records,
                Ok(None) => break,
                Err(err) => {
                    warn!(page = page_no, error = %err, "source failed; run is partial");
                    source_error = Some(err.to_string());
                    break;
                }
            };
            let span = info_span!("ingest_page", page = page_no, records = records.len());
            match self.ingest_page(records).instrument(span).await {
                Ok(page) => {
                    info!(
                        page = page_no,
                        new = page.new,
                        updated = page.updated,
                        unchanged = page.unchanged,
                        failed = page.failed,
                        "page ingested"
                    );
                    stats.merge(&page);
                }
                Err(err) => {
                    stats.merge(err.stats());
                    error!(error = %err, total = stats.total, "aborting run");
                    return Err(match err {
                        RunError::StoreUnavailable { source, .. } => {
                            RunError::StoreUnavailable { stats, source }
                        }
                        RunError::Bookkeeping { source, .. } => {
                            RunError::Bookkeeping { stats, source }
                        }
                    });
                }
            }
            page_no += 1;
        }

        let status = if source_error.is_some() {
            RunStatus::Partial
        } else {
            RunStatus::Completed
        };
        let deactivated = match status {
            RunStatus::Completed => self
                .run_cleanup(started_at)
                .await
                .map_err(|err| RunError::from_store(stats.clone(), err))?,
            RunStatus::Partial => {
                warn!("skipping cleanup after incomplete observation");
                0
            }
        };

        let finished_at = self
            .store
            .now()
            .await
            .map_err(|err| RunError::from_store(stats.clone(), err))?;
        let run = RunRecord {
            run_id,
            started_at,
            finished_at,
            status,
            stats,
            deactivated,
        };
        self.with_retries("record_run", |_| self.store.record_run(&run))
            .await
            .map_err(|err| RunError::from_store(run.stats.clone(), err))?;

        info!(
            status = status.as_str(),
            total = run.stats.total,
            new = run.stats.new,
            updated = run.stats.updated,
            unchanged = run.stats.unchanged,
            failed = run.stats.failed,
            deactivated,
            avg_ms = run.stats.avg_ms(),
            slowest_ms = run.stats.slowest_ms,
            "run finished"
        );
        Ok(RunSummary { run, source_error })
    }

    async fn with_retries<T, F, Fut>(&self, operation: &'static str, mut op: F) -> StoreResult<T>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let policy = self.settings.backoff;
        let mut attempt = 0usize;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err)
                    if err.disposition() == RetryDisposition::Retryable
                        && attempt < policy.max_retries =>
                {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(operation, attempt, ?delay, error = %err, "retrying store operation");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Persist a generated insight; absence leaves nothing behind.
async fn store_insight(
    tx: &mut Box<dyn LedgerTx>,
    entity_id: Uuid,
    snapshot_id: Uuid,
    kind: InsightKind,
    insight: Insight,
) -> StoreResult<()> {
    if let Insight::Generated { content, model } = insight {
        tx.insert_insight(entity_id, snapshot_id, kind, &content, &model)
            .await?;
    }
    Ok(())
}
