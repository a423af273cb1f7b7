//! Index reconciliation for one feed source.
//!
//! A run moves through `FetchingState -> Diffing -> Applying -> Done`, or
//! ends in `Failed`. The index is only written during `Applying`, in chunk
//! round-trips that each send an upsert batch and then a delete batch. A
//! failed round-trip leaves earlier ones in place; re-running converges.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobfeed_adapters::{FeedDocument, FeedMetadata, ValidationError};
use jobfeed_core::{CompanyRef, FeedSource, FeedSourceUpdate, NormalizedJobDocument};
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::engine::{DeleteQuery, EngineError, SearchEngine, SearchQuery};
use crate::sources::FeedSourceStore;
use crate::tasks::{Scheduler, Task};
use crate::transform::JobTransformer;
use crate::SyncError;

pub const DEFAULT_CLAUSE_LIMIT: usize = 4096;
pub const DEFAULT_FETCH_WINDOW: usize = 1024;

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Upper bound on documents per add or delete call. A full delete chunk
    /// renders `clause_limit + 2` boolean clauses (see
    /// [`DeleteQuery::clause_count`]), so the engine's max clause count must
    /// be at least that. Lower this when it is not.
    pub clause_limit: usize,
    pub fetch_window: usize,
    pub commit_within_ms: Option<u64>,
    pub cache_invalidation_delay: Option<Duration>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            clause_limit: DEFAULT_CLAUSE_LIMIT,
            fetch_window: DEFAULT_FETCH_WINDOW,
            commit_within_ms: Some(30_000),
            cache_invalidation_delay: Some(Duration::from_secs(25 * 60)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileMode {
    /// Re-send every feed document.
    Force,
    /// Only send documents the index does not have yet.
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReconcileState {
    FetchingState,
    Diffing,
    Applying,
    Done,
    Failed,
}

impl fmt::Display for ReconcileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FetchingState => "fetching_state",
            Self::Diffing => "diffing",
            Self::Applying => "applying",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What the index currently holds for a source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexSnapshot {
    pub uids: BTreeSet<String>,
    pub posted: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationPlan {
    pub to_upsert: BTreeSet<String>,
    pub to_delete: BTreeSet<String>,
}

impl ReconciliationPlan {
    pub fn compute(
        feed_uids: &BTreeSet<String>,
        snapshot: &IndexSnapshot,
        mode: ReconcileMode,
    ) -> Self {
        let to_delete = snapshot
            .uids
            .iter()
            .filter(|uid| !feed_uids.contains(*uid) && !snapshot.posted.contains(*uid))
            .cloned()
            .collect();
        let to_upsert = match mode {
            ReconcileMode::Force => feed_uids.clone(),
            ReconcileMode::Incremental => feed_uids.difference(&snapshot.uids).cloned().collect(),
        };
        Self { to_upsert, to_delete }
    }
}

/// Splits both lists into `limit`-sized chunks and pairs them by position,
/// padding the shorter side with empty chunks.
pub fn chunk_pairs<'a, A, B>(
    upserts: &'a [A],
    deletes: &'a [B],
    limit: usize,
) -> Vec<(&'a [A], &'a [B])> {
    let limit = limit.max(1);
    let rounds = upserts.len().div_ceil(limit).max(deletes.len().div_ceil(limit));
    let mut ups = upserts.chunks(limit);
    let mut dels = deletes.chunks(limit);
    (0..rounds)
        .map(|_| (ups.next().unwrap_or(&[]), dels.next().unwrap_or(&[])))
        .collect()
}

/// A validated feed, transformed and keyed by uid. Repeated uids keep the
/// last occurrence.
#[derive(Debug, Clone)]
pub struct TransformedFeed {
    pub metadata: FeedMetadata,
    pub documents: BTreeMap<String, NormalizedJobDocument>,
    pub skipped: usize,
}

impl TransformedFeed {
    pub fn from_document(
        document: FeedDocument,
        transformer: &JobTransformer,
        source: &FeedSource,
        company: Option<&CompanyRef>,
    ) -> Result<Self, ValidationError> {
        if let Some(err) = document.error_detail() {
            return Err(err.clone());
        }
        let metadata = document.metadata().cloned().ok_or_else(|| ValidationError {
            line: 0,
            message: "feed document carries no metadata".to_string(),
        })?;

        let mut jobs = document.jobs();
        let mut documents = BTreeMap::new();
        for raw in jobs.by_ref() {
            let doc = transformer.transform(&raw, source, company);
            documents.insert(doc.uid.clone(), doc);
        }

        Ok(Self {
            metadata,
            documents,
            skipped: jobs.skipped(),
        })
    }

    pub fn uids(&self) -> BTreeSet<String> {
        self.documents.keys().cloned().collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub mode: ReconcileMode,
    pub feed_jobs: usize,
    pub skipped_jobs: usize,
    pub indexed_before: usize,
    pub posted: usize,
    pub upserted: usize,
    pub deleted: usize,
    pub round_trips: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub enum ReconcileOutcome {
    Applied(ReconcileSummary),
    /// The feed failed validation; the index was not touched.
    Rejected { source_id: String, error: ValidationError },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyCounts {
    pub upserted: usize,
    pub deleted: usize,
    pub round_trips: usize,
}

struct RunTracker {
    run_id: Uuid,
    state: ReconcileState,
}

impl RunTracker {
    fn start(run_id: Uuid) -> Self {
        tracing::info!(state = %ReconcileState::FetchingState, "reconcile started");
        Self {
            run_id,
            state: ReconcileState::FetchingState,
        }
    }

    fn advance(&mut self, next: ReconcileState) {
        tracing::info!(
            run_id = %self.run_id,
            from = %self.state,
            to = %next,
            "reconcile state changed"
        );
        self.state = next;
    }
}

pub struct IndexReconciler {
    engine: Arc<dyn SearchEngine>,
    sources: Arc<dyn FeedSourceStore>,
    scheduler: Arc<dyn Scheduler>,
    config: ReconcileConfig,
}

impl IndexReconciler {
    pub fn new(
        engine: Arc<dyn SearchEngine>,
        sources: Arc<dyn FeedSourceStore>,
        scheduler: Arc<dyn Scheduler>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            engine,
            sources,
            scheduler,
            config,
        }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub async fn reconcile(
        &self,
        run_id: Uuid,
        source: &FeedSource,
        feed: Result<TransformedFeed, ValidationError>,
        mode: ReconcileMode,
    ) -> Result<ReconcileOutcome, SyncError> {
        let span = info_span!("reconcile", %run_id, source_id = %source.source_id, ?mode);
        self.run(run_id, source, feed, mode).instrument(span).await
    }

    async fn run(
        &self,
        run_id: Uuid,
        source: &FeedSource,
        feed: Result<TransformedFeed, ValidationError>,
        mode: ReconcileMode,
    ) -> Result<ReconcileOutcome, SyncError> {
        let started_at = Utc::now();
        let mut tracker = RunTracker::start(run_id);

        let feed = match feed {
            Ok(feed) => feed,
            Err(error) => {
                tracker.advance(ReconcileState::Failed);
                tracing::warn!(line = error.line, message = %error.message, "feed rejected");
                return Ok(ReconcileOutcome::Rejected {
                    source_id: source.source_id.clone(),
                    error,
                });
            }
        };

        let snapshot = self
            .fetch_indexed(&source.source_id)
            .await
            .inspect_err(|_| tracker.advance(ReconcileState::Failed))?;

        tracker.advance(ReconcileState::Diffing);
        let plan = ReconciliationPlan::compute(&feed.uids(), &snapshot, mode);
        tracing::info!(
            indexed = snapshot.uids.len(),
            posted = snapshot.posted.len(),
            to_upsert = plan.to_upsert.len(),
            to_delete = plan.to_delete.len(),
            "reconciliation planned"
        );

        tracker.advance(ReconcileState::Applying);
        let counts = self
            .apply(&source.source_id, &plan, &feed.documents)
            .await
            .inspect_err(|_| tracker.advance(ReconcileState::Failed))?;

        let update = FeedSourceUpdate {
            title: Some(feed.metadata.source_name.clone())
                .filter(|name| !name.is_empty() && source.title.as_deref() != Some(name.as_str())),
            associated_jobs: Some(feed.documents.len()),
            date_crawled: Some(feed.metadata.crawled_at),
            date_updated: Some(Utc::now()),
        };
        self.sources
            .update(&source.source_id, &update)
            .await
            .map_err(SyncError::Other)
            .inspect_err(|_| tracker.advance(ReconcileState::Failed))?;

        self.scheduler.schedule(
            Task::ClearCache {
                source_id: source.source_id.clone(),
            },
            self.config.cache_invalidation_delay,
        );
        tracker.advance(ReconcileState::Done);

        Ok(ReconcileOutcome::Applied(ReconcileSummary {
            run_id,
            source_id: source.source_id.clone(),
            mode,
            feed_jobs: feed.documents.len(),
            skipped_jobs: feed.skipped,
            indexed_before: snapshot.uids.len(),
            posted: snapshot.posted.len(),
            upserted: counts.upserted,
            deleted: counts.deleted,
            round_trips: counts.round_trips,
            started_at,
            finished_at: Utc::now(),
        }))
    }

    /// Pages through every uid the index holds for `source_id`.
    pub async fn fetch_indexed(&self, source_id: &str) -> Result<IndexSnapshot, EngineError> {
        let window = self.config.fetch_window.max(1);
        let mut snapshot = IndexSnapshot::default();
        let mut start = 0usize;
        loop {
            let page = self
                .engine
                .search(&SearchQuery::uids_for_source(source_id, start, window))
                .await?;
            let received = page.docs.len();
            for doc in page.docs {
                if doc.is_posted {
                    snapshot.posted.insert(doc.uid.clone());
                }
                snapshot.uids.insert(doc.uid);
            }
            start += received;
            if received == 0 || start >= page.hits {
                break;
            }
        }
        Ok(snapshot)
    }

    pub async fn apply(
        &self,
        source_id: &str,
        plan: &ReconciliationPlan,
        documents: &BTreeMap<String, NormalizedJobDocument>,
    ) -> Result<ApplyCounts, EngineError> {
        let upserts = plan
            .to_upsert
            .iter()
            .filter_map(|uid| documents.get(uid).cloned())
            .collect::<Vec<_>>();
        let deletes = plan.to_delete.iter().cloned().collect::<Vec<_>>();

        let mut counts = ApplyCounts::default();
        for (round, (ups, dels)) in chunk_pairs(&upserts, &deletes, self.config.clause_limit)
            .into_iter()
            .enumerate()
        {
            if !ups.is_empty() {
                self.engine.add(ups, self.config.commit_within_ms).await?;
                counts.upserted += ups.len();
            }
            if !dels.is_empty() {
                let query = DeleteQuery::uids(source_id, dels.iter().cloned()).excluding_posted();
                tracing::debug!(round, clauses = query.clause_count(), "deleting stale documents");
                self.engine.delete(&query).await?;
                counts.deleted += dels.len();
            }
            counts.round_trips += 1;
            tracing::info!(round, upserts = ups.len(), deletes = dels.len(), "chunk applied");
        }
        Ok(counts)
    }

    /// Deletes every document of the source except posted ones.
    pub async fn clear_source(&self, run_id: Uuid, source_id: &str) -> Result<(), EngineError> {
        self.engine
            .delete(&DeleteQuery::all_for_source(source_id).excluding_posted())
            .instrument(info_span!("clear_source", %run_id, source_id))
            .await?;
        tracing::info!(%run_id, source_id, "source cleared from index");
        Ok(())
    }
}
