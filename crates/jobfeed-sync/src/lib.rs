//! Feed sync orchestration: acquire a source's feed, validate and transform
//! it, reconcile the search index, and run the follow-up tasks.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use jobfeed_adapters::{FeedDocument, FeedOptions};
use jobfeed_core::{FeedSource, FeedSourceUpdate};
use jobfeed_storage::{
    AcquisitionError, AcquisitionSource, BackoffPolicy, FeedAcquirer, HttpClientConfig, HttpFetcher,
    WorkspaceAllocator,
};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::JobScheduler;
use uuid::Uuid;

pub mod engine;
pub mod occupations;
pub mod reconcile;
pub mod sources;
pub mod tasks;
pub mod transform;

use engine::{EngineError, SearchEngine, SolrClient};
use occupations::{InMemoryOccupationStore, OccupationResolver, OccupationStore};
use reconcile::{IndexReconciler, ReconcileConfig, ReconcileMode, ReconcileOutcome, TransformedFeed};
use sources::{FeedSourceStore, YamlFeedSourceStore};
use tasks::{
    CacheInvalidator, LoggingCacheInvalidator, RetryingTaskRunner, Scheduler, SourceLeases, Task,
    TaskHandler, TaskOutcome, TaskQueue, TokioScheduler,
};
use transform::JobTransformer;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub solr_url: String,
    pub sources_file: PathBuf,
    pub occupations_file: PathBuf,
    pub scratch_dir: PathBuf,
    /// Scratch namespace; defaults to the process id.
    pub worker_id: Option<String>,
    pub reconcile: ReconcileConfig,
    pub max_retries: usize,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    /// Where run reports go; `None` disables them.
    pub reports_dir: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            solr_url: "http://localhost:8983/solr/jobs".to_string(),
            sources_file: PathBuf::from("./sources.yaml"),
            occupations_file: PathBuf::from("./occupations.yaml"),
            scratch_dir: std::env::temp_dir().join("jobfeed"),
            worker_id: None,
            reconcile: ReconcileConfig::default(),
            max_retries: BackoffPolicy::default().max_retries,
            user_agent: "jobfeed-bot/0.1".to_string(),
            http_timeout_secs: 120,
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".to_string(),
            reports_dir: Some(PathBuf::from("./reports")),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let reconcile = ReconcileConfig {
            clause_limit: env_parse("JOBFEED_CLAUSE_LIMIT")
                .unwrap_or(defaults.reconcile.clause_limit),
            fetch_window: env_parse("JOBFEED_FETCH_WINDOW")
                .unwrap_or(defaults.reconcile.fetch_window),
            commit_within_ms: env_parse("JOBFEED_COMMIT_WITHIN_MS")
                .map(|ms: u64| Some(ms).filter(|ms| *ms > 0))
                .unwrap_or(defaults.reconcile.commit_within_ms),
            cache_invalidation_delay: env_parse("JOBFEED_CACHE_INVALIDATION_DELAY_SECS")
                .map(|secs: u64| Some(Duration::from_secs(secs)))
                .unwrap_or(defaults.reconcile.cache_invalidation_delay),
        };

        Self {
            solr_url: std::env::var("SOLR_URL").unwrap_or(defaults.solr_url),
            sources_file: env_path("JOBFEED_SOURCES_FILE").unwrap_or(defaults.sources_file),
            occupations_file: env_path("JOBFEED_OCCUPATIONS_FILE")
                .unwrap_or(defaults.occupations_file),
            scratch_dir: env_path("JOBFEED_SCRATCH_DIR").unwrap_or(defaults.scratch_dir),
            worker_id: std::env::var("JOBFEED_WORKER_ID").ok().filter(|v| !v.is_empty()),
            reconcile,
            max_retries: env_parse("JOBFEED_MAX_RETRIES").unwrap_or(defaults.max_retries),
            user_agent: std::env::var("JOBFEED_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("JOBFEED_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            scheduler_enabled: std::env::var("JOBFEED_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            sync_cron: std::env::var("JOBFEED_SYNC_CRON").unwrap_or(defaults.sync_cron),
            reports_dir: match std::env::var("JOBFEED_REPORTS_DIR") {
                Ok(v) if v.is_empty() => None,
                Ok(v) => Some(PathBuf::from(v)),
                Err(_) => defaults.reports_dir,
            },
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            ..BackoffPolicy::default()
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    pub fn workspace(&self) -> WorkspaceAllocator {
        match &self.worker_id {
            Some(worker_id) => WorkspaceAllocator::new(self.scratch_dir.clone(), worker_id.clone()),
            None => WorkspaceAllocator::for_current_process(self.scratch_dir.clone()),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("unknown feed source {0}")]
    UnknownSource(String),
    #[error("source {0} is already being synced")]
    SourceBusy(String),
    #[error("source {0} has no feed_url and no feed location was given")]
    MissingFeedUrl(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    /// Whether re-running the same task can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Acquisition(_) | Self::Engine(_) | Self::SourceBusy(_))
    }
}

/// Collaborators a pipeline is assembled from.
pub struct PipelineParts {
    pub engine: Arc<dyn SearchEngine>,
    pub sources: Arc<dyn FeedSourceStore>,
    pub occupations: Arc<dyn OccupationStore>,
    pub scheduler: Arc<dyn Scheduler>,
    pub cache: Arc<dyn CacheInvalidator>,
    pub acquirer: FeedAcquirer,
}

#[derive(Debug, Serialize)]
struct RunReport<'a> {
    run_id: Uuid,
    source_id: &'a str,
    payload_sha256: Option<&'a str>,
    payload_bytes: Option<usize>,
    outcome: &'a ReconcileOutcome,
}

pub struct FeedSyncPipeline {
    sources: Arc<dyn FeedSourceStore>,
    occupations: OccupationResolver,
    cache: Arc<dyn CacheInvalidator>,
    scheduler: Arc<dyn Scheduler>,
    acquirer: FeedAcquirer,
    reconciler: IndexReconciler,
    leases: SourceLeases,
    reports_dir: Option<PathBuf>,
    cache_invalidation_delay: Option<Duration>,
}

impl FeedSyncPipeline {
    pub fn new(config: &SyncConfig, parts: PipelineParts) -> Self {
        let reconciler = IndexReconciler::new(
            parts.engine,
            Arc::clone(&parts.sources),
            Arc::clone(&parts.scheduler),
            config.reconcile.clone(),
        );
        Self {
            sources: parts.sources,
            occupations: OccupationResolver::new(parts.occupations),
            cache: parts.cache,
            scheduler: parts.scheduler,
            acquirer: parts.acquirer,
            reconciler,
            leases: SourceLeases::new(),
            reports_dir: config.reports_dir.clone(),
            cache_invalidation_delay: config.reconcile.cache_invalidation_delay,
        }
    }

    pub fn leases(&self) -> &SourceLeases {
        &self.leases
    }

    /// Acquires the feed from `acquisition` (or the source's `feed_url`) and
    /// reconciles it. Holds the source's lease for the whole run.
    pub async fn sync_source(
        &self,
        run_id: Uuid,
        source_id: &str,
        acquisition: Option<&AcquisitionSource>,
        mode: ReconcileMode,
    ) -> Result<ReconcileOutcome, SyncError> {
        let _lease = self
            .leases
            .try_acquire(source_id)
            .ok_or_else(|| SyncError::SourceBusy(source_id.to_string()))?;
        let source = self.load_source(source_id).await?;

        let location = match (acquisition, &source.feed_url) {
            (Some(location), _) => location.clone(),
            (None, Some(url)) => AcquisitionSource::Url(url.clone()),
            (None, None) => return Err(SyncError::MissingFeedUrl(source_id.to_string())),
        };

        let acquired = self.acquirer.acquire(run_id, source_id, &location).await?;
        let outcome = self.reconcile_file(run_id, &source, &acquired.feed_path, mode).await;

        let (sha256, byte_size) = (acquired.sha256, acquired.byte_size);
        if let Err(err) = acquired.scratch.release() {
            tracing::warn!(%run_id, source_id, error = %err, "scratch cleanup failed");
        }

        let outcome = outcome?;
        self.write_report(run_id, source_id, Some((sha256.as_str(), byte_size)), &outcome)
            .await;
        Ok(outcome)
    }

    async fn reconcile_file(
        &self,
        run_id: Uuid,
        source: &FeedSource,
        feed_path: &Path,
        mode: ReconcileMode,
    ) -> Result<ReconcileOutcome, SyncError> {
        let path = feed_path.to_path_buf();
        let options = FeedOptions::from(source);
        let document = tokio::task::spawn_blocking(move || FeedDocument::open(path, options))
            .await
            .context("feed parser stopped")?;

        let transformer = JobTransformer::new(self.occupations.for_source(&source.source_id));
        let feed =
            TransformedFeed::from_document(document, &transformer, source, source.company.as_ref());
        self.reconciler.reconcile(run_id, source, feed, mode).await
    }

    /// Removes the source's non-posted documents from the index.
    pub async fn clear_source(&self, run_id: Uuid, source_id: &str) -> Result<(), SyncError> {
        let _lease = self
            .leases
            .try_acquire(source_id)
            .ok_or_else(|| SyncError::SourceBusy(source_id.to_string()))?;
        self.load_source(source_id).await?;

        self.reconciler.clear_source(run_id, source_id).await?;
        self.sources
            .update(
                source_id,
                &FeedSourceUpdate {
                    associated_jobs: Some(0),
                    date_updated: Some(chrono::Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        self.scheduler.schedule(
            Task::ClearCache {
                source_id: source_id.to_string(),
            },
            self.cache_invalidation_delay,
        );
        Ok(())
    }

    pub async fn clear_cache(&self, source_id: &str) -> Result<(), SyncError> {
        self.cache
            .invalidate(source_id)
            .await
            .with_context(|| format!("invalidating cache for {source_id}"))?;
        Ok(())
    }

    async fn load_source(&self, source_id: &str) -> Result<FeedSource, SyncError> {
        self.sources
            .get(source_id)
            .await?
            .ok_or_else(|| SyncError::UnknownSource(source_id.to_string()))
    }

    async fn write_report(
        &self,
        run_id: Uuid,
        source_id: &str,
        payload: Option<(&str, usize)>,
        outcome: &ReconcileOutcome,
    ) {
        let Some(root) = &self.reports_dir else {
            return;
        };
        let report = RunReport {
            run_id,
            source_id,
            payload_sha256: payload.map(|(sha, _)| sha),
            payload_bytes: payload.map(|(_, bytes)| bytes),
            outcome,
        };
        let dir = root.join(run_id.to_string());
        if let Err(err) = write_json(&dir.join("reconcile_report.json"), &report).await {
            tracing::warn!(%run_id, source_id, error = %err, "writing run report failed");
        }
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
    }
    let json = serde_json::to_vec_pretty(value).context("serializing run report")?;
    fs::write(path, json)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

#[async_trait]
impl TaskHandler for FeedSyncPipeline {
    async fn handle(&self, task: &Task) -> Result<TaskOutcome, SyncError> {
        let run_id = Uuid::new_v4();
        match task {
            Task::Reconcile {
                source_id,
                acquisition,
                mode,
            } => self
                .sync_source(run_id, source_id, acquisition.as_ref(), *mode)
                .await
                .map(TaskOutcome::Reconciled),
            Task::ClearSource { source_id } => {
                self.clear_source(run_id, source_id).await?;
                Ok(TaskOutcome::SourceCleared {
                    source_id: source_id.clone(),
                })
            }
            Task::ClearCache { source_id } => {
                self.clear_cache(source_id).await?;
                Ok(TaskOutcome::CacheCleared {
                    source_id: source_id.clone(),
                })
            }
        }
    }
}

/// A pipeline wired to Solr and the YAML stores, plus the queue that runs
/// its scheduled follow-ups.
pub struct SyncRuntime {
    pub config: SyncConfig,
    pub pipeline: Arc<FeedSyncPipeline>,
    pub runner: Arc<RetryingTaskRunner>,
    pub sources: Arc<dyn FeedSourceStore>,
    pub scheduler: Arc<TokioScheduler>,
    pub queue: TaskQueue,
}

impl SyncRuntime {
    pub async fn from_config(config: SyncConfig) -> anyhow::Result<Self> {
        let engine: Arc<dyn SearchEngine> = Arc::new(
            SolrClient::new(
                config.solr_url.clone(),
                Duration::from_secs(config.http_timeout_secs),
            )?
            .with_delete_commit_within(config.reconcile.commit_within_ms),
        );
        let sources: Arc<dyn FeedSourceStore> =
            Arc::new(YamlFeedSourceStore::open(config.sources_file.clone()).await?);
        let occupations: Arc<dyn OccupationStore> =
            Arc::new(InMemoryOccupationStore::from_yaml_file(&config.occupations_file)?);
        let http = Arc::new(HttpFetcher::new(config.http_config())?);
        let (scheduler, queue) = TokioScheduler::new();
        let scheduler = Arc::new(scheduler);

        let pipeline = Arc::new(FeedSyncPipeline::new(
            &config,
            PipelineParts {
                engine,
                sources: Arc::clone(&sources),
                occupations,
                scheduler: scheduler.clone(),
                cache: Arc::new(LoggingCacheInvalidator::new()),
                acquirer: FeedAcquirer::new(http, config.workspace()),
            },
        ));
        let runner = Arc::new(RetryingTaskRunner::new(pipeline.clone(), config.backoff()));

        Ok(Self {
            config,
            pipeline,
            runner,
            sources,
            scheduler,
            queue,
        })
    }

    pub async fn from_env() -> anyhow::Result<Self> {
        Self::from_config(SyncConfig::from_env()).await
    }

    /// Cron refresh of every source, or `None` when scheduling is disabled.
    pub async fn maybe_build_scheduler(&self) -> anyhow::Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }
        let sched = tasks::build_refresh_scheduler(
            &self.config.sync_cron,
            Arc::clone(&self.sources),
            self.scheduler.clone(),
        )
        .await?;
        Ok(Some(sched))
    }
}
