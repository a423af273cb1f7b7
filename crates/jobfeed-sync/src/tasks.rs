//! Background task plumbing: the task vocabulary, the retry wrapper, delayed
//! scheduling, per-source leases and the cron refresh.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use jobfeed_storage::{AcquisitionSource, BackoffPolicy};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::reconcile::{ReconcileMode, ReconcileOutcome};
use crate::sources::FeedSourceStore;
use crate::SyncError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// Acquire (when given a location, else the source's `feed_url`),
    /// validate, transform and reconcile one source.
    Reconcile {
        source_id: String,
        acquisition: Option<AcquisitionSource>,
        mode: ReconcileMode,
    },
    /// Remove every non-posted document of a source from the index.
    ClearSource { source_id: String },
    ClearCache { source_id: String },
}

impl Task {
    pub fn source_id(&self) -> &str {
        match self {
            Self::Reconcile { source_id, .. }
            | Self::ClearSource { source_id }
            | Self::ClearCache { source_id } => source_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Reconcile { .. } => "reconcile",
            Self::ClearSource { .. } => "clear_source",
            Self::ClearCache { .. } => "clear_cache",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub enum TaskOutcome {
    Reconciled(ReconcileOutcome),
    SourceCleared { source_id: String },
    CacheCleared { source_id: String },
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<TaskOutcome, SyncError>;
}

/// Re-runs a task while it fails with a retryable error, backing off
/// exponentially. Anything else, and the last failure, goes back to the
/// caller.
pub struct RetryingTaskRunner {
    handler: Arc<dyn TaskHandler>,
    backoff: BackoffPolicy,
}

impl RetryingTaskRunner {
    pub fn new(handler: Arc<dyn TaskHandler>, backoff: BackoffPolicy) -> Self {
        Self { handler, backoff }
    }

    pub async fn run(&self, task: &Task) -> Result<TaskOutcome, SyncError> {
        let mut attempt = 0usize;
        loop {
            match self.handler.handle(task).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_retryable() && attempt < self.backoff.max_retries => {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    tracing::warn!(
                        task = task.kind(),
                        source_id = task.source_id(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "task failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Fire-and-forget task submission.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, task: Task, delay: Option<Duration>);
}

/// Scheduler backed by the tokio runtime. Delayed tasks sleep on their own
/// spawned task, then land on the queue drained by [`TaskQueue::run`].
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    tx: mpsc::UnboundedSender<Task>,
}

pub struct TaskQueue {
    rx: mpsc::UnboundedReceiver<Task>,
}

impl TokioScheduler {
    pub fn new() -> (Self, TaskQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, TaskQueue { rx })
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, task: Task, delay: Option<Duration>) {
        let tx = self.tx.clone();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::error!(
                task = task.kind(),
                source_id = task.source_id(),
                "no runtime to schedule task on"
            );
            return;
        };
        handle.spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Err(mpsc::error::SendError(task)) = tx.send(task) {
                tracing::warn!(
                    task = task.kind(),
                    source_id = task.source_id(),
                    "task queue closed; dropping task"
                );
            }
        });
    }
}

/// What a drained queue did with its tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub completed: usize,
    /// Tasks that still failed after the retry wrapper gave up.
    pub dead_letters: usize,
}

impl DrainSummary {
    fn record(&mut self, joined: Result<(Task, Result<TaskOutcome, SyncError>), JoinError>) {
        match joined {
            Ok((task, Ok(_))) => {
                self.completed += 1;
                tracing::debug!(task = task.kind(), source_id = task.source_id(), "task finished");
            }
            Ok((task, Err(err))) => {
                self.dead_letters += 1;
                tracing::error!(
                    task = task.kind(),
                    source_id = task.source_id(),
                    error = %err,
                    "task failed permanently"
                );
            }
            Err(err) => {
                self.dead_letters += 1;
                tracing::error!(error = %err, "task panicked or was cancelled");
            }
        }
    }
}

impl TaskQueue {
    /// Drains the queue until every scheduler handle is gone, then waits for
    /// the tasks still running. Each task runs on its own tokio task.
    pub async fn run(mut self, runner: Arc<RetryingTaskRunner>) -> DrainSummary {
        let mut running = JoinSet::new();
        let mut summary = DrainSummary::default();
        loop {
            tokio::select! {
                received = self.rx.recv() => {
                    let Some(task) = received else { break };
                    let runner = Arc::clone(&runner);
                    running.spawn(async move {
                        let result = runner.run(&task).await;
                        (task, result)
                    });
                }
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    summary.record(joined);
                }
            }
        }
        while let Some(joined) = running.join_next().await {
            summary.record(joined);
        }
        summary
    }
}

/// Keeps scheduled tasks in memory instead of running them.
#[derive(Debug, Default)]
pub struct RecordingScheduler {
    scheduled: Mutex<Vec<(Task, Option<Duration>)>>,
}

impl RecordingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scheduled(&self) -> Vec<(Task, Option<Duration>)> {
        lock(&self.scheduled).clone()
    }
}

impl Scheduler for RecordingScheduler {
    fn schedule(&self, task: Task, delay: Option<Duration>) {
        lock(&self.scheduled).push((task, delay));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One run per source at a time, within this process.
#[derive(Debug, Clone, Default)]
pub struct SourceLeases {
    held: Arc<Mutex<HashSet<String>>>,
}

impl SourceLeases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, source_id: &str) -> Option<SourceLease> {
        if !lock(&self.held).insert(source_id.to_string()) {
            return None;
        }
        Some(SourceLease {
            source_id: source_id.to_string(),
            held: Arc::clone(&self.held),
        })
    }

    pub fn is_held(&self, source_id: &str) -> bool {
        lock(&self.held).contains(source_id)
    }
}

#[derive(Debug)]
pub struct SourceLease {
    source_id: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl SourceLease {
    pub fn source_id(&self) -> &str {
        &self.source_id
    }
}

impl Drop for SourceLease {
    fn drop(&mut self) {
        lock(&self.held).remove(&self.source_id);
    }
}

#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    async fn invalidate(&self, source_id: &str) -> anyhow::Result<()>;
}

/// Emits the invalidation as a log event and remembers it.
#[derive(Debug, Default)]
pub struct LoggingCacheInvalidator {
    invalidated: Mutex<Vec<String>>,
}

impl LoggingCacheInvalidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidated(&self) -> Vec<String> {
        lock(&self.invalidated).clone()
    }
}

#[async_trait]
impl CacheInvalidator for LoggingCacheInvalidator {
    async fn invalidate(&self, source_id: &str) -> anyhow::Result<()> {
        tracing::info!(source_id, "search cache invalidated");
        lock(&self.invalidated).push(source_id.to_string());
        Ok(())
    }
}

/// Queues a forced reconcile for every source with a `feed_url`; returns how
/// many were queued.
pub async fn queue_refresh(
    sources: &dyn FeedSourceStore,
    scheduler: &dyn Scheduler,
) -> anyhow::Result<usize> {
    let listed = sources.list().await.context("listing feed sources for refresh")?;
    let mut queued = 0usize;
    for source in listed.into_iter().filter(|s| s.feed_url.is_some()) {
        scheduler.schedule(
            Task::Reconcile {
                source_id: source.source_id,
                acquisition: None,
                mode: ReconcileMode::Force,
            },
            None,
        );
        queued += 1;
    }
    Ok(queued)
}

/// Cron job running [`queue_refresh`]. The caller starts the returned
/// scheduler.
pub async fn build_refresh_scheduler(
    cron: &str,
    sources: Arc<dyn FeedSourceStore>,
    scheduler: Arc<dyn Scheduler>,
) -> anyhow::Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let sources = Arc::clone(&sources);
        let scheduler = Arc::clone(&scheduler);
        Box::pin(async move {
            match queue_refresh(sources.as_ref(), scheduler.as_ref()).await {
                Ok(queued) => tracing::info!(queued, "scheduled feed refresh"),
                Err(err) => tracing::warn!(error = %err, "feed refresh failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::InMemoryFeedSourceStore;
    use jobfeed_core::FeedSource;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        calls: AtomicUsize,
        failures: usize,
        error: fn() -> SyncError,
    }

    #[async_trait]
    impl TaskHandler for Flaky {
        async fn handle(&self, task: &Task) -> Result<TaskOutcome, SyncError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err((self.error)());
            }
            Ok(TaskOutcome::CacheCleared {
                source_id: task.source_id().to_string(),
            })
        }
    }

    fn quick_backoff(max_retries: usize) -> BackoffPolicy {
        BackoffPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    fn clear_cache() -> Task {
        Task::ClearCache {
            source_id: "42".into(),
        }
    }

    #[tokio::test]
    async fn retryable_failures_are_retried_until_success() {
        let handler = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            failures: 2,
            error: || SyncError::SourceBusy("42".into()),
        });
        let runner = RetryingTaskRunner::new(handler.clone(), quick_backoff(3));
        assert!(runner.run(&clear_cache()).await.is_ok());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_last_error() {
        let handler = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            failures: usize::MAX,
            error: || SyncError::SourceBusy("42".into()),
        });
        let runner = RetryingTaskRunner::new(handler.clone(), quick_backoff(2));
        assert!(matches!(runner.run(&clear_cache()).await, Err(SyncError::SourceBusy(_))));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_failures_are_not_retried() {
        let handler = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            failures: usize::MAX,
            error: || SyncError::UnknownSource("42".into()),
        });
        let runner = RetryingTaskRunner::new(handler.clone(), quick_backoff(5));
        assert!(runner.run(&clear_cache()).await.is_err());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn leases_are_exclusive_per_source_and_released_on_drop() {
        let leases = SourceLeases::new();
        let first = leases.try_acquire("42").expect("first lease");
        assert!(leases.try_acquire("42").is_none());
        assert!(leases.try_acquire("43").is_some());
        drop(first);
        assert!(!leases.is_held("42"));
        assert!(leases.try_acquire("42").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn drained_queue_counts_tasks_that_exhaust_their_retries() {
        let handler = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            failures: usize::MAX,
            error: || SyncError::SourceBusy("42".into()),
        });
        let runner = Arc::new(RetryingTaskRunner::new(handler.clone(), quick_backoff(2)));
        let (scheduler, queue) = TokioScheduler::new();
        scheduler.schedule(clear_cache(), Some(Duration::from_secs(60)));
        drop(scheduler);

        let summary = queue.run(runner).await;
        assert_eq!(
            summary,
            DrainSummary {
                completed: 0,
                dead_letters: 1
            }
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn drained_queue_counts_successful_tasks() {
        let handler = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            failures: 1,
            error: || SyncError::SourceBusy("42".into()),
        });
        let runner = Arc::new(RetryingTaskRunner::new(handler, quick_backoff(2)));
        let (scheduler, queue) = TokioScheduler::new();
        scheduler.schedule(clear_cache(), None);
        drop(scheduler);

        assert_eq!(queue.run(runner).await.completed, 1);
    }

    fn refreshable_sources() -> Arc<InMemoryFeedSourceStore> {
        let mut remote = FeedSource::new("remote");
        remote.feed_url = Some("https://feeds.example.com/remote.xml".into());
        Arc::new(InMemoryFeedSourceStore::new([remote, FeedSource::new("manual")]))
    }

    fn forced_refresh(source_id: &str) -> (Task, Option<Duration>) {
        (
            Task::Reconcile {
                source_id: source_id.into(),
                acquisition: None,
                mode: ReconcileMode::Force,
            },
            None,
        )
    }

    #[tokio::test]
    async fn refresh_queues_only_sources_with_a_feed_url() {
        let sources = refreshable_sources();
        let scheduler = RecordingScheduler::new();

        let queued = queue_refresh(sources.as_ref(), &scheduler).await.unwrap();
        assert_eq!(queued, 1);
        assert_eq!(scheduler.scheduled(), vec![forced_refresh("remote")]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cron_job_queues_forced_refreshes() {
        let scheduler = Arc::new(RecordingScheduler::new());
        let mut sched =
            build_refresh_scheduler("* * * * * *", refreshable_sources(), scheduler.clone())
                .await
                .unwrap();
        sched.start().await.unwrap();

        let mut waited = Duration::ZERO;
        while scheduler.scheduled().is_empty() && waited < Duration::from_secs(10) {
            tokio::time::sleep(Duration::from_millis(100)).await;
            waited += Duration::from_millis(100);
        }
        sched.shutdown().await.unwrap();

        let scheduled = scheduler.scheduled();
        assert!(!scheduled.is_empty());
        assert!(scheduled.iter().all(|entry| *entry == forced_refresh("remote")));
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_scheduler_delivers_delayed_tasks_after_the_delay() {
        let (scheduler, mut queue) = TokioScheduler::new();
        scheduler.schedule(clear_cache(), Some(Duration::from_secs(25 * 60)));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(queue.rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(25 * 60)).await;
        assert_eq!(queue.rx.recv().await, Some(clear_cache()));
    }
}
