use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use jobfeed_adapters::parse_timestamp;
use jobfeed_core::RawJobNode;
use jobfeed_storage::{
    AcquisitionSource, BackoffPolicy, FeedAcquirer, HttpClientConfig, HttpFetcher,
    WorkspaceAllocator,
};
use jobfeed_sync::engine::{EngineOp, InMemorySearchEngine};
use jobfeed_sync::occupations::{InMemoryOccupationStore, OccupationResolver};
use jobfeed_sync::reconcile::{ReconcileMode, ReconcileOutcome, ReconcileSummary};
use jobfeed_sync::sources::{FeedSourceStore, YamlFeedSourceStore};
use jobfeed_sync::tasks::{
    LoggingCacheInvalidator, RecordingScheduler, RetryingTaskRunner, Task, TaskOutcome,
};
use jobfeed_sync::transform::derive_location_fields;
use jobfeed_sync::{FeedSyncPipeline, PipelineParts, SyncConfig, SyncError};
use tempfile::TempDir;
use uuid::Uuid;

fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

fn feed(name: &str) -> AcquisitionSource {
    AcquisitionSource::Archive(fixtures().join("feeds").join(name))
}

fn set(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

struct Harness {
    dir: TempDir,
    engine: Arc<InMemorySearchEngine>,
    sources: Arc<YamlFeedSourceStore>,
    scheduler: Arc<RecordingScheduler>,
    cache: Arc<LoggingCacheInvalidator>,
    pipeline: Arc<FeedSyncPipeline>,
}

async fn harness_with(configure: impl FnOnce(&mut SyncConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let sources_path = dir.path().join("sources.yaml");
    std::fs::copy(fixtures().join("sources.yaml"), &sources_path).unwrap();

    let mut config = SyncConfig {
        scratch_dir: dir.path().join("scratch"),
        worker_id: Some("test".into()),
        reports_dir: Some(dir.path().join("reports")),
        ..SyncConfig::default()
    };
    configure(&mut config);

    let engine = Arc::new(InMemorySearchEngine::new());
    let sources = Arc::new(YamlFeedSourceStore::open(&sources_path).await.unwrap());
    let scheduler = Arc::new(RecordingScheduler::new());
    let cache = Arc::new(LoggingCacheInvalidator::new());
    let occupations =
        Arc::new(
            InMemoryOccupationStore::from_yaml_file(fixtures().join("occupations.yaml")).unwrap(),
        );
    let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());

    let pipeline = Arc::new(FeedSyncPipeline::new(
        &config,
        PipelineParts {
            engine: engine.clone(),
            sources: sources.clone(),
            occupations,
            scheduler: scheduler.clone(),
            cache: cache.clone(),
            acquirer: FeedAcquirer::new(
                http,
                WorkspaceAllocator::new(config.scratch_dir.clone(), "test"),
            ),
        },
    ));

    Harness {
        dir,
        engine,
        sources,
        scheduler,
        cache,
        pipeline,
    }
}

async fn harness() -> Harness {
    harness_with(|_| {}).await
}

impl Harness {
    async fn sync(
        &self,
        source_id: &str,
        feed_name: &str,
        mode: ReconcileMode,
    ) -> Result<ReconcileOutcome, SyncError> {
        self.pipeline
            .sync_source(Uuid::new_v4(), source_id, Some(&feed(feed_name)), mode)
            .await
    }

    async fn applied(
        &self,
        source_id: &str,
        feed_name: &str,
        mode: ReconcileMode,
    ) -> ReconcileSummary {
        match self.sync(source_id, feed_name, mode).await.unwrap() {
            ReconcileOutcome::Applied(summary) => summary,
            other => panic!("expected an applied run, got {other:?}"),
        }
    }

    fn adds(&self) -> Vec<usize> {
        self.engine
            .ops()
            .into_iter()
            .filter_map(|op| match op {
                EngineOp::Add { count, .. } => Some(count),
                _ => None,
            })
            .collect()
    }
}

#[tokio::test]
async fn force_run_upserts_the_whole_feed_and_spares_posted_jobs() {
    let h = harness().await;
    h.engine.seed("acme", "u2", false);
    h.engine.insert_posted("acme", "u4");

    let summary = h.applied("acme", "three_jobs.xml", ReconcileMode::Force).await;

    assert_eq!(summary.upserted, 3);
    assert_eq!(summary.deleted, 0);
    assert_eq!(summary.indexed_before, 2);
    assert_eq!(summary.posted, 1);
    assert_eq!(h.engine.uids("acme"), set(&["u1", "u2", "u3", "u4"]));
    assert_eq!(h.adds(), vec![3]);
    assert!(!h.engine.ops().iter().any(|op| matches!(op, EngineOp::Delete { .. })));
}

#[tokio::test]
async fn incremental_run_only_sends_new_jobs() {
    let h = harness().await;
    h.engine.seed("acme", "u2", false);
    h.engine.insert_posted("acme", "u4");

    let summary = h.applied("acme", "three_jobs.xml", ReconcileMode::Incremental).await;

    assert_eq!(summary.upserted, 2);
    assert_eq!(h.adds(), vec![2]);
    assert!(h.engine.document("acme", "u1").is_some());
    assert!(h.engine.document("acme", "u3").is_some());
    // u2 was already indexed and is left as it was.
    assert!(h.engine.document("acme", "u2").is_none());
}

#[tokio::test]
async fn done_state_writes_back_source_and_schedules_cache_invalidation() {
    let h = harness().await;
    let run_id = Uuid::new_v4();
    h.pipeline
        .sync_source(run_id, "acme", Some(&feed("three_jobs.xml")), ReconcileMode::Force)
        .await
        .unwrap();

    let source = h.sources.get("acme").await.unwrap().unwrap();
    assert_eq!(source.title.as_deref(), Some("Acme Health"));
    assert_eq!(source.associated_jobs, 3);
    assert_eq!(source.date_crawled, parse_timestamp("10/18/2026 02:15:00 PM"));
    assert!(source.date_updated.is_some());

    assert_eq!(
        h.scheduler.scheduled(),
        vec![(
            Task::ClearCache {
                source_id: "acme".into()
            },
            Some(Duration::from_secs(25 * 60))
        )]
    );

    let report = h
        .dir
        .path()
        .join("reports")
        .join(run_id.to_string())
        .join("reconcile_report.json");
    let report: serde_json::Value =
        serde_json::from_slice(&std::fs::read(report).unwrap()).unwrap();
    assert_eq!(report["source_id"], "acme");
    assert_eq!(report["outcome"]["Applied"]["upserted"], 3);
    assert_eq!(report["payload_sha256"].as_str().map(str::len), Some(64));

    let leftovers = std::fs::read_dir(h.dir.path().join("scratch").join("worker-test"))
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn transformed_documents_carry_facets_and_resolved_occupations() {
    let h = harness().await;
    h.applied("acme", "three_jobs.xml", ReconcileMode::Force).await;

    let u1 = h.engine.document("acme", "u1").unwrap();
    assert_eq!(u1.id, "acme:u1");
    assert_eq!(u1.company.as_deref(), Some("Acme Health"));
    assert_eq!(u1.company_slab.as_deref(), Some("acme-health/careers::Acme Health"));
    assert_eq!(u1.moc, set(&["46F", "68C"]));
    assert_eq!(u1.mapped_moc, u1.moc);
    assert!(!u1.is_posted);

    // 13-1081.00 is overridden to LS for this source, which also drops 92A.
    let u2 = h.engine.document("acme", "u2").unwrap();
    assert_eq!(u2.moc, set(&["92A", "LS"]));
    assert_eq!(u2.moc_id, vec![201, 202]);
    assert_eq!(u2.mapped_moc, set(&["LS"]));
    assert_eq!(
        u2.mapped_moc_slab,
        set(&["logistics-specialist/LS/navy/vet-jobs::LS - Logistics Specialist"])
    );
    assert_eq!(u2.location, "Lyon, FRA");
    assert_eq!(u2.html_description, "<p>Coordinate <strong>inbound</strong> freight.</p>");

    let u3 = h.engine.document("acme", "u3").unwrap();
    assert_eq!(u3.location, "Virtual, USA");
    assert!(u3.city_slab.is_none());
    assert!(u3.moc.is_empty() && u3.moc_slab.is_empty() && u3.moc_id.is_empty());
}

#[tokio::test]
async fn second_identical_run_is_idempotent() {
    let h = harness().await;
    h.engine.insert_posted("acme", "u4");

    h.applied("acme", "three_jobs.xml", ReconcileMode::Force).await;
    let first = ["u1", "u2", "u3"].map(|uid| h.engine.document("acme", uid));
    h.engine.clear_ops();

    let again = h.applied("acme", "three_jobs.xml", ReconcileMode::Force).await;
    assert_eq!(again.upserted, 3);
    assert_eq!(again.deleted, 0);
    assert_eq!(h.engine.uids("acme"), set(&["u1", "u2", "u3", "u4"]));
    assert_eq!(["u1", "u2", "u3"].map(|uid| h.engine.document("acme", uid)), first);

    let incremental = h.applied("acme", "three_jobs.xml", ReconcileMode::Incremental).await;
    assert_eq!(incremental.upserted, 0);
    assert_eq!(incremental.round_trips, 0);
}

#[tokio::test]
async fn stale_jobs_are_deleted_but_posted_ones_survive() {
    let h = harness().await;
    h.engine.seed("acme", "stale", false);
    h.engine.insert_posted("acme", "posted");
    h.engine.seed("other", "stale", false);

    let summary = h.applied("acme", "three_jobs.xml", ReconcileMode::Force).await;
    assert_eq!(summary.deleted, 1);
    assert_eq!(h.engine.uids("acme"), set(&["posted", "u1", "u2", "u3"]));
    assert_eq!(h.engine.uids("other"), set(&["stale"]));
    assert!(h
        .engine
        .ops()
        .iter()
        .any(|op| matches!(op, EngineOp::Delete { count: 1, exclude_posted: true })));
}

#[tokio::test]
async fn clearing_a_source_keeps_posted_jobs() {
    let h = harness().await;
    h.applied("acme", "three_jobs.xml", ReconcileMode::Force).await;
    h.engine.insert_posted("acme", "posted");

    let runner = RetryingTaskRunner::new(h.pipeline.clone(), BackoffPolicy::default());
    let outcome = runner
        .run(&Task::ClearSource {
            source_id: "acme".into(),
        })
        .await
        .unwrap();
    assert!(matches!(outcome, TaskOutcome::SourceCleared { .. }));
    assert_eq!(h.engine.uids("acme"), set(&["posted"]));
    assert_eq!(h.sources.get("acme").await.unwrap().unwrap().associated_jobs, 0);

    let cache_task = Task::ClearCache {
        source_id: "acme".into(),
    };
    runner.run(&cache_task).await.unwrap();
    assert_eq!(h.cache.invalidated(), set(&["acme"]));
}

#[tokio::test]
async fn chunks_never_exceed_the_clause_limit() {
    let h = harness_with(|config| {
        config.reconcile.clause_limit = 2;
        config.reconcile.fetch_window = 2;
    })
    .await;
    for uid in ["s1", "s2", "s3", "s4", "s5"] {
        h.engine.seed("acme", uid, false);
    }

    let summary = h.applied("acme", "three_jobs.xml", ReconcileMode::Force).await;
    assert_eq!(summary.upserted, 3);
    assert_eq!(summary.deleted, 5);
    assert_eq!(summary.round_trips, 3);

    let commit = SyncConfig::default().reconcile.commit_within_ms;
    assert_eq!(
        h.engine.ops(),
        vec![
            EngineOp::Search { start: 0, rows: 2 },
            EngineOp::Search { start: 2, rows: 2 },
            EngineOp::Search { start: 4, rows: 2 },
            EngineOp::Add { count: 2, commit_within_ms: commit },
            EngineOp::Delete { count: 2, exclude_posted: true },
            EngineOp::Add { count: 1, commit_within_ms: commit },
            EngineOp::Delete { count: 2, exclude_posted: true },
            EngineOp::Delete { count: 1, exclude_posted: true },
        ]
    );
    assert_eq!(h.engine.uids("acme"), set(&["u1", "u2", "u3"]));
}

#[tokio::test]
async fn unflagged_job_is_filtered_from_an_otherwise_valid_feed() {
    let h = harness().await;
    let summary = h.applied("ten", "ten_jobs_one_unflagged.xml", ReconcileMode::Force).await;

    assert_eq!(summary.feed_jobs, 9);
    assert_eq!(summary.skipped_jobs, 1);
    let uids = h.engine.uids("ten");
    assert_eq!(uids.len(), 9);
    assert!(!uids.contains(&"job-7".to_string()));
    // "ten" already has a title matching the feed, so it is left alone.
    assert_eq!(
        h.sources.get("ten").await.unwrap().unwrap().title.as_deref(),
        Some("Ten Jobs Inc")
    );
}

#[tokio::test]
async fn invalid_feeds_are_rejected_without_touching_the_index() {
    let h = harness().await;
    h.engine.seed("acme", "keep", false);

    let outcome = h.sync("acme", "missing_uid.xml", ReconcileMode::Force).await.unwrap();
    let ReconcileOutcome::Rejected { error, .. } = outcome else {
        panic!("expected rejection");
    };
    assert_eq!(error.line, 11);
    assert!(error.message.contains("uid"));

    let outcome = h.sync("acme", "malformed.xml", ReconcileMode::Force).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Rejected { .. }));

    assert!(h.engine.ops().is_empty());
    assert_eq!(h.engine.uids("acme"), set(&["keep"]));
    let source = h.sources.get("acme").await.unwrap().unwrap();
    assert_eq!(source.associated_jobs, 0);
    assert!(h.scheduler.scheduled().is_empty());
}

#[tokio::test]
async fn failed_round_trip_converges_on_retry() {
    let h = harness_with(|config| config.reconcile.clause_limit = 2).await;
    for uid in ["s1", "s2", "s3"] {
        h.engine.seed("acme", uid, false);
    }
    h.engine.fail_next_deletes(1);

    let runner = RetryingTaskRunner::new(
        h.pipeline.clone(),
        BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
    );
    let outcome = runner
        .run(&Task::Reconcile {
            source_id: "acme".into(),
            acquisition: Some(feed("three_jobs.xml")),
            mode: ReconcileMode::Force,
        })
        .await
        .unwrap();

    let TaskOutcome::Reconciled(ReconcileOutcome::Applied(summary)) = outcome else {
        panic!("expected an applied reconcile");
    };
    assert_eq!(summary.deleted, 3);
    assert_eq!(h.engine.uids("acme"), set(&["u1", "u2", "u3"]));
    // The first attempt got one upsert chunk in before failing.
    assert_eq!(h.adds(), vec![2, 2, 1]);
}

#[tokio::test]
async fn precondition_failures_are_reported_without_retrying() {
    let h = harness().await;

    let err = h.sync("missing", "three_jobs.xml", ReconcileMode::Force).await.unwrap_err();
    assert!(matches!(err, SyncError::UnknownSource(_)));
    assert!(!err.is_retryable());

    let err = h
        .pipeline
        .sync_source(Uuid::new_v4(), "ten", None, ReconcileMode::Force)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::MissingFeedUrl(_)));

    let _lease = h.pipeline.leases().try_acquire("acme").unwrap();
    let err = h.sync("acme", "three_jobs.xml", ReconcileMode::Force).await.unwrap_err();
    assert!(matches!(err, SyncError::SourceBusy(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn missing_feed_file_is_an_acquisition_error() {
    let h = harness().await;
    let err = h.sync("acme", "does_not_exist.xml", ReconcileMode::Force).await.unwrap_err();
    assert!(matches!(err, SyncError::Acquisition(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn derived_location_strings_round_trip_from_the_document() {
    let h = harness().await;
    h.applied("acme", "three_jobs.xml", ReconcileMode::Force).await;

    for uid in ["u1", "u2", "u3"] {
        let doc = h.engine.document("acme", uid).unwrap();
        let raw = RawJobNode {
            uid: doc.uid.clone(),
            title: doc.title.clone(),
            link: doc.link.clone(),
            city: doc.city.clone(),
            state: doc.state.clone(),
            state_short: doc.state_short.clone(),
            country: doc.country.clone(),
            country_short: doc.country_short.clone(),
            description: doc.description.clone(),
            onet_code: None,
            date_new: doc.date_new,
            date_modified: doc.date_updated,
            include_in_index: true,
        };
        let derived = derive_location_fields(&raw);
        assert_eq!(derived.location, doc.location);
        assert_eq!(derived.full_loc, doc.full_loc);
        assert_eq!(derived.city_slab, doc.city_slab);
        assert_eq!(derived.state_slab, doc.state_slab);
        assert_eq!(derived.country_slab, doc.country_slab);
    }
}

#[test]
fn override_excludes_standard_mocs_only_when_it_applies() {
    let store = InMemoryOccupationStore::from_yaml_str(
        r#"
mocs:
  - { id: 1, code: MOC1, branch: army, title: One, onets: ["Z"] }
  - { id: 2, code: MOC2, branch: army, title: Two, onets: ["A"] }
  - { id: 3, code: MOC3, branch: army, title: Three, onets: ["B"] }
overrides:
  - { source_id: s, onet_code: "A", moc_code: MOC1 }
"#,
    )
    .unwrap();
    let resolver = OccupationResolver::new(Arc::new(store));
    let codes = |values: &[&str]| values.iter().map(|v| v.to_string()).collect::<BTreeSet<_>>();

    assert_eq!(resolver.resolve("s", &codes(&["A"])).mapped.codes, set(&["MOC1"]));
    assert_eq!(resolver.resolve("s", &codes(&["B"])).mapped.codes, set(&["MOC3"]));
}
