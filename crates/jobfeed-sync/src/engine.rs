//! Search engine seam: the trait the reconciler talks to, an in-memory engine
//! for tests and inspection, and a Solr JSON binding.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use jobfeed_core::NormalizedJobDocument;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("search engine request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("search engine returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected search engine response: {0}")]
    Decode(String),
    #[error("search engine unavailable: {0}")]
    Unavailable(String),
}

/// One page of the uid listing for a source, ordered by uid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub source_id: String,
    pub rows: usize,
    pub start: usize,
}

impl SearchQuery {
    pub fn uids_for_source(source_id: impl Into<String>, start: usize, rows: usize) -> Self {
        Self {
            source_id: source_id.into(),
            rows,
            start,
        }
    }

    pub fn to_solr_params(&self) -> Vec<(&'static str, String)> {
        vec![
            ("q", "*:*".to_string()),
            ("fq", format!("buid:{}", quote_term(&self.source_id))),
            ("fl", "uid,is_posted".to_string()),
            ("sort", "uid asc".to_string()),
            ("rows", self.rows.to_string()),
            ("start", self.start.to_string()),
            ("wt", "json".to_string()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IndexedDoc {
    pub uid: String,
    #[serde(default)]
    pub is_posted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPage {
    pub hits: usize,
    pub docs: Vec<IndexedDoc>,
}

/// Deletion scoped to one source: either the listed uids or everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteQuery {
    pub source_id: String,
    pub uids: Option<Vec<String>>,
    pub exclude_posted: bool,
}

impl DeleteQuery {
    pub fn uids(
        source_id: impl Into<String>,
        uids: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            uids: Some(uids.into_iter().map(Into::into).collect()),
            exclude_posted: false,
        }
    }

    pub fn all_for_source(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            uids: None,
            exclude_posted: false,
        }
    }

    /// Rewrites the query so documents flagged `is_posted` never match.
    pub fn excluding_posted(mut self) -> Self {
        self.exclude_posted = true;
        self
    }

    pub fn len(&self) -> usize {
        self.uids.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Boolean clauses in the rendered query: one per uid, the source filter
    /// and the posted exclusion. The engine's max clause count must allow it.
    pub fn clause_count(&self) -> usize {
        self.len() + 1 + usize::from(self.exclude_posted)
    }

    pub fn to_solr_query(&self) -> String {
        let mut clauses = vec![format!("buid:{}", quote_term(&self.source_id))];
        if let Some(uids) = &self.uids {
            let terms = uids.iter().map(|u| quote_term(u)).collect::<Vec<_>>();
            clauses.push(format!("uid:({})", terms.join(" OR ")));
        }
        if self.exclude_posted {
            clauses.push("-is_posted:true".to_string());
        }
        clauses.join(" AND ")
    }
}

fn quote_term(term: &str) -> String {
    format!("\"{}\"", term.replace('\\', "\\\\").replace('"', "\\\""))
}

#[async_trait]
pub trait SearchEngine: Send + Sync {
    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, EngineError>;

    /// Upserts by document id. `commit_within_ms` lets the engine batch commits.
    async fn add(
        &self,
        docs: &[NormalizedJobDocument],
        commit_within_ms: Option<u64>,
    ) -> Result<(), EngineError>;

    async fn delete(&self, query: &DeleteQuery) -> Result<(), EngineError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOp {
    Search { start: usize, rows: usize },
    Add { count: usize, commit_within_ms: Option<u64> },
    Delete { count: usize, exclude_posted: bool },
}

#[derive(Debug, Clone)]
struct StoredDoc {
    is_posted: bool,
    document: Option<NormalizedJobDocument>,
}

#[derive(Debug, Default)]
struct MemoryState {
    docs: BTreeMap<(String, String), StoredDoc>,
    ops: Vec<EngineOp>,
    failing_adds: usize,
    failing_deletes: usize,
}

/// Engine kept in process memory. Records every call so callers can inspect
/// how work was chunked, and can be told to fail upcoming calls.
#[derive(Debug, Default)]
pub struct InMemorySearchEngine {
    state: Mutex<MemoryState>,
}

impl InMemorySearchEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seeds a bare uid, as if indexed by an earlier run or another writer.
    pub fn seed(&self, source_id: &str, uid: &str, is_posted: bool) {
        self.lock().docs.insert(
            (source_id.to_string(), uid.to_string()),
            StoredDoc {
                is_posted,
                document: None,
            },
        );
    }

    /// Seeds a document that entered the index through the posting path.
    pub fn insert_posted(&self, source_id: &str, uid: &str) {
        self.seed(source_id, uid, true);
    }

    pub fn uids(&self, source_id: &str) -> Vec<String> {
        self.lock()
            .docs
            .keys()
            .filter(|(source, _)| source == source_id)
            .map(|(_, uid)| uid.clone())
            .collect()
    }

    pub fn document(&self, source_id: &str, uid: &str) -> Option<NormalizedJobDocument> {
        self.lock()
            .docs
            .get(&(source_id.to_string(), uid.to_string()))
            .and_then(|stored| stored.document.clone())
    }

    pub fn ops(&self) -> Vec<EngineOp> {
        self.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.lock().ops.clear();
    }

    pub fn fail_next_adds(&self, count: usize) {
        self.lock().failing_adds = count;
    }

    pub fn fail_next_deletes(&self, count: usize) {
        self.lock().failing_deletes = count;
    }
}

#[async_trait]
impl SearchEngine for InMemorySearchEngine {
    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, EngineError> {
        let mut state = self.lock();
        state.ops.push(EngineOp::Search {
            start: query.start,
            rows: query.rows,
        });
        let matching = state
            .docs
            .iter()
            .filter(|((source, _), _)| source == &query.source_id)
            .map(|((_, uid), stored)| IndexedDoc {
                uid: uid.clone(),
                is_posted: stored.is_posted,
            })
            .collect::<Vec<_>>();
        let hits = matching.len();
        let docs = matching.into_iter().skip(query.start).take(query.rows).collect();
        Ok(SearchPage { hits, docs })
    }

    async fn add(
        &self,
        docs: &[NormalizedJobDocument],
        commit_within_ms: Option<u64>,
    ) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.ops.push(EngineOp::Add {
            count: docs.len(),
            commit_within_ms,
        });
        if state.failing_adds > 0 {
            state.failing_adds -= 1;
            return Err(EngineError::Unavailable("injected add failure".to_string()));
        }
        for doc in docs {
            state.docs.insert(
                (doc.source_id.clone(), doc.uid.clone()),
                StoredDoc {
                    is_posted: doc.is_posted,
                    document: Some(doc.clone()),
                },
            );
        }
        Ok(())
    }

    async fn delete(&self, query: &DeleteQuery) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.ops.push(EngineOp::Delete {
            count: query.len(),
            exclude_posted: query.exclude_posted,
        });
        if state.failing_deletes > 0 {
            state.failing_deletes -= 1;
            return Err(EngineError::Unavailable("injected delete failure".to_string()));
        }
        state.docs.retain(|(source, uid), stored| {
            let targeted = source == &query.source_id
                && query.uids.as_ref().map_or(true, |uids| uids.contains(uid));
            let protected = query.exclude_posted && stored.is_posted;
            !targeted || protected
        });
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct SolrSelectResponse {
    response: SolrSelectBody,
}

#[derive(Debug, Deserialize)]
struct SolrSelectBody {
    #[serde(rename = "numFound")]
    num_found: usize,
    docs: Vec<IndexedDoc>,
}

/// Solr core reached over its JSON request handlers.
#[derive(Debug, Clone)]
pub struct SolrClient {
    client: reqwest::Client,
    core_url: String,
    /// Commit hint for deletes; adds carry their own.
    delete_commit_within_ms: Option<u64>,
}

impl SolrClient {
    pub fn new(core_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        use anyhow::Context;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building solr client")?;
        Ok(Self {
            client,
            core_url: core_url.into().trim_end_matches('/').to_string(),
            delete_commit_within_ms: None,
        })
    }

    pub fn with_delete_commit_within(mut self, commit_within_ms: Option<u64>) -> Self {
        self.delete_commit_within_ms = commit_within_ms;
        self
    }

    async fn post_update(
        &self,
        body: serde_json::Value,
        commit_within_ms: Option<u64>,
    ) -> Result<(), EngineError> {
        let mut request = self.client.post(format!("{}/update", self.core_url)).json(&body);
        if let Some(ms) = commit_within_ms {
            request = request.query(&[("commitWithin", ms.to_string())]);
        }
        let resp = request.send().await?;
        ensure_success(resp).await.map(|_| ())
    }
}

async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response, EngineError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(EngineError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl SearchEngine for SolrClient {
    async fn search(&self, query: &SearchQuery) -> Result<SearchPage, EngineError> {
        let resp = self
            .client
            .get(format!("{}/select", self.core_url))
            .query(&query.to_solr_params())
            .send()
            .await?;
        let parsed: SolrSelectResponse = ensure_success(resp)
            .await?
            .json()
            .await
            .map_err(|err| EngineError::Decode(err.to_string()))?;
        Ok(SearchPage {
            hits: parsed.response.num_found,
            docs: parsed.response.docs,
        })
    }

    async fn add(
        &self,
        docs: &[NormalizedJobDocument],
        commit_within_ms: Option<u64>,
    ) -> Result<(), EngineError> {
        let body = serde_json::to_value(docs).map_err(|err| EngineError::Decode(err.to_string()))?;
        self.post_update(body, commit_within_ms).await
    }

    async fn delete(&self, query: &DeleteQuery) -> Result<(), EngineError> {
        self.post_update(
            json!({ "delete": { "query": query.to_solr_query() } }),
            self.delete_commit_within_ms,
        )
        .await
    }
}
