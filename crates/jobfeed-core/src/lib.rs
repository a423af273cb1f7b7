//! Core domain model for job feed ingestion and index reconciliation.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod facet;

pub use facet::{compose_full_loc, compose_location, slugify, FacetKey, FacetSegment};

/// Company a feed source publishes jobs for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyRef {
    pub name: String,
    #[serde(default)]
    pub canonical_url: Option<String>,
}

/// A feed source ("business unit"). Owned by an external store; the pipeline
/// only reads it and writes back the aggregate counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSource {
    pub source_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub markdown_enabled: bool,
    #[serde(default)]
    pub ignore_index_filter: bool,
    #[serde(default)]
    pub company: Option<CompanyRef>,
    /// Where scheduled refreshes download the feed from.
    #[serde(default)]
    pub feed_url: Option<String>,
    #[serde(default)]
    pub associated_jobs: usize,
    #[serde(default)]
    pub date_crawled: Option<DateTime<Utc>>,
    #[serde(default)]
    pub date_updated: Option<DateTime<Utc>>,
}

impl FeedSource {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            title: None,
            markdown_enabled: false,
            ignore_index_filter: false,
            company: None,
            feed_url: None,
            associated_jobs: 0,
            date_crawled: None,
            date_updated: None,
        }
    }
}

/// Fields written back to a feed source after a successful reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSourceUpdate {
    pub title: Option<String>,
    pub associated_jobs: Option<usize>,
    pub date_crawled: Option<DateTime<Utc>>,
    pub date_updated: Option<DateTime<Utc>>,
}

impl FeedSourceUpdate {
    pub fn apply_to(&self, source: &mut FeedSource) {
        if let Some(title) = &self.title {
            source.title = Some(title.clone());
        }
        if let Some(count) = self.associated_jobs {
            source.associated_jobs = count;
        }
        if self.date_crawled.is_some() {
            source.date_crawled = self.date_crawled;
        }
        if self.date_updated.is_some() {
            source.date_updated = self.date_updated;
        }
    }
}

/// One `job` element as it came out of a feed document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawJobNode {
    pub uid: String,
    pub title: String,
    pub link: String,
    pub city: Option<String>,
    pub state: Option<String>,
    pub state_short: Option<String>,
    pub country: Option<String>,
    pub country_short: Option<String>,
    pub description: Option<String>,
    /// Comma-delimited ONET codes, verbatim from the feed.
    pub onet_code: Option<String>,
    pub date_new: Option<DateTime<Utc>>,
    pub date_modified: Option<DateTime<Utc>>,
    pub include_in_index: bool,
}

impl RawJobNode {
    pub fn onet_codes(&self) -> BTreeSet<String> {
        self.onet_code
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|code| !code.is_empty())
            .map(ToString::to_string)
            .collect()
    }
}

/// Military occupational classification record with its ONET membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MocRecord {
    pub id: u64,
    pub code: String,
    pub branch: String,
    pub title: String,
    #[serde(default)]
    pub onets: BTreeSet<String>,
}

impl MocRecord {
    pub fn slab(&self) -> String {
        FacetKey::occupation(self).encode()
    }
}

/// Per-source override: within `source_id`, `onet_code` maps to `moc_code`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOverrideMapping {
    pub source_id: String,
    pub onet_code: String,
    pub moc_code: String,
}

/// A set of MOC records expanded into parallel code/slab/id lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MocSet {
    pub codes: Vec<String>,
    pub slabs: Vec<String>,
    pub ids: Vec<u64>,
}

impl MocSet {
    /// Builds the lists ordered by record id, dropping repeated ids.
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a MocRecord>) -> Self {
        let mut records = records.into_iter().collect::<Vec<_>>();
        records.sort_by_key(|r| r.id);
        records.dedup_by_key(|r| r.id);
        Self {
            codes: records.iter().map(|r| r.code.clone()).collect(),
            slabs: records.iter().map(|r| r.slab()).collect(),
            ids: records.iter().map(|r| r.id).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedOccupations {
    pub standard: MocSet,
    pub mapped: MocSet,
}

/// Index-ready job record. Replaces any indexed document with the same
/// `(source_id, uid)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedJobDocument {
    pub id: String,
    pub uid: String,
    /// Indexed as `buid`, the field index queries filter a source on.
    #[serde(rename = "buid")]
    pub source_id: String,
    pub title: String,
    pub title_slug: String,
    pub title_slab: Option<String>,
    pub link: String,
    pub city: Option<String>,
    pub city_slab: Option<String>,
    pub state: Option<String>,
    pub state_short: Option<String>,
    pub state_slab: Option<String>,
    pub country: Option<String>,
    pub country_short: Option<String>,
    pub country_slab: Option<String>,
    pub location: String,
    pub full_loc: String,
    pub company: Option<String>,
    pub company_slab: Option<String>,
    pub description: Option<String>,
    pub html_description: String,
    pub onet: Vec<String>,
    pub moc: Vec<String>,
    pub moc_slab: Vec<String>,
    pub moc_id: Vec<u64>,
    pub mapped_moc: Vec<String>,
    pub mapped_moc_slab: Vec<String>,
    pub mapped_moc_id: Vec<u64>,
    pub date_new: Option<DateTime<Utc>>,
    pub date_updated: Option<DateTime<Utc>>,
    pub is_posted: bool,
    pub text: String,
}

/// Index document id for a feed uid within a source: `{source_id}:{uid}`,
/// with `\` and `:` in the source id backslash-escaped so the first bare
/// `:` always ends it.
pub fn document_id(source_id: &str, uid: &str) -> String {
    let mut id = String::with_capacity(source_id.len() + uid.len() + 1);
    for c in source_id.chars() {
        if matches!(c, '\\' | ':') {
            id.push('\\');
        }
        id.push(c);
    }
    id.push(':');
    id.push_str(uid);
    id
}
