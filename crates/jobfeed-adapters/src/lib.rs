//! Feed document parsing and validation.
//!
//! A [`FeedDocument`] never fails to construct: unreadable, malformed, and
//! schema-invalid feeds all end up as an invalid document carrying a
//! [`ValidationError`], so a batch can report the problem and move on.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use jobfeed_core::{FeedSource, RawJobNode};
use roxmltree::{Document, Node};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod markup;

pub use markup::render_description;

/// Pattern every feed timestamp must follow, e.g. `10/18/2026 02:15:00 PM`.
pub const TIMESTAMP_FORMAT: &str = "%m/%d/%Y %I:%M:%S %p";

const ROOT_TAG: &str = "jobs";
const JOB_TAG: &str = "job";
const INDEX_MARKER_PATH: [&str; 2] = ["flags", "include_in_index"];

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("line {line}: {message}")]
pub struct ValidationError {
    pub line: u32,
    pub message: String,
}

impl ValidationError {
    fn at(doc: &Document<'_>, node: Node<'_, '_>, message: impl Into<String>) -> Self {
        Self {
            line: doc.text_pos_at(node.range().start).row,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedMetadata {
    pub source_name: String,
    pub crawled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedOptions {
    /// Yield every job, including those without the include-in-index marker.
    pub ignore_index_filter: bool,
}

impl From<&FeedSource> for FeedOptions {
    fn from(source: &FeedSource) -> Self {
        Self {
            ignore_index_filter: source.ignore_index_filter,
        }
    }
}

#[derive(Debug)]
enum FeedState {
    Valid {
        metadata: FeedMetadata,
        jobs: Vec<RawJobNode>,
    },
    Invalid(ValidationError),
}

#[derive(Debug)]
pub struct FeedDocument {
    path: Option<PathBuf>,
    options: FeedOptions,
    state: FeedState,
}

impl FeedDocument {
    pub fn open(path: impl AsRef<Path>, options: FeedOptions) -> Self {
        let path = path.as_ref();
        let state = match std::fs::read_to_string(path) {
            Ok(text) => parse_state(&text),
            Err(err) => FeedState::Invalid(ValidationError {
                line: 0,
                message: format!("reading {}: {err}", path.display()),
            }),
        };
        let document = Self {
            path: Some(path.to_path_buf()),
            options,
            state,
        };
        document.log_outcome();
        document
    }

    pub fn from_xml(text: &str, options: FeedOptions) -> Self {
        let document = Self {
            path: None,
            options,
            state: parse_state(text),
        };
        document.log_outcome();
        document
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_valid(&self) -> bool {
        matches!(self.state, FeedState::Valid { .. })
    }

    pub fn error_detail(&self) -> Option<&ValidationError> {
        match &self.state {
            FeedState::Invalid(err) => Some(err),
            FeedState::Valid { .. } => None,
        }
    }

    pub fn metadata(&self) -> Option<&FeedMetadata> {
        match &self.state {
            FeedState::Valid { metadata, .. } => Some(metadata),
            FeedState::Invalid(_) => None,
        }
    }

    /// Consumes the document. Jobs lacking the include-in-index marker are
    /// skipped unless the source ignores the index filter. An invalid
    /// document yields nothing.
    pub fn jobs(self) -> FeedJobs {
        let jobs = match self.state {
            FeedState::Valid { jobs, .. } => jobs,
            FeedState::Invalid(_) => Vec::new(),
        };
        FeedJobs {
            inner: jobs.into_iter(),
            ignore_index_filter: self.options.ignore_index_filter,
            skipped: 0,
        }
    }

    fn log_outcome(&self) {
        let path = self
            .path
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<inline>".to_string());
        match &self.state {
            FeedState::Valid { metadata, jobs } => tracing::debug!(
                path,
                source_name = %metadata.source_name,
                jobs = jobs.len(),
                "feed document parsed"
            ),
            FeedState::Invalid(err) => tracing::warn!(
                path,
                line = err.line,
                message = %err.message,
                "feed document failed validation"
            ),
        }
    }
}

#[derive(Debug)]
pub struct FeedJobs {
    inner: std::vec::IntoIter<RawJobNode>,
    ignore_index_filter: bool,
    skipped: usize,
}

impl FeedJobs {
    /// Jobs filtered out so far for lacking the include-in-index marker.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl Iterator for FeedJobs {
    type Item = RawJobNode;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let job = self.inner.next()?;
            if self.ignore_index_filter || job.include_in_index {
                return Some(job);
            }
            self.skipped += 1;
            tracing::debug!(uid = %job.uid, "job not flagged for indexing");
        }
    }
}

fn parse_state(text: &str) -> FeedState {
    match parse_feed(text) {
        Ok((metadata, jobs)) => FeedState::Valid { metadata, jobs },
        Err(err) => FeedState::Invalid(err),
    }
}

fn parse_feed(text: &str) -> Result<(FeedMetadata, Vec<RawJobNode>), ValidationError> {
    let doc = Document::parse(text).map_err(|err| ValidationError {
        line: err.pos().row,
        message: err.to_string(),
    })?;
    let root = doc.root_element();
    if root.tag_name().name() != ROOT_TAG {
        return Err(ValidationError::at(
            &doc,
            root,
            format!("expected root element <{ROOT_TAG}>, found <{}>", root.tag_name().name()),
        ));
    }

    let source_name = required_text(&doc, root, "job_source_name")?;
    let crawled_at = required_timestamp(&doc, root, "date_modified")?;

    let jobs = root
        .children()
        .filter(|n| n.is_element() && n.tag_name().name() == JOB_TAG)
        .map(|job| parse_job(&doc, job))
        .collect::<Result<Vec<_>, _>>()?;

    Ok((
        FeedMetadata {
            source_name,
            crawled_at,
        },
        jobs,
    ))
}

fn parse_job(doc: &Document<'_>, job: Node<'_, '_>) -> Result<RawJobNode, ValidationError> {
    let include_in_index = INDEX_MARKER_PATH
        .iter()
        .try_fold(job, |node, tag| child(node, tag))
        .and_then(|marker| marker.text())
        .is_some_and(is_truthy);

    Ok(RawJobNode {
        uid: required_text(doc, job, "uid")?,
        title: required_text(doc, job, "title")?,
        link: required_text(doc, job, "link")?,
        city: optional_text(job, "city"),
        state: optional_text(job, "state"),
        state_short: optional_text(job, "state_short"),
        country: optional_text(job, "country"),
        country_short: optional_text(job, "country_short"),
        description: optional_text(job, "description"),
        onet_code: optional_text(job, "onet_code"),
        date_new: optional_timestamp(doc, job, "date_new")?,
        date_modified: optional_timestamp(doc, job, "date_modified")?,
        include_in_index,
    })
}

fn child<'a, 'input>(node: Node<'a, 'input>, tag: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == tag)
}

/// Element text with HTML entities decoded and whitespace trimmed; blank
/// text counts as absent.
fn optional_text(node: Node<'_, '_>, tag: &str) -> Option<String> {
    let raw = child(node, tag)?
        .children()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect::<String>();
    let decoded = html_escape::decode_html_entities(&raw);
    let trimmed = decoded.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn required_text(
    doc: &Document<'_>,
    node: Node<'_, '_>,
    tag: &str,
) -> Result<String, ValidationError> {
    optional_text(node, tag).ok_or_else(|| {
        ValidationError::at(
            doc,
            node,
            format!("<{}> is missing required element <{tag}>", node.tag_name().name()),
        )
    })
}

fn optional_timestamp(
    doc: &Document<'_>,
    node: Node<'_, '_>,
    tag: &str,
) -> Result<Option<DateTime<Utc>>, ValidationError> {
    let Some(value) = optional_text(node, tag) else {
        return Ok(None);
    };
    parse_timestamp(&value).map(Some).ok_or_else(|| {
        let at = child(node, tag).unwrap_or(node);
        ValidationError::at(
            doc,
            at,
            format!("<{tag}> value {value:?} does not match {TIMESTAMP_FORMAT}"),
        )
    })
}

fn required_timestamp(
    doc: &Document<'_>,
    node: Node<'_, '_>,
    tag: &str,
) -> Result<DateTime<Utc>, ValidationError> {
    optional_timestamp(doc, node, tag)?.ok_or_else(|| {
        ValidationError::at(
            doc,
            node,
            format!("<{}> is missing required element <{tag}>", node.tag_name().name()),
        )
    })
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value.trim(), TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/feeds")
            .join(name)
    }

    #[test]
    fn parses_metadata_and_jobs() {
        let doc = FeedDocument::open(fixture("three_jobs.xml"), FeedOptions::default());
        assert!(doc.is_valid(), "{:?}", doc.error_detail());
        let metadata = doc.metadata().unwrap().clone();
        assert_eq!(metadata.source_name, "Acme Health");
        assert_eq!(metadata.crawled_at.hour(), 14);

        let jobs = doc.jobs().collect::<Vec<_>>();
        assert_eq!(
            jobs.iter().map(|j| j.uid.as_str()).collect::<Vec<_>>(),
            vec!["u1", "u2", "u3"]
        );
        let nurse = &jobs[0];
        assert_eq!(nurse.state_short.as_deref(), Some("TX"));
        assert_eq!(nurse.date_new.unwrap().day(), 1);
        assert_eq!(
            nurse.description.as_deref(),
            Some("Care for patients & families.\nNights and weekends.")
        );
        assert_eq!(jobs[2].description.as_deref(), Some("Help customers <b>remotely</b>."));
        assert_eq!(jobs[2].city, None);
    }

    #[test]
    fn unflagged_jobs_are_filtered_without_failing() {
        let doc = FeedDocument::open(fixture("ten_jobs_one_unflagged.xml"), FeedOptions::default());
        assert!(doc.is_valid());
        let mut jobs = doc.jobs();
        let uids = jobs.by_ref().map(|j| j.uid).collect::<Vec<_>>();
        assert_eq!(uids.len(), 9);
        assert!(!uids.contains(&"job-7".to_string()));
        assert_eq!(jobs.skipped(), 1);
    }

    #[test]
    fn ignore_index_filter_yields_every_job() {
        let doc = FeedDocument::open(
            fixture("ten_jobs_one_unflagged.xml"),
            FeedOptions {
                ignore_index_filter: true,
            },
        );
        assert_eq!(doc.jobs().count(), 10);
    }

    #[test]
    fn malformed_xml_is_captured_not_raised() {
        let doc = FeedDocument::open(fixture("malformed.xml"), FeedOptions::default());
        assert!(!doc.is_valid());
        assert!(doc.metadata().is_none());
        let err = doc.error_detail().unwrap();
        assert!(err.line >= 7, "unexpected line {}", err.line);
        assert_eq!(doc.jobs().count(), 0);
    }

    #[test]
    fn schema_violation_reports_the_offending_job() {
        let doc = FeedDocument::open(fixture("missing_uid.xml"), FeedOptions::default());
        let err = doc.error_detail().cloned().unwrap();
        assert_eq!(err.line, 11);
        assert!(err.message.contains("<uid>"), "{}", err.message);
        assert_eq!(doc.jobs().count(), 0);
    }

    #[test]
    fn unreadable_file_is_an_invalid_document() {
        let doc = FeedDocument::open(fixture("does_not_exist.xml"), FeedOptions::default());
        assert_eq!(doc.error_detail().map(|e| e.line), Some(0));
    }

    #[test]
    fn bad_timestamps_and_wrong_roots_fail_validation() {
        let bad_date = r#"<jobs>
  <job_source_name>X</job_source_name>
  <date_modified>2026-10-18T08:00:00Z</date_modified>
</jobs>"#;
        let err = FeedDocument::from_xml(bad_date, FeedOptions::default())
            .error_detail()
            .cloned()
            .unwrap();
        assert_eq!(err.line, 3);

        let wrong_root = "<postings><job_source_name>X</job_source_name></postings>";
        let doc = FeedDocument::from_xml(wrong_root, FeedOptions::default());
        assert!(doc.error_detail().unwrap().message.contains("<jobs>"));
    }

    #[test]
    fn timestamps_accept_unpadded_hours() {
        let ts = parse_timestamp("1/2/2026 9:05:00 PM").unwrap();
        assert_eq!((ts.month(), ts.day(), ts.hour(), ts.minute()), (1, 2, 21, 5));
        assert!(parse_timestamp("13/40/2026 09:00:00 AM").is_none());
    }
}
