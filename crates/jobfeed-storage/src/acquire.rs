//! Pulls a feed payload into a scratch directory and locates the XML inside it.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use uuid::Uuid;

use crate::workspace::{path_safe, ScratchDir, WorkspaceAllocator};
use crate::{FetchError, HttpFetcher};

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("downloading {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("reading archive {origin}: {source}")]
    Archive {
        origin: String,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no feed document for source {source_id} under {}", dir.display())]
    MissingFeed { source_id: String, dir: PathBuf },
    #[error("scratch path {} is outside {}", path.display(), root.display())]
    ScratchEscape { path: PathBuf, root: PathBuf },
    #[error("extraction worker stopped: {0}")]
    Interrupted(String),
}

impl AcquisitionError {
    pub(crate) fn filesystem(path: &Path, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionSource {
    /// Remote feed, either bare XML or a ZIP archive.
    Url(String),
    /// Local file, either bare XML or a ZIP archive.
    Archive(PathBuf),
}

impl AcquisitionSource {
    fn origin(&self) -> String {
        match self {
            Self::Url(url) => url.clone(),
            Self::Archive(path) => path.display().to_string(),
        }
    }
}

/// An extracted feed. The scratch directory lives as long as this value.
#[derive(Debug)]
pub struct AcquiredFeed {
    pub feed_path: PathBuf,
    pub sha256: String,
    pub byte_size: usize,
    pub scratch: ScratchDir,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct FeedAcquirer {
    http: Arc<HttpFetcher>,
    workspace: WorkspaceAllocator,
}

impl FeedAcquirer {
    pub fn new(http: Arc<HttpFetcher>, workspace: WorkspaceAllocator) -> Self {
        Self { http, workspace }
    }

    pub fn workspace(&self) -> &WorkspaceAllocator {
        &self.workspace
    }

    pub async fn acquire(
        &self,
        run_id: Uuid,
        source_id: &str,
        source: &AcquisitionSource,
    ) -> Result<AcquiredFeed, AcquisitionError> {
        let scratch = self.workspace.acquire(source_id).await?;

        let bytes = match source {
            AcquisitionSource::Url(url) => {
                self.http
                    .fetch_bytes(run_id, source_id, url)
                    .await
                    .map_err(|source| AcquisitionError::Download {
                        url: url.clone(),
                        source,
                    })?
                    .body
            }
            AcquisitionSource::Archive(path) => fs::read(path)
                .await
                .map_err(|source| AcquisitionError::filesystem(path, source))?,
        };

        let sha256 = sha256_hex(&bytes);
        let byte_size = bytes.len();

        let feed_path = if bytes.starts_with(ZIP_MAGIC) {
            let dest = scratch.path().to_path_buf();
            let origin = source.origin();
            let extracted = tokio::task::spawn_blocking(move || extract_zip(bytes, &dest, &origin))
                .await
                .map_err(|err| AcquisitionError::Interrupted(err.to_string()))??;
            locate_feed(scratch.path(), source_id, &extracted)?
        } else {
            let path = scratch.path().join(format!("{}.xml", path_safe(source_id)));
            fs::write(&path, &bytes)
                .await
                .map_err(|source| AcquisitionError::filesystem(&path, source))?;
            path
        };

        tracing::info!(
            %run_id,
            source_id,
            origin = %source.origin(),
            byte_size,
            sha256 = %sha256,
            feed = %feed_path.display(),
            "feed acquired"
        );

        Ok(AcquiredFeed {
            feed_path,
            sha256,
            byte_size,
            scratch,
        })
    }
}

fn extract_zip(
    bytes: Vec<u8>,
    dest: &Path,
    origin: &str,
) -> Result<Vec<PathBuf>, AcquisitionError> {
    let archive_err = |source| AcquisitionError::Archive {
        origin: origin.to_string(),
        source,
    };
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(archive_err)?;
    let mut extracted = Vec::new();

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(archive_err)?;
        let Some(relative) = entry.enclosed_name() else {
            tracing::warn!(
                entry = entry.name(),
                "skipping archive entry outside the extraction root"
            );
            continue;
        };
        let out = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out)
                .map_err(|source| AcquisitionError::filesystem(&out, source))?;
            continue;
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|source| AcquisitionError::filesystem(parent, source))?;
        }
        let mut file = std::fs::File::create(&out)
            .map_err(|source| AcquisitionError::filesystem(&out, source))?;
        std::io::copy(&mut entry, &mut file)
            .map_err(|source| AcquisitionError::filesystem(&out, source))?;
        extracted.push(out);
    }

    Ok(extracted)
}

fn locate_feed(
    dir: &Path,
    source_id: &str,
    extracted: &[PathBuf],
) -> Result<PathBuf, AcquisitionError> {
    let named = format!("{source_id}.xml");
    if let Some(path) = extracted
        .iter()
        .find(|p| p.file_name().is_some_and(|name| name == named.as_str()))
    {
        return Ok(path.clone());
    }

    let xml_files = extracted
        .iter()
        .filter(|p| {
            p.extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("xml"))
        })
        .collect::<Vec<_>>();
    match xml_files.as_slice() {
        [only] => Ok((*only).clone()),
        _ => Err(AcquisitionError::MissingFeed {
            source_id: source_id.to_string(),
            dir: dir.to_path_buf(),
        }),
    }
}
