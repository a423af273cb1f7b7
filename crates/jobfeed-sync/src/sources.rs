//! Feed source records. The pipeline reads them and writes back the
//! aggregates a reconciliation produces; it never creates or removes one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use jobfeed_core::{FeedSource, FeedSourceUpdate};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[async_trait]
pub trait FeedSourceStore: Send + Sync {
    async fn get(&self, source_id: &str) -> Result<Option<FeedSource>>;

    async fn update(&self, source_id: &str, update: &FeedSourceUpdate) -> Result<FeedSource>;

    async fn list(&self) -> Result<Vec<FeedSource>>;
}

#[derive(Debug, Default)]
pub struct InMemoryFeedSourceStore {
    sources: Mutex<BTreeMap<String, FeedSource>>,
}

impl InMemoryFeedSourceStore {
    pub fn new(sources: impl IntoIterator<Item = FeedSource>) -> Self {
        Self {
            sources: Mutex::new(
                sources
                    .into_iter()
                    .map(|source| (source.source_id.clone(), source))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl FeedSourceStore for InMemoryFeedSourceStore {
    async fn get(&self, source_id: &str) -> Result<Option<FeedSource>> {
        Ok(self.sources.lock().await.get(source_id).cloned())
    }

    async fn update(&self, source_id: &str, update: &FeedSourceUpdate) -> Result<FeedSource> {
        let mut sources = self.sources.lock().await;
        let Some(source) = sources.get_mut(source_id) else {
            bail!("feed source {source_id} does not exist");
        };
        update.apply_to(source);
        Ok(source.clone())
    }

    async fn list(&self) -> Result<Vec<FeedSource>> {
        Ok(self.sources.lock().await.values().cloned().collect())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SourcesFile {
    #[serde(default)]
    sources: Vec<FeedSource>,
}

/// Sources kept in a YAML file (`sources:` list). Updates rewrite the file
/// through a temporary sibling and a rename.
#[derive(Debug)]
pub struct YamlFeedSourceStore {
    path: PathBuf,
    sources: Mutex<Vec<FeedSource>>,
}

impl YamlFeedSourceStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let file: SourcesFile = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self {
            path,
            sources: Mutex::new(file.sources),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, sources: &[FeedSource]) -> Result<()> {
        let text = serde_yaml::to_string(&SourcesFile {
            sources: sources.to_vec(),
        })
        .context("serializing feed sources")?;
        let tmp = self.path.with_extension("yaml.tmp");
        tokio::fs::write(&tmp, text)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl FeedSourceStore for YamlFeedSourceStore {
    async fn get(&self, source_id: &str) -> Result<Option<FeedSource>> {
        Ok(self
            .sources
            .lock()
            .await
            .iter()
            .find(|s| s.source_id == source_id)
            .cloned())
    }

    async fn update(&self, source_id: &str, update: &FeedSourceUpdate) -> Result<FeedSource> {
        let mut sources = self.sources.lock().await;
        let Some(index) = sources.iter().position(|s| s.source_id == source_id) else {
            bail!("feed source {source_id} is not listed in {}", self.path.display());
        };
        // Memory only changes once the file has been replaced.
        let mut staged = sources.clone();
        update.apply_to(&mut staged[index]);
        self.persist(&staged).await?;
        let updated = staged[index].clone();
        *sources = staged;
        Ok(updated)
    }

    async fn list(&self) -> Result<Vec<FeedSource>> {
        Ok(self.sources.lock().await.clone())
    }
}
