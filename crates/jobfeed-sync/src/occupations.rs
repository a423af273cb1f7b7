//! ONET to MOC resolution with per-source overrides.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use jobfeed_core::{MocRecord, MocSet, ResolvedOccupations, SourceOverrideMapping};
use serde::Deserialize;
use thiserror::Error;

/// Read-only occupation reference data.
pub trait OccupationStore: Send + Sync {
    /// MOC records whose ONET membership intersects `onet_codes`.
    fn standard_mocs(&self, onet_codes: &BTreeSet<String>) -> Vec<MocRecord>;

    fn source_overrides(&self, source_id: &str) -> Vec<SourceOverrideMapping>;

    /// Every record carrying `code`; a code can exist in several branches.
    fn mocs_by_code(&self, code: &str) -> Vec<MocRecord>;

    fn onet_exists(&self, code: &str) -> bool;
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OccupationCatalog {
    #[serde(default)]
    pub mocs: Vec<MocRecord>,
    #[serde(default)]
    pub onets: Vec<OnetEntry>,
    #[serde(default)]
    pub overrides: Vec<SourceOverrideMapping>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OnetEntry {
    pub code: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryOccupationStore {
    mocs: Vec<MocRecord>,
    onets: BTreeSet<String>,
    overrides: BTreeMap<String, Vec<SourceOverrideMapping>>,
}

impl InMemoryOccupationStore {
    pub fn new(catalog: OccupationCatalog) -> Self {
        let mut onets = catalog
            .onets
            .into_iter()
            .map(|entry| entry.code)
            .collect::<BTreeSet<_>>();
        for moc in &catalog.mocs {
            onets.extend(moc.onets.iter().cloned());
        }
        let mut overrides: BTreeMap<String, Vec<SourceOverrideMapping>> = BTreeMap::new();
        for mapping in catalog.overrides {
            overrides
                .entry(mapping.source_id.clone())
                .or_default()
                .push(mapping);
        }
        Self {
            mocs: catalog.mocs,
            onets,
            overrides,
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let catalog: OccupationCatalog =
            serde_yaml::from_str(text).context("parsing occupation catalog")?;
        Ok(Self::new(catalog))
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }
}

impl OccupationStore for InMemoryOccupationStore {
    fn standard_mocs(&self, onet_codes: &BTreeSet<String>) -> Vec<MocRecord> {
        self.mocs
            .iter()
            .filter(|moc| !moc.onets.is_disjoint(onet_codes))
            .cloned()
            .collect()
    }

    fn source_overrides(&self, source_id: &str) -> Vec<SourceOverrideMapping> {
        self.overrides.get(source_id).cloned().unwrap_or_default()
    }

    fn mocs_by_code(&self, code: &str) -> Vec<MocRecord> {
        self.mocs.iter().filter(|moc| moc.code == code).cloned().collect()
    }

    fn onet_exists(&self, code: &str) -> bool {
        self.onets.contains(code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingInconsistency {
    #[error("override {onet_code} -> {moc_code} for source {source_id} targets an unknown MOC")]
    UnknownMoc { source_id: String, onet_code: String, moc_code: String },
    #[error("override {onet_code} -> {moc_code} for source {source_id} names an unknown ONET code")]
    UnknownOnet { source_id: String, onet_code: String, moc_code: String },
}

#[derive(Clone)]
pub struct OccupationResolver {
    store: Arc<dyn OccupationStore>,
}

impl OccupationResolver {
    pub fn new(store: Arc<dyn OccupationStore>) -> Self {
        Self { store }
    }

    /// Loads a source's overrides once so a whole feed can be resolved
    /// without re-reading them per job.
    pub fn for_source(&self, source_id: &str) -> SourceMappings {
        SourceMappings::load(Arc::clone(&self.store), source_id)
    }

    pub fn resolve(&self, source_id: &str, onet_codes: &BTreeSet<String>) -> ResolvedOccupations {
        self.for_source(source_id).resolve(onet_codes)
    }
}

/// Overrides for one source, with their targets already looked up.
pub struct SourceMappings {
    store: Arc<dyn OccupationStore>,
    source_id: String,
    overrides: Vec<SourceOverrideMapping>,
    targets: BTreeMap<String, Vec<MocRecord>>,
    overridden_onets: BTreeSet<String>,
    inconsistencies: Vec<MappingInconsistency>,
}

impl SourceMappings {
    fn load(store: Arc<dyn OccupationStore>, source_id: &str) -> Self {
        let mut overrides = Vec::new();
        let mut targets: BTreeMap<String, Vec<MocRecord>> = BTreeMap::new();
        let mut inconsistencies = Vec::new();

        for mapping in store.source_overrides(source_id) {
            let fields = || {
                (
                    mapping.source_id.clone(),
                    mapping.onet_code.clone(),
                    mapping.moc_code.clone(),
                )
            };
            if !store.onet_exists(&mapping.onet_code) {
                let (source_id, onet_code, moc_code) = fields();
                inconsistencies.push(MappingInconsistency::UnknownOnet {
                    source_id,
                    onet_code,
                    moc_code,
                });
                continue;
            }
            let mocs = store.mocs_by_code(&mapping.moc_code);
            if mocs.is_empty() {
                let (source_id, onet_code, moc_code) = fields();
                inconsistencies.push(MappingInconsistency::UnknownMoc {
                    source_id,
                    onet_code,
                    moc_code,
                });
                continue;
            }
            targets.entry(mapping.onet_code.clone()).or_default().extend(mocs);
            overrides.push(mapping);
        }

        for inconsistency in &inconsistencies {
            tracing::warn!(source_id, %inconsistency, "skipping occupation override");
        }

        // Only overrides that resolved take part in matching and exclusion.
        let overridden_onets = overrides.iter().map(|m| m.onet_code.clone()).collect();
        Self {
            store,
            source_id: source_id.to_string(),
            overrides,
            targets,
            overridden_onets,
            inconsistencies,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn inconsistencies(&self) -> &[MappingInconsistency] {
        &self.inconsistencies
    }

    /// Standard MOCs come straight from ONET membership. Once any valid
    /// override for this source matches the job, every standard MOC tied to
    /// an overridden ONET code (for any valid override of the source, not
    /// only the matching ones) is replaced by the override targets.
    pub fn resolve(&self, onet_codes: &BTreeSet<String>) -> ResolvedOccupations {
        let standard = self.store.standard_mocs(onet_codes);
        let matching = self
            .overrides
            .iter()
            .filter(|m| onet_codes.contains(&m.onet_code))
            .collect::<Vec<_>>();

        if matching.is_empty() {
            let set = MocSet::from_records(&standard);
            return ResolvedOccupations {
                standard: set.clone(),
                mapped: set,
            };
        }

        let overridden = matching
            .iter()
            .filter_map(|m| self.targets.get(&m.onet_code))
            .flatten()
            .collect::<Vec<_>>();
        let unmapped = standard
            .iter()
            .filter(|moc| moc.onets.is_disjoint(&self.overridden_onets));

        ResolvedOccupations {
            standard: MocSet::from_records(&standard),
            mapped: MocSet::from_records(unmapped.chain(overridden)),
        }
    }
}
