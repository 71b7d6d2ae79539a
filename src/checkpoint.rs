use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::str::FromStr;
use std::sync::{LazyLock, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::CaseId;
use crate::error::KiraError;
use crate::index::IndexSnapshot;
use crate::reducer::FeatureSpace;
use crate::store::Store;

const ID_FORMAT: &str = "%Y%m%d_%H%M%S_%6f";
const VECTOR_FORMAT_VERSION: u32 = 1;

static ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{8}_\d{6}_\d{6}$").expect("valid checkpoint id regex"));
static VECTORS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^vectors_(\d{8}_\d{6}_\d{6})\.bin$").expect("valid vectors file regex")
});
static MAPPING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^mapping_(\d{8}_\d{6}_\d{6})\.json$").expect("valid mapping file regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(into = "String")]
pub struct CheckpointId(String);

impl CheckpointId {
    fn from_time(time: DateTime<Utc>) -> Self {
        Self(time.format(ID_FORMAT).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn timestamp(&self) -> Option<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(&self.0, ID_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CheckpointId {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if !ID_RE.is_match(trimmed) {
            return Err(KiraError::InvalidCheckpointId(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl From<CheckpointId> for String {
    fn from(value: CheckpointId) -> Self {
        value.0
    }
}

#[derive(Serialize)]
struct VectorArtifactRef<'a> {
    format_version: u32,
    dimension: Option<usize>,
    genes: Option<&'a [String]>,
    data: &'a [f32],
}

#[derive(Deserialize)]
struct VectorArtifact {
    format_version: u32,
    dimension: Option<usize>,
    genes: Option<Vec<String>>,
    data: Vec<f32>,
}

#[derive(Debug)]
pub struct LoadedCheckpoint {
    pub id: CheckpointId,
    pub snapshot: IndexSnapshot,
}

#[derive(Debug)]
pub struct CheckpointManager {
    dir: Utf8PathBuf,
    keep: usize,
    last_stamp: Mutex<Option<DateTime<Utc>>>,
}

impl CheckpointManager {
    pub fn new(dir: Utf8PathBuf, keep: usize) -> Self {
        Self {
            dir,
            keep: keep.max(1),
            last_stamp: Mutex::new(None),
        }
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    pub fn vectors_path(&self, id: &CheckpointId) -> Utf8PathBuf {
        self.dir.join(format!("vectors_{id}.bin"))
    }

    pub fn mapping_path(&self, id: &CheckpointId) -> Utf8PathBuf {
        self.dir.join(format!("mapping_{id}.json"))
    }

    pub fn save(&self, snapshot: &IndexSnapshot) -> Result<CheckpointId, KiraError> {
        let id = self.next_id()?;
        let fail = |message: String| KiraError::Checkpoint {
            id: id.to_string(),
            message,
        };

        let genes = snapshot.feature_space.as_ref().map(FeatureSpace::genes);
        let artifact = VectorArtifactRef {
            format_version: VECTOR_FORMAT_VERSION,
            dimension: snapshot.dimension,
            genes,
            data: &snapshot.data,
        };
        let vectors = bincode::serialize(&artifact).map_err(|err| fail(err.to_string()))?;
        let mapping: BTreeMap<&str, usize> = snapshot
            .mapping
            .iter()
            .map(|(case_id, pos)| (case_id.as_str(), *pos))
            .collect();
        let mapping = serde_json::to_vec(&mapping).map_err(|err| fail(err.to_string()))?;

        Store::write_bytes_atomic(&self.vectors_path(&id), &vectors)?;
        Store::write_bytes_atomic(&self.mapping_path(&id), &mapping)?;
        info!(
            checkpoint = %id,
            rows = snapshot.rows(),
            cases = snapshot.mapping.len(),
            "checkpoint saved"
        );

        self.prune();
        Ok(id)
    }

    pub fn list(&self) -> Result<Vec<CheckpointId>, KiraError> {
        let (vectors, mappings) = self.scan()?;
        Ok(vectors.intersection(&mappings).cloned().collect())
    }

    pub fn load(&self, id: &CheckpointId) -> Result<IndexSnapshot, KiraError> {
        let fail = |message: String| KiraError::Checkpoint {
            id: id.to_string(),
            message,
        };

        let vectors_path = self.vectors_path(id);
        let mapping_path = self.mapping_path(id);
        if !vectors_path.as_std_path().exists() || !mapping_path.as_std_path().exists() {
            return Err(fail("incomplete pair".to_string()));
        }

        let bytes = fs::read(vectors_path.as_std_path())
            .map_err(|err| fail(format!("read {vectors_path}: {err}")))?;
        let artifact: VectorArtifact =
            bincode::deserialize(&bytes).map_err(|err| fail(format!("decode vectors: {err}")))?;
        drop(bytes);
        if artifact.format_version != VECTOR_FORMAT_VERSION {
            return Err(fail(format!(
                "unsupported vector format version {}",
                artifact.format_version
            )));
        }

        let content = fs::read_to_string(mapping_path.as_std_path())
            .map_err(|err| fail(format!("read {mapping_path}: {err}")))?;
        let mapping: BTreeMap<CaseId, usize> =
            serde_json::from_str(&content).map_err(|err| fail(format!("decode mapping: {err}")))?;

        let snapshot = IndexSnapshot {
            dimension: artifact.dimension,
            feature_space: artifact.genes.map(FeatureSpace::new),
            data: artifact.data,
            mapping,
        };
        snapshot.validate().map_err(fail)?;
        Ok(snapshot)
    }

    pub fn load_latest(&self) -> Option<LoadedCheckpoint> {
        let ids = match self.list() {
            Ok(ids) => ids,
            Err(err) => {
                warn!(error = %err, dir = %self.dir, "cannot scan checkpoints");
                return None;
            }
        };
        for id in ids.into_iter().rev() {
            match self.load(&id) {
                Ok(snapshot) => {
                    info!(checkpoint = %id, rows = snapshot.rows(), "checkpoint loaded");
                    return Some(LoadedCheckpoint { id, snapshot });
                }
                Err(err) => warn!(error = %err, "skipping unusable checkpoint"),
            }
        }
        None
    }

    /// Combines pairs in the given order. A case id keeps the vector of the first pair that
    /// mentions it; pairs that fail to load or do not fit are logged and skipped.
    pub fn merge(&self, ids: &[CheckpointId]) -> Result<IndexSnapshot, KiraError> {
        let mut combined = IndexSnapshot::default();
        for id in ids {
            let snapshot = match self.load(id) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    warn!(error = %err, "skipping checkpoint in merge");
                    continue;
                }
            };
            let incoming = snapshot.mapping.len();
            match combined.absorb(snapshot) {
                Ok(added) => info!(
                    checkpoint = %id,
                    added,
                    duplicates = incoming - added,
                    "checkpoint merged"
                ),
                Err(err) => warn!(checkpoint = %id, error = %err, "skipping checkpoint in merge"),
            }
        }
        Ok(combined)
    }

    pub fn consolidate(&self) -> Result<Option<(CheckpointId, IndexSnapshot)>, KiraError> {
        let ids = self.list()?;
        if ids.is_empty() {
            return Ok(None);
        }
        let merged = self.merge(&ids)?;
        let id = self.save(&merged)?;
        Ok(Some((id, merged)))
    }

    fn scan(&self) -> Result<(BTreeSet<CheckpointId>, BTreeSet<CheckpointId>), KiraError> {
        let mut vectors = BTreeSet::new();
        let mut mappings = BTreeSet::new();
        if !self.dir.as_std_path().exists() {
            return Ok((vectors, mappings));
        }
        let entries = fs::read_dir(self.dir.as_std_path()).map_err(KiraError::filesystem)?;
        for entry in entries {
            let entry = entry.map_err(KiraError::filesystem)?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(caps) = VECTORS_RE.captures(name) {
                vectors.insert(CheckpointId(caps[1].to_string()));
            } else if let Some(caps) = MAPPING_RE.captures(name) {
                mappings.insert(CheckpointId(caps[1].to_string()));
            }
        }
        Ok((vectors, mappings))
    }

    fn prune(&self) {
        let (vectors, mappings) = match self.scan() {
            Ok(found) => found,
            Err(err) => {
                warn!(error = %err, "cannot scan checkpoints for retention");
                return;
            }
        };
        let pairs: Vec<_> = vectors.intersection(&mappings).cloned().collect();
        let stale = pairs.len().saturating_sub(self.keep);
        for id in &pairs[..stale] {
            self.remove(&self.vectors_path(id));
            self.remove(&self.mapping_path(id));
        }

        // half pairs older than the newest complete pair are leftovers of interrupted saves
        let Some(newest) = pairs.last() else {
            return;
        };
        for id in vectors.difference(&mappings).filter(|id| *id < newest) {
            self.remove(&self.vectors_path(id));
        }
        for id in mappings.difference(&vectors).filter(|id| *id < newest) {
            self.remove(&self.mapping_path(id));
        }
    }

    fn remove(&self, path: &Utf8Path) {
        match fs::remove_file(path.as_std_path()) {
            Ok(()) => info!(file = %path, "removed old checkpoint file"),
            Err(err) => warn!(file = %path, error = %err, "cannot remove old checkpoint file"),
        }
    }

    /// Strictly increasing ids even when saves land in the same microsecond.
    fn next_id(&self) -> Result<CheckpointId, KiraError> {
        let mut last = self
            .last_stamp
            .lock()
            .map_err(|_| KiraError::Filesystem("checkpoint clock poisoned".to_string()))?;
        let floor = (*last)
            .or_else(|| self.latest_on_disk())
            .map(|stamp| stamp + TimeDelta::microseconds(1));
        let now = Utc::now();
        let stamp = match floor {
            Some(floor) if floor > now => floor,
            _ => now,
        };
        *last = Some(stamp);
        Ok(CheckpointId::from_time(stamp))
    }

    fn latest_on_disk(&self) -> Option<DateTime<Utc>> {
        let (vectors, mappings) = self.scan().ok()?;
        vectors
            .into_iter()
            .chain(mappings)
            .filter_map(|id| id.timestamp())
            .max()
    }
}
