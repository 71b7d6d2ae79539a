use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::checkpoint::{CheckpointId, CheckpointManager};
use crate::domain::CaseId;
use crate::error::KiraError;
use crate::index::{IndexSnapshot, VectorIndex};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Neighbor {
    pub case_id: CaseId,
    pub score: f32,
}

pub trait NeighborSearch: Send + Sync {
    /// At most `k` neighbours, best first, never including `case_id`. Empty when the case or
    /// the index is unavailable.
    fn search(&self, case_id: &CaseId, k: usize) -> Vec<Neighbor>;
}

#[derive(Clone)]
pub struct FlatCosineSearch {
    index: Arc<VectorIndex>,
}

impl FlatCosineSearch {
    pub fn new(index: Arc<VectorIndex>) -> Self {
        Self { index }
    }

    pub fn from_latest(manager: &CheckpointManager) -> Option<(CheckpointId, Self)> {
        let loaded = manager.load_latest()?;
        let search = Self::new(Arc::new(VectorIndex::from_snapshot(loaded.snapshot)));
        Some((loaded.id, search))
    }

    pub fn from_checkpoint(
        manager: &CheckpointManager,
        id: &CheckpointId,
    ) -> Result<Self, KiraError> {
        let snapshot = manager.load(id)?;
        Ok(Self::new(Arc::new(VectorIndex::from_snapshot(snapshot))))
    }

    pub fn index_size(&self) -> usize {
        self.index.size()
    }

    pub fn try_search(&self, case_id: &CaseId, k: usize) -> Result<Vec<Neighbor>, KiraError> {
        self.index
            .read_with(|snapshot| rank(snapshot, case_id, k))?
    }
}

impl NeighborSearch for FlatCosineSearch {
    fn search(&self, case_id: &CaseId, k: usize) -> Vec<Neighbor> {
        match self.try_search(case_id, k) {
            Ok(neighbors) => neighbors,
            Err(err) => {
                warn!(case_id = %case_id, error = %err, "similarity search failed");
                Vec::new()
            }
        }
    }
}

fn rank(snapshot: &IndexSnapshot, case_id: &CaseId, k: usize) -> Result<Vec<Neighbor>, KiraError> {
    let query = snapshot
        .vector(case_id)
        .ok_or_else(|| KiraError::CaseNotIndexed(case_id.to_string()))?;
    let query_norm = norm(query);

    let mut scored: Vec<(&CaseId, f32)> = snapshot
        .entries_by_row()
        .into_iter()
        .filter(|(candidate, _)| *candidate != case_id)
        .filter_map(|(candidate, pos)| {
            let row = snapshot.row(pos)?;
            Some((candidate, cosine(query, query_norm, row)))
        })
        .collect();
    // stable: equal scores keep stored row order
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.truncate(k);

    debug!(case_id = %case_id, k, returned = scored.len(), "similarity search");
    Ok(scored
        .into_iter()
        .map(|(candidate, score)| Neighbor {
            case_id: candidate.clone(),
            score,
        })
        .collect())
}

fn norm(vector: &[f32]) -> f64 {
    vector
        .iter()
        .map(|v| f64::from(*v) * f64::from(*v))
        .sum::<f64>()
        .sqrt()
}

/// Zero-length vectors have no direction and score 0.
fn cosine(query: &[f32], query_norm: f64, other: &[f32]) -> f32 {
    let other_norm = norm(other);
    if query_norm == 0.0 || other_norm == 0.0 {
        return 0.0;
    }
    let dot: f64 = query
        .iter()
        .zip(other)
        .map(|(a, b)| f64::from(*a) * f64::from(*b))
        .sum();
    (dot / (query_norm * other_norm)).clamp(-1.0, 1.0) as f32
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    cosine(a, norm(a), b)
}
