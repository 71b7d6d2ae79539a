use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{info, warn};

use crate::checkpoint::{CheckpointId, CheckpointManager};
use crate::domain::CaseId;
use crate::error::KiraError;
use crate::reducer::FeatureSpace;

#[derive(Debug, Clone, Default)]
pub struct IndexSnapshot {
    pub dimension: Option<usize>,
    pub feature_space: Option<FeatureSpace>,
    pub data: Vec<f32>,
    pub mapping: BTreeMap<CaseId, usize>,
}

impl IndexSnapshot {
    pub fn rows(&self) -> usize {
        match self.dimension {
            Some(dimension) if dimension > 0 => self.data.len() / dimension,
            _ => 0,
        }
    }

    pub fn row(&self, pos: usize) -> Option<&[f32]> {
        let dimension = self.dimension?;
        self.data.get(pos * dimension..(pos + 1) * dimension)
    }

    pub fn vector(&self, case_id: &CaseId) -> Option<&[f32]> {
        self.mapping.get(case_id).and_then(|pos| self.row(*pos))
    }

    pub fn entries_by_row(&self) -> Vec<(&CaseId, usize)> {
        let mut entries: Vec<_> = self.mapping.iter().map(|(id, pos)| (id, *pos)).collect();
        entries.sort_by_key(|(_, pos)| *pos);
        entries
    }

    pub fn validate(&self) -> Result<(), String> {
        let Some(dimension) = self.dimension else {
            if !self.data.is_empty() || !self.mapping.is_empty() {
                return Err("vectors present without a dimension".to_string());
            }
            return Ok(());
        };
        if dimension == 0 {
            return Err("dimension is zero".to_string());
        }
        if self.data.len() % dimension != 0 {
            return Err(format!(
                "{} values do not divide into rows of {dimension}",
                self.data.len()
            ));
        }
        if let Some(space) = &self.feature_space {
            if space.len() != dimension {
                return Err(format!(
                    "feature space has {} genes but dimension is {dimension}",
                    space.len()
                ));
            }
        }
        let rows = self.rows();
        let mut seen = HashSet::with_capacity(self.mapping.len());
        for (case_id, pos) in &self.mapping {
            if *pos >= rows {
                return Err(format!("case {case_id} maps to row {pos} of {rows}"));
            }
            if !seen.insert(*pos) {
                return Err(format!("row {pos} is mapped more than once"));
            }
        }
        Ok(())
    }

    /// Appends `other` after the rows already present. Case ids already mapped keep their
    /// existing vector; the incoming duplicate and any unreferenced rows are not copied.
    /// Returns the number of cases added.
    pub fn absorb(&mut self, other: IndexSnapshot) -> Result<usize, KiraError> {
        let Some(dimension) = other.dimension else {
            return Ok(0);
        };
        if let Some(expected) = self.dimension {
            if expected != dimension {
                return Err(KiraError::DimensionMismatch {
                    expected,
                    actual: dimension,
                });
            }
        }
        if let (Some(mine), Some(theirs)) = (&self.feature_space, &other.feature_space) {
            if mine != theirs {
                return Err(KiraError::Checkpoint {
                    id: "merge".to_string(),
                    message: "feature spaces differ".to_string(),
                });
            }
        }

        self.dimension = Some(dimension);
        if self.feature_space.is_none() {
            self.feature_space = other.feature_space.clone();
        }
        let mut added = 0;
        for (case_id, pos) in other.entries_by_row() {
            if self.mapping.contains_key(case_id) {
                continue;
            }
            let Some(vector) = other.row(pos) else {
                continue;
            };
            let next = self.rows();
            self.data.extend_from_slice(vector);
            self.mapping.insert(case_id.clone(), next);
            added += 1;
        }
        Ok(added)
    }
}

struct CheckpointHook {
    manager: Arc<CheckpointManager>,
    interval: usize,
}

struct IndexState {
    snapshot: IndexSnapshot,
    last_checkpoint: usize,
}

pub struct VectorIndex {
    state: RwLock<IndexState>,
    hook: Option<CheckpointHook>,
}

impl Default for VectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::from_snapshot(IndexSnapshot::default())
    }

    /// Restores from a snapshot; its rows count as already checkpointed.
    pub fn from_snapshot(snapshot: IndexSnapshot) -> Self {
        let last_checkpoint = snapshot.rows();
        Self {
            state: RwLock::new(IndexState {
                snapshot,
                last_checkpoint,
            }),
            hook: None,
        }
    }

    pub fn with_checkpoints(mut self, manager: Arc<CheckpointManager>, interval: usize) -> Self {
        self.hook = Some(CheckpointHook {
            manager,
            interval: interval.max(1),
        });
        self
    }

    pub fn add(&self, case_id: CaseId, vector: Vec<f32>) -> Result<usize, KiraError> {
        let mut state = self.write()?;
        if vector.is_empty() {
            return Err(KiraError::EmptyVector(case_id.to_string()));
        }
        if state.snapshot.mapping.contains_key(&case_id) {
            return Err(KiraError::DuplicateCase(case_id.to_string()));
        }
        if let Some(expected) = state.snapshot.dimension {
            if expected != vector.len() {
                return Err(KiraError::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                });
            }
        }

        let snapshot = &mut state.snapshot;
        snapshot.dimension = Some(vector.len());
        let pos = snapshot.rows();
        snapshot.data.extend_from_slice(&vector);
        snapshot.mapping.insert(case_id, pos);

        if let Some(hook) = &self.hook {
            let rows = state.snapshot.rows();
            if rows - state.last_checkpoint >= hook.interval {
                match hook.manager.save(&state.snapshot) {
                    Ok(id) => {
                        info!(checkpoint = %id, rows, "interval checkpoint written");
                        state.last_checkpoint = rows;
                    }
                    Err(err) => warn!(error = %err, rows, "interval checkpoint failed"),
                }
            }
        }
        Ok(pos)
    }

    pub fn get(&self, case_id: &CaseId) -> Option<Vec<f32>> {
        let state = self.read().ok()?;
        state.snapshot.vector(case_id).map(<[f32]>::to_vec)
    }

    pub fn contains(&self, case_id: &CaseId) -> bool {
        self.read()
            .map(|state| state.snapshot.mapping.contains_key(case_id))
            .unwrap_or(false)
    }

    pub fn size(&self) -> usize {
        self.read().map(|state| state.snapshot.rows()).unwrap_or(0)
    }

    pub fn dimension(&self) -> Option<usize> {
        self.read().ok().and_then(|state| state.snapshot.dimension)
    }

    pub fn feature_space(&self) -> Option<FeatureSpace> {
        self.read()
            .ok()
            .and_then(|state| state.snapshot.feature_space.clone())
    }

    pub fn establish_feature_space(
        &self,
        candidate: FeatureSpace,
    ) -> Result<FeatureSpace, KiraError> {
        let mut state = self.write()?;
        if let Some(existing) = &state.snapshot.feature_space {
            return Ok(existing.clone());
        }
        if let Some(expected) = state.snapshot.dimension {
            if expected != candidate.len() {
                return Err(KiraError::DimensionMismatch {
                    expected,
                    actual: candidate.len(),
                });
            }
        }
        info!(genes = candidate.len(), "feature space established");
        state.snapshot.feature_space = Some(candidate.clone());
        Ok(candidate)
    }

    pub fn read_with<R>(&self, f: impl FnOnce(&IndexSnapshot) -> R) -> Result<R, KiraError> {
        let state = self.read()?;
        Ok(f(&state.snapshot))
    }

    pub fn snapshot(&self) -> Result<IndexSnapshot, KiraError> {
        self.read_with(IndexSnapshot::clone)
    }

    pub fn checkpoint(&self) -> Result<Option<CheckpointId>, KiraError> {
        let Some(hook) = &self.hook else {
            return Ok(None);
        };
        let mut state = self.write()?;
        let rows = state.snapshot.rows();
        if rows == 0 || rows == state.last_checkpoint {
            return Ok(None);
        }
        let id = hook.manager.save(&state.snapshot)?;
        state.last_checkpoint = rows;
        Ok(Some(id))
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, IndexState>, KiraError> {
        self.state
            .read()
            .map_err(|_| KiraError::IndexUnavailable("index lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, IndexState>, KiraError> {
        self.state
            .write()
            .map_err(|_| KiraError::IndexUnavailable("index lock poisoned".to_string()))
    }
}
