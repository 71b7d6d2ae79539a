use std::io::{self, Write};

use serde::Serialize;
use tracing::info;

use crate::checkpoint::CheckpointId;
use crate::domain::CaseId;
use crate::pipeline::{ProgressEvent, ProgressSink, RunReport};
use crate::search::Neighbor;

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub case_id: CaseId,
    pub checkpoint: Option<CheckpointId>,
    pub neighbors: Vec<Neighbor>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointEntry {
    pub id: CheckpointId,
    pub vectors: String,
    pub mapping: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointListing {
    pub dir: String,
    pub checkpoints: Vec<CheckpointEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeResult {
    pub sources: Vec<CheckpointId>,
    pub checkpoint: Option<CheckpointId>,
    pub cases: usize,
    pub dimension: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResult {
    pub data_root: String,
    pub latest_checkpoint: Option<CheckpointId>,
    pub cases: usize,
    pub dimension: Option<usize>,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_run(result: &RunReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_search(result: &SearchResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_checkpoints(result: &CheckpointListing) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_merge(result: &MergeResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_status(result: &StatusResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message),
            None => info!("{}", event.message),
        }
    }
}
