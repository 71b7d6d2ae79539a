use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::sync::Arc;

use flate2::read::MultiGzDecoder;
use tracing::debug;

use crate::error::KiraError;

pub const ACCOUNTING_ROWS: [&str; 4] = ["N_unmapped", "N_multimapping", "N_noFeature", "N_ambiguous"];

#[derive(Debug, Clone)]
pub struct FeatureSpace {
    genes: Arc<[String]>,
    positions: Arc<HashMap<String, usize>>,
}

impl FeatureSpace {
    /// Repeated genes keep their first position.
    pub fn new(genes: impl IntoIterator<Item = String>) -> Self {
        let mut ordered = Vec::new();
        let mut positions = HashMap::new();
        for gene in genes {
            if !positions.contains_key(&gene) {
                positions.insert(gene.clone(), ordered.len());
                ordered.push(gene);
            }
        }
        Self {
            genes: ordered.into(),
            positions: Arc::new(positions),
        }
    }

    pub fn genes(&self) -> &[String] {
        &self.genes
    }

    pub fn len(&self) -> usize {
        self.genes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genes.is_empty()
    }

    pub fn position(&self, gene: &str) -> Option<usize> {
        self.positions.get(gene).copied()
    }
}

impl PartialEq for FeatureSpace {
    fn eq(&self, other: &Self) -> bool {
        self.genes == other.genes
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneCounts {
    genes: Vec<String>,
    counts: Vec<f32>,
}

impl GeneCounts {
    pub fn len(&self) -> usize {
        self.genes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genes.is_empty()
    }

    pub fn genes(&self) -> &[String] {
        &self.genes
    }

    pub fn counts(&self) -> &[f32] {
        &self.counts
    }

    pub fn get(&self, gene: &str) -> Option<f32> {
        self.genes
            .iter()
            .position(|candidate| candidate == gene)
            .map(|pos| self.counts[pos])
    }

    pub fn feature_space(&self) -> FeatureSpace {
        FeatureSpace::new(self.genes.iter().cloned())
    }

    /// Re-indexes onto `space`: absent genes become 0, genes outside the space are dropped.
    pub fn align(&self, space: &FeatureSpace) -> Vec<f32> {
        let mut vector = vec![0.0f32; space.len()];
        let mut filled = vec![false; space.len()];
        for (gene, count) in self.genes.iter().zip(&self.counts) {
            if let Some(pos) = space.position(gene) {
                if !filled[pos] {
                    vector[pos] = *count;
                    filled[pos] = true;
                }
            }
        }
        vector
    }

    fn append(&mut self, mut other: GeneCounts) {
        self.genes.append(&mut other.genes);
        self.counts.append(&mut other.counts);
    }
}

#[derive(Debug, Clone)]
pub struct CountReducer {
    chunk_rows: usize,
    count_column: String,
}

impl Default for CountReducer {
    fn default() -> Self {
        Self::new(10_000, "unstranded")
    }
}

impl CountReducer {
    pub fn new(chunk_rows: usize, count_column: impl Into<String>) -> Self {
        Self {
            chunk_rows: chunk_rows.max(1),
            count_column: count_column.into(),
        }
    }

    pub fn reduce(&self, path: &Path) -> Result<GeneCounts, KiraError> {
        let label = path.display().to_string();
        let file = File::open(path)
            .map_err(|err| KiraError::Filesystem(format!("open {label}: {err}")))?;
        let is_gzip = path.extension().is_some_and(|ext| ext == "gz");
        let reader: Box<dyn Read> = if is_gzip {
            Box::new(MultiGzDecoder::new(file))
        } else {
            Box::new(file)
        };
        self.reduce_reader(BufReader::new(reader), &label)
    }

    pub fn reduce_aligned(
        &self,
        path: &Path,
        space: Option<&FeatureSpace>,
    ) -> Result<Vec<f32>, KiraError> {
        let counts = self.reduce(path)?;
        Ok(match space {
            Some(space) => counts.align(space),
            None => counts.counts,
        })
    }

    pub fn reduce_reader<R: BufRead>(
        &self,
        mut reader: R,
        label: &str,
    ) -> Result<GeneCounts, KiraError> {
        let mut line = String::new();

        // gene-model comment
        if read_line(&mut reader, &mut line, label)? == 0 {
            return Err(KiraError::MissingHeader(label.to_string()));
        }
        if read_line(&mut reader, &mut line, label)? == 0 {
            return Err(KiraError::MissingHeader(label.to_string()));
        }
        let column = line
            .trim_end_matches(['\r', '\n'])
            .split('\t')
            .position(|name| name.trim() == self.count_column)
            .filter(|pos| *pos > 0)
            .ok_or_else(|| KiraError::MissingColumn(label.to_string(), self.count_column.clone()))?;

        let mut retained = GeneCounts::default();
        let mut chunk: Vec<String> = Vec::with_capacity(self.chunk_rows);
        let mut rows = 0usize;
        let mut chunks = 0usize;
        loop {
            let read = read_line(&mut reader, &mut line, label)?;
            if read > 0 {
                let row = line.trim_end_matches(['\r', '\n']);
                if !row.is_empty() {
                    chunk.push(row.to_string());
                }
            }
            if chunk.len() >= self.chunk_rows || (read == 0 && !chunk.is_empty()) {
                rows += chunk.len();
                chunks += 1;
                retained.append(filter_chunk(&chunk, column));
                chunk.clear();
            }
            if read == 0 {
                break;
            }
        }
        drop(chunk);

        debug!(
            file = label,
            rows,
            chunks,
            retained = retained.len(),
            "reduced count table"
        );

        if retained.is_empty() {
            return Err(KiraError::EmptyCounts(label.to_string()));
        }
        retained.genes.shrink_to_fit();
        retained.counts.shrink_to_fit();
        Ok(retained)
    }
}

fn read_line<R: BufRead>(reader: &mut R, line: &mut String, label: &str) -> Result<usize, KiraError> {
    line.clear();
    reader
        .read_line(line)
        .map_err(|err| KiraError::Filesystem(format!("read {label}: {err}")))
}

fn filter_chunk(rows: &[String], column: usize) -> GeneCounts {
    let mut kept = GeneCounts::default();
    for row in rows {
        let mut fields = row.split('\t');
        let gene = match fields.next().map(str::trim) {
            Some(gene) if !gene.is_empty() => gene,
            _ => continue,
        };
        if ACCOUNTING_ROWS.contains(&gene) {
            continue;
        }
        let Some(raw) = fields.nth(column - 1) else {
            continue;
        };
        let Ok(count) = raw.trim().parse::<f64>() else {
            continue;
        };
        if !count.is_finite() || count == 0.0 {
            continue;
        }
        kept.genes.push(gene.to_string());
        kept.counts.push(count as f32);
    }
    kept
}
