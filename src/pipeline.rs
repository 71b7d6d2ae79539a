use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use futures::future::join_all;
use futures::stream;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointId, CheckpointManager};
use crate::config::ResolvedConfig;
use crate::domain::{CaseId, FileId, ProjectId, ProjectSummary, WorkUnit};
use crate::download::Downloader;
use crate::error::KiraError;
use crate::gdc::DiscoveryClient;
use crate::index::VectorIndex;
use crate::reducer::{CountReducer, GeneCounts};
use crate::retry::RetryPolicy;
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub min_cases: u64,
    pub case_concurrency: usize,
    pub case_delay: Duration,
    pub download_timeout: Duration,
    pub max_concurrent_projects: usize,
    pub reduce_workers: usize,
    pub checkpoint_interval: usize,
    pub checkpoint_keep: usize,
    pub skip_indexed_cases: bool,
    pub retry: RetryPolicy,
    pub reducer: CountReducer,
}

impl PipelineSettings {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            min_cases: config.min_cases,
            case_concurrency: config.case_concurrency,
            case_delay: config.case_delay,
            download_timeout: config.download_timeout,
            max_concurrent_projects: config.max_concurrent_projects,
            reduce_workers: config.reduce_workers,
            checkpoint_interval: config.checkpoint_interval,
            checkpoint_keep: config.checkpoint_keep,
            skip_indexed_cases: config.skip_indexed_cases,
            retry: RetryPolicy::new(config.retry_attempts, config.retry_base_delay),
            reducer: CountReducer::new(config.chunk_rows, config.count_column.clone()),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&ResolvedConfig::default())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CaseOutcome {
    pub project_id: ProjectId,
    pub case_id: CaseId,
    pub file_id: FileId,
    pub row: usize,
    pub genes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub processed: Vec<CaseOutcome>,
    pub index_size: usize,
    pub restored_from: Option<CheckpointId>,
    pub checkpoint: Option<CheckpointId>,
}

pub struct Pipeline<D: DiscoveryClient, F: Downloader> {
    discovery: D,
    downloader: F,
    store: Store,
    settings: PipelineSettings,
    checkpoints: Arc<CheckpointManager>,
    index: Arc<VectorIndex>,
    restored_from: Option<CheckpointId>,
    reduce_slots: Semaphore,
}

impl<D: DiscoveryClient, F: Downloader> Pipeline<D, F> {
    pub fn open(discovery: D, downloader: F, store: Store, settings: PipelineSettings) -> Self {
        let checkpoints = Arc::new(CheckpointManager::new(
            store.checkpoint_dir(),
            settings.checkpoint_keep,
        ));
        let (snapshot, restored_from) = match checkpoints.load_latest() {
            Some(loaded) => {
                info!(checkpoint = %loaded.id, rows = loaded.snapshot.rows(), "resuming from checkpoint");
                (loaded.snapshot, Some(loaded.id))
            }
            None => {
                info!("no checkpoint found, starting fresh");
                (Default::default(), None)
            }
        };
        let index = Arc::new(
            VectorIndex::from_snapshot(snapshot)
                .with_checkpoints(Arc::clone(&checkpoints), settings.checkpoint_interval),
        );
        let reduce_slots = Semaphore::new(settings.reduce_workers.max(1));
        Self {
            discovery,
            downloader,
            store,
            settings,
            checkpoints,
            index,
            restored_from,
            reduce_slots,
        }
    }

    pub fn index(&self) -> Arc<VectorIndex> {
        Arc::clone(&self.index)
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn restored_from(&self) -> Option<&CheckpointId> {
        self.restored_from.as_ref()
    }

    pub async fn run(&self, sink: &dyn ProgressSink) -> Result<RunReport, KiraError> {
        let start = Instant::now();
        if let Err(err) = self.store.ensure_layout() {
            warn!(error = %err, "cannot prepare data root");
        }

        let outcome = self
            .settings
            .retry
            .run(|attempt| self.run_once(attempt, sink))
            .await;

        let checkpoint = match self.final_checkpoint().await {
            Ok(id) => id,
            Err(err) => {
                warn!(error = %err, "final checkpoint failed");
                None
            }
        };
        sink.event(ProgressEvent {
            message: format!("phase=Done; index_size={}", self.index.size()),
            elapsed: Some(start.elapsed()),
        });

        let processed = outcome?;
        Ok(RunReport {
            processed,
            index_size: self.index.size(),
            restored_from: self.restored_from.clone(),
            checkpoint,
        })
    }

    pub async fn discover(&self) -> Result<Vec<ProjectSummary>, KiraError> {
        let projects = self.discovery.list_projects().await?;
        let total = projects.len();
        let eligible: Vec<_> = projects
            .into_iter()
            .filter(|project| {
                let keep = project.meets_threshold(self.settings.min_cases);
                if !keep {
                    debug!(
                        project_id = %project.project_id,
                        case_count = ?project.case_count,
                        "project below case threshold"
                    );
                }
                keep
            })
            .collect();
        info!(total, eligible = eligible.len(), "projects discovered");
        Ok(eligible)
    }

    async fn run_once(
        &self,
        attempt: u32,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<CaseOutcome>, KiraError> {
        sink.event(ProgressEvent {
            message: format!("phase=Discover; attempt {attempt}"),
            elapsed: None,
        });
        let projects = self.discover().await?;
        let results: Vec<Vec<CaseOutcome>> = stream::iter(projects)
            .map(|project| self.process_project(project.project_id, sink))
            .buffer_unordered(self.settings.max_concurrent_projects.max(1))
            .collect()
            .await;
        Ok(results.into_iter().flatten().collect())
    }

    async fn process_project(
        &self,
        project_id: ProjectId,
        sink: &dyn ProgressSink,
    ) -> Vec<CaseOutcome> {
        let cases = match self.discovery.list_cases(&project_id).await {
            Ok(cases) => cases,
            Err(err) => {
                warn!(project_id = %project_id, error = %err, "cannot list cases");
                return Vec::new();
            }
        };
        sink.event(ProgressEvent {
            message: format!("phase=Project; {project_id} cases={}", cases.len()),
            elapsed: None,
        });

        // FIFO permits keep discovery order when only one case runs at a time.
        let limiter = Semaphore::new(self.settings.case_concurrency.max(1));
        let tasks = cases.into_iter().map(|case| {
            let limiter = &limiter;
            let project_id = &project_id;
            async move {
                let _permit = limiter.acquire().await.ok()?;
                tokio::time::sleep(self.settings.case_delay).await;
                self.process_case(project_id, case.case_id, sink).await
            }
        });
        let processed: Vec<_> = join_all(tasks).await.into_iter().flatten().collect();
        info!(project_id = %project_id, processed = processed.len(), "project finished");
        processed
    }

    async fn process_case(
        &self,
        project_id: &ProjectId,
        case_id: CaseId,
        sink: &dyn ProgressSink,
    ) -> Option<CaseOutcome> {
        let start = Instant::now();
        match self.try_process_case(project_id, case_id.clone()).await {
            Ok(Some(outcome)) => {
                sink.event(ProgressEvent {
                    message: format!("phase=Index; {} row={}", outcome.case_id, outcome.row),
                    elapsed: Some(start.elapsed()),
                });
                Some(outcome)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(project_id = %project_id, case_id = %case_id, error = %err, "case failed");
                None
            }
        }
    }

    async fn try_process_case(
        &self,
        project_id: &ProjectId,
        case_id: CaseId,
    ) -> Result<Option<CaseOutcome>, KiraError> {
        if self.settings.skip_indexed_cases && self.indexed(&case_id).await? {
            debug!(case_id = %case_id, "already indexed, skipping");
            return Ok(None);
        }
        let file = self
            .discovery
            .resolve_file(&case_id)
            .await?
            .ok_or_else(|| KiraError::NoFileForCase(case_id.to_string()))?;
        let unit = WorkUnit {
            project_id: project_id.clone(),
            case_id,
            file,
        };

        // Removed on drop, so every exit path below cleans up.
        let scratch = self.store.case_scratch(&unit.case_id)?;
        let path = scratch.path().join(unit.file.local_name());
        let bytes = self.download(&unit.file.file_id, path.clone()).await?;
        debug!(case_id = %unit.case_id, bytes, "downloaded");

        let counts = self.reduce(path).await?;
        let genes = counts.len();
        let row = self.append(unit.case_id.clone(), counts).await?;

        if let Err(err) = scratch.close() {
            warn!(case_id = %unit.case_id, error = %err, "cannot remove scratch directory");
        }
        Ok(Some(CaseOutcome {
            project_id: unit.project_id,
            case_id: unit.case_id,
            file_id: unit.file.file_id,
            row,
            genes,
        }))
    }

    async fn download(&self, file_id: &FileId, path: PathBuf) -> Result<u64, KiraError> {
        let limit = self.settings.download_timeout;
        match tokio::time::timeout(limit, self.downloader.fetch(file_id, &path)).await {
            Ok(result) => result,
            Err(_) => Err(KiraError::Timeout {
                file_id: file_id.to_string(),
                secs: limit.as_secs(),
            }),
        }
    }

    async fn reduce(&self, path: PathBuf) -> Result<GeneCounts, KiraError> {
        let _slot = self
            .reduce_slots
            .acquire()
            .await
            .map_err(|err| KiraError::Worker(err.to_string()))?;
        let reducer = self.settings.reducer.clone();
        tokio::task::spawn_blocking(move || reducer.reduce(&path))
            .await
            .map_err(|err| KiraError::Worker(err.to_string()))?
    }

    async fn indexed(&self, case_id: &CaseId) -> Result<bool, KiraError> {
        let index = Arc::clone(&self.index);
        let case_id = case_id.clone();
        tokio::task::spawn_blocking(move || index.contains(&case_id))
            .await
            .map_err(|err| KiraError::Worker(err.to_string()))
    }

    // add may hold the index lock through an interval checkpoint; touch it only from the
    // blocking pool.
    async fn append(&self, case_id: CaseId, counts: GeneCounts) -> Result<usize, KiraError> {
        let index = Arc::clone(&self.index);
        tokio::task::spawn_blocking(move || -> Result<usize, KiraError> {
            let space = match index.feature_space() {
                Some(space) => space,
                None => index.establish_feature_space(counts.feature_space())?,
            };
            let vector = counts.align(&space);
            drop(counts);
            index.add(case_id, vector)
        })
        .await
        .map_err(|err| KiraError::Worker(err.to_string()))?
    }

    async fn final_checkpoint(&self) -> Result<Option<CheckpointId>, KiraError> {
        let index = Arc::clone(&self.index);
        tokio::task::spawn_blocking(move || index.checkpoint())
            .await
            .map_err(|err| KiraError::Worker(err.to_string()))?
    }
}
