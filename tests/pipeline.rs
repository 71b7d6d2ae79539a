use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use async_trait::async_trait;
use camino::Utf8PathBuf;

use kira_expression_index::checkpoint::CheckpointManager;
use kira_expression_index::domain::{
    CaseId, CaseSummary, FileDescriptor, FileId, ProjectId, ProjectSummary,
};
use kira_expression_index::download::Downloader;
use kira_expression_index::error::KiraError;
use kira_expression_index::gdc::DiscoveryClient;
use kira_expression_index::output::JsonOutput;
use kira_expression_index::pipeline::{Pipeline, PipelineSettings};
use kira_expression_index::retry::RetryPolicy;
use kira_expression_index::store::Store;

const PREAMBLE: &str = "# gene-model: GENCODE v36\n\
gene_id\tgene_name\tgene_type\tunstranded\tstranded_first\tstranded_second\n\
N_unmapped\t\t\t1200\t1200\t1200\n\
N_multimapping\t\t\t300\t300\t300\n\
N_noFeature\t\t\t50\t900\t880\n\
N_ambiguous\t\t\t75\t20\t21\n";

fn counts_table(rows: &[(&str, u32)]) -> String {
    let mut table = PREAMBLE.to_string();
    for (gene, count) in rows {
        table.push_str(&format!("{gene}\tNAME\tprotein_coding\t{count}\t0\t0\n"));
    }
    table
}

fn case(id: &str) -> CaseId {
    id.parse().unwrap()
}

fn project(id: &str, case_count: u64) -> ProjectSummary {
    ProjectSummary {
        project_id: id.parse().unwrap(),
        name: None,
        case_count: Some(case_count),
    }
}

#[derive(Default)]
struct MockGdc {
    projects: Vec<ProjectSummary>,
    cases: HashMap<ProjectId, Vec<CaseSummary>>,
    files: HashMap<CaseId, FileDescriptor>,
    transient_failures: AtomicU32,
    listed: Arc<Mutex<Vec<ProjectId>>>,
}

impl MockGdc {
    fn with_project(mut self, summary: ProjectSummary, case_ids: &[String]) -> Self {
        let cases = case_ids
            .iter()
            .map(|id| CaseSummary {
                case_id: case(id),
                submitter_id: None,
            })
            .collect();
        for id in case_ids {
            self.files.insert(
                case(id),
                FileDescriptor {
                    file_id: format!("file-{id}").parse().unwrap(),
                    file_name: format!("{id}.rna_seq.augmented_star_gene_counts.tsv"),
                },
            );
        }
        self.cases.insert(summary.project_id.clone(), cases);
        self.projects.push(summary);
        self
    }
}

#[async_trait]
impl DiscoveryClient for MockGdc {
    async fn list_projects(&self) -> Result<Vec<ProjectSummary>, KiraError> {
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(KiraError::Http {
                message: "connection reset".to_string(),
                transient: true,
            });
        }
        Ok(self.projects.clone())
    }

    async fn list_cases(&self, project: &ProjectId) -> Result<Vec<CaseSummary>, KiraError> {
        self.listed.lock().unwrap().push(project.clone());
        self.cases
            .get(project)
            .cloned()
            .ok_or_else(|| KiraError::Status {
                status: 500,
                message: "boom".to_string(),
            })
    }

    async fn resolve_file(&self, case: &CaseId) -> Result<Option<FileDescriptor>, KiraError> {
        Ok(self.files.get(case).cloned())
    }
}

#[derive(Default)]
struct MockDownloader {
    tables: HashMap<FileId, String>,
    slow: HashSet<FileId>,
    fetched: Arc<Mutex<Vec<(FileId, Instant)>>>,
}

impl MockDownloader {
    fn serve_all(mut self, case_ids: &[String], rows: &[(&str, u32)]) -> Self {
        for id in case_ids {
            self.tables
                .insert(format!("file-{id}").parse().unwrap(), counts_table(rows));
        }
        self
    }

    fn serve(mut self, case_id: &str, table: String) -> Self {
        self.tables
            .insert(format!("file-{case_id}").parse().unwrap(), table);
        self
    }

    fn stall(mut self, case_id: &str) -> Self {
        self.slow.insert(format!("file-{case_id}").parse().unwrap());
        self
    }

    fn fetch_log(&self) -> Arc<Mutex<Vec<(FileId, Instant)>>> {
        Arc::clone(&self.fetched)
    }
}

#[async_trait]
impl Downloader for MockDownloader {
    async fn fetch(&self, file_id: &FileId, destination: &Path) -> Result<u64, KiraError> {
        self.fetched
            .lock()
            .unwrap()
            .push((file_id.clone(), Instant::now()));
        if self.slow.contains(file_id) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        let table = self
            .tables
            .get(file_id)
            .ok_or_else(|| KiraError::Status {
                status: 404,
                message: file_id.to_string(),
            })?;
        std::fs::write(destination, table).unwrap();
        Ok(table.len() as u64)
    }
}

fn ids(prefix: &str, count: usize) -> Vec<String> {
    (0..count).map(|n| format!("{prefix}-{n:03}")).collect()
}

fn settings() -> PipelineSettings {
    let mut settings = PipelineSettings::default();
    settings.min_cases = 20;
    settings.case_concurrency = 4;
    settings.case_delay = Duration::ZERO;
    settings.download_timeout = Duration::from_secs(5);
    settings.reduce_workers = 2;
    settings.checkpoint_interval = 1000;
    settings.retry = RetryPolicy::new(3, Duration::from_millis(1));
    settings
}

fn temp_store(temp: &tempfile::TempDir) -> Store {
    Store::new_with_root(Utf8PathBuf::from_path_buf(temp.path().join("data")).unwrap())
}

fn scratch_entries(store: &Store) -> usize {
    match std::fs::read_dir(store.scratch_dir().as_std_path()) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}

#[tokio::test]
async fn ingests_only_projects_above_threshold() {
    let temp = tempfile::tempdir().unwrap();
    let store = temp_store(&temp);
    let large = ids("large", 25);
    let small = ids("small", 5);
    let gdc = MockGdc::default()
        .with_project(project("TCGA-LARGE", 25), &large)
        .with_project(project("TCGA-SMALL", 5), &small);
    let rows = [("ENSG01", 10), ("ENSG02", 0), ("ENSG03", 7)];
    let downloader = MockDownloader::default()
        .serve_all(&large, &rows)
        .serve_all(&small, &rows);

    let pipeline = Pipeline::open(gdc, downloader, store.clone(), settings());
    let report = pipeline.run(&JsonOutput).await.unwrap();

    assert_eq!(report.processed.len(), 25);
    assert_eq!(report.index_size, 25);
    assert!(report.restored_from.is_none());
    let index = pipeline.index();
    for id in &large {
        assert_eq!(index.get(&case(id)), Some(vec![10.0, 7.0]));
    }
    for id in &small {
        assert!(!index.contains(&case(id)));
    }

    let checkpoint = report.checkpoint.expect("final checkpoint");
    let manager = CheckpointManager::new(store.checkpoint_dir(), 3);
    let loaded = manager.load_latest().unwrap();
    assert_eq!(loaded.id, checkpoint);
    assert_eq!(loaded.snapshot.mapping.len(), 25);
    assert_eq!(scratch_entries(&store), 0);
}

#[tokio::test]
async fn below_threshold_projects_are_never_expanded() {
    let temp = tempfile::tempdir().unwrap();
    let large = ids("large", 20);
    let gdc = MockGdc::default()
        .with_project(project("TCGA-LARGE", 20), &large)
        .with_project(project("TCGA-SMALL", 19), &ids("small", 19));
    let listed = Arc::clone(&gdc.listed);
    let downloader = MockDownloader::default().serve_all(&large, &[("ENSG01", 1)]);

    let pipeline = Pipeline::open(gdc, downloader, temp_store(&temp), settings());
    let eligible = pipeline.discover().await.unwrap();
    assert_eq!(eligible.len(), 1);
    assert_eq!(eligible[0].project_id.as_str(), "TCGA-LARGE");

    pipeline.run(&JsonOutput).await.unwrap();
    let listed: Vec<_> = listed.lock().unwrap().iter().map(ToString::to_string).collect();
    assert_eq!(listed, ["TCGA-LARGE"]);
}

#[tokio::test]
async fn stalled_download_is_skipped_and_next_case_proceeds() {
    let temp = tempfile::tempdir().unwrap();
    let store = temp_store(&temp);
    let cases = ids("case", 3);
    let gdc = MockGdc::default().with_project(project("TCGA-SLOW", 30), &cases);
    let downloader = MockDownloader::default()
        .serve_all(&cases, &[("ENSG01", 4), ("ENSG02", 2)])
        .stall(&cases[0]);

    let mut settings = settings();
    settings.case_concurrency = 1;
    settings.case_delay = Duration::from_millis(20);
    settings.download_timeout = Duration::from_millis(100);

    let pipeline = Pipeline::open(gdc, downloader, store.clone(), settings);
    let report = pipeline.run(&JsonOutput).await.unwrap();

    let processed: Vec<_> = report
        .processed
        .iter()
        .map(|outcome| outcome.case_id.to_string())
        .collect();
    assert_eq!(processed, [cases[1].clone(), cases[2].clone()]);
    assert!(!pipeline.index().contains(&case(&cases[0])));
    assert_eq!(scratch_entries(&store), 0);
}

#[tokio::test]
async fn serial_cases_follow_discovery_order_with_delay() {
    let temp = tempfile::tempdir().unwrap();
    let cases = ids("case", 5);
    let gdc = MockGdc::default().with_project(project("TCGA-PACED", 25), &cases);
    let downloader = MockDownloader::default().serve_all(&cases, &[("ENSG01", 3)]);
    let log = downloader.fetch_log();

    let delay = Duration::from_millis(40);
    let mut settings = settings();
    settings.case_concurrency = 1;
    settings.case_delay = delay;

    let pipeline = Pipeline::open(gdc, downloader, temp_store(&temp), settings);
    let report = pipeline.run(&JsonOutput).await.unwrap();
    assert_eq!(report.processed.len(), 5);

    let log = log.lock().unwrap();
    let fetched: Vec<_> = log.iter().map(|(file_id, _)| file_id.to_string()).collect();
    let expected: Vec<_> = cases.iter().map(|id| format!("file-{id}")).collect();
    assert_eq!(fetched, expected);
    for pair in log.windows(2) {
        assert!(pair[1].1.duration_since(pair[0].1) >= delay);
    }
}

#[tokio::test(flavor = "current_thread")]
async fn per_add_checkpoints_do_not_stall_download_timeouts() {
    let temp = tempfile::tempdir().unwrap();
    let store = temp_store(&temp);
    let cases = ids("case", 8);
    let gdc = MockGdc::default().with_project(project("TCGA-BUSY", 20), &cases);
    let downloader = MockDownloader::default()
        .serve_all(&cases, &[("ENSG01", 3), ("ENSG02", 1)])
        .stall(&cases[3]);

    let mut settings = settings();
    settings.checkpoint_interval = 1;
    settings.checkpoint_keep = 2;
    settings.download_timeout = Duration::from_millis(200);

    let pipeline = Pipeline::open(gdc, downloader, store, settings);
    let report = tokio::time::timeout(Duration::from_secs(10), pipeline.run(&JsonOutput))
        .await
        .expect("run finishes while checkpoints are written")
        .unwrap();
    assert_eq!(report.index_size, 7);
    assert!(!pipeline.index().contains(&case(&cases[3])));
    assert_eq!(pipeline.checkpoints().list().unwrap().len(), 2);
}

#[tokio::test]
async fn bad_cases_are_isolated_and_vectors_follow_first_gene_order() {
    let temp = tempfile::tempdir().unwrap();
    let cases = ids("case", 4);
    let mut gdc = MockGdc::default().with_project(project("TCGA-MIX", 40), &cases);
    gdc.files.remove(&case(&cases[1]));
    let downloader = MockDownloader::default()
        .serve(&cases[0], counts_table(&[("ENSG01", 3), ("ENSG02", 5)]))
        .serve(&cases[2], counts_table(&[("ENSG01", 0), ("ENSG02", 0)]))
        .serve(&cases[3], counts_table(&[("ENSG02", 8), ("ENSG09", 1)]));

    let mut settings = settings();
    settings.case_concurrency = 1;

    let pipeline = Pipeline::open(gdc, downloader, temp_store(&temp), settings);
    let report = pipeline.run(&JsonOutput).await.unwrap();

    assert_eq!(report.index_size, 2);
    let index = pipeline.index();
    assert_eq!(index.get(&case(&cases[0])), Some(vec![3.0, 5.0]));
    assert_eq!(index.get(&case(&cases[3])), Some(vec![0.0, 8.0]));
    assert!(!index.contains(&case(&cases[1])));
    assert!(!index.contains(&case(&cases[2])));
}

#[tokio::test]
async fn failing_project_does_not_stop_others() {
    let temp = tempfile::tempdir().unwrap();
    let good = ids("good", 20);
    let mut gdc = MockGdc::default()
        .with_project(project("TCGA-GOOD", 20), &good)
        .with_project(project("TCGA-BROKEN", 50), &[]);
    gdc.cases.remove(&"TCGA-BROKEN".parse::<ProjectId>().unwrap());
    let downloader = MockDownloader::default().serve_all(&good, &[("ENSG01", 2)]);

    let pipeline = Pipeline::open(gdc, downloader, temp_store(&temp), settings());
    let report = pipeline.run(&JsonOutput).await.unwrap();
    assert_eq!(report.index_size, 20);
}

#[tokio::test]
async fn transient_discovery_failure_is_retried() {
    let temp = tempfile::tempdir().unwrap();
    let cases = ids("case", 20);
    let gdc = MockGdc::default().with_project(project("TCGA-RETRY", 20), &cases);
    gdc.transient_failures.store(2, Ordering::SeqCst);
    let downloader = MockDownloader::default().serve_all(&cases, &[("ENSG01", 2)]);

    let pipeline = Pipeline::open(gdc, downloader, temp_store(&temp), settings());
    let report = pipeline.run(&JsonOutput).await.unwrap();
    assert_eq!(report.index_size, 20);
}

#[tokio::test]
async fn exhausted_retries_still_write_final_checkpoint() {
    let temp = tempfile::tempdir().unwrap();
    let store = temp_store(&temp);
    let first = ids("first", 20);
    let gdc = MockGdc::default().with_project(project("TCGA-ONE", 20), &first);
    let downloader = MockDownloader::default().serve_all(&first, &[("ENSG01", 2)]);
    let pipeline = Pipeline::open(gdc, downloader, store.clone(), settings());
    pipeline.run(&JsonOutput).await.unwrap();

    let gdc = MockGdc::default();
    gdc.transient_failures.store(10, Ordering::SeqCst);
    let pipeline = Pipeline::open(gdc, MockDownloader::default(), store.clone(), settings());
    let result = pipeline.run(&JsonOutput).await;
    assert_matches!(result, Err(KiraError::Http { .. }));
    assert_eq!(pipeline.index().size(), 20);
}

#[tokio::test]
async fn restart_resumes_from_latest_checkpoint() {
    let temp = tempfile::tempdir().unwrap();
    let store = temp_store(&temp);
    let first = ids("case", 20);
    let gdc = MockGdc::default().with_project(project("TCGA-RESUME", 22), &first);
    let downloader = MockDownloader::default().serve_all(&first, &[("ENSG01", 2), ("ENSG02", 3)]);
    let pipeline = Pipeline::open(gdc, downloader, store.clone(), settings());
    let first_report = pipeline.run(&JsonOutput).await.unwrap();
    let first_checkpoint = first_report.checkpoint.unwrap();

    let all = ids("case", 22);
    let gdc = MockGdc::default().with_project(project("TCGA-RESUME", 22), &all);
    let downloader = MockDownloader::default().serve_all(&all, &[("ENSG01", 2), ("ENSG02", 3)]);
    let mut settings = settings();
    settings.skip_indexed_cases = true;
    let pipeline = Pipeline::open(gdc, downloader, store.clone(), settings);
    assert_eq!(pipeline.restored_from(), Some(&first_checkpoint));
    assert_eq!(pipeline.index().size(), 20);

    let report = pipeline.run(&JsonOutput).await.unwrap();
    assert_eq!(report.processed.len(), 2);
    assert_eq!(report.index_size, 22);
    assert_eq!(report.restored_from, Some(first_checkpoint));
}

#[tokio::test]
async fn reindexing_rejects_duplicates_without_growing() {
    let temp = tempfile::tempdir().unwrap();
    let store = temp_store(&temp);
    let cases = ids("case", 20);
    let table = [("ENSG01", 2)];

    let gdc = MockGdc::default().with_project(project("TCGA-DUP", 20), &cases);
    let downloader = MockDownloader::default().serve_all(&cases, &table);
    Pipeline::open(gdc, downloader, store.clone(), settings())
        .run(&JsonOutput)
        .await
        .unwrap();

    let gdc = MockGdc::default().with_project(project("TCGA-DUP", 20), &cases);
    let downloader = MockDownloader::default().serve_all(&cases, &table);
    let pipeline = Pipeline::open(gdc, downloader, store, settings());
    let report = pipeline.run(&JsonOutput).await.unwrap();
    assert!(report.processed.is_empty());
    assert_eq!(report.index_size, 20);
    assert!(report.checkpoint.is_none());
}

#[tokio::test]
async fn interval_checkpoints_are_written_during_ingestion() {
    let temp = tempfile::tempdir().unwrap();
    let store = temp_store(&temp);
    let cases = ids("case", 20);
    let gdc = MockGdc::default().with_project(project("TCGA-INTERVAL", 20), &cases);
    let downloader = MockDownloader::default().serve_all(&cases, &[("ENSG01", 2)]);
    let mut settings = settings();
    settings.checkpoint_interval = 5;
    settings.checkpoint_keep = 10;

    let pipeline = Pipeline::open(gdc, downloader, store.clone(), settings);
    let report = pipeline.run(&JsonOutput).await.unwrap();

    // every fifth add checkpoints; the final call has nothing new to write
    let ids = pipeline.checkpoints().list().unwrap();
    assert_eq!(ids.len(), 4);
    assert!(report.checkpoint.is_none());
    assert_eq!(
        pipeline.checkpoints().load_latest().unwrap().snapshot.rows(),
        20
    );
}

#[tokio::test]
async fn skip_indexed_cases_avoids_downloads() {
    let temp = tempfile::tempdir().unwrap();
    let store = temp_store(&temp);
    let cases = ids("case", 20);
    let table = [("ENSG01", 2)];

    let gdc = MockGdc::default().with_project(project("TCGA-SKIP", 20), &cases);
    let downloader = MockDownloader::default().serve_all(&cases, &table);
    Pipeline::open(gdc, downloader, store.clone(), settings())
        .run(&JsonOutput)
        .await
        .unwrap();

    let gdc = MockGdc::default().with_project(project("TCGA-SKIP", 20), &cases);
    let downloader = MockDownloader::default().serve_all(&cases, &table);
    let log = downloader.fetch_log();
    let mut settings = settings();
    settings.skip_indexed_cases = true;
    let pipeline = Pipeline::open(gdc, downloader, store, settings);
    pipeline.run(&JsonOutput).await.unwrap();
    assert_eq!(pipeline.index().size(), 20);
    assert!(log.lock().unwrap().is_empty());
}
