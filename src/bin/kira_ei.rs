use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kira_expression_index::checkpoint::{CheckpointId, CheckpointManager};
use kira_expression_index::config::{ConfigLoader, ResolvedConfig};
use kira_expression_index::domain::CaseId;
use kira_expression_index::download::GdcDownloader;
use kira_expression_index::error::KiraError;
use kira_expression_index::gdc::GdcHttpClient;
use kira_expression_index::index::IndexSnapshot;
use kira_expression_index::output::{
    CheckpointEntry, CheckpointListing, JsonOutput, LogProgress, MergeResult, SearchResult,
    StatusResult,
};
use kira_expression_index::pipeline::{Pipeline, PipelineSettings, ProgressSink};
use kira_expression_index::search::{FlatCosineSearch, NeighborSearch};
use kira_expression_index::store::Store;

#[derive(Parser)]
#[command(name = "kira-ei")]
#[command(about = "GDC expression ingestion into a checkpointed similarity index")]
#[command(version, author)]
struct Cli {
    /// JSON config file (defaults to ./kira-ei.json when present)
    #[arg(long, global = true)]
    config: Option<String>,

    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Discover eligible projects and index their cases")]
    Ingest,
    #[command(about = "Most similar indexed cases for one case")]
    Search(SearchArgs),
    #[command(about = "Merge checkpoints into a new one (all when none given)")]
    Merge(MergeArgs),
    #[command(about = "List checkpoints on disk")]
    Checkpoints,
    #[command(about = "Show the latest checkpoint")]
    Status,
}

#[derive(Args)]
struct SearchArgs {
    case_id: String,

    #[arg(short, long, default_value_t = 5)]
    k: usize,

    #[arg(long)]
    checkpoint: Option<String>,
}

#[derive(Args)]
struct MergeArgs {
    ids: Vec<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(kira) = report.downcast_ref::<KiraError>() {
            return ExitCode::from(map_exit_code(kira));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &KiraError) -> u8 {
    match error {
        KiraError::InvalidCaseId(_)
        | KiraError::InvalidCheckpointId(_)
        | KiraError::ConfigRead(_)
        | KiraError::ConfigParse(_)
        | KiraError::ConfigValue { .. }
        | KiraError::Checkpoint { .. } => 2,
        KiraError::Http { .. }
        | KiraError::Status { .. }
        | KiraError::RateLimited(_)
        | KiraError::Response(_)
        | KiraError::Timeout { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let store = Store::new_with_root(config.data_root.clone());
    let manager = CheckpointManager::new(store.checkpoint_dir(), config.checkpoint_keep);

    match cli.command {
        Commands::Ingest => run_ingest(config, store, cli.quiet),
        Commands::Search(args) => run_search(&manager, args),
        Commands::Merge(args) => run_merge(&manager, args),
        Commands::Checkpoints => run_checkpoints(&manager),
        Commands::Status => run_status(&manager, &store),
    }
}

fn run_ingest(config: ResolvedConfig, store: Store, quiet: bool) -> miette::Result<()> {
    let discovery = GdcHttpClient::new(&config.api_base_url)?;
    let downloader = GdcDownloader::new(&config.api_base_url)?;
    let settings = PipelineSettings::from_config(&config);

    let runtime = tokio::runtime::Runtime::new().into_diagnostic()?;
    let report = runtime.block_on(async {
        let pipeline = Pipeline::open(discovery, downloader, store, settings);
        let sink: &dyn ProgressSink = if quiet { &JsonOutput } else { &LogProgress };
        pipeline.run(sink).await
    })?;
    info!(
        processed = report.processed.len(),
        index_size = report.index_size,
        "ingestion finished"
    );
    JsonOutput::print_run(&report).into_diagnostic()?;
    Ok(())
}

fn run_search(manager: &CheckpointManager, args: SearchArgs) -> miette::Result<()> {
    let case_id: CaseId = args.case_id.parse()?;
    let (checkpoint, neighbors) = match args.checkpoint {
        Some(id) => {
            let id: CheckpointId = id.parse()?;
            let search = FlatCosineSearch::from_checkpoint(manager, &id)?;
            (Some(id), search.search(&case_id, args.k))
        }
        None => match FlatCosineSearch::from_latest(manager) {
            Some((id, search)) => (Some(id), search.search(&case_id, args.k)),
            None => {
                warn!(dir = %manager.dir(), "no usable checkpoint to search");
                (None, Vec::new())
            }
        },
    };
    JsonOutput::print_search(&SearchResult {
        case_id,
        checkpoint,
        neighbors,
    })
    .into_diagnostic()?;
    Ok(())
}

fn run_merge(manager: &CheckpointManager, args: MergeArgs) -> miette::Result<()> {
    let (sources, checkpoint, merged) = if args.ids.is_empty() {
        let sources = manager.list()?;
        match manager.consolidate()? {
            Some((id, merged)) => (sources, Some(id), merged),
            None => (sources, None, IndexSnapshot::default()),
        }
    } else {
        let sources = args
            .ids
            .iter()
            .map(|id| id.parse::<CheckpointId>())
            .collect::<Result<Vec<_>, _>>()?;
        let merged = manager.merge(&sources)?;
        let checkpoint = if merged.rows() == 0 {
            None
        } else {
            Some(manager.save(&merged)?)
        };
        (sources, checkpoint, merged)
    };
    JsonOutput::print_merge(&MergeResult {
        sources,
        checkpoint,
        cases: merged.mapping.len(),
        dimension: merged.dimension,
    })
    .into_diagnostic()?;
    Ok(())
}

fn run_checkpoints(manager: &CheckpointManager) -> miette::Result<()> {
    let checkpoints = manager
        .list()?
        .into_iter()
        .map(|id| CheckpointEntry {
            vectors: manager.vectors_path(&id).to_string(),
            mapping: manager.mapping_path(&id).to_string(),
            id,
        })
        .collect();
    JsonOutput::print_checkpoints(&CheckpointListing {
        dir: manager.dir().to_string(),
        checkpoints,
    })
    .into_diagnostic()?;
    Ok(())
}

fn run_status(manager: &CheckpointManager, store: &Store) -> miette::Result<()> {
    let loaded = manager.load_latest();
    let result = match loaded {
        Some(loaded) => StatusResult {
            data_root: store.root().to_string(),
            latest_checkpoint: Some(loaded.id),
            cases: loaded.snapshot.mapping.len(),
            dimension: loaded.snapshot.dimension,
        },
        None => StatusResult {
            data_root: store.root().to_string(),
            latest_checkpoint: None,
            cases: 0,
            dimension: None,
        },
    };
    JsonOutput::print_status(&result).into_diagnostic()?;
    Ok(())
}
