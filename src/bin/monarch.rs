use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use monarch_pipeline::app::{App, Workspace};
use monarch_pipeline::config::{Settings, SettingsLoader};
use monarch_pipeline::domain::ObservationId;
use monarch_pipeline::error::{FailureClass, PipelineError};
use monarch_pipeline::images::{FetchedImage, HttpImageFetcher, ImageFetcher};
use monarch_pipeline::inat::{CatalogClient, CatalogPage, INatHttpClient, PageRequest};
use monarch_pipeline::labelstudio::LabelStudioHttpClient;
use monarch_pipeline::output::{ConsoleProgress, HumanOutput, JsonOutput, OutputMode};
use monarch_pipeline::sampler::{FetchRequest, StopReason};
use monarch_pipeline::store::ObservationStore;
use monarch_pipeline::sync::{DEFAULT_ITEM_RETRIES, SyncOptions};

#[derive(Parser)]
#[command(name = "monarch")]
#[command(about = "Collect monarch butterfly observations from iNaturalist and queue them for life-stage labelling")]
#[command(version, author)]
struct Cli {
    /// Print results as JSON instead of a coloured summary.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Sample new observations and download their images")]
    Fetch(FetchArgs),
    #[command(about = "Create annotation tasks for observations not yet synced")]
    Sync(SyncArgs),
    #[command(about = "Show store counts")]
    Status,
    #[command(about = "Delete every stored observation, label and image")]
    Purge(PurgeArgs),
    #[command(about = "Create the database schema and image directory")]
    Init,
}

#[derive(Args)]
struct FetchArgs {
    /// Number of new observations to store.
    #[arg(short = 'n', long = "count")]
    count: usize,

    /// Candidates to evaluate before giving up (defaults to 3 x count).
    #[arg(long)]
    max_attempts: Option<usize>,
}

#[derive(Args)]
struct SyncArgs {
    /// Sync at most this many observations.
    #[arg(short = 'n', long = "limit")]
    limit: Option<usize>,

    /// Look up existing tasks first and skip observations already present.
    #[arg(long)]
    skip_duplicates: bool,
}

#[derive(Args)]
struct PurgeArgs {
    /// Confirm deletion.
    #[arg(long)]
    yes: bool,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(error) = report.downcast_ref::<PipelineError>() {
                return ExitCode::from(map_exit_code(error.class()));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(class: FailureClass) -> u8 {
    match class {
        FailureClass::Config => 2,
        FailureClass::Network => 3,
        FailureClass::Auth => 4,
        FailureClass::Other => 1,
    }
}

fn run() -> miette::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };
    let settings = SettingsLoader::resolve()?;

    match cli.command {
        Commands::Fetch(args) => run_fetch(args, &settings, output_mode),
        Commands::Sync(args) => run_sync(args, &settings, output_mode),
        Commands::Status => {
            let app = offline_app(&settings)?;
            match output_mode {
                OutputMode::NonInteractive => {
                    let result = app.status(&JsonOutput)?;
                    JsonOutput::print_status(&result).into_diagnostic()?;
                }
                OutputMode::Interactive => {
                    let result = app.status(&ConsoleProgress)?;
                    HumanOutput::print_status(&result);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Purge(args) => {
            if !args.yes {
                return Err(miette::Report::msg(
                    "purge deletes every observation and image; rerun with --yes to confirm",
                ));
            }
            let app = offline_app(&settings)?;
            match output_mode {
                OutputMode::NonInteractive => {
                    let result = app.purge(&JsonOutput)?;
                    JsonOutput::print_purge(&result).into_diagnostic()?;
                }
                OutputMode::Interactive => {
                    let result = app.purge(&ConsoleProgress)?;
                    HumanOutput::print_purge(&result);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Init => {
            let app = offline_app(&settings)?;
            match output_mode {
                OutputMode::NonInteractive => {
                    let result = app.init(&JsonOutput)?;
                    JsonOutput::print_init(&result).into_diagnostic()?;
                }
                OutputMode::Interactive => {
                    let result = app.init(&ConsoleProgress)?;
                    HumanOutput::print_init(&result);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn workspace(settings: &Settings) -> Workspace {
    Workspace {
        database_path: settings.database_path.clone(),
        image_dir: settings.image_dir.clone(),
        request_delay: settings.request_delay,
    }
}

fn offline_app(settings: &Settings) -> miette::Result<App<NopCatalog, NopFetcher>> {
    let store = ObservationStore::open(&settings.database_path)?;
    Ok(App::new(store, workspace(settings), NopCatalog, NopFetcher))
}

fn run_fetch(
    args: FetchArgs,
    settings: &Settings,
    output_mode: OutputMode,
) -> miette::Result<ExitCode> {
    let store = ObservationStore::open(&settings.database_path)?;
    let catalog = INatHttpClient::new(settings.catalog.clone())?;
    let fetcher = HttpImageFetcher::new(settings.image_dir.clone())?;
    let app = App::new(store, workspace(settings), catalog, fetcher);
    let request = FetchRequest {
        target: args.count,
        max_attempts: args.max_attempts,
    };

    let result = match output_mode {
        OutputMode::NonInteractive => {
            let result = app.fetch(request, &JsonOutput)?;
            JsonOutput::print_fetch(&result).into_diagnostic()?;
            result
        }
        OutputMode::Interactive => {
            let result = app.fetch(request, &ConsoleProgress)?;
            HumanOutput::print_fetch(&result);
            result
        }
    };
    Ok(exit_for(&result.stop))
}

fn run_sync(
    args: SyncArgs,
    settings: &Settings,
    output_mode: OutputMode,
) -> miette::Result<ExitCode> {
    let annotation = settings.annotation()?;
    let store = ObservationStore::open(&settings.database_path)?;
    let client = LabelStudioHttpClient::new(annotation.clone())?;
    let app = App::new(store, workspace(settings), NopCatalog, NopFetcher);
    let options = SyncOptions {
        limit: args.limit,
        skip_duplicates: args.skip_duplicates,
        item_retries: DEFAULT_ITEM_RETRIES,
    };

    let result = match output_mode {
        OutputMode::NonInteractive => {
            let result = app.sync(&client, &annotation, options, &JsonOutput)?;
            JsonOutput::print_sync(&result).into_diagnostic()?;
            result
        }
        OutputMode::Interactive => {
            let result = app.sync(&client, &annotation, options, &ConsoleProgress)?;
            HumanOutput::print_sync(&result);
            result
        }
    };
    Ok(exit_for(&result.stop))
}

fn exit_for(stop: &StopReason) -> ExitCode {
    ExitCode::from(stop_code(stop))
}

fn stop_code(stop: &StopReason) -> u8 {
    match stop {
        StopReason::Aborted { class, .. } => map_exit_code(*class),
        _ => 0,
    }
}

struct NopCatalog;
struct NopFetcher;

impl CatalogClient for NopCatalog {
    fn fetch_page(&self, _request: &PageRequest) -> Result<CatalogPage, PipelineError> {
        Err(PipelineError::TransientFetch(
            "catalog client not configured".to_string(),
        ))
    }
}

impl ImageFetcher for NopFetcher {
    fn fetch(&self, url: &str, _id: ObservationId) -> Result<FetchedImage, PipelineError> {
        Err(PipelineError::Transfer {
            url: url.to_string(),
            message: "image fetcher not configured".to_string(),
        })
    }
}
