use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use bids_curator::app::{App, DedupOptions, ReportOptions};
use bids_curator::domain::{KeepPolicy, ProjectPath};
use bids_curator::error::CuratorError;
use bids_curator::platform::PlatformHttpClient;

#[derive(Parser)]
#[command(name = "bids-curator")]
#[command(about = "Operator tools for BIDS curation on a medical-imaging data platform")]
#[command(version, author)]
struct Cli {
    /// Platform base URL, e.g. https://imaging.example.com
    #[arg(long, global = true)]
    host: Option<String>,

    /// Platform API key
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// Repeat for more detail (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Rename files whose curated BIDS paths collide")]
    Dedup(DedupArgs),
    #[command(about = "Write CSV reports of a project's BIDS curation")]
    Report(ReportArgs),
}

#[derive(Args)]
struct DedupArgs {
    group: String,
    project: String,

    /// Which duplicate keeps the contested path
    #[arg(long, value_enum, default_value_t = KeepPolicy::Latest)]
    keep: KeepPolicy,

    /// Write the renames back to the platform
    #[arg(long)]
    apply: bool,
}

#[derive(Args)]
struct ReportArgs {
    group: String,
    project: String,

    /// File/target regex pairs for filtering fieldmap IntendedFor lists
    #[arg(short = 'i', long = "intended-for", num_args = 0.., value_name = "REGEX")]
    intended_for: Vec<String>,

    /// Load the survey from a local snapshot when one exists, save it otherwise
    #[arg(long)]
    snapshot: bool,

    /// Directory the reports are written into
    #[arg(long, default_value = ".")]
    out_dir: Utf8PathBuf,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(curator) = report.downcast_ref::<CuratorError>() {
            return ExitCode::from(map_exit_code(curator));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &CuratorError) -> u8 {
    match error {
        CuratorError::InvalidProjectPath(_)
        | CuratorError::ProjectNotFound(_)
        | CuratorError::InvalidPattern { .. }
        | CuratorError::UnpairedPattern(_)
        | CuratorError::MissingApiKey
        | CuratorError::MissingHost => 2,
        CuratorError::PlatformHttp(_) | CuratorError::PlatformStatus { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(cli.verbose)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let host = resolve_setting(cli.host, "BIDS_CURATOR_HOST").ok_or(CuratorError::MissingHost)?;
    let api_key =
        resolve_setting(cli.api_key, "BIDS_CURATOR_KEY").ok_or(CuratorError::MissingApiKey)?;
    let client = PlatformHttpClient::new(&host, &api_key)?;
    info!("talking to {}", client.host());
    let app = App::new(client);

    match cli.command {
        Commands::Dedup(args) => run_dedup(&app, args),
        Commands::Report(args) => run_report(&app, args),
    }
}

fn run_dedup(app: &App<PlatformHttpClient>, args: DedupArgs) -> miette::Result<()> {
    let path = ProjectPath::new(&args.group, &args.project)?;
    if args.apply {
        info!("renames will be written back to the platform");
    } else {
        info!("dry run, pass --apply to write renames");
    }
    let outcome = app.dedup(
        &path,
        DedupOptions {
            keep: args.keep,
            apply: args.apply,
        },
    )?;
    println!(
        "{} files, {} BIDS paths claimed more than once, {} renames{}",
        outcome.files_seen,
        outcome.duplicate_paths,
        outcome.renamed,
        if args.apply { "" } else { " (dry run)" },
    );
    Ok(())
}

fn run_report(app: &App<PlatformHttpClient>, args: ReportArgs) -> miette::Result<()> {
    let path = ProjectPath::new(&args.group, &args.project)?;
    let options = ReportOptions {
        patterns: args.intended_for,
        use_snapshot: args.snapshot,
        out_dir: args.out_dir,
    };
    let outcome = app.report(&path, &options)?;
    println!(
        "{} subjects, {} sessions, {} duplicated BIDS paths",
        outcome.subjects,
        outcome.sessions,
        outcome.duplicates.len(),
    );
    println!("wrote {}", outcome.files.niftis);
    println!("wrote {}", outcome.files.intendedfors);
    println!("wrote {}", outcome.files.acquisitions);
    if let Some(snapshot) = outcome.snapshot {
        println!("snapshot {snapshot}");
    }
    Ok(())
}

fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

fn resolve_setting(arg: Option<String>, env_var: &str) -> Option<String> {
    arg.or_else(|| {
        std::env::var(env_var)
            .ok()
            .filter(|value| !value.is_empty())
    })
}
