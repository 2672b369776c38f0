use std::process::ExitCode;
use std::thread;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_pipeline::app::{App, PlanOptions};
use kira_pipeline::ase_map::{AseMapOptions, DEFAULT_MIN_CASES};
use kira_pipeline::catalog::pipeline_stages;
use kira_pipeline::config::ConfigLoader;
use kira_pipeline::error::PipelineError;
use kira_pipeline::output::{JsonOutput, OutputMode, TableOutput};
use kira_pipeline::world::WorldSnapshot;

#[derive(Parser)]
#[command(name = "kira-pipeline")]
#[command(about = "Plans the next round of commands for a file-system resident genomics pipeline")]
#[command(version, author)]
struct Cli {
    /// Configuration file (default: kira-pipeline.json in the current directory)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Classify every stage and write the command scripts (default)")]
    Plan(PlanArgs),
    #[command(about = "Build the per-region ASE map from the per-case measurements")]
    AseMap(AseMapArgs),
}

#[derive(Args, Default)]
struct PlanArgs {
    /// Verify that no finished output is older than its inputs before planning
    #[arg(short = 'd', long)]
    check_dependencies: bool,

    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct AseMapArgs {
    /// Worker threads (default: one per processor)
    #[arg(long)]
    threads: Option<usize>,

    /// Regions with fewer measurements are left out of the map
    #[arg(long, default_value_t = DEFAULT_MIN_CASES)]
    min_cases: usize,

    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<PipelineError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &PipelineError) -> u8 {
    match error {
        PipelineError::MissingConfig | PipelineError::ConfigRead(_) => 2,
        PipelineError::FreshnessViolations { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let app = App::new(config);

    match cli.command.unwrap_or(Commands::Plan(PlanArgs::default())) {
        Commands::Plan(args) => run_plan(&app, args),
        Commands::AseMap(args) => run_ase_map(&app, args),
    }
}

fn run_plan(app: &App, args: PlanArgs) -> miette::Result<()> {
    let world = WorldSnapshot::load(app.config());
    let stages = pipeline_stages(app.config());
    let options = PlanOptions {
        check_dependencies: args.check_dependencies,
    };
    let output_mode = if args.json {
        OutputMode::Json
    } else {
        OutputMode::Table
    };

    let result = match output_mode {
        OutputMode::Json => app.plan(&world, &stages, options, &JsonOutput)?,
        OutputMode::Table => app.plan(&world, &stages, options, &TableOutput)?,
    };
    match output_mode {
        OutputMode::Json => JsonOutput::print_plan(&result).into_diagnostic()?,
        OutputMode::Table => TableOutput::print_plan(&result).into_diagnostic()?,
    }

    if result.failed_stages > 0 {
        return Err(PipelineError::StagesFailed {
            count: result.failed_stages,
        }
        .into());
    }
    Ok(())
}

fn run_ase_map(app: &App, args: AseMapArgs) -> miette::Result<()> {
    let threads = args.threads.filter(|threads| *threads > 0).unwrap_or_else(|| {
        thread::available_parallelism()
            .map(|threads| threads.get())
            .unwrap_or(1)
    });
    let options = AseMapOptions {
        threads,
        min_cases: args.min_cases,
    };
    let world = WorldSnapshot::load(app.config());
    if args.json {
        let summary = app.ase_map(&world, options, &JsonOutput)?;
        JsonOutput::print_ase_map(&summary).into_diagnostic()?;
    } else {
        let summary = app.ase_map(&world, options, &TableOutput)?;
        TableOutput::print_ase_map(&summary).into_diagnostic()?;
    }
    Ok(())
}
