use std::io;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{anyhow, Result};
use chrono::NaiveDateTime;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum, ValueHint};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use trend_stitch::{plan_windows, reconstruct, Cadence, PacedFetcher, RetryingFetcher};

mod config;
mod output;
mod render;
mod replay;

use config::{default_end, load_file_config, parse_timestamp, resolve, Overrides, RunConfig};
use render::{render_chart_guard, ChartKind};
use replay::ReplayFetcher;

#[derive(Parser, Debug)]
#[command(author, version, about = "Windowed popularity series stitching CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the query windows for a range
    Plan(PlanArgs),
    /// Stitch recorded window responses into one series per identifier
    Stitch(StitchArgs),
}

#[derive(Args, Debug)]
struct RangeArgs {
    /// First timestamp of the range (YYYY-MM-DD or YYYY-MM-DDTHH)
    #[arg(long)]
    start: String,

    /// Last timestamp of the range; defaults to the latest grid point before now
    #[arg(long)]
    end: Option<String>,

    /// Sampling cadence (preset window limits follow from it)
    #[arg(long, value_enum)]
    cadence: Option<CadenceOpt>,

    /// Longest window in ticks
    #[arg(long)]
    max_step: Option<u32>,

    /// Ticks shared by consecutive windows
    #[arg(long)]
    overlap: Option<u32>,

    /// JSON run configuration
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct PlanArgs {
    #[command(flatten)]
    range: RangeArgs,

    /// Output CSV path, or '-' for stdout
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,
}

#[derive(Parser, Debug)]
struct StitchArgs {
    #[command(flatten)]
    range: RangeArgs,

    /// Series identifiers, comma-separated
    #[arg(long, required = true, value_delimiter = ',')]
    keys: Vec<String>,

    /// Directory of recorded responses, one `<start>_<end>.csv` per window
    #[arg(long, value_hint = ValueHint::DirPath)]
    responses: PathBuf,

    /// Output CSV path, or '-' for stdout
    #[arg(short, long, default_value = "stitched.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Optional JSON report with windows, scaling factors and warnings
    #[arg(long, value_hint = ValueHint::FilePath)]
    json: Option<PathBuf>,

    /// Optional PNG chart
    #[arg(long, value_hint = ValueHint::FilePath)]
    png: Option<PathBuf>,

    /// Optional SVG chart
    #[arg(long, value_hint = ValueHint::FilePath)]
    svg: Option<PathBuf>,

    /// Retries for quota and transport failures
    #[arg(long)]
    retries: Option<u32>,

    /// Backoff base in seconds; retry n waits factor * 2^(n-1)
    #[arg(long)]
    backoff_factor: Option<f64>,

    /// Minimum milliseconds between window queries
    #[arg(long)]
    pace_ms: Option<u64>,

    /// Log stage timings
    #[arg(long, action = ArgAction::SetTrue)]
    profile: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum CadenceOpt {
    Daily,
    Hourly,
}

impl From<CadenceOpt> for Cadence {
    fn from(value: CadenceOpt) -> Self {
        match value {
            CadenceOpt::Daily => Cadence::Daily,
            CadenceOpt::Hourly => Cadence::Hourly,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Plan(args) => args.range.verbose,
        Command::Stitch(args) => args.range.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Plan(args) => handle_plan(args),
        Command::Stitch(args) => handle_stitch(args),
    }
}

fn resolve_range(
    range: &RangeArgs,
    overrides: Overrides,
) -> Result<(RunConfig, NaiveDateTime, NaiveDateTime)> {
    let file = range
        .config
        .as_deref()
        .map(load_file_config)
        .transpose()?;
    let overrides = Overrides {
        cadence: range.cadence.map(Cadence::from),
        max_step: range.max_step,
        overlap: range.overlap,
        ..overrides
    };
    let run = resolve(file, &overrides)?;
    let start = parse_timestamp(&range.start)?;
    let end = match range.end.as_deref() {
        Some(text) => parse_timestamp(text)?,
        None => default_end(run.params.cadence)?,
    };
    Ok((run, start, end))
}

fn handle_plan(args: PlanArgs) -> Result<()> {
    let (run, start, end) = resolve_range(&args.range, Overrides::default())?;
    let windows = plan_windows(start, end, &run.params)?;
    info!(
        "{} windows of at most {} {} ticks (overlap {})",
        windows.len(),
        run.params.max_step,
        run.params.cadence,
        run.params.overlap
    );
    output::write_plan_csv(&windows, &args.output)?;
    if args.output.as_os_str() != "-" {
        info!("Wrote plan CSV: {}", args.output.display());
    }
    Ok(())
}

fn handle_stitch(args: StitchArgs) -> Result<()> {
    let keys: Vec<String> = args
        .keys
        .iter()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect();
    if keys.is_empty() {
        return Err(anyhow!("no series identifiers supplied"));
    }

    let overrides = Overrides {
        retries: args.retries,
        backoff_factor: args.backoff_factor,
        pace_ms: args.pace_ms,
        ..Overrides::default()
    };
    let (run, start, end) = resolve_range(&args.range, overrides)?;
    let timed = args.profile || args.range.verbose;

    let t_load = Instant::now();
    let replay = ReplayFetcher::load(&args.responses)?;
    if replay.is_empty() {
        warn!("No recorded responses in {}", args.responses.display());
    }
    if timed {
        info!(
            "Load stage: {:.1} ms ({} recordings)",
            t_load.elapsed().as_secs_f64() * 1000.0,
            replay.len()
        );
    }

    let t_stitch = Instant::now();
    let mut fetcher = PacedFetcher::new(RetryingFetcher::new(replay, run.retry.clone()), run.pace);
    let result = reconstruct(start, end, &run.params, &keys, &mut fetcher)?;
    if timed {
        info!(
            "Stitch stage: {:.1} ms ({} windows)",
            t_stitch.elapsed().as_secs_f64() * 1000.0,
            result.windows.len()
        );
    }
    for warning in &result.warnings {
        warn!("Low confidence: {}", warning);
    }
    info!(
        "Stitched {} series over {} ticks (params {})",
        result.keys.len(),
        result.get(&keys[0]).map_or(0, |s| s.len()),
        result.params_hash.get(..12).unwrap_or(&result.params_hash)
    );

    let t_write = Instant::now();
    output::write_series_csv(&result, &args.output)?;
    if args.output.as_os_str() != "-" {
        info!("Wrote stitched CSV: {}", args.output.display());
    }
    if let Some(path) = args.json.as_ref() {
        output::write_report_json(&result, path)?;
        info!("Wrote report: {}", path.display());
    }
    for (path, kind) in [(&args.png, ChartKind::Png), (&args.svg, ChartKind::Svg)] {
        if let Some(path) = path {
            match render_chart_guard(&result, path, kind) {
                Ok(()) => info!("Wrote plot: {}", path.display()),
                Err(err) => warn!("Skipping chart ({}): {}", path.display(), err),
            }
        }
    }
    if timed {
        info!(
            "Write stage: {:.1} ms",
            t_write.elapsed().as_secs_f64() * 1000.0
        );
    }
    Ok(())
}
