use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use pair_sweep::checkpoint::CheckpointStore;
use pair_sweep::config::PipelineConfig;
use pair_sweep::gateway::FreqtradeEngine;
use pair_sweep::market::FreqtradeMarketData;
use pair_sweep::pipeline::{self, Collaborators, Mode};

#[derive(Parser, Debug)]
#[command(name = "pair-sweep", about = "Resumable pair blacklist and parameter sweep over freqtrade backtests")]
struct Args {
    /// TOML run configuration; defaults apply to every missing field.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Run tag, keys the checkpoint and report files.
    #[arg(long)]
    tag: Option<String>,
    #[arg(long)]
    strategy: Option<String>,
    #[arg(long, default_value = "info")]
    log_level: String,
    /// Additional JSON log file.
    #[arg(long)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Backtest every pair batch, then derive the blacklist.
    Blacklist,
    /// Sweep concurrency limit and pair count.
    Parameters,
    /// Blacklist followed by the parameter sweep.
    All,
}

impl From<Command> for Mode {
    fn from(cmd: Command) -> Self {
        match cmd {
            Command::Blacklist => Mode::Blacklist,
            Command::Parameters => Mode::Parameters,
            Command::All => Mode::Full,
        }
    }
}

fn init_logging(level: &str, log_file: Option<&PathBuf>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("pair_sweep={level}")))
        .context("invalid --log-level")?;

    let json_layer = match log_file {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
            }
            let file = File::create(path).with_context(|| format!("open log file {}", path.display()))?;
            Some(fmt::layer().json().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(json_layer)
        .init();
    Ok(())
}

fn load_config(args: &Args) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_toml_file(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(tag) = &args.tag {
        config.tag = tag.clone();
    }
    if let Some(strategy) = &args.strategy {
        config.strategy = strategy.clone();
    }
    config.validate()?;
    config.check_resources()?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, args.log_file.as_ref())?;

    let config = load_config(&args).context("loading run configuration")?;
    let mode = Mode::from(args.command);
    info!(
        tag = %config.tag,
        strategy = %config.strategy,
        ?mode,
        window_days = config.window_days,
        time_range_days = config.time_range_days,
        "pair-sweep starting"
    );

    let mut store = CheckpointStore::new(config.checkpoint_path());
    let mut state = store
        .load_or_new(&config.strategy)
        .with_context(|| format!("reading checkpoint {}", store.path().display()))?;

    let mut engine = FreqtradeEngine::new(&config.engine);
    let mut market = FreqtradeMarketData::new(&config.engine);
    let report = pipeline::run(
        &mut state,
        &config,
        mode,
        Utc::now().date_naive(),
        Collaborators {
            engine: &mut engine,
            market: &mut market,
            checkpoint: &mut store,
        },
    )
    .with_context(|| format!("run aborted; resume with the same tag ({})", config.tag))?;

    let report_path = config.report_path();
    pipeline::write_report(&report_path, &report)
        .with_context(|| format!("writing report {}", report_path.display()))?;

    info!(
        pairs = report.pair_count,
        blacklisted = report.blacklist.as_ref().map(Vec::len),
        unfiltered = report.performance.map(|p| p.unfiltered),
        filtered = report.performance.map(|p| p.filtered),
        optimal_concurrency_limit = report.optimal_concurrency_limit,
        optimal_pair_count = report.optimal_pair_count,
        report = %report_path.display(),
        "done"
    );
    Ok(())
}
