//! Pair discovery and history download collaborators.

use std::path::PathBuf;
use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use chrono::NaiveDate;
use regex::Regex;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::{PipelineError, Result};
use crate::model::format_day;
use crate::process::run_tool;

static RE_QUOTED_PAIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'(?P<pair>[0-9A-Za-z]+/[0-9A-Za-z]+)'").expect("static regex"));

pub trait MarketDataSource {
    /// Tradable pairs in the engine's ranking order.
    fn discover_pairs(&mut self) -> Result<Vec<String>>;

    fn download_history(
        &mut self,
        pairs: &[String],
        start: NaiveDate,
        end: NaiveDate,
        timeframes: &[String],
    ) -> Result<()>;
}

/// Retries `op` for as long as it reports [`PipelineError::RateLimited`],
/// sleeping a fixed `pause` between attempts. Any other outcome is returned.
pub fn retry_rate_limited<T>(
    what: &str,
    pause: Duration,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempt = 1_u64;
    loop {
        match op() {
            Err(e) if e.is_rate_limited() => {
                warn!(what, attempt, pause_secs = pause.as_secs(), "rate limited, waiting before retry");
                thread::sleep(pause);
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Pairs are the quoted `'BASE/QUOTE'` tokens on the last output line.
pub fn parse_pairlist(output: &str) -> Result<Vec<String>> {
    let last = output
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| PipelineError::ParseFailure("pair list output is empty".to_string()))?;
    let pairs: Vec<String> = RE_QUOTED_PAIR
        .captures_iter(last)
        .map(|c| c["pair"].to_string())
        .collect();
    if pairs.is_empty() {
        return Err(PipelineError::ParseFailure(format!("pairs not found in line: {last}")));
    }
    Ok(pairs)
}

#[derive(Clone, Debug)]
pub struct FreqtradeMarketData {
    executable: String,
    discovery_config: PathBuf,
    download_config: PathBuf,
    data_format: String,
}

impl FreqtradeMarketData {
    pub fn new(engine: &EngineConfig) -> Self {
        Self {
            executable: engine.executable.clone(),
            discovery_config: engine.discovery_config().to_path_buf(),
            download_config: engine.backtest_config.clone(),
            data_format: engine.data_format.clone(),
        }
    }

    pub fn download_args(
        &self,
        pairs: &[String],
        start: NaiveDate,
        end: NaiveDate,
        timeframes: &[String],
    ) -> Vec<String> {
        let mut args = vec!["download-data".to_string(), "-t".to_string()];
        args.extend(timeframes.iter().cloned());
        args.extend([
            "--data-format-ohlcv".to_string(),
            self.data_format.clone(),
            "--timerange".to_string(),
            format!("{}-{}", format_day(start), format_day(end)),
            "-p".to_string(),
        ]);
        args.extend(pairs.iter().cloned());
        args.push("-c".to_string());
        args.push(self.download_config.display().to_string());
        args
    }
}

impl MarketDataSource for FreqtradeMarketData {
    fn discover_pairs(&mut self) -> Result<Vec<String>> {
        let args = vec![
            "test-pairlist".to_string(),
            "-c".to_string(),
            self.discovery_config.display().to_string(),
        ];
        let output = run_tool(&self.executable, &args)?.into_success()?;
        let pairs = parse_pairlist(&output)?;
        info!(count = pairs.len(), "discovered tradable pairs");
        Ok(pairs)
    }

    fn download_history(
        &mut self,
        pairs: &[String],
        start: NaiveDate,
        end: NaiveDate,
        timeframes: &[String],
    ) -> Result<()> {
        info!(pairs = pairs.len(), start = %start, end = %end, "downloading history");
        let args = self.download_args(pairs, start, end, timeframes);
        run_tool(&self.executable, &args)?.into_success()?;
        Ok(())
    }
}
