//! Top-level run controller.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::info;

use crate::blacklist::{ensure_blacklist, ensure_performance};
use crate::checkpoint::Checkpoint;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::gateway::BacktestEngine;
use crate::market::MarketDataSource;
use crate::model::{HistoricParameterScore, ParameterKind, ParameterScore, PerformanceSummary, RunState, opt_day};
use crate::scheduler::{WindowPlan, drain_windows};
use crate::tournament::{optimal_value, run_sweep, score};
use crate::universe::{HistorySpan, ensure_history, ensure_pairs, next_batch};

/// Which stages a run executes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Partition backtests, blacklist and performance summary.
    Blacklist,
    /// Parameter sweep and tournament scores.
    Parameters,
    Full,
}

impl Mode {
    fn runs_blacklist(self) -> bool {
        matches!(self, Mode::Blacklist | Mode::Full)
    }

    fn runs_sweep(self) -> bool {
        matches!(self, Mode::Parameters | Mode::Full)
    }
}

/// External collaborators driven by a run.
pub struct Collaborators<'a> {
    pub engine: &'a mut dyn BacktestEngine,
    pub market: &'a mut dyn MarketDataSource,
    pub checkpoint: &'a mut dyn Checkpoint,
}

/// What a run hands to the report renderer.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunReport {
    pub tag: String,
    pub strategy: String,
    #[serde(with = "opt_day")]
    pub end_date: Option<NaiveDate>,
    pub pair_count: usize,
    pub blacklist: Option<Vec<String>>,
    pub green_pairs: Option<Vec<String>>,
    pub performance: Option<PerformanceSummary>,
    pub scores: Vec<ParameterScore>,
    pub accumulated: Vec<ParameterScore>,
    pub historic: Vec<HistoricParameterScore>,
    pub optimal_concurrency_limit: Option<u32>,
    pub optimal_pair_count: Option<u32>,
}

impl RunReport {
    /// Derives the report from the persisted state; scores are recomputed.
    pub fn from_state(tag: &str, state: &RunState) -> Self {
        let green_pairs = state.blacklist.as_ref().map(|banned| {
            let banned: HashSet<&str> = banned.iter().map(String::as_str).collect();
            state
                .pairs()
                .iter()
                .filter(|p| !banned.contains(p.as_str()))
                .cloned()
                .collect()
        });
        let trials = state
            .parameter_sweep
            .as_ref()
            .map(|s| s.trials.as_slice())
            .unwrap_or_default();
        let tournament = score(trials);

        Self {
            tag: tag.to_string(),
            strategy: state.strategy.clone(),
            end_date: state.end_date,
            pair_count: state.pairs().len(),
            blacklist: state.blacklist.clone(),
            green_pairs,
            performance: state.performance,
            optimal_concurrency_limit: optimal_value(&tournament.scores, ParameterKind::ConcurrencyLimit),
            optimal_pair_count: optimal_value(&tournament.scores, ParameterKind::PairCount),
            scores: tournament.scores,
            accumulated: tournament.accumulated,
            historic: tournament.historic,
        }
    }
}

/// Drives `state` through every stage of `mode` that is not finished yet.
///
/// Each stage checks the state first, so calling this with a checkpoint from
/// an interrupted run continues at the first missing unit of work.
pub fn run(
    state: &mut RunState,
    config: &PipelineConfig,
    mode: Mode,
    today: NaiveDate,
    services: Collaborators<'_>,
) -> Result<RunReport> {
    let Collaborators { engine, market, checkpoint } = services;
    let pause = Duration::from_secs(config.rate_limit_timeout_secs);

    ensure_pairs(state, market, checkpoint, pause)?;
    let span = HistorySpan {
        window_days: config.window_days,
        time_range_days: config.time_range_days,
        padding_days: config.download_padding_days,
        timeframes: config.engine.timeframes.clone(),
        max_pairs: (mode == Mode::Parameters).then_some(config.sweep.pairs_needed() as usize),
    };
    ensure_history(state, market, checkpoint, &span, today, pause)?;

    let reference_end = state
        .end_date
        .ok_or_else(|| PipelineError::InvalidRequest("history downloaded without an end date".to_string()))?;
    let plan = WindowPlan {
        window_days: config.window_days,
        time_range_days: config.time_range_days,
        reference_end,
    };
    info!(
        ?mode,
        end = %reference_end,
        windows = plan.required_windows() + 1,
        pairs = state.pairs().len(),
        "run started"
    );

    if mode.runs_blacklist() {
        while let Some(index) = next_batch(state, config.batch_size, checkpoint)? {
            drain_windows(state, index, &plan, config.concurrency_limit, engine, checkpoint)?;
        }
        ensure_blacklist(state, checkpoint)?;
        ensure_performance(state, checkpoint)?;
    }

    if mode.runs_sweep() {
        run_sweep(state, &plan, &config.sweep, engine, checkpoint)?;
    }

    Ok(RunReport::from_state(&config.tag, state))
}

pub fn write_report(path: &Path, report: &RunReport) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
    }
    fs::write(path, serde_json::to_string_pretty(report)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SweepConfig, ValueRange};
    use crate::testing::{FixedMarket, Recorder, ScriptedEngine, day, pairs};

    fn config() -> PipelineConfig {
        PipelineConfig {
            strategy: "SampleStrategy".to_string(),
            window_days: 7,
            time_range_days: 14,
            batch_size: 2,
            rate_limit_timeout_secs: 0,
            sweep: SweepConfig {
                pair_counts: ValueRange { low: 2, high: 4, step: 2 },
                concurrency_limits: ValueRange { low: 1, high: 3, step: 1 },
                concurrency_sweep_pairs: None,
            },
            ..PipelineConfig::default()
        }
    }

    fn run_mode(mode: Mode) -> (RunState, RunReport, ScriptedEngine, FixedMarket) {
        let mut state = RunState::new("SampleStrategy");
        let mut engine = ScriptedEngine::default();
        let mut market = FixedMarket::new(pairs(5));
        let mut rec = Recorder::default();
        let report = run(
            &mut state,
            &config(),
            mode,
            day(2024, 3, 31),
            Collaborators { engine: &mut engine, market: &mut market, checkpoint: &mut rec },
        )
        .unwrap();
        (state, report, engine, market)
    }

    #[test]
    fn blacklist_mode_skips_the_sweep() {
        let (state, report, engine, market) = run_mode(Mode::Blacklist);
        // 3 partitions x (2 + 1) windows
        assert_eq!(engine.calls.len(), 9);
        assert_eq!(state.partitions.len(), 3);
        assert!(state.partitions.iter().all(|p| p.completed));
        assert!(state.parameter_sweep.is_none());
        assert_eq!(market.downloads.len(), 1);
        assert_eq!(market.downloads[0].0, pairs(5));

        let blacklist = report.blacklist.unwrap();
        let green = report.green_pairs.unwrap();
        assert_eq!(blacklist.len() + green.len(), 5);
        assert!(report.performance.is_some());
        assert!(report.scores.is_empty());
    }

    #[test]
    fn parameters_mode_downloads_only_swept_pairs() {
        let (state, report, engine, market) = run_mode(Mode::Parameters);
        assert!(state.partitions.is_empty());
        assert!(state.blacklist.is_none());
        assert_eq!(market.downloads[0].0, pairs(4));
        // 2 windows x (3 limits + 2 counts)
        assert_eq!(engine.calls.len(), 10);
        assert!(report.optimal_concurrency_limit.is_some());
        assert!(report.optimal_pair_count.is_some());
        assert_eq!(report.scores.len(), 5);
    }

    #[test]
    fn full_mode_runs_everything_and_is_idempotent() {
        let (mut state, report, engine, _) = run_mode(Mode::Full);
        assert_eq!(engine.calls.len(), 19);

        let mut engine = ScriptedEngine::default();
        let mut market = FixedMarket::new(pairs(5));
        let mut rec = Recorder::default();
        let again = run(
            &mut state,
            &config(),
            Mode::Full,
            day(2024, 4, 30),
            Collaborators { engine: &mut engine, market: &mut market, checkpoint: &mut rec },
        )
        .unwrap();
        assert!(engine.calls.is_empty());
        assert!(market.downloads.is_empty());
        assert!(rec.snapshots.is_empty());
        assert_eq!(again, report);
    }

    /// Every backtested pair was part of some earlier download.
    fn assert_history_present(engine: &ScriptedEngine, market: &FixedMarket) {
        let downloaded: HashSet<&String> = market.downloads.iter().flat_map(|(p, _, _)| p).collect();
        for call in &engine.calls {
            for pair in &call.pairs {
                assert!(downloaded.contains(pair), "{pair} backtested without history");
            }
        }
    }

    #[test]
    fn blacklist_after_parameters_downloads_the_rest() {
        let mut state = RunState::new("SampleStrategy");
        let mut engine = ScriptedEngine::default();
        let mut market = FixedMarket::new(pairs(8));
        let mut rec = Recorder::default();
        for mode in [Mode::Parameters, Mode::Blacklist] {
            run(
                &mut state,
                &config(),
                mode,
                day(2024, 3, 31),
                Collaborators { engine: &mut engine, market: &mut market, checkpoint: &mut rec },
            )
            .unwrap();
        }

        assert_eq!(market.downloads.len(), 2);
        assert_eq!(market.downloads[0].0, pairs(4));
        assert_eq!(market.downloads[1].0, pairs(8)[4..].to_vec());
        assert_eq!(market.downloads[0].1, market.downloads[1].1);
        assert_eq!(state.downloaded_pairs, 8);
        assert_history_present(&engine, &market);
    }

    #[test]
    fn concurrency_sweep_pairs_are_downloaded_in_parameters_mode() {
        let mut cfg = config();
        cfg.sweep.concurrency_sweep_pairs = Some(7);
        let mut state = RunState::new("SampleStrategy");
        let mut engine = ScriptedEngine::default();
        let mut market = FixedMarket::new(pairs(8));
        run(
            &mut state,
            &cfg,
            Mode::Parameters,
            day(2024, 3, 31),
            Collaborators { engine: &mut engine, market: &mut market, checkpoint: &mut Recorder::default() },
        )
        .unwrap();

        assert_eq!(market.downloads[0].0, pairs(7));
        assert!(engine.calls.iter().any(|c| c.pairs.len() == 7));
        assert_history_present(&engine, &market);
    }

    #[test]
    fn report_is_written_as_json() {
        let (_, report, _, _) = run_mode(Mode::Full);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("default-report.json");
        write_report(&path, &report).unwrap();

        let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["strategy"], "SampleStrategy");
        assert_eq!(json["end_date"], "20240331");
        assert_eq!(json["scores"].as_array().unwrap().len(), 5);
        assert_eq!(json["scores"][0]["kind"], "concurrency_limit");
    }
}
