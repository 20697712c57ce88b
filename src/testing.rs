//! Deterministic collaborators shared by the unit tests.

use chrono::{Datelike, NaiveDate};

use crate::checkpoint::Checkpoint;
use crate::error::{PipelineError, Result};
use crate::gateway::{BacktestEngine, BacktestRequest};
use crate::market::MarketDataSource;
use crate::model::{RunState, WindowResult};

pub fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn pairs(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("C{i}/USDT")).collect()
}

#[derive(Clone, Debug, PartialEq)]
pub struct Call {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub pairs: Vec<String>,
    pub concurrency_limit: u32,
}

/// Pure function of its inputs; optionally fails once `fail_after` calls succeeded.
#[derive(Default)]
pub struct ScriptedEngine {
    pub calls: Vec<Call>,
    pub fail_after: Option<usize>,
}

impl ScriptedEngine {
    pub fn failing_after(n: usize) -> Self {
        Self { calls: Vec::new(), fail_after: Some(n) }
    }
}

pub fn scripted_result(req: &BacktestRequest<'_>) -> WindowResult {
    let seed = req.window_start.num_days_from_ce() as i64 + req.concurrency_limit as i64 * 3;
    let mut w = WindowResult::zero(req.window_start, req.window_end);
    for (i, p) in req.pairs.iter().enumerate() {
        let v = ((seed + i as i64 * 7).rem_euclid(11) - 5) as f64;
        if v != 0.0 {
            w.pairs.insert(p.clone(), v);
        }
    }
    w.profit = w.pairs.values().sum();
    w.drawdown = (seed.rem_euclid(4)) as f64;
    w.market_change = ((seed.rem_euclid(9)) - 2) as f64;
    w
}

impl BacktestEngine for ScriptedEngine {
    fn run_backtest(&mut self, req: &BacktestRequest<'_>) -> Result<WindowResult> {
        req.validate()?;
        if self.fail_after.is_some_and(|n| self.calls.len() >= n) {
            return Err(PipelineError::ExternalToolFailure {
                tool: "scripted".to_string(),
                code: Some(1),
                detail: "simulated crash".to_string(),
            });
        }
        self.calls.push(Call {
            start: req.window_start,
            end: req.window_end,
            pairs: req.pairs.to_vec(),
            concurrency_limit: req.concurrency_limit,
        });
        Ok(scripted_result(req))
    }
}

/// Keeps every persisted document in memory.
#[derive(Default)]
pub struct Recorder {
    pub snapshots: Vec<RunState>,
}

impl Recorder {
    pub fn last(&self) -> Option<&RunState> {
        self.snapshots.last()
    }
}

impl Checkpoint for Recorder {
    fn persist(&mut self, state: &RunState) -> Result<()> {
        self.snapshots.push(state.clone());
        Ok(())
    }
}

/// Market source with a fixed universe that records every download.
#[derive(Default)]
pub struct FixedMarket {
    pub universe: Vec<String>,
    pub downloads: Vec<(Vec<String>, NaiveDate, NaiveDate)>,
}

impl FixedMarket {
    pub fn new(universe: Vec<String>) -> Self {
        Self { universe, downloads: Vec::new() }
    }
}

impl MarketDataSource for FixedMarket {
    fn discover_pairs(&mut self) -> Result<Vec<String>> {
        Ok(self.universe.clone())
    }

    fn download_history(
        &mut self,
        pairs: &[String],
        start: NaiveDate,
        end: NaiveDate,
        _timeframes: &[String],
    ) -> Result<()> {
        self.downloads.push((pairs.to_vec(), start, end));
        Ok(())
    }
}
