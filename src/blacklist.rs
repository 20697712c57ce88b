//! Rule-based blacklist over each pair's per-window profit history.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::checkpoint::Checkpoint;
use crate::error::Result;
use crate::model::{PerformanceSummary, RunState};

/// Profit of `pair` per window, oldest first. Untraded windows count as 0.
pub fn profit_history(state: &RunState, pair: &str) -> Vec<f64> {
    state
        .partition_of(pair)
        .map(|p| p.results.iter().rev().map(|w| w.pair_profit(pair)).collect())
        .unwrap_or_default()
}

/// Which heuristics a history trips.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Verdict {
    pub overall_negative: bool,
    pub asymmetric_downside: bool,
    pub majority_negative: bool,
    pub recent_decay: bool,
}

impl Verdict {
    pub fn is_blacklisted(&self) -> bool {
        self.overall_negative || self.asymmetric_downside || self.majority_negative || self.recent_decay
    }
}

pub fn evaluate(history: &[f64]) -> Verdict {
    Verdict {
        overall_negative: overall_negative(history),
        asymmetric_downside: asymmetric_downside(history),
        majority_negative: majority_negative(history),
        recent_decay: recent_decay(history),
    }
}

fn overall_negative(history: &[f64]) -> bool {
    history.iter().sum::<f64>() < 0.0
}

fn asymmetric_downside(history: &[f64]) -> bool {
    if history.is_empty() {
        return false;
    }
    let min = history.iter().copied().fold(f64::INFINITY, f64::min);
    let max = history.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    min < 0.0 && min.abs() > 3.0 * max
}

fn majority_negative(history: &[f64]) -> bool {
    let negative = history.iter().filter(|v| **v < 0.0).count();
    let positive = history.iter().filter(|v| **v > 0.0).count();
    negative > positive
}

/// The back half of `values`; for odd lengths the middle entry belongs to it.
fn back_half(values: &[f64]) -> &[f64] {
    &values[values.len() / 2..]
}

/// Two overlapping checks, either one triggers:
/// the trailing half of the traded (non-zero) windows is non-positive, or the
/// trailing half of all windows is non-positive with at least one loss.
fn recent_decay(history: &[f64]) -> bool {
    let traded: Vec<f64> = history.iter().copied().filter(|v| *v != 0.0).collect();
    let traded_tail = back_half(&traded);
    let traded_decay = traded_tail.iter().all(|v| *v <= 0.0) && traded_tail.iter().any(|v| *v <= 0.0);

    let tail = back_half(history);
    let window_decay = tail.iter().all(|v| *v <= 0.0) && tail.iter().any(|v| *v < 0.0);

    traded_decay || window_decay
}

/// Every pair of the universe that trips at least one heuristic, in universe order.
pub fn generate(state: &RunState) -> Vec<String> {
    state
        .pairs()
        .iter()
        .filter(|pair| {
            let verdict = evaluate(&profit_history(state, pair));
            debug!(pair = %pair, ?verdict, "evaluated pair");
            verdict.is_blacklisted()
        })
        .cloned()
        .collect()
}

/// Computes the blacklist once; afterwards the stored list is authoritative.
pub fn ensure_blacklist(state: &mut RunState, checkpoint: &mut dyn Checkpoint) -> Result<()> {
    if state.blacklist.is_some() {
        return Ok(());
    }
    let blacklist = generate(state);
    info!(blacklisted = blacklist.len(), universe = state.pairs().len(), "blacklist generated");
    state.blacklist = Some(blacklist);
    checkpoint.persist(state)
}

fn ratio(profit: f64, market: f64) -> f64 {
    if market == 0.0 { 0.0 } else { profit / market }
}

/// Strategy profit relative to market change, with and without the blacklist.
pub fn performance_summary(state: &RunState) -> PerformanceSummary {
    let (first_profit, first_market) = state
        .partitions
        .first()
        .map(|p| {
            p.results
                .iter()
                .fold((0.0, 0.0), |(pr, mk), w| (pr + w.profit, mk + w.market_change))
        })
        .unwrap_or((0.0, 0.0));

    let banned: HashSet<&str> = state
        .blacklist
        .iter()
        .flatten()
        .map(String::as_str)
        .collect();
    let windows = || state.partitions.iter().flat_map(|p| p.results.iter());

    let kept_profit: f64 = windows()
        .flat_map(|w| w.pairs.iter())
        .filter(|(pair, _)| !banned.contains(pair.as_str()))
        .map(|(_, profit)| *profit)
        .sum();
    let all_profit: f64 = windows().map(|w| w.profit).sum();
    let all_market: f64 = windows().map(|w| w.market_change).sum();

    PerformanceSummary {
        unfiltered: ratio(first_profit, first_market),
        filtered: ratio(kept_profit, first_market),
        overall: ratio(all_profit, all_market),
    }
}

pub fn ensure_performance(state: &mut RunState, checkpoint: &mut dyn Checkpoint) -> Result<()> {
    if state.performance.is_some() {
        return Ok(());
    }
    let summary = performance_summary(state);
    info!(
        unfiltered = summary.unfiltered,
        filtered = summary.filtered,
        overall = summary.overall,
        "performance summary"
    );
    state.performance = Some(summary);
    checkpoint.persist(state)
}
