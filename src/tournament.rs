//! Parameter sweep and its tournament scoring.
//!
//! Trials of one parameter kind that share a window form a heat. Inside a heat
//! candidates are ranked by `profit - drawdown` (worst gets rank 1), ranks are
//! summed per candidate value over all heats and normalized to 0..=100.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use tracing::{info, warn};

use crate::checkpoint::Checkpoint;
use crate::config::SweepConfig;
use crate::error::{PipelineError, Result};
use crate::gateway::{BacktestEngine, BacktestRequest};
use crate::model::{HistoricParameterScore, ParameterKind, ParameterScore, ParameterTrial, RunState};
use crate::scheduler::WindowPlan;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TournamentResult {
    pub scores: Vec<ParameterScore>,
    pub accumulated: Vec<ParameterScore>,
    pub historic: Vec<HistoricParameterScore>,
}

type Candidate = (ParameterKind, u32);

fn by_risk_adjusted(a: &&ParameterTrial, b: &&ParameterTrial) -> Ordering {
    a.result
        .risk_adjusted()
        .partial_cmp(&b.result.risk_adjusted())
        .unwrap_or(Ordering::Equal)
}

/// Scores every (kind, value) present in `trials`.
///
/// A kind without heats or without distinct values produces no output.
pub fn score(trials: &[ParameterTrial]) -> TournamentResult {
    let mut heats: BTreeMap<(ParameterKind, NaiveDate), Vec<&ParameterTrial>> = BTreeMap::new();
    let mut values: BTreeMap<ParameterKind, BTreeSet<u32>> = BTreeMap::new();
    for t in trials {
        heats.entry((t.kind, t.result.start)).or_default().push(t);
        values.entry(t.kind).or_default().insert(t.value);
    }

    let mut heat_count: BTreeMap<ParameterKind, usize> = BTreeMap::new();
    let mut rank_sum: BTreeMap<Candidate, usize> = BTreeMap::new();
    let mut wins: BTreeMap<Candidate, usize> = BTreeMap::new();
    let mut heat_rank: BTreeMap<(ParameterKind, u32, NaiveDate), usize> = BTreeMap::new();

    for ((kind, date), heat) in &heats {
        *heat_count.entry(*kind).or_default() += 1;
        let mut ordered = heat.clone();
        ordered.sort_by(by_risk_adjusted);
        let last = ordered.len() - 1;
        for (i, t) in ordered.iter().enumerate() {
            let rank = i + 1;
            *rank_sum.entry((t.kind, t.value)).or_default() += rank;
            if i == last {
                *wins.entry((t.kind, t.value)).or_default() += 1;
            }
            heat_rank.insert((t.kind, t.value, *date), rank);
        }
    }

    let distinct = |kind: ParameterKind| values.get(&kind).map_or(0, BTreeSet::len);
    let heats_of = |kind: ParameterKind| heat_count.get(&kind).copied().unwrap_or(0);

    let scores = rank_sum
        .iter()
        .filter_map(|(&(kind, value), &sum)| {
            let (n_values, n_heats) = (distinct(kind), heats_of(kind));
            if n_values == 0 || n_heats == 0 {
                return None;
            }
            let won = wins.get(&(kind, value)).copied().unwrap_or(0);
            Some(ParameterScore {
                kind,
                value,
                score: sum as f64 / (n_values * n_heats) as f64 * 100.0,
                winner: won as f64 / n_heats as f64 * 100.0,
            })
        })
        .collect();

    let historic = heat_rank
        .iter()
        .filter_map(|(&(kind, value, date), &rank)| {
            let n_values = distinct(kind);
            (n_values > 0).then(|| HistoricParameterScore {
                kind,
                value,
                score: rank as f64 / n_values as f64 * 100.0,
                date,
            })
        })
        .collect();

    TournamentResult {
        scores,
        accumulated: accumulated_scores(trials),
        historic,
    }
}

/// Compounded profit `Π(1 + profit/100)` per (kind, value), relative to the
/// best value of the same kind.
pub fn accumulated_scores(trials: &[ParameterTrial]) -> Vec<ParameterScore> {
    let mut factors: BTreeMap<Candidate, f64> = BTreeMap::new();
    for t in trials {
        *factors.entry((t.kind, t.value)).or_insert(1.0) *= 1.0 + t.result.profit / 100.0;
    }

    let mut best: BTreeMap<ParameterKind, f64> = BTreeMap::new();
    for (&(kind, _), &f) in &factors {
        let slot = best.entry(kind).or_insert(f64::NEG_INFINITY);
        *slot = slot.max(f);
    }

    factors
        .iter()
        .filter_map(|(&(kind, value), &f)| {
            let max = best.get(&kind).copied().filter(|m| *m > 0.0)?;
            Some(ParameterScore {
                kind,
                value,
                score: f / max * 100.0,
                winner: 0.0,
            })
        })
        .collect()
}

/// Highest score of `kind`; ties go to the smallest value.
pub fn optimal_value(scores: &[ParameterScore], kind: ParameterKind) -> Option<u32> {
    scores
        .iter()
        .filter(|s| s.kind == kind)
        .max_by(|a, b| a.score.total_cmp(&b.score).then_with(|| b.value.cmp(&a.value)))
        .map(|s| s.value)
}

#[allow(clippy::too_many_arguments)]
fn run_trial(
    state: &mut RunState,
    kind: ParameterKind,
    value: u32,
    window: (NaiveDate, NaiveDate),
    pairs: &[String],
    concurrency_limit: u32,
    engine: &mut dyn BacktestEngine,
    checkpoint: &mut dyn Checkpoint,
) -> Result<()> {
    let (start, end) = window;
    if state
        .parameter_sweep
        .as_ref()
        .is_some_and(|s| s.has_trial(kind, value, start, end))
    {
        return Ok(());
    }

    let result = engine.run_backtest(&BacktestRequest {
        window_start: start,
        window_end: end,
        pairs,
        concurrency_limit,
        strategy: &state.strategy,
    })?;
    info!(%kind, value, start = %start, profit = result.profit, drawdown = result.drawdown, "trial done");

    state
        .parameter_sweep
        .get_or_insert_with(Default::default)
        .trials
        .push(ParameterTrial { kind, value, result });
    checkpoint.persist(state)
}

/// Runs every outstanding trial of the two-phase sweep.
///
/// The concurrency limit is swept first over a fixed pair set; its winner is
/// then used while sweeping the pair count. Already recorded trials are
/// skipped, so an interrupted sweep resumes at trial granularity.
pub fn run_sweep(
    state: &mut RunState,
    plan: &WindowPlan,
    sweep: &SweepConfig,
    engine: &mut dyn BacktestEngine,
    checkpoint: &mut dyn Checkpoint,
) -> Result<()> {
    if state.parameter_sweep.as_ref().is_some_and(|s| s.completed) {
        return Ok(());
    }
    if state.pairs().is_empty() {
        return Err(PipelineError::InvalidRequest("parameter sweep needs a pair universe".to_string()));
    }
    let windows = plan.windows(plan.required_windows());

    let universe = state.pairs().to_vec();
    let sweep_pairs = (sweep.concurrency_sweep_pairs() as usize).min(universe.len());
    let limits = sweep.candidates(ParameterKind::ConcurrencyLimit);
    for &window in &windows {
        for &limit in &limits {
            run_trial(
                state,
                ParameterKind::ConcurrencyLimit,
                limit,
                window,
                &universe[..sweep_pairs],
                limit,
                engine,
                checkpoint,
            )?;
        }
    }

    let concurrency_trials: Vec<ParameterTrial> = state
        .parameter_sweep
        .iter()
        .flat_map(|s| s.trials_of(ParameterKind::ConcurrencyLimit).cloned())
        .collect();
    let optimal_limit = optimal_value(&score(&concurrency_trials).scores, ParameterKind::ConcurrencyLimit)
        .ok_or_else(|| PipelineError::InvalidRequest("no concurrency-limit trials to choose from".to_string()))?;
    info!(optimal_limit, "concurrency limit selected for the pair-count sweep");

    let counts = sweep.candidates(ParameterKind::PairCount);
    if counts.iter().any(|c| *c as usize > universe.len()) {
        warn!(universe = universe.len(), "pair-count candidates exceed the universe and are clamped");
    }
    for &window in &windows {
        for &count in &counts {
            let take = (count as usize).min(universe.len());
            run_trial(
                state,
                ParameterKind::PairCount,
                count,
                window,
                &universe[..take],
                optimal_limit,
                engine,
                checkpoint,
            )?;
        }
    }

    state.parameter_sweep.get_or_insert_with(Default::default).completed = true;
    checkpoint.persist(state)
}
