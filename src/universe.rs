//! Pair universe discovery, history download and batch partitioning.

use std::time::Duration;

use chrono::{Days, NaiveDate};
use tracing::info;

use crate::checkpoint::Checkpoint;
use crate::error::{PipelineError, Result};
use crate::market::{MarketDataSource, retry_rate_limited};
use crate::model::{PartitionState, RunState};

/// What to download before the first backtest.
#[derive(Clone, Debug)]
pub struct HistorySpan {
    pub window_days: u32,
    pub time_range_days: u32,
    pub padding_days: u32,
    pub timeframes: Vec<String>,
    /// Only the first `max_pairs` of the universe are downloaded.
    pub max_pairs: Option<usize>,
}

impl HistorySpan {
    /// First day needed to backtest every window ending before `end`.
    pub fn start_for(&self, end: NaiveDate) -> NaiveDate {
        let windows = u64::from(self.time_range_days.div_ceil(self.window_days)) + 1;
        end - Days::new(u64::from(self.window_days) * windows + u64::from(self.padding_days))
    }
}

/// Discovers the pair universe exactly once per run.
pub fn ensure_pairs(
    state: &mut RunState,
    market: &mut dyn MarketDataSource,
    checkpoint: &mut dyn Checkpoint,
    rate_limit_pause: Duration,
) -> Result<()> {
    if state.all_pairs.is_some() {
        return Ok(());
    }
    let pairs = retry_rate_limited("pair discovery", rate_limit_pause, || market.discover_pairs())?;
    if pairs.is_empty() {
        return Err(PipelineError::ParseFailure("pair discovery returned no pairs".to_string()));
    }
    info!(count = pairs.len(), "pair universe fixed");
    state.all_pairs = Some(pairs);
    checkpoint.persist(state)
}

/// Makes sure history exists for the leading pairs `span` asks for.
///
/// The first download pins `today` as the reference end date. A later call
/// that needs more of the universe downloads only the missing pairs, over the
/// same date range.
pub fn ensure_history(
    state: &mut RunState,
    market: &mut dyn MarketDataSource,
    checkpoint: &mut dyn Checkpoint,
    span: &HistorySpan,
    today: NaiveDate,
    rate_limit_pause: Duration,
) -> Result<()> {
    let all = state.pairs();
    let wanted = span.max_pairs.map_or(all.len(), |n| n.min(all.len()));
    let have = if state.data_downloaded { state.downloaded_pairs } else { 0 };
    if state.data_downloaded && have >= wanted {
        return Ok(());
    }

    let end = state.end_date.unwrap_or(today);
    let start = span.start_for(end);
    let pairs = all[have.min(wanted)..wanted].to_vec();
    info!(from = have, to = wanted, start = %start, end = %end, "history missing");
    retry_rate_limited("history download", rate_limit_pause, || {
        market.download_history(&pairs, start, end, &span.timeframes)
    })?;

    state.data_downloaded = true;
    state.downloaded_pairs = wanted;
    state.end_date = Some(end);
    checkpoint.persist(state)
}

/// Resumable batch cursor.
///
/// Hands back the unfinished partition if there is one, otherwise carves the
/// next contiguous slice of the universe. `None` once every pair is assigned.
pub fn next_batch(
    state: &mut RunState,
    batch_size: usize,
    checkpoint: &mut dyn Checkpoint,
) -> Result<Option<usize>> {
    let active = state.completed_partitions;
    if state.partitions.get(active).is_some_and(|p| !p.completed) {
        return Ok(Some(active));
    }

    let start = state.assigned_pairs();
    let total = state.pairs().len();
    if start >= total || batch_size == 0 {
        return Ok(None);
    }
    let end = (start + batch_size).min(total);
    let batch = state.pairs()[start..end].to_vec();
    info!(partition = state.partitions.len() + 1, from = start, to = end, "new pair batch");

    state.partitions.push(PartitionState::new(batch));
    checkpoint.persist(state)?;
    Ok(Some(state.partitions.len() - 1))
}
