//! Backward walk over fixed-size day windows for one partition.

use chrono::{Days, NaiveDate};
use tracing::info;

use crate::checkpoint::Checkpoint;
use crate::error::{PipelineError, Result};
use crate::gateway::{BacktestEngine, BacktestRequest};
use crate::model::RunState;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowPlan {
    pub window_days: u32,
    pub time_range_days: u32,
    pub reference_end: NaiveDate,
}

impl WindowPlan {
    pub fn required_windows(&self) -> usize {
        self.time_range_days.div_ceil(self.window_days) as usize
    }

    /// The window ending the day before `cursor`, both bounds inclusive.
    pub fn window_before(&self, cursor: NaiveDate) -> (NaiveDate, NaiveDate) {
        let end = cursor - Days::new(1);
        let start = end - Days::new(u64::from(self.window_days.saturating_sub(1)));
        (start, end)
    }

    /// The first `count` windows walking back from the reference end, newest first.
    pub fn windows(&self, count: usize) -> Vec<(NaiveDate, NaiveDate)> {
        let mut out = Vec::with_capacity(count);
        let mut cursor = self.reference_end;
        for _ in 0..count {
            let (start, end) = self.window_before(cursor);
            out.push((start, end));
            cursor = start;
        }
        out
    }
}

/// Runs every outstanding window of partition `index`, persisting after each.
///
/// Resumes from the partition's recorded cursor; a partition finishes after
/// `required_windows() + 1` windows.
pub fn drain_windows(
    state: &mut RunState,
    index: usize,
    plan: &WindowPlan,
    concurrency_limit: u32,
    engine: &mut dyn BacktestEngine,
    checkpoint: &mut dyn Checkpoint,
) -> Result<()> {
    let required = plan.required_windows();
    let total = state.partitions.len();
    let Some(partition) = state.partitions.get(index) else {
        return Err(PipelineError::InvalidRequest(format!(
            "partition {index} does not exist ({total} partitions)"
        )));
    };
    if partition.completed {
        return Ok(());
    }

    while state.partitions[index].completed_windows <= required {
        let partition = &state.partitions[index];
        let cursor = partition.cursor.unwrap_or(plan.reference_end);
        let (start, end) = plan.window_before(cursor);
        let request = BacktestRequest {
            window_start: start,
            window_end: end,
            pairs: &partition.pairs,
            concurrency_limit,
            strategy: &state.strategy,
        };
        let result = engine.run_backtest(&request)?;
        info!(
            partition = index + 1,
            window = partition.completed_windows + 1,
            of = required + 1,
            start = %start,
            end = %end,
            profit = result.profit,
            "window done"
        );

        state.partitions[index].record_window(result);
        checkpoint.persist(state)?;
    }

    state.partitions[index].completed = true;
    state.completed_partitions += 1;
    checkpoint.persist(state)?;
    info!(partition = index + 1, "partition complete");
    Ok(())
}
