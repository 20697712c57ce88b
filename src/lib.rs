//! Checkpointed strategy evaluation driving an external backtesting engine.
//!
//! The pair universe is split into batches, every batch is backtested over a
//! backward walk of fixed-size windows, and the accumulated per-pair profit
//! history feeds a rule-based blacklist. A second sweep ranks candidate
//! concurrency limits and pair counts window by window. All progress lives in
//! one [`model::RunState`] document that is persisted after every unit of work.

pub mod blacklist;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod gateway;
pub mod market;
pub mod model;
pub mod pipeline;
pub mod process;
pub mod scheduler;
pub mod tournament;
pub mod universe;

#[cfg(test)]
mod testing;

pub use error::{PipelineError, Result};
