//! Single call into the external backtesting engine.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::{PipelineError, Result};
use crate::model::{WindowResult, format_day};
use crate::process::run_tool;

macro_rules! re {
    ($pat:expr) => {
        LazyLock::new(|| Regex::new($pat).expect("static regex"))
    };
}

static RE_PAIR_ROW: LazyLock<Regex> = re!(
    r"^\|\s*(?P<pair>[A-Z0-9]*/[A-Z0-9]*)\s*\|[^|]*\|[^|]*\|[^|]*\|[^|]*\|\s*(?P<profit>-?\d+(?:\.\d+)?).*\|$"
);
static RE_TRADES_PER_DAY: LazyLock<Regex> = re!(
    r"^\|\s*Total/Daily Avg Trades\s*\|\s*\d+(?:\.\d+)?\s*/\s*(?P<value>\d+(?:\.\d+)?).*\|$"
);
static RE_TOTAL_PROFIT: LazyLock<Regex> =
    re!(r"^\|\s*Total profit %\s*\|\s*(?P<value>-?\d+(?:\.\d+)?).*\|$");
static RE_DRAWDOWN: LazyLock<Regex> = re!(r"^\|\s*Drawdown\s*\|\s*(?P<value>-?\d+(?:\.\d+)?).*\|$");
static RE_MARKET_CHANGE: LazyLock<Regex> =
    re!(r"^\|\s*Market change\s*\|\s*(?P<value>-?\d+(?:\.\d+)?).*\|$");

pub const NO_TRADES_MARKER: &str = "No trades made.";

/// Offset from the strategy header to the first per-pair row
/// (banner, column header and separator sit in between).
const PAIR_TABLE_OFFSET: usize = 4;

/// Inputs of one backtest invocation.
#[derive(Clone, Debug)]
pub struct BacktestRequest<'a> {
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub pairs: &'a [String],
    pub concurrency_limit: u32,
    pub strategy: &'a str,
}

impl BacktestRequest<'_> {
    pub fn validate(&self) -> Result<()> {
        if self.window_start > self.window_end {
            return Err(PipelineError::InvalidRequest(format!(
                "window start {} is after window end {}",
                self.window_start, self.window_end
            )));
        }
        if self.pairs.is_empty() {
            return Err(PipelineError::InvalidRequest("empty pair list".to_string()));
        }
        if self.concurrency_limit == 0 {
            return Err(PipelineError::InvalidRequest("concurrency limit must be positive".to_string()));
        }
        if self.strategy.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("empty strategy identifier".to_string()));
        }
        Ok(())
    }

    pub fn timerange(&self) -> String {
        format!("{}-{}", format_day(self.window_start), format_day(self.window_end))
    }
}

/// The opaque engine. Must be a pure function of its inputs so that a
/// repeated in-flight call after a crash is harmless.
pub trait BacktestEngine {
    fn run_backtest(&mut self, request: &BacktestRequest<'_>) -> Result<WindowResult>;
}

/// Drives the `freqtrade backtesting` command.
#[derive(Clone, Debug)]
pub struct FreqtradeEngine {
    executable: String,
    config: PathBuf,
    data_format: String,
}

impl FreqtradeEngine {
    pub fn new(engine: &EngineConfig) -> Self {
        Self {
            executable: engine.executable.clone(),
            config: engine.backtest_config.clone(),
            data_format: engine.data_format.clone(),
        }
    }

    pub fn backtest_args(&self, request: &BacktestRequest<'_>) -> Vec<String> {
        let mut args = vec![
            "backtesting".to_string(),
            "--data-format-ohlcv".to_string(),
            self.data_format.clone(),
            "--timerange".to_string(),
            request.timerange(),
            "-s".to_string(),
            request.strategy.to_string(),
            "-c".to_string(),
            self.config.display().to_string(),
            "-p".to_string(),
        ];
        args.extend(request.pairs.iter().cloned());
        args.push("--max-open-trades".to_string());
        args.push(request.concurrency_limit.to_string());
        args
    }
}

impl BacktestEngine for FreqtradeEngine {
    fn run_backtest(&mut self, request: &BacktestRequest<'_>) -> Result<WindowResult> {
        request.validate()?;
        let output = run_tool(&self.executable, &self.backtest_args(request))?.into_success()?;
        let result = parse_backtest_output(&output, request.strategy, request.window_start, request.window_end)?;
        info!(
            timerange = %request.timerange(),
            pairs = request.pairs.len(),
            max_open_trades = request.concurrency_limit,
            profit = result.profit,
            drawdown = result.drawdown,
            "backtest finished"
        );
        Ok(result)
    }
}

fn parse_number(raw: &str, what: &str) -> Result<f64> {
    raw.parse::<f64>()
        .map_err(|e| PipelineError::ParseFailure(format!("{what} value {raw:?}: {e}")))
}

fn find_metric(lines: &[&str], re: &Regex, what: &str) -> Result<f64> {
    let caps = lines
        .iter()
        .find_map(|l| re.captures(l))
        .ok_or_else(|| PipelineError::ParseFailure(format!("{what} row not found")))?;
    parse_number(&caps["value"], what)
}

/// Extracts the result block of `strategy` from the engine's console tables.
pub fn parse_backtest_output(
    output: &str,
    strategy: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<WindowResult> {
    if output.contains(NO_TRADES_MARKER) {
        warn!(strategy, start = %start, end = %end, "no trades in window");
        return Ok(WindowResult::zero(start, end));
    }

    let lines: Vec<&str> = output.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    let header = format!("Result for strategy {strategy}");
    let head = lines.iter().position(|l| *l == header).ok_or_else(|| {
        PipelineError::ParseFailure(format!("output does not contain the line '{header}'"))
    })?;

    let mut pairs = BTreeMap::new();
    for line in lines.iter().skip(head + PAIR_TABLE_OFFSET) {
        let Some(caps) = RE_PAIR_ROW.captures(line) else {
            break;
        };
        let profit = parse_number(&caps["profit"], "pair profit")?;
        pairs.insert(caps["pair"].to_string(), profit);
    }

    let block = &lines[head..];
    Ok(WindowResult {
        start,
        end,
        profit: find_metric(block, &RE_TOTAL_PROFIT, "total profit")?,
        drawdown: find_metric(block, &RE_DRAWDOWN, "drawdown")?,
        market_change: find_metric(block, &RE_MARKET_CHANGE, "market change")?,
        trades_per_day: find_metric(block, &RE_TRADES_PER_DAY, "trades per day")?,
        pairs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
2024-03-10 12:00:01 - freqtrade.optimize.backtesting - INFO - Running backtesting for Strategy SampleStrategy
2024-03-10 12:00:09 - freqtrade.misc - INFO - dumping json to "user_data/backtest_results/backtest-result-2024-03-10.json"
Result for strategy SampleStrategy
============================================================= BACKTESTING REPORT =============================================================
|      Pair |   Buys |   Avg Profit % |   Cum Profit % |   Tot Profit USDT |   Tot Profit % |   Avg Duration |   Win  Draw  Loss  Win% |
|-----------+--------+----------------+----------------+-------------------+----------------+----------------+-------------------------|
|  ETH/USDT |      4 |           1.10 |           4.40 |             4.404 |           1.47 |        3:05:00 |     3     0     1  75.0 |
|  ADA/USDT |      2 |          -2.05 |          -4.10 |            -4.104 |          -1.37 |        6:30:00 |     0     0     2     0 |
| 1INCH/BTC |      1 |           0.00 |           0.00 |             0.000 |           0.00 |        0:10:00 |     0     1     0     0 |
|     TOTAL |      7 |           0.04 |           0.30 |             0.300 |           0.10 |        4:00:00 |     3     1     3  42.9 |
============================================================= SELL REASON STATS ==============================================================
|   Sell Reason |   Sells |   Win  Draws  Loss  Win% |
|---------------+---------+--------------------------|
|           roi |       3 |     3     0     0   100 |
=============== SUMMARY METRICS ===============
| Metric                 | Value               |
|------------------------+---------------------|
| Backtesting from       | 2024-03-01 00:00:00 |
| Total/Daily Avg Trades | 7 / 1.0             |
| Total profit %         | 0.1%                |
| Drawdown               | 2.35%               |
| Market change          | -3.8%               |
===============================================
"#;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn parses_summary_and_pair_rows() {
        let r = parse_backtest_output(SAMPLE, "SampleStrategy", d(2024, 3, 1), d(2024, 3, 7)).unwrap();
        assert_eq!(r.start, d(2024, 3, 1));
        assert_eq!(r.end, d(2024, 3, 7));
        assert!((r.profit - 0.1).abs() < 1e-9);
        assert!((r.drawdown - 2.35).abs() < 1e-9);
        assert!((r.market_change + 3.8).abs() < 1e-9);
        assert!((r.trades_per_day - 1.0).abs() < 1e-9);
        assert_eq!(r.pairs.len(), 3);
        assert!((r.pair_profit("ETH/USDT") - 1.47).abs() < 1e-9);
        assert!((r.pair_profit("ADA/USDT") + 1.37).abs() < 1e-9);
        assert!(!r.pairs.contains_key("TOTAL"));
    }

    #[test]
    fn no_trades_yields_zero_window() {
        let out = "Result for strategy SampleStrategy\nNo trades made. Your starting balance was 1000 USDT\n";
        let r = parse_backtest_output(out, "SampleStrategy", d(2024, 3, 1), d(2024, 3, 7)).unwrap();
        assert_eq!(r, WindowResult::zero(d(2024, 3, 1), d(2024, 3, 7)));
    }

    #[test]
    fn missing_strategy_block_is_parse_failure() {
        let err = parse_backtest_output(SAMPLE, "OtherStrategy", d(2024, 3, 1), d(2024, 3, 7)).unwrap_err();
        assert!(matches!(err, PipelineError::ParseFailure(_)));
    }

    #[test]
    fn missing_summary_row_is_parse_failure() {
        let truncated: String = SAMPLE
            .lines()
            .filter(|l| !l.contains("Market change"))
            .map(|l| format!("{l}\n"))
            .collect();
        let err = parse_backtest_output(&truncated, "SampleStrategy", d(2024, 3, 1), d(2024, 3, 7)).unwrap_err();
        assert!(matches!(err, PipelineError::ParseFailure(msg) if msg.contains("market change")));
    }

    #[test]
    fn backtest_arguments_follow_engine_cli() {
        let engine = FreqtradeEngine::new(&EngineConfig::default());
        let pairs = vec!["ETH/USDT".to_string(), "ADA/USDT".to_string()];
        let req = BacktestRequest {
            window_start: d(2024, 2, 23),
            window_end: d(2024, 2, 29),
            pairs: &pairs,
            concurrency_limit: 3,
            strategy: "SampleStrategy",
        };
        let args = engine.backtest_args(&req);
        assert_eq!(
            args.join(" "),
            "backtesting --data-format-ohlcv hdf5 --timerange 20240223-20240229 -s SampleStrategy \
             -c user_data/config.json -p ETH/USDT ADA/USDT --max-open-trades 3"
        );
    }

    #[test]
    fn invalid_requests_are_rejected_before_spawning() {
        let pairs = vec!["ETH/USDT".to_string()];
        let base = BacktestRequest {
            window_start: d(2024, 3, 7),
            window_end: d(2024, 3, 1),
            pairs: &pairs,
            concurrency_limit: 1,
            strategy: "SampleStrategy",
        };
        assert!(base.validate().is_err());
        let empty: Vec<String> = Vec::new();
        let req = BacktestRequest { window_start: d(2024, 3, 1), window_end: d(2024, 3, 7), pairs: &empty, ..base.clone() };
        assert!(req.validate().is_err());
        let req = BacktestRequest { window_start: d(2024, 3, 1), window_end: d(2024, 3, 7), concurrency_limit: 0, ..base.clone() };
        assert!(req.validate().is_err());
        let req = BacktestRequest { window_start: d(2024, 3, 1), window_end: d(2024, 3, 7), ..base };
        assert!(req.validate().is_ok());
    }
}
