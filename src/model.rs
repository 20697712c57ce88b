use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const DAY_FORMAT: &str = "%Y%m%d";

pub fn format_day(date: NaiveDate) -> String {
    date.format(DAY_FORMAT).to_string()
}

pub fn parse_day(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DAY_FORMAT).ok()
}

/// Serde codec for `YYYYMMDD` day stamps.
pub mod day {
    use chrono::NaiveDate;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(date: &NaiveDate, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_day(*date))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDate, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_day(&raw).ok_or_else(|| D::Error::custom(format!("invalid day stamp: {raw}")))
    }
}

pub mod opt_day {
    use chrono::NaiveDate;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(date: &Option<NaiveDate>, s: S) -> Result<S::Ok, S::Error> {
        match date {
            Some(d) => s.serialize_some(&super::format_day(*d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<NaiveDate>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        raw.map(|r| super::parse_day(&r).ok_or_else(|| D::Error::custom(format!("invalid day stamp: {r}"))))
            .transpose()
    }
}

/// Outcome of one backtest over an inclusive day range.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WindowResult {
    #[serde(with = "day")]
    pub start: NaiveDate,
    #[serde(with = "day")]
    pub end: NaiveDate,
    pub profit: f64,
    pub drawdown: f64,
    pub market_change: f64,
    #[serde(default)]
    pub trades_per_day: f64,
    /// Profit per traded pair. Pairs without trades are absent.
    #[serde(default)]
    pub pairs: BTreeMap<String, f64>,
}

impl WindowResult {
    pub fn zero(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start,
            end,
            profit: 0.0,
            drawdown: 0.0,
            market_change: 0.0,
            trades_per_day: 0.0,
            pairs: BTreeMap::new(),
        }
    }

    pub fn pair_profit(&self, pair: &str) -> f64 {
        self.pairs.get(pair).copied().unwrap_or(0.0)
    }

    /// Ranking key used inside a tournament heat.
    pub fn risk_adjusted(&self) -> f64 {
        self.profit - self.drawdown
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartitionState {
    pub pairs: Vec<String>,
    #[serde(default)]
    pub completed: bool,
    /// Newest window first; entries are only ever appended.
    #[serde(default)]
    pub results: Vec<WindowResult>,
    #[serde(default)]
    pub completed_windows: usize,
    /// Start day of the most recently appended window.
    #[serde(default, with = "opt_day")]
    pub cursor: Option<NaiveDate>,
}

impl PartitionState {
    pub fn new(pairs: Vec<String>) -> Self {
        Self {
            pairs,
            completed: false,
            results: Vec::new(),
            completed_windows: 0,
            cursor: None,
        }
    }

    pub fn record_window(&mut self, result: WindowResult) {
        self.cursor = Some(result.start);
        self.completed_windows += 1;
        self.results.push(result);
    }

    pub fn contains(&self, pair: &str) -> bool {
        self.pairs.iter().any(|p| p == pair)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    ConcurrencyLimit,
    PairCount,
}

impl ParameterKind {
    pub const ALL: [ParameterKind; 2] = [ParameterKind::ConcurrencyLimit, ParameterKind::PairCount];
}

impl fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterKind::ConcurrencyLimit => write!(f, "concurrency-limit"),
            ParameterKind::PairCount => write!(f, "pair-count"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterTrial {
    pub kind: ParameterKind,
    pub value: u32,
    pub result: WindowResult,
}

impl ParameterTrial {
    pub fn matches(&self, kind: ParameterKind, value: u32, start: NaiveDate, end: NaiveDate) -> bool {
        self.kind == kind && self.value == value && self.result.start == start && self.result.end == end
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSweepState {
    #[serde(default)]
    pub trials: Vec<ParameterTrial>,
    #[serde(default)]
    pub completed: bool,
}

impl ParameterSweepState {
    pub fn has_trial(&self, kind: ParameterKind, value: u32, start: NaiveDate, end: NaiveDate) -> bool {
        self.trials.iter().any(|t| t.matches(kind, value, start, end))
    }

    pub fn trials_of(&self, kind: ParameterKind) -> impl Iterator<Item = &ParameterTrial> {
        self.trials.iter().filter(move |t| t.kind == kind)
    }
}

/// Normalized tournament outcome. Derived on every run, never persisted.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ParameterScore {
    pub kind: ParameterKind,
    pub value: u32,
    pub score: f64,
    pub winner: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HistoricParameterScore {
    pub kind: ParameterKind,
    pub value: u32,
    pub score: f64,
    #[serde(with = "day")]
    pub date: NaiveDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub unfiltered: f64,
    pub filtered: f64,
    pub overall: f64,
}

/// The checkpointed run document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub strategy: String,
    /// Set once; later computations index into it positionally.
    #[serde(default)]
    pub all_pairs: Option<Vec<String>>,
    #[serde(default)]
    pub data_downloaded: bool,
    /// Leading pairs of `all_pairs` whose history is on disk.
    #[serde(default)]
    pub downloaded_pairs: usize,
    #[serde(default, with = "opt_day")]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub partitions: Vec<PartitionState>,
    #[serde(default)]
    pub completed_partitions: usize,
    #[serde(default)]
    pub blacklist: Option<Vec<String>>,
    #[serde(default)]
    pub performance: Option<PerformanceSummary>,
    #[serde(default)]
    pub parameter_sweep: Option<ParameterSweepState>,
}

impl RunState {
    pub fn new(strategy: &str) -> Self {
        Self {
            strategy: strategy.to_string(),
            all_pairs: None,
            data_downloaded: false,
            downloaded_pairs: 0,
            end_date: None,
            partitions: Vec::new(),
            completed_partitions: 0,
            blacklist: None,
            performance: None,
            parameter_sweep: None,
        }
    }

    pub fn pairs(&self) -> &[String] {
        self.all_pairs.as_deref().unwrap_or(&[])
    }

    /// Number of pairs already handed to some partition.
    pub fn assigned_pairs(&self) -> usize {
        self.partitions.iter().map(|p| p.pairs.len()).sum()
    }

    pub fn partition_of(&self, pair: &str) -> Option<&PartitionState> {
        self.partitions.iter().find(|p| p.contains(pair))
    }
}
