use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::model::ParameterKind;

/// Inclusive integer range walked with a fixed step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueRange {
    pub low: u32,
    pub high: u32,
    pub step: u32,
}

impl ValueRange {
    pub fn values(&self) -> Vec<u32> {
        if self.step == 0 || self.low > self.high {
            return Vec::new();
        }
        (self.low..=self.high).step_by(self.step as usize).collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub executable: String,
    pub backtest_config: PathBuf,
    /// Falls back to `backtest_config` when unset.
    pub discovery_config: Option<PathBuf>,
    pub data_format: String,
    pub timeframes: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            executable: "freqtrade".to_string(),
            backtest_config: PathBuf::from("user_data/config.json"),
            discovery_config: None,
            data_format: "hdf5".to_string(),
            timeframes: vec!["5m".to_string(), "1h".to_string()],
        }
    }
}

impl EngineConfig {
    pub fn discovery_config(&self) -> &Path {
        self.discovery_config.as_deref().unwrap_or(&self.backtest_config)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub pair_counts: ValueRange,
    pub concurrency_limits: ValueRange,
    /// Pairs backtested while the concurrency limit is swept.
    pub concurrency_sweep_pairs: Option<u32>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            pair_counts: ValueRange { low: 10, high: 100, step: 10 },
            concurrency_limits: ValueRange { low: 1, high: 10, step: 1 },
            concurrency_sweep_pairs: None,
        }
    }
}

impl SweepConfig {
    pub fn candidates(&self, kind: ParameterKind) -> Vec<u32> {
        match kind {
            ParameterKind::ConcurrencyLimit => self.concurrency_limits.values(),
            ParameterKind::PairCount => self.pair_counts.values(),
        }
    }

    pub fn concurrency_sweep_pairs(&self) -> u32 {
        self.concurrency_sweep_pairs.unwrap_or(self.pair_counts.high)
    }

    /// Leading pairs of the universe that either sweep phase backtests.
    pub fn pairs_needed(&self) -> u32 {
        self.pair_counts.high.max(self.concurrency_sweep_pairs())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub tag: String,
    pub strategy: String,
    pub result_dir: PathBuf,
    pub engine: EngineConfig,
    pub window_days: u32,
    pub time_range_days: u32,
    pub batch_size: usize,
    pub concurrency_limit: u32,
    pub download_padding_days: u32,
    pub rate_limit_timeout_secs: u64,
    pub sweep: SweepConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tag: "default".to_string(),
            strategy: String::new(),
            result_dir: PathBuf::from("user_data/pair-sweep"),
            engine: EngineConfig::default(),
            window_days: 7,
            time_range_days: 90,
            batch_size: 50,
            concurrency_limit: 1,
            download_padding_days: 20,
            rate_limit_timeout_secs: 70,
            sweep: SweepConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            PipelineError::ConfigurationMissing(format!("{}: {e}", path.display()))
        })?;
        toml::from_str(&raw)
            .map_err(|e| PipelineError::InvalidConfiguration(format!("{}: {e}", path.display())))
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.result_dir.join(format!("{}-result.json", self.tag))
    }

    pub fn report_path(&self) -> PathBuf {
        self.result_dir.join(format!("{}-report.json", self.tag))
    }

    pub fn validate(&self) -> Result<()> {
        if self.strategy.trim().is_empty() {
            return Err(PipelineError::ConfigurationMissing("strategy".to_string()));
        }
        if self.tag.trim().is_empty() {
            return Err(PipelineError::ConfigurationMissing("tag".to_string()));
        }
        let invalid = |what: &str| -> Result<()> {
            Err(PipelineError::InvalidConfiguration(what.to_string()))
        };
        if self.window_days == 0 {
            return invalid("window_days must be >= 1");
        }
        if self.time_range_days == 0 {
            return invalid("time_range_days must be >= 1");
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be >= 1");
        }
        if self.concurrency_limit == 0 {
            return invalid("concurrency_limit must be >= 1");
        }
        for kind in ParameterKind::ALL {
            let values = self.sweep.candidates(kind);
            if values.is_empty() || values[0] == 0 {
                return invalid(&format!("sweep range for {kind} is empty or starts at 0"));
            }
        }
        if self.sweep.concurrency_sweep_pairs() == 0 {
            return invalid("sweep.concurrency_sweep_pairs must be >= 1");
        }
        Ok(())
    }

    /// Engine configuration files must be present before any work starts.
    pub fn check_resources(&self) -> Result<()> {
        for path in [self.engine.backtest_config.as_path(), self.engine.discovery_config()] {
            if !path.is_file() {
                return Err(PipelineError::ConfigurationMissing(format!(
                    "engine config not found: {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}
