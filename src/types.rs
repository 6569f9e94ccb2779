use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Configuration stored in ~/.pastlead/config.json
///
/// Every field is optional; a missing file means all defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Database location. The `--db` flag takes precedence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<String>,
    /// Source records per ingestion transaction (and checkpoint).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Threads per transaction in the filter, scoring and aggregation stages.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_volume_ceiling")]
    pub volume_ceiling: i64,
    #[serde(default = "default_min_messages")]
    pub min_messages: i64,
    /// Extra sender regexes, appended to the built-in system-sender set.
    #[serde(default)]
    pub blacklist_patterns: Vec<String>,
    /// Footer keywords that zero a monologue. Replaces the built-in set when given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spam_keywords: Option<Vec<String>>,
    #[serde(default)]
    pub scoring: ScoringConstants,
}

fn default_batch_size() -> usize {
    1000
}

fn default_page_size() -> usize {
    100
}

fn default_volume_ceiling() -> i64 {
    300
}

fn default_min_messages() -> i64 {
    2
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            batch_size: default_batch_size(),
            page_size: default_page_size(),
            volume_ceiling: default_volume_ceiling(),
            min_messages: default_min_messages(),
            blacklist_patterns: Vec::new(),
            spam_keywords: None,
            scoring: ScoringConstants::default(),
        }
    }
}

impl Config {
    /// Reject values that would make a run meaningless or ambiguous.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.batch_size == 0 || self.page_size == 0 {
            return Err(PipelineError::Config(
                "batchSize and pageSize must be greater than zero".to_string(),
            ));
        }
        if self.min_messages < 1 || self.volume_ceiling < self.min_messages {
            return Err(PipelineError::Config(format!(
                "volumeCeiling ({}) must be at least minMessages ({}), which must be positive",
                self.volume_ceiling, self.min_messages
            )));
        }
        self.scoring.validate()?;
        crate::filters::compile_patterns(&self.blacklist_patterns)?;
        Ok(())
    }
}

/// One rung of the density ladder: gaps strictly below `max_gap_secs` earn `multiplier`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DensityStep {
    pub max_gap_secs: f64,
    pub multiplier: f64,
}

/// The single scoring constant table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScoringConstants {
    pub financial_weight: f64,
    /// Message count up to which the volume term is linear.
    pub volume_linear_cap: usize,
    pub volume_log_weight: f64,
    /// Checked in order; the first rung whose bound exceeds the mean gap wins.
    pub density_ladder: Vec<DensityStep>,
    /// Mean gaps strictly above this are penalized with `sparse_multiplier`.
    pub sparse_gap_secs: f64,
    pub sparse_multiplier: f64,
    pub monologue_base: f64,
    pub monologue_value_bonus: f64,
    pub monologue_cap: f64,
}

impl Default for ScoringConstants {
    fn default() -> Self {
        Self {
            financial_weight: 2.0,
            volume_linear_cap: 20,
            volume_log_weight: 2.0,
            density_ladder: vec![
                DensityStep {
                    max_gap_secs: 3600.0,
                    multiplier: 1.5,
                },
                DensityStep {
                    max_gap_secs: 86400.0,
                    multiplier: 1.2,
                },
            ],
            sparse_gap_secs: 604800.0,
            sparse_multiplier: 0.8,
            monologue_base: 0.5,
            monologue_value_bonus: 0.5,
            monologue_cap: 1.0,
        }
    }
}

impl ScoringConstants {
    pub fn validate(&self) -> Result<(), PipelineError> {
        let ascending = self
            .density_ladder
            .windows(2)
            .all(|w| w[0].max_gap_secs < w[1].max_gap_secs);
        if !ascending {
            return Err(PipelineError::Config(
                "scoring.densityLadder bounds must be strictly ascending".to_string(),
            ));
        }
        if let Some(last) = self.density_ladder.last() {
            if last.max_gap_secs > self.sparse_gap_secs {
                return Err(PipelineError::Config(
                    "scoring.sparseGapSecs must not be below the last densityLadder bound".to_string(),
                ));
            }
        }
        let multipliers = self
            .density_ladder
            .iter()
            .map(|s| s.multiplier)
            .chain([self.sparse_multiplier, self.financial_weight, self.volume_log_weight]);
        for value in multipliers {
            if !value.is_finite() || value < 0.0 {
                return Err(PipelineError::Config(format!(
                    "scoring constants must be finite and non-negative, got {}",
                    value
                )));
            }
        }
        if self.monologue_cap < self.monologue_base {
            return Err(PipelineError::Config(
                "scoring.monologueCap must be at least monologueBase".to_string(),
            ));
        }
        Ok(())
    }
}
