//! Strategy viability: walk-forward degradation and Monte Carlo robustness
//! checked against configured thresholds.

pub mod monte_carlo;
pub mod walk_forward;

use serde::{Deserialize, Serialize};

use crate::config::env_or;
use crate::error::ValidationError;
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::metrics::PerformanceMetrics;

pub use monte_carlo::{bootstrap, MonteCarloReport};
pub use walk_forward::{WalkForwardReport, WindowResult};

pub const OOS_DEGRADATION_EXCEEDED: &str = "oos_degradation_exceeded";
pub const ROBUSTNESS_BELOW_THRESHOLD: &str = "robustness_below_threshold";
pub const INSUFFICIENT_TRADES: &str = "insufficient_trades";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub max_degradation: f64,
    pub min_robustness: f64,
    pub min_trades: usize,
    pub windows: usize,
    pub train_fraction: f64,
    pub mc_paths: usize,
    pub seed: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_degradation: 0.4,
            min_robustness: 0.6,
            min_trades: 10,
            windows: 4,
            train_fraction: 0.7,
            mc_paths: 1_000,
            seed: 42,
        }
    }
}

impl ValidationConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_degradation: env_or("MAX_DEGRADATION", d.max_degradation),
            min_robustness: env_or("MIN_ROBUSTNESS", d.min_robustness),
            min_trades: env_or("MIN_TRADES", d.min_trades),
            windows: env_or("WF_WINDOWS", d.windows),
            train_fraction: env_or("WF_TRAIN_FRACTION", d.train_fraction),
            mc_paths: env_or("MC_PATHS", d.mc_paths),
            seed: env_or("SEED", d.seed),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(self.max_degradation.is_finite() && self.max_degradation >= 0.0) {
            return Err(ValidationError::invalid("max_degradation", "must be >= 0"));
        }
        if !(0.0..=1.0).contains(&self.min_robustness) {
            return Err(ValidationError::invalid("min_robustness", "must be in [0, 1]"));
        }
        if !(self.train_fraction > 0.0 && self.train_fraction < 1.0) {
            return Err(ValidationError::invalid("train_fraction", "must be in (0, 1)"));
        }
        if self.windows == 0 {
            return Err(ValidationError::invalid("windows", "must be >= 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub metrics: PerformanceMetrics,
    /// `None` when walk-forward was not run.
    pub degradation: Option<f64>,
    /// `None` when Monte Carlo was not run.
    pub robustness: Option<f64>,
    pub viable: bool,
    pub reasons: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub walk_forward: Option<WalkForwardReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monte_carlo: Option<MonteCarloReport>,
}

/// Combine whatever evidence is available into a verdict. Reasons are
/// listed in a fixed order: degradation, robustness, trade count.
pub fn assess(
    metrics: PerformanceMetrics,
    walk_forward: Option<WalkForwardReport>,
    monte_carlo: Option<MonteCarloReport>,
    cfg: &ValidationConfig,
) -> ValidationResult {
    let degradation = walk_forward.as_ref().map(|w| w.degradation);
    let robustness = monte_carlo.as_ref().map(|m| m.robustness);

    let mut reasons = Vec::new();
    if degradation.map_or(false, |d| d > cfg.max_degradation) {
        reasons.push(OOS_DEGRADATION_EXCEEDED.to_string());
    }
    if robustness.map_or(false, |r| r < cfg.min_robustness) {
        reasons.push(ROBUSTNESS_BELOW_THRESHOLD.to_string());
    }
    if metrics.trade_count < cfg.min_trades {
        reasons.push(INSUFFICIENT_TRADES.to_string());
    }
    let viable = reasons.is_empty();
    log(
        if viable { Level::Info } else { Level::Warn },
        Domain::Validation,
        "verdict",
        obj(&[
            ("viable", serde_json::Value::Bool(viable)),
            ("degradation", degradation.map_or(serde_json::Value::Null, v_num)),
            ("robustness", robustness.map_or(serde_json::Value::Null, v_num)),
            ("reasons", v_str(&reasons.join(","))),
        ]),
    );
    ValidationResult { metrics, degradation, robustness, viable, reasons, walk_forward, monte_carlo }
}
