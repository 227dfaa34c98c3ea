//! Strategy configuration: signal sources, entry/exit rules, sizing policy
//! and the parameter ranges walk-forward fitting searches over.
//!
//! Parameters are addressed by dotted keys (`entry.min_confidence`,
//! `momentum.fast`, ...) so a grid point is just a `BTreeMap<String, f64>`
//! applied on top of a base config.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::events::Timestamp;
use crate::regime::RegimeLabel;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    /// EMA spread over ATR.
    Momentum { fast: usize, slow: usize, atr_period: usize, weight: f64 },
    /// Negative z-score of close against its rolling mean.
    MeanReversion { window: usize, weight: f64 },
    /// Close position inside the prior Donchian channel.
    Breakout { window: usize, weight: f64 },
}

impl SourceSpec {
    pub fn name(&self) -> &'static str {
        match self {
            SourceSpec::Momentum { .. } => "momentum",
            SourceSpec::MeanReversion { .. } => "mean_reversion",
            SourceSpec::Breakout { .. } => "breakout",
        }
    }

    pub fn weight(&self) -> f64 {
        match self {
            SourceSpec::Momentum { weight, .. } | SourceSpec::MeanReversion { weight, .. } | SourceSpec::Breakout { weight, .. } => *weight,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryRules {
    /// Minimum |confidence| to open a position.
    pub min_confidence: f64,
    pub allow_short: bool,
    /// Empty means every regime.
    #[serde(default)]
    pub allowed_regimes: Vec<RegimeLabel>,
}

impl Default for EntryRules {
    fn default() -> Self {
        Self { min_confidence: 0.3, allow_short: true, allowed_regimes: Vec::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitRules {
    /// Close when confidence in the held direction drops below this.
    pub exit_confidence: f64,
    /// Fractions of entry price.
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub max_holding_ms: Option<u64>,
}

impl Default for ExitRules {
    fn default() -> Self {
        Self { exit_confidence: 0.05, stop_loss: Some(0.02), take_profit: None, max_holding_ms: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum SizingPolicy {
    FixedFractional { fraction: f64 },
    VolatilityAdjusted { risk_fraction: f64, atr_multiple: f64 },
    FractionalKelly { fraction: f64, min_trades: usize },
}

impl Default for SizingPolicy {
    fn default() -> Self {
        SizingPolicy::FixedFractional { fraction: 0.1 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSpec {
    /// Minimum quantity increment.
    pub lot_size: f64,
}

impl Default for InstrumentSpec {
    fn default() -> Self {
        Self { lot_size: 0.0001 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamRange {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl ParamRange {
    pub fn values(&self) -> Vec<f64> {
        let mut out = Vec::new();
        if self.step <= 0.0 || self.max < self.min {
            return out;
        }
        let n = ((self.max - self.min) / self.step + 1e-9).floor() as usize;
        for i in 0..=n {
            out.push(self.min + i as f64 * self.step);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub name: String,
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
    #[serde(default)]
    pub param_ranges: BTreeMap<String, ParamRange>,
    #[serde(default = "default_sources")]
    pub sources: Vec<SourceSpec>,
    #[serde(default)]
    pub entry: EntryRules,
    #[serde(default)]
    pub exit: ExitRules,
    #[serde(default)]
    pub sizing: SizingPolicy,
    #[serde(default)]
    pub instrument: InstrumentSpec,
}

fn default_sources() -> Vec<SourceSpec> {
    vec![
        SourceSpec::Momentum { fast: 8, slow: 24, atr_period: 14, weight: 1.0 },
        SourceSpec::MeanReversion { window: 20, weight: 0.5 },
        SourceSpec::Breakout { window: 20, weight: 0.5 },
    ]
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            params: BTreeMap::new(),
            param_ranges: BTreeMap::new(),
            sources: default_sources(),
            entry: EntryRules::default(),
            exit: ExitRules::default(),
            sizing: SizingPolicy::default(),
            instrument: InstrumentSpec::default(),
        }
    }
}

pub const PARAM_KEYS: [&str; 13] = [
    "entry.min_confidence",
    "exit.exit_confidence",
    "exit.stop_loss",
    "exit.take_profit",
    "exit.max_holding_ms",
    "momentum.fast",
    "momentum.slow",
    "momentum.atr_period",
    "mean_reversion.window",
    "breakout.window",
    "sizing.fraction",
    "sizing.atr_multiple",
    "instrument.lot_size",
];

fn check(cond: bool, name: &str, reason: &str) -> Result<(), ValidationError> {
    if cond {
        Ok(())
    } else {
        Err(ValidationError::invalid(name, reason))
    }
}

impl StrategyConfig {
    /// Synchronous gate run before any simulation work.
    pub fn validate(&self) -> Result<(), ValidationError> {
        check(!self.name.trim().is_empty(), "name", "must not be empty")?;
        check(!self.sources.is_empty(), "sources", "at least one signal source")?;
        for s in &self.sources {
            check(s.weight().is_finite() && s.weight() > 0.0, s.name(), "weight must be > 0")?;
            match s {
                SourceSpec::Momentum { fast, slow, atr_period, .. } => {
                    check(*fast >= 1 && fast < slow, "momentum.fast", "need 1 <= fast < slow")?;
                    check(*atr_period >= 1, "momentum.atr_period", "must be >= 1")?;
                }
                SourceSpec::MeanReversion { window, .. } => check(*window >= 2, "mean_reversion.window", "must be >= 2")?,
                SourceSpec::Breakout { window, .. } => check(*window >= 2, "breakout.window", "must be >= 2")?,
            }
        }
        let e = &self.entry;
        check((0.0..=1.0).contains(&e.min_confidence), "entry.min_confidence", "must be in [0, 1]")?;
        check((0.0..=1.0).contains(&self.exit.exit_confidence), "exit.exit_confidence", "must be in [0, 1]")?;
        check(self.exit.exit_confidence <= e.min_confidence, "exit.exit_confidence", "must not exceed entry.min_confidence")?;
        for (name, v) in [("exit.stop_loss", self.exit.stop_loss), ("exit.take_profit", self.exit.take_profit)] {
            if let Some(v) = v {
                check(v.is_finite() && v > 0.0 && v < 1.0, name, "must be in (0, 1)")?;
            }
        }
        match &self.sizing {
            SizingPolicy::FixedFractional { fraction } => {
                check(*fraction > 0.0 && *fraction <= 1.0, "sizing.fraction", "must be in (0, 1]")?
            }
            SizingPolicy::VolatilityAdjusted { risk_fraction, atr_multiple } => {
                check(*risk_fraction > 0.0 && *risk_fraction <= 1.0, "sizing.risk_fraction", "must be in (0, 1]")?;
                check(*atr_multiple > 0.0, "sizing.atr_multiple", "must be > 0")?;
            }
            SizingPolicy::FractionalKelly { fraction, .. } => {
                check(*fraction > 0.0 && *fraction <= 1.0, "sizing.fraction", "must be in (0, 1]")?
            }
        }
        check(self.instrument.lot_size.is_finite() && self.instrument.lot_size > 0.0, "instrument.lot_size", "must be > 0")?;
        for (key, r) in &self.param_ranges {
            check(PARAM_KEYS.contains(&key.as_str()), key, "unknown parameter")?;
            check(r.min <= r.max && r.step > 0.0, key, "need min <= max and step > 0")?;
        }
        for key in self.params.keys() {
            check(PARAM_KEYS.contains(&key.as_str()), key, "unknown parameter")?;
        }
        Ok(())
    }

    /// Base config with `params` (then `overrides`) applied, validated.
    pub fn resolved(&self, overrides: &BTreeMap<String, f64>) -> Result<StrategyConfig, ValidationError> {
        let mut out = self.clone();
        let mut all = self.params.clone();
        all.extend(overrides.iter().map(|(k, v)| (k.clone(), *v)));
        for (key, value) in &all {
            out.apply(key, *value)?;
        }
        out.params = all;
        out.validate()?;
        Ok(out)
    }

    fn apply(&mut self, key: &str, v: f64) -> Result<(), ValidationError> {
        let as_count = |v: f64| -> Result<usize, ValidationError> {
            if v.is_finite() && v >= 0.0 {
                Ok(v.round() as usize)
            } else {
                Err(ValidationError::invalid(key, "must be a non-negative integer"))
            }
        };
        match key {
            "entry.min_confidence" => self.entry.min_confidence = v,
            "exit.exit_confidence" => self.exit.exit_confidence = v,
            "exit.stop_loss" => self.exit.stop_loss = Some(v),
            "exit.take_profit" => self.exit.take_profit = Some(v),
            "exit.max_holding_ms" => self.exit.max_holding_ms = Some(as_count(v)? as Timestamp),
            "instrument.lot_size" => self.instrument.lot_size = v,
            "momentum.fast" | "momentum.slow" | "momentum.atr_period" => {
                let n = as_count(v)?;
                for s in &mut self.sources {
                    if let SourceSpec::Momentum { fast, slow, atr_period, .. } = s {
                        match key {
                            "momentum.fast" => *fast = n,
                            "momentum.slow" => *slow = n,
                            _ => *atr_period = n,
                        }
                    }
                }
            }
            "mean_reversion.window" => {
                let n = as_count(v)?;
                for s in &mut self.sources {
                    if let SourceSpec::MeanReversion { window, .. } = s {
                        *window = n;
                    }
                }
            }
            "breakout.window" => {
                let n = as_count(v)?;
                for s in &mut self.sources {
                    if let SourceSpec::Breakout { window, .. } = s {
                        *window = n;
                    }
                }
            }
            "sizing.fraction" => match &mut self.sizing {
                SizingPolicy::FixedFractional { fraction } | SizingPolicy::FractionalKelly { fraction, .. } => *fraction = v,
                SizingPolicy::VolatilityAdjusted { risk_fraction, .. } => *risk_fraction = v,
            },
            "sizing.atr_multiple" => {
                if let SizingPolicy::VolatilityAdjusted { atr_multiple, .. } = &mut self.sizing {
                    *atr_multiple = v;
                }
            }
            _ => return Err(ValidationError::invalid(key, "unknown parameter")),
        }
        Ok(())
    }

    /// Cartesian product of the parameter ranges, in key order.
    pub fn grid(&self) -> Vec<BTreeMap<String, f64>> {
        let mut out = vec![BTreeMap::new()];
        for (key, range) in &self.param_ranges {
            let values = range.values();
            let mut next = Vec::with_capacity(out.len() * values.len().max(1));
            for point in &out {
                for v in &values {
                    let mut p = point.clone();
                    p.insert(key.clone(), *v);
                    next.push(p);
                }
            }
            out = next;
        }
        out
    }

    pub fn regime_allowed(&self, label: Option<RegimeLabel>) -> bool {
        if self.entry.allowed_regimes.is_empty() {
            return true;
        }
        label.map_or(false, |l| self.entry.allowed_regimes.contains(&l))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        StrategyConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_bad_windows() {
        let mut cfg = StrategyConfig::default();
        cfg.sources = vec![SourceSpec::Momentum { fast: 30, slow: 10, atr_period: 14, weight: 1.0 }];
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, ValidationError::InvalidParameter { ref name, .. } if name == "momentum.fast"));
    }

    #[test]
    fn params_override_fields() {
        let cfg = StrategyConfig::default();
        let mut p = BTreeMap::new();
        p.insert("momentum.fast".to_string(), 5.0);
        p.insert("entry.min_confidence".to_string(), 0.5);
        let r = cfg.resolved(&p).unwrap();
        assert_eq!(r.entry.min_confidence, 0.5);
        assert!(r.sources.iter().any(|s| matches!(s, SourceSpec::Momentum { fast: 5, .. })));

        p.insert("nonsense".to_string(), 1.0);
        assert!(cfg.resolved(&p).is_err());
    }

    #[test]
    fn grid_is_cartesian() {
        let mut cfg = StrategyConfig::default();
        cfg.param_ranges.insert("momentum.fast".into(), ParamRange { min: 4.0, max: 8.0, step: 2.0 });
        cfg.param_ranges.insert("entry.min_confidence".into(), ParamRange { min: 0.2, max: 0.3, step: 0.1 });
        let grid = cfg.grid();
        assert_eq!(grid.len(), 6);
        assert!(grid.iter().all(|g| g.len() == 2));
    }

    #[test]
    fn parses_from_json() {
        let cfg: StrategyConfig = serde_json::from_str(
            r#"{"name":"x","sizing":{"policy":"fractional_kelly","fraction":0.5,"min_trades":20},
                "entry":{"min_confidence":0.4,"allow_short":false,"allowed_regimes":["trending_up"]}}"#,
        )
        .unwrap();
        assert_eq!(cfg.sources.len(), 3);
        assert!(!cfg.regime_allowed(Some(RegimeLabel::RangeBound)));
        assert!(cfg.regime_allowed(Some(RegimeLabel::TrendingUp)));
    }
}
