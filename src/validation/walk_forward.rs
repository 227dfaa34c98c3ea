//! Walk-forward optimization.
//!
//! Splits the bar timeline into overlapping windows, fits parameters on the
//! in-sample part of each window by grid search over the strategy's
//! parameter ranges, then scores the winner on the out-of-sample part.
//! The windows advance by `(total - window) / num_windows` bars, with
//! `window = total * 2 / (num_windows + 1)`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::data::TimeRange;
use crate::error::{EngineError, EngineResult, ValidationError};
use crate::events::Timestamp;
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::metrics::PerformanceMetrics;
use crate::strategy::StrategyConfig;

const MIN_TRAIN_BARS: usize = 10;
const MIN_TEST_BARS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowResult {
    pub window_idx: usize,
    pub train_bars: usize,
    pub test_bars: usize,
    pub train_start_ts: Timestamp,
    pub test_start_ts: Timestamp,
    pub test_end_ts: Timestamp,
    pub best_params: BTreeMap<String, f64>,
    /// Grid points that resolved to a valid config.
    pub candidates: usize,
    pub in_sample: PerformanceMetrics,
    pub out_of_sample: PerformanceMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkForwardReport {
    pub windows: Vec<WindowResult>,
    pub mean_is_sharpe: f64,
    pub mean_oos_sharpe: f64,
    pub degradation: f64,
    pub oos_positive_windows: usize,
}

impl WalkForwardReport {
    pub fn from_windows(windows: Vec<WindowResult>) -> Self {
        let n = windows.len().max(1) as f64;
        let mean_is_sharpe = windows.iter().map(|w| w.in_sample.sharpe).sum::<f64>() / n;
        let mean_oos_sharpe = windows.iter().map(|w| w.out_of_sample.sharpe).sum::<f64>() / n;
        let oos_positive_windows = windows.iter().filter(|w| w.out_of_sample.total_return > 0.0).count();
        Self {
            degradation: degradation(mean_is_sharpe, mean_oos_sharpe),
            windows,
            mean_is_sharpe,
            mean_oos_sharpe,
            oos_positive_windows,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

/// `1 − oos / is`. Without a positive in-sample Sharpe there is no edge to
/// preserve, which counts as full degradation.
pub fn degradation(mean_is_sharpe: f64, mean_oos_sharpe: f64) -> f64 {
    if mean_is_sharpe <= 1e-12 {
        1.0
    } else {
        1.0 - mean_oos_sharpe / mean_is_sharpe
    }
}

/// Train and test bar index ranges `[start, end)` for each window.
pub fn window_bounds(total: usize, num_windows: usize, train_fraction: f64) -> Vec<((usize, usize), (usize, usize))> {
    let num_windows = num_windows.max(1);
    let window = total * 2 / (num_windows + 1);
    let step = total.saturating_sub(window).max(1) / num_windows;
    let mut out = Vec::new();
    for i in 0..num_windows {
        let start = i * step;
        let end = (start + window).min(total);
        if end <= start {
            continue;
        }
        let split = start + ((end - start) as f64 * train_fraction).round() as usize;
        let split = split.min(end);
        if split - start < MIN_TRAIN_BARS || end - split < MIN_TEST_BARS {
            continue;
        }
        out.push(((start, split), (split, end)));
    }
    out
}

fn range(timestamps: &[Timestamp], (start, end): (usize, usize)) -> TimeRange {
    TimeRange { start: Some(timestamps[start]), end: Some(timestamps[end - 1]) }
}

/// Run walk-forward over bar open times `timestamps`. `eval` runs one
/// backtest of a resolved config over a time range.
pub fn run<F>(
    timestamps: &[Timestamp],
    base: &StrategyConfig,
    num_windows: usize,
    train_fraction: f64,
    mut eval: F,
) -> EngineResult<WalkForwardReport>
where
    F: FnMut(&StrategyConfig, TimeRange) -> EngineResult<PerformanceMetrics>,
{
    let candidates: Vec<StrategyConfig> = base
        .grid()
        .iter()
        .filter_map(|point| match base.resolved(point) {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                log(Level::Debug, Domain::Validation, "grid_point_skipped", obj(&[("error", v_str(&e.to_string()))]));
                None
            }
        })
        .collect();
    if candidates.is_empty() {
        return Err(ValidationError::invalid("param_ranges", "no grid point yields a valid config").into());
    }

    let bounds = window_bounds(timestamps.len(), num_windows, train_fraction);
    if bounds.is_empty() {
        return Err(EngineError::Validation(ValidationError::invalid(
            "walk_forward",
            format!("{} bars are too few for {} windows", timestamps.len(), num_windows),
        )));
    }

    let mut windows = Vec::with_capacity(bounds.len());
    for (idx, (train, test)) in bounds.into_iter().enumerate() {
        let train_range = range(timestamps, train);
        let mut best: Option<(&StrategyConfig, PerformanceMetrics)> = None;
        for cfg in &candidates {
            let m = eval(cfg, train_range)?;
            // Strictly greater keeps the first grid point on ties.
            if best.as_ref().map_or(true, |(_, b)| m.sharpe > b.sharpe) {
                best = Some((cfg, m));
            }
        }
        let Some((winner, in_sample)) = best else {
            continue;
        };
        let out_of_sample = eval(winner, range(timestamps, test))?;
        log(
            Level::Info,
            Domain::Validation,
            "walk_forward_window",
            obj(&[
                ("window", v_num(idx as f64)),
                ("is_sharpe", v_num(in_sample.sharpe)),
                ("oos_sharpe", v_num(out_of_sample.sharpe)),
            ]),
        );
        windows.push(WindowResult {
            window_idx: idx,
            train_bars: train.1 - train.0,
            test_bars: test.1 - test.0,
            train_start_ts: timestamps[train.0],
            test_start_ts: timestamps[test.0],
            test_end_ts: timestamps[test.1 - 1],
            best_params: winner.params.clone(),
            candidates: candidates.len(),
            in_sample,
            out_of_sample,
        });
    }
    Ok(WalkForwardReport::from_windows(windows))
}
