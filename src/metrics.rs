//! Performance metrics over an equity curve and its closed trades.

use serde::{Deserialize, Serialize};

use crate::config::env_or;
use crate::portfolio::{EquityPoint, TradeRecord};

const MS_PER_YEAR: f64 = 365.25 * 86_400_000.0;

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsConfig {
    /// Annualization factor for Sharpe and Sortino. Zero derives it from
    /// the bar interval.
    pub periods_per_year: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { periods_per_year: 0.0 }
    }
}

impl MetricsConfig {
    pub fn from_env() -> Self {
        Self { periods_per_year: env_or("PERIODS_PER_YEAR", 0.0) }
    }

    pub fn periods_for(&self, interval_ms: u64) -> f64 {
        if self.periods_per_year > 0.0 {
            self.periods_per_year
        } else if interval_ms > 0 {
            MS_PER_YEAR / interval_ms as f64
        } else {
            252.0
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub sharpe: f64,
    pub sortino: f64,
    /// Largest peak-to-trough fall, as a positive fraction of the peak.
    pub max_drawdown: f64,
    pub win_rate: f64,
    /// Gross profit over gross loss; `None` when there were no losing trades.
    pub profit_factor: Option<f64>,
    pub total_return: f64,
    pub trade_count: usize,
    pub final_equity: f64,
}

impl PerformanceMetrics {
    /// Ratios need at least two returns and some dispersion; otherwise they
    /// are zero rather than infinite.
    pub fn compute(curve: &[EquityPoint], trades: &[TradeRecord], periods_per_year: f64) -> Self {
        let returns = period_returns(curve);
        let first = curve.first().map_or(0.0, |p| p.equity);
        let last = curve.last().map_or(0.0, |p| p.equity);

        let wins: Vec<f64> = trades.iter().map(|t| t.pnl).filter(|p| *p > 0.0).collect();
        let gross_profit: f64 = wins.iter().sum();
        let gross_loss: f64 = trades.iter().map(|t| t.pnl).filter(|p| *p < 0.0).map(f64::abs).sum();

        Self {
            sharpe: sharpe(&returns, periods_per_year),
            sortino: sortino(&returns, periods_per_year),
            max_drawdown: max_drawdown(curve),
            win_rate: if trades.is_empty() { 0.0 } else { wins.len() as f64 / trades.len() as f64 },
            profit_factor: if gross_loss > 0.0 { Some(gross_profit / gross_loss) } else { None },
            total_return: if first > 0.0 { last / first - 1.0 } else { 0.0 },
            trade_count: trades.len(),
            final_equity: last,
        }
    }
}

pub fn period_returns(curve: &[EquityPoint]) -> Vec<f64> {
    curve
        .windows(2)
        .filter(|w| w[0].equity > 0.0)
        .map(|w| w[1].equity / w[0].equity - 1.0)
        .collect()
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        0.0
    } else {
        xs.iter().sum::<f64>() / xs.len() as f64
    }
}

pub fn sharpe(returns: &[f64], periods_per_year: f64) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let m = mean(returns);
    let var = returns.iter().map(|r| (r - m).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
    let sd = var.sqrt();
    if sd < 1e-12 {
        return 0.0;
    }
    m / sd * periods_per_year.sqrt()
}

/// Downside deviation uses all periods, counting non-negative returns as zero.
pub fn sortino(returns: &[f64], periods_per_year: f64) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let m = mean(returns);
    let downside = (returns.iter().map(|r| r.min(0.0).powi(2)).sum::<f64>() / returns.len() as f64).sqrt();
    if downside < 1e-12 {
        return 0.0;
    }
    m / downside * periods_per_year.sqrt()
}

pub fn max_drawdown(curve: &[EquityPoint]) -> f64 {
    let mut peak = f64::MIN;
    let mut worst: f64 = 0.0;
    for p in curve {
        peak = peak.max(p.equity);
        if peak > 0.0 {
            worst = worst.max((peak - p.equity) / peak);
        }
    }
    worst
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Side;

    fn curve(values: &[f64]) -> Vec<EquityPoint> {
        values.iter().enumerate().map(|(i, e)| EquityPoint { ts: i as u64, equity: *e }).collect()
    }

    fn trade(pnl: f64) -> TradeRecord {
        TradeRecord {
            symbol: "BTC".into(),
            side: Side::Buy,
            entry_ts: 0,
            exit_ts: 1,
            qty: 1.0,
            entry_price: 100.0,
            exit_price: 100.0 + pnl,
            pnl,
            fees: 0.0,
        }
    }

    #[test]
    fn drawdown_is_peak_to_trough() {
        let c = curve(&[100.0, 120.0, 90.0, 130.0, 117.0]);
        assert!((max_drawdown(&c) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn flat_curve_has_zero_ratios() {
        let m = PerformanceMetrics::compute(&curve(&[100.0; 10]), &[], 252.0);
        assert_eq!(m.sharpe, 0.0);
        assert_eq!(m.sortino, 0.0);
        assert_eq!(m.total_return, 0.0);
        assert_eq!(m.profit_factor, None);
    }

    #[test]
    fn trade_stats() {
        let trades = [trade(30.0), trade(-10.0), trade(10.0), trade(-10.0)];
        let m = PerformanceMetrics::compute(&curve(&[100.0, 120.0]), &trades, 252.0);
        assert_eq!(m.trade_count, 4);
        assert!((m.win_rate - 0.5).abs() < 1e-12);
        assert_eq!(m.profit_factor, Some(2.0));
        assert!((m.total_return - 0.2).abs() < 1e-12);
    }

    #[test]
    fn steady_gains_beat_noisy_gains() {
        let steady = curve(&[100.0, 101.0, 102.1, 103.0, 104.2, 105.1]);
        let noisy = curve(&[100.0, 104.0, 99.0, 106.0, 100.0, 105.1]);
        let a = sharpe(&period_returns(&steady), 252.0);
        let b = sharpe(&period_returns(&noisy), 252.0);
        assert!(a > b);
        assert!(sortino(&period_returns(&noisy), 252.0) > 0.0);
    }

    #[test]
    fn periods_derive_from_interval() {
        let cfg = MetricsConfig::default();
        assert!((cfg.periods_for(86_400_000) - 365.25).abs() < 1e-9);
        assert_eq!(MetricsConfig { periods_per_year: 252.0 }.periods_for(60_000), 252.0);
    }
}
