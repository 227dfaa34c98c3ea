//! Position sizing.
//!
//! Sizing turns an effective confidence into a target quantity (base asset
//! units). The pipeline is fixed: policy size, scaled by |confidence|, by
//! the regime multiplier, by the risk state's scale, rounded down to the
//! lot, clamped to `[0, max_position_size]`.

use crate::config::env_or;
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::regime::RegimeState;
use crate::strategy::SizingPolicy;

// =============================================================================
// Building blocks
// =============================================================================

/// Fixed percentage of equity
pub fn fixed_equity_pct(equity: f64, pct: f64, price: f64) -> f64 {
    if price <= 0.0 {
        return 0.0;
    }
    equity * pct / price
}

/// ATR-based sizing: size inversely proportional to ATR
pub fn atr_sized(equity: f64, risk_pct: f64, atr: f64, atr_multiple: f64) -> f64 {
    if atr <= 0.0 || atr_multiple <= 0.0 {
        return 0.0;
    }
    let risk_amount = equity * risk_pct;
    let stop_distance = atr * atr_multiple;
    risk_amount / stop_distance
}

/// Full Kelly sizing
///
/// win_rate: probability of winning (0.0 - 1.0)
/// avg_win: average win amount
/// avg_loss: average loss amount (positive number)
pub fn kelly_size(win_rate: f64, avg_win: f64, avg_loss: f64) -> f64 {
    if avg_loss <= 0.0 || win_rate <= 0.0 || win_rate >= 1.0 {
        return 0.0;
    }

    let win_loss_ratio = avg_win / avg_loss;
    let kelly = win_rate - (1.0 - win_rate) / win_loss_ratio;

    kelly.max(0.0)
}

/// Round down to exchange lot size
pub fn round_to_lot(qty: f64, lot_size: f64) -> f64 {
    if lot_size <= 0.0 {
        return qty;
    }
    // Absorb representation error so 0.3 / 0.1 lands on 3, not 2.
    ((qty / lot_size) + 1e-9).floor() * lot_size
}

/// Win/loss statistics over closed trades, the Kelly inputs.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TradeStats {
    pub trades: usize,
    pub win_rate: f64,
    pub avg_win: f64,
    /// Positive.
    pub avg_loss: f64,
}

impl TradeStats {
    pub fn from_pnls(pnls: &[f64]) -> Self {
        if pnls.is_empty() {
            return Self::default();
        }
        let wins: Vec<f64> = pnls.iter().copied().filter(|p| *p > 0.0).collect();
        let losses: Vec<f64> = pnls.iter().copied().filter(|p| *p < 0.0).map(f64::abs).collect();
        let mean = |v: &[f64]| if v.is_empty() { 0.0 } else { v.iter().sum::<f64>() / v.len() as f64 };
        Self {
            trades: pnls.len(),
            win_rate: wins.len() as f64 / pnls.len() as f64,
            avg_win: mean(&wins),
            avg_loss: mean(&losses),
        }
    }

    pub fn full_kelly(&self) -> f64 {
        kelly_size(self.win_rate, self.avg_win, self.avg_loss)
    }
}

// =============================================================================
// Sizer
// =============================================================================

#[derive(Debug, Clone)]
pub struct SizingConfig {
    /// Hard cap on the Kelly multiple regardless of policy fraction.
    pub max_kelly_fraction: f64,
    /// Full-confidence multiplier per regime, in `RegimeLabel::ALL` order.
    pub regime_multipliers: [f64; 4],
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self { max_kelly_fraction: 0.5, regime_multipliers: [1.0, 1.0, 0.75, 0.5] }
    }
}

impl SizingConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let m = d.regime_multipliers;
        Self {
            max_kelly_fraction: env_or("SIZING_MAX_KELLY", d.max_kelly_fraction),
            regime_multipliers: [
                env_or("SIZING_MULT_TRENDING_UP", m[0]),
                env_or("SIZING_MULT_TRENDING_DOWN", m[1]),
                env_or("SIZING_MULT_RANGE_BOUND", m[2]),
                env_or("SIZING_MULT_HIGH_VOLATILITY", m[3]),
            ],
        }
    }

    /// Blend toward 1.0 as regime confidence falls: `1 + c * (m - 1)`.
    pub fn regime_multiplier(&self, regime: Option<&RegimeState>) -> f64 {
        match regime {
            None => 1.0,
            Some(r) => {
                let m = self.regime_multipliers[r.label.index()];
                let c = r.confidence.clamp(0.0, 1.0);
                (1.0 + c * (m - 1.0)).max(0.0)
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SizingInput<'a> {
    pub equity: f64,
    pub price: f64,
    /// Effective (conflict-zeroed) confidence; sign ignored.
    pub confidence: f64,
    pub atr: f64,
    pub regime: Option<&'a RegimeState>,
    pub stats: TradeStats,
    /// From the risk state: 1.0 normal, reduced under warning.
    pub risk_scale: f64,
    pub max_position_size: f64,
    pub lot_size: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizeDecision {
    /// Unsigned target quantity.
    pub qty: f64,
    /// Policy size before confidence, regime and risk scaling.
    pub base: f64,
    pub regime_multiplier: f64,
    /// Full-Kelly fraction of equity when the policy is Kelly.
    pub full_kelly: Option<f64>,
}

pub struct Sizer {
    cfg: SizingConfig,
    policy: SizingPolicy,
}

impl Sizer {
    pub fn new(cfg: SizingConfig, policy: SizingPolicy) -> Self {
        Self { cfg, policy }
    }

    pub fn config(&self) -> &SizingConfig {
        &self.cfg
    }

    pub fn size(&self, symbol: &str, input: &SizingInput<'_>) -> SizeDecision {
        let mut full_kelly = None;
        let mut kelly_cap = f64::INFINITY;
        let base = if input.equity <= 0.0 || input.price <= 0.0 {
            0.0
        } else {
            match self.policy {
                SizingPolicy::FixedFractional { fraction } => fixed_equity_pct(input.equity, fraction, input.price),
                SizingPolicy::VolatilityAdjusted { risk_fraction, atr_multiple } => {
                    atr_sized(input.equity, risk_fraction, input.atr, atr_multiple)
                }
                SizingPolicy::FractionalKelly { fraction, min_trades } => {
                    let k = input.stats.full_kelly();
                    full_kelly = Some(k);
                    if input.stats.trades < min_trades {
                        0.0
                    } else {
                        let f = fraction.min(self.cfg.max_kelly_fraction);
                        kelly_cap = fixed_equity_pct(input.equity, f * k, input.price);
                        kelly_cap
                    }
                }
            }
        };

        let regime_multiplier = self.cfg.regime_multiplier(input.regime);
        let scaled = base * input.confidence.abs().min(1.0) * regime_multiplier * input.risk_scale.clamp(0.0, 1.0);
        // A regime multiplier above 1 must not push Kelly past its cap.
        let scaled = scaled.min(kelly_cap);
        let qty = round_to_lot(scaled.max(0.0), input.lot_size).clamp(0.0, input.max_position_size.max(0.0));

        log(
            Level::Debug,
            Domain::Sizing,
            "size",
            obj(&[
                ("symbol", v_str(symbol)),
                ("base", v_num(base)),
                ("confidence", v_num(input.confidence)),
                ("regime_multiplier", v_num(regime_multiplier)),
                ("risk_scale", v_num(input.risk_scale)),
                ("qty", v_num(qty)),
                ("regime", v_str(input.regime.map(|r| r.label.as_str()).unwrap_or("none"))),
            ]),
        );

        SizeDecision { qty, base, regime_multiplier, full_kelly }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regime::RegimeLabel;

    fn input<'a>(confidence: f64, stats: TradeStats) -> SizingInput<'a> {
        SizingInput {
            equity: 10_000.0,
            price: 100.0,
            confidence,
            atr: 2.0,
            regime: None,
            stats,
            risk_scale: 1.0,
            max_position_size: 1_000.0,
            lot_size: 0.01,
        }
    }

    fn boosted() -> SizingConfig {
        SizingConfig { max_kelly_fraction: 0.25, regime_multipliers: [1.5, 1.0, 1.0, 1.0] }
    }

    fn regime(label: RegimeLabel, confidence: f64) -> RegimeState {
        RegimeState { label, confidence, features: [0.0; 4], started_at: 0, posteriors: [0.25; 4] }
    }

    #[test]
    fn test_fixed_equity_pct() {
        let qty = fixed_equity_pct(10000.0, 0.01, 100.0);
        assert!((qty - 1.0).abs() < 0.001); // 1% of 10000 at $100 = 1 unit
    }

    #[test]
    fn test_kelly_size() {
        // 60% win rate, avg win $2, avg loss $1
        // Kelly = 0.6 - 0.4/2 = 0.6 - 0.2 = 0.4
        let k = kelly_size(0.6, 2.0, 1.0);
        assert!((k - 0.4).abs() < 0.001);
    }

    #[test]
    fn test_kelly_negative_edge() {
        let k = kelly_size(0.4, 1.0, 1.0);
        assert!(k < 0.001);
    }

    #[test]
    fn test_round_to_lot() {
        assert!((round_to_lot(1.234, 0.01) - 1.23).abs() < 1e-12);
        assert!((round_to_lot(1.239, 0.01) - 1.23).abs() < 1e-12);
        assert!((round_to_lot(0.3, 0.1) - 0.3).abs() < 1e-12);
    }

    #[test]
    fn fixed_fraction_scales_with_confidence() {
        let s = Sizer::new(SizingConfig::default(), SizingPolicy::FixedFractional { fraction: 0.1 });
        let full = s.size("BTC", &input(1.0, TradeStats::default()));
        assert!((full.qty - 10.0).abs() < 1e-9);
        let half = s.size("BTC", &input(-0.5, TradeStats::default()));
        assert!((half.qty - 5.0).abs() < 1e-9);
        assert_eq!(s.size("BTC", &input(0.0, TradeStats::default())).qty, 0.0);
    }

    #[test]
    fn volatility_adjusted_is_inverse_atr() {
        let s = Sizer::new(SizingConfig::default(), SizingPolicy::VolatilityAdjusted { risk_fraction: 0.01, atr_multiple: 2.0 });
        // 100 at risk / (2 * 2) per unit
        assert!((s.size("BTC", &input(1.0, TradeStats::default())).qty - 25.0).abs() < 1e-9);
        let mut flat = input(1.0, TradeStats::default());
        flat.atr = 0.0;
        assert_eq!(s.size("BTC", &flat).qty, 0.0);
    }

    #[test]
    fn kelly_needs_history_and_is_capped() {
        let stats = TradeStats { trades: 40, win_rate: 0.6, avg_win: 2.0, avg_loss: 1.0 };
        let cfg = SizingConfig { max_kelly_fraction: 0.25, ..SizingConfig::default() };
        let s = Sizer::new(cfg, SizingPolicy::FractionalKelly { fraction: 1.0, min_trades: 30 });
        let d = s.size("BTC", &input(1.0, stats));
        let bound = 0.25 * 0.4 * 10_000.0 / 100.0;
        assert!(d.qty <= bound + 1e-9);
        assert!((d.qty - bound).abs() < 1e-9);

        let few = TradeStats { trades: 10, ..stats };
        assert_eq!(s.size("BTC", &input(1.0, few)).qty, 0.0);
    }

    #[test]
    fn regime_boost_does_not_lift_kelly_past_its_cap() {
        let stats = TradeStats { trades: 40, win_rate: 0.6, avg_win: 2.0, avg_loss: 1.0 };
        let s = Sizer::new(boosted(), SizingPolicy::FractionalKelly { fraction: 1.0, min_trades: 30 });
        let up = regime(RegimeLabel::TrendingUp, 1.0);
        let mut i = input(1.0, stats);
        i.regime = Some(&up);
        let d = s.size("BTC", &i);
        assert!((d.regime_multiplier - 1.5).abs() < 1e-12);
        let bound = 0.25 * 0.4 * 10_000.0 / 100.0;
        assert!(d.qty <= bound + 1e-9, "qty {} over {}", d.qty, bound);

        // Boosts still apply to the other policies.
        let fixed = Sizer::new(boosted(), SizingPolicy::FixedFractional { fraction: 0.1 });
        assert!((fixed.size("BTC", &i).qty - 15.0).abs() < 1e-9);
    }

    #[test]
    fn regime_multiplier_interpolates_by_confidence() {
        let cfg = SizingConfig::default();
        assert_eq!(cfg.regime_multiplier(None), 1.0);
        let hv = regime(RegimeLabel::HighVolatility, 1.0);
        assert!((cfg.regime_multiplier(Some(&hv)) - 0.5).abs() < 1e-12);
        let unsure = regime(RegimeLabel::HighVolatility, 0.5);
        assert!((cfg.regime_multiplier(Some(&unsure)) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn clamped_to_max_position() {
        let s = Sizer::new(SizingConfig::default(), SizingPolicy::FixedFractional { fraction: 1.0 });
        let mut i = input(1.0, TradeStats::default());
        i.max_position_size = 3.0;
        assert_eq!(s.size("BTC", &i).qty, 3.0);
    }

    #[test]
    fn stats_from_pnls() {
        let st = TradeStats::from_pnls(&[2.0, -1.0, 2.0, -1.0, 2.0]);
        assert_eq!(st.trades, 5);
        assert!((st.win_rate - 0.6).abs() < 1e-12);
        assert!((st.full_kelly() - 0.4).abs() < 1e-12);
    }
}
