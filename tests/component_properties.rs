//! Sizing and regime properties checked over many inputs.

mod common;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use replayfx::regime::{RegimeClassifier, RegimeConfig, RegimeLabel, RegimeState};
use replayfx::sizing::{Sizer, SizingConfig, SizingInput, TradeStats};
use replayfx::strategy::SizingPolicy;

use common::{trending_walk, MINUTE};

fn input(stats: TradeStats, confidence: f64, price: f64) -> SizingInput<'static> {
    SizingInput {
        equity: 10_000.0,
        price,
        confidence,
        atr: 1.0,
        regime: None,
        stats,
        risk_scale: 1.0,
        max_position_size: 1e9,
        lot_size: 0.0001,
    }
}

#[test]
fn kelly_size_never_exceeds_the_capped_fraction() {
    let mut rng = StdRng::seed_from_u64(3);
    for _ in 0..2_000 {
        let cfg = SizingConfig {
            max_kelly_fraction: 0.5,
            regime_multipliers: [rng.gen_range(0.2..3.0), rng.gen_range(0.2..3.0), rng.gen_range(0.2..3.0), rng.gen_range(0.2..3.0)],
        };
        let fraction = rng.gen_range(0.05..2.0);
        let sizer = Sizer::new(cfg.clone(), SizingPolicy::FractionalKelly { fraction, min_trades: 5 });
        let stats = TradeStats {
            trades: rng.gen_range(0..60),
            win_rate: rng.gen_range(0.0..1.0),
            avg_win: rng.gen_range(0.1..50.0),
            avg_loss: rng.gen_range(0.1..50.0),
        };
        let price = rng.gen_range(1.0..1_000.0);
        let confidence = rng.gen_range(-1.0..1.0);
        let regime = RegimeState {
            label: RegimeLabel::ALL[rng.gen_range(0..4)],
            confidence: rng.gen_range(0.0..1.0),
            features: [0.0; 4],
            started_at: 0,
            posteriors: [0.25; 4],
        };
        let mut i = input(stats, confidence, price);
        if rng.gen_bool(0.7) {
            i.regime = Some(&regime);
        }
        let d = sizer.size("BTC", &i);

        let k = d.full_kelly.unwrap();
        assert!(k >= 0.0);
        let bound = fraction.min(cfg.max_kelly_fraction) * k * 10_000.0;
        assert!(d.qty * price <= bound + 1e-6, "notional {} over bound {}", d.qty * price, bound);
        if stats.trades < 5 {
            assert_eq!(d.qty, 0.0);
        }
    }
}

#[test]
fn regime_changes_respect_dwell_and_margin() {
    let cfg = RegimeConfig { window: 24, refit_every: 64, min_dwell_ms: 20 * MINUTE, hysteresis_margin: 0.2, ..RegimeConfig::default() };
    let (dwell, margin) = (cfg.min_dwell_ms, cfg.hysteresis_margin);
    let mut c = RegimeClassifier::new(cfg);

    // Alternating trend, calm and choppy stretches.
    let mut bars = trending_walk(1_200, 17, 0.006, 0.002, 100);
    let mut rng = StdRng::seed_from_u64(99);
    for b in bars.iter_mut().skip(600).take(200) {
        b.c *= 1.0 + rng.gen_range(-0.03..0.03);
    }

    let mut changes = Vec::new();
    for b in &bars {
        if let Some(ch) = c.observe("BTC", b.ts, b.c) {
            changes.push(ch);
        }
    }
    assert!(changes.len() >= 2, "only {} changes", changes.len());
    assert!(changes[0].from.is_none());
    for pair in changes.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        assert_eq!(next.from, Some(prev.state.label));
        assert_ne!(next.state.label, prev.state.label);
        assert!(next.state.started_at - prev.state.started_at >= dwell);
        let p = next.state.posteriors;
        assert!(p[next.state.label.index()] - p[prev.state.label.index()] >= margin - 1e-12);
    }
}
