//! Market regime classification.
//!
//! Each symbol keeps a rolling window of prices from which a four-feature
//! vector is built:
//!
//! | idx | feature                                   | range   |
//! |-----|-------------------------------------------|---------|
//! | 0   | trend slope t-stat of log price (squashed)| (-3, 3) |
//! | 1   | realized-volatility percentile (mid-rank) | [0, 1]  |
//! | 2   | return correlation vs reference symbol    | [-1, 1] |
//! | 3   | window momentum in vol units (squashed)   | (-3, 3) |
//!
//! A diagonal Gaussian mixture with one component per label scores the
//! vector. Components start at label anchors and are refined by MAP-EM on a
//! bounded buffer, so the data can move them but never swap their meaning.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::config::env_or;
use crate::events::{RegimeChange, Timestamp};
use crate::indicators::{correlation, slope_tstat};
use crate::logging::log_regime_change;

pub const FEATURES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegimeLabel {
    TrendingUp,
    TrendingDown,
    RangeBound,
    HighVolatility,
}

impl RegimeLabel {
    pub const ALL: [RegimeLabel; 4] = [
        RegimeLabel::TrendingUp,
        RegimeLabel::TrendingDown,
        RegimeLabel::RangeBound,
        RegimeLabel::HighVolatility,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RegimeLabel::TrendingUp => "trending_up",
            RegimeLabel::TrendingDown => "trending_down",
            RegimeLabel::RangeBound => "range_bound",
            RegimeLabel::HighVolatility => "high_volatility",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|l| l.as_str() == s)
    }

    pub fn index(&self) -> usize {
        *self as usize
    }
}

/// Snapshot of the classified regime. Replaced, never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeState {
    pub label: RegimeLabel,
    pub confidence: f64,
    pub features: [f64; FEATURES],
    pub started_at: Timestamp,
    /// Posterior per label, in `RegimeLabel::ALL` order.
    pub posteriors: [f64; 4],
}

#[derive(Debug, Clone)]
pub struct RegimeConfig {
    /// Prices per feature window (also the warm-up length).
    pub window: usize,
    pub vol_history: usize,
    pub buffer_size: usize,
    pub refit_every: usize,
    pub em_iterations: usize,
    pub hysteresis_margin: f64,
    pub min_dwell_ms: u64,
    /// Pseudo-observations anchoring each component to its label.
    pub prior_strength: f64,
    pub reference_symbol: Option<String>,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            window: 48,
            vol_history: 512,
            buffer_size: 512,
            refit_every: 128,
            em_iterations: 4,
            hysteresis_margin: 0.2,
            min_dwell_ms: 15 * 60 * 1000,
            prior_strength: 20.0,
            reference_symbol: None,
        }
    }
}

impl RegimeConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            window: env_or("REGIME_WINDOW", d.window).max(4),
            vol_history: env_or("REGIME_VOL_HISTORY", d.vol_history),
            buffer_size: env_or("REGIME_BUFFER", d.buffer_size),
            refit_every: env_or("REGIME_REFIT_EVERY", d.refit_every),
            em_iterations: env_or("REGIME_EM_ITERS", d.em_iterations),
            hysteresis_margin: env_or("REGIME_HYSTERESIS", d.hysteresis_margin),
            min_dwell_ms: env_or("REGIME_MIN_DWELL_MS", d.min_dwell_ms),
            prior_strength: env_or("REGIME_PRIOR_STRENGTH", d.prior_strength),
            reference_symbol: std::env::var("REFERENCE_SYMBOL").ok().filter(|s| !s.is_empty()),
        }
    }
}

// =============================================================================
// Mixture model
// =============================================================================

#[derive(Debug, Clone)]
struct Component {
    weight: f64,
    mean: [f64; FEATURES],
    var: [f64; FEATURES],
    prior_mean: [f64; FEATURES],
    prior_var: [f64; FEATURES],
}

impl Component {
    fn anchored(label: RegimeLabel) -> Self {
        let (mean, sd) = match label {
            RegimeLabel::TrendingUp => ([2.0, 0.5, 0.0, 1.5], [1.0, 0.25, 0.5, 0.75]),
            RegimeLabel::TrendingDown => ([-2.0, 0.5, 0.0, -1.5], [1.0, 0.25, 0.5, 0.75]),
            RegimeLabel::RangeBound => ([0.0, 0.4, 0.0, 0.0], [1.0, 0.25, 0.5, 0.75]),
            RegimeLabel::HighVolatility => ([0.0, 0.9, 0.0, 0.0], [1.2, 0.1, 0.5, 1.2]),
        };
        let var = sd.map(|s| s * s);
        Self { weight: 0.25, mean, var, prior_mean: mean, prior_var: var }
    }

    fn log_density(&self, x: &[f64; FEATURES]) -> f64 {
        let mut ll = self.weight.max(1e-300).ln();
        for d in 0..FEATURES {
            let v = self.var[d];
            ll += -0.5 * (2.0 * std::f64::consts::PI * v).ln() - 0.5 * (x[d] - self.mean[d]).powi(2) / v;
        }
        ll
    }

    fn var_floor(&self, d: usize) -> f64 {
        self.prior_var[d] * 0.01
    }
}

#[derive(Debug, Clone)]
pub struct Mixture {
    comps: Vec<Component>,
    prior_strength: f64,
    /// Dirichlet concentration on the weights.
    alpha: f64,
}

impl Mixture {
    pub fn anchored(prior_strength: f64) -> Self {
        Self {
            comps: RegimeLabel::ALL.iter().map(|l| Component::anchored(*l)).collect(),
            prior_strength,
            alpha: 2.0,
        }
    }

    /// Posterior per label for one feature vector.
    pub fn posteriors(&self, x: &[f64; FEATURES]) -> [f64; 4] {
        let logs: Vec<f64> = self.comps.iter().map(|c| c.log_density(x)).collect();
        let max = logs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let mut out = [0.0; 4];
        let mut total = 0.0;
        for (i, l) in logs.iter().enumerate() {
            out[i] = (l - max).exp();
            total += out[i];
        }
        if total > 0.0 {
            for p in &mut out {
                *p /= total;
            }
        }
        out
    }

    /// MAP-EM over `data`, starting from the current parameters.
    pub fn refit(&mut self, data: &[[f64; FEATURES]], iterations: usize) {
        if data.is_empty() {
            return;
        }
        let k = self.comps.len();
        let n = data.len() as f64;
        let kappa = self.prior_strength;
        for _ in 0..iterations {
            let resp: Vec<[f64; 4]> = data.iter().map(|x| self.posteriors(x)).collect();
            for j in 0..k {
                let nk: f64 = resp.iter().map(|r| r[j]).sum();
                let c = &mut self.comps[j];
                let mut mean = [0.0; FEATURES];
                for d in 0..FEATURES {
                    let sx: f64 = resp.iter().zip(data).map(|(r, x)| r[j] * x[d]).sum();
                    mean[d] = (kappa * c.prior_mean[d] + sx) / (kappa + nk);
                }
                for d in 0..FEATURES {
                    let ss: f64 = resp.iter().zip(data).map(|(r, x)| r[j] * (x[d] - mean[d]).powi(2)).sum();
                    let shrink = kappa * (mean[d] - c.prior_mean[d]).powi(2);
                    let v = (kappa * c.prior_var[d] + ss + shrink) / (kappa + nk);
                    c.var[d] = v.max(c.var_floor(d));
                }
                c.mean = mean;
                c.weight = (nk + self.alpha - 1.0) / (n + k as f64 * (self.alpha - 1.0));
            }
        }
    }

    pub fn mean(&self, label: RegimeLabel) -> [f64; FEATURES] {
        self.comps[label.index()].mean
    }
}

// =============================================================================
// Per-symbol feature tracking
// =============================================================================

#[derive(Debug, Clone)]
struct SymbolTrack {
    log_prices: VecDeque<f64>,
    returns: VecDeque<f64>,
    vol_history: VecDeque<f64>,
    buffer: VecDeque<[f64; FEATURES]>,
    since_refit: usize,
    model: Mixture,
    current: Option<RegimeState>,
    last_posteriors: Option<[f64; 4]>,
}

impl SymbolTrack {
    fn new(cfg: &RegimeConfig) -> Self {
        Self {
            log_prices: VecDeque::with_capacity(cfg.window + 1),
            returns: VecDeque::with_capacity(cfg.window + 1),
            vol_history: VecDeque::with_capacity(cfg.vol_history + 1),
            buffer: VecDeque::with_capacity(cfg.buffer_size + 1),
            since_refit: 0,
            model: Mixture::anchored(cfg.prior_strength),
            current: None,
            last_posteriors: None,
        }
    }

    fn push_price(&mut self, price: f64, window: usize) {
        let lp = price.max(1e-12).ln();
        if let Some(prev) = self.log_prices.back() {
            self.returns.push_back(lp - prev);
            if self.returns.len() > window {
                self.returns.pop_front();
            }
        }
        self.log_prices.push_back(lp);
        if self.log_prices.len() > window {
            self.log_prices.pop_front();
        }
    }

    fn realized_vol(&self) -> f64 {
        let n = self.returns.len();
        if n < 2 {
            return 0.0;
        }
        let mean = self.returns.iter().sum::<f64>() / n as f64;
        let m2: f64 = self.returns.iter().map(|r| (r - mean).powi(2)).sum();
        (m2 / (n as f64 - 1.0)).sqrt()
    }
}

fn squash(x: f64) -> f64 {
    3.0 * (x / 3.0).tanh()
}

/// Mid-rank percentile of `value` among `history` (ties count half).
fn mid_rank(history: &VecDeque<f64>, value: f64) -> f64 {
    if history.is_empty() {
        return 0.5;
    }
    let eps = 1e-15;
    let less = history.iter().filter(|v| **v < value - eps).count() as f64;
    let equal = history.iter().filter(|v| (**v - value).abs() <= eps).count() as f64;
    (less + 0.5 * equal) / history.len() as f64
}

// =============================================================================
// Classifier
// =============================================================================

pub struct RegimeClassifier {
    cfg: RegimeConfig,
    tracks: BTreeMap<String, SymbolTrack>,
}

impl RegimeClassifier {
    pub fn new(cfg: RegimeConfig) -> Self {
        Self { cfg, tracks: BTreeMap::new() }
    }

    pub fn config(&self) -> &RegimeConfig {
        &self.cfg
    }

    pub fn current(&self, symbol: &str) -> Option<&RegimeState> {
        self.tracks.get(symbol).and_then(|t| t.current.as_ref())
    }

    pub fn last_posteriors(&self, symbol: &str) -> Option<[f64; 4]> {
        self.tracks.get(symbol).and_then(|t| t.last_posteriors)
    }

    /// Feed one price. Returns a change when the emission rule fires.
    pub fn observe(&mut self, symbol: &str, ts: Timestamp, price: f64) -> Option<RegimeChange> {
        if !price.is_finite() || price <= 0.0 {
            return None;
        }
        let window = self.cfg.window;
        let track = self
            .tracks
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolTrack::new(&self.cfg));
        track.push_price(price, window);
        if track.log_prices.len() < window {
            return None;
        }

        let features = self.features(symbol)?;
        let cfg = &self.cfg;
        let track = self.tracks.get_mut(symbol)?;

        track.buffer.push_back(features);
        if track.buffer.len() > cfg.buffer_size {
            track.buffer.pop_front();
        }
        track.since_refit += 1;
        if cfg.refit_every > 0 && track.since_refit >= cfg.refit_every {
            let data: Vec<[f64; FEATURES]> = track.buffer.iter().cloned().collect();
            track.model.refit(&data, cfg.em_iterations);
            track.since_refit = 0;
        }

        let post = track.model.posteriors(&features);
        track.last_posteriors = Some(post);
        let best = RegimeLabel::ALL
            .into_iter()
            .max_by(|a, b| post[a.index()].total_cmp(&post[b.index()]))
            .unwrap_or(RegimeLabel::RangeBound);

        let emit = match &track.current {
            None => true,
            Some(cur) => {
                best != cur.label
                    && post[best.index()] - post[cur.label.index()] >= cfg.hysteresis_margin
                    && ts.saturating_sub(cur.started_at) >= cfg.min_dwell_ms
            }
        };
        if !emit {
            return None;
        }

        let state = RegimeState {
            label: best,
            confidence: post[best.index()],
            features,
            started_at: ts,
            posteriors: post,
        };
        let from = track.current.replace(state.clone()).map(|s| s.label);
        log_regime_change(symbol, from.map(|l| l.as_str()).unwrap_or("none"), best.as_str(), state.confidence);
        Some(RegimeChange { symbol: symbol.to_string(), from, state })
    }

    fn features(&mut self, symbol: &str) -> Option<[f64; FEATURES]> {
        let reference_returns: Option<Vec<f64>> = match &self.cfg.reference_symbol {
            Some(r) if r != symbol => self.tracks.get(r).map(|t| t.returns.iter().cloned().collect()),
            _ => None,
        };
        let vol_cap = self.cfg.vol_history;
        let track = self.tracks.get_mut(symbol)?;

        let prices: Vec<f64> = track.log_prices.iter().cloned().collect();
        let (_, t) = slope_tstat(&prices);

        let vol = track.realized_vol();
        track.vol_history.push_back(vol);
        if track.vol_history.len() > vol_cap.max(1) {
            track.vol_history.pop_front();
        }
        let vol_pct = mid_rank(&track.vol_history, vol);

        let returns: Vec<f64> = track.returns.iter().cloned().collect();
        let corr = reference_returns.map(|r| correlation(&returns, &r)).unwrap_or(0.0);

        let total: f64 = returns.iter().sum();
        let momentum = if vol > 1e-12 {
            total / (vol * (returns.len() as f64).sqrt())
        } else if total.abs() > 1e-12 {
            3.0 * total.signum()
        } else {
            0.0
        };

        Some([squash(t), vol_pct, corr, squash(momentum)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RegimeConfig {
        RegimeConfig { window: 20, min_dwell_ms: 0, refit_every: 50, ..Default::default() }
    }

    fn run(c: &mut RegimeClassifier, prices: &[f64], start: u64) -> Vec<RegimeChange> {
        prices
            .iter()
            .enumerate()
            .filter_map(|(i, p)| c.observe("BTC", start + i as u64 * 1000, *p))
            .collect()
    }

    #[test]
    fn flat_prices_are_range_bound() {
        let mut c = RegimeClassifier::new(cfg());
        let changes = run(&mut c, &vec![100.0; 1000], 0);
        assert_eq!(changes.len(), 1);
        let state = c.current("BTC").unwrap();
        assert_eq!(state.label, RegimeLabel::RangeBound);
        assert!(state.confidence > 0.8, "confidence {}", state.confidence);
        assert_eq!(state.features, [0.0, 0.5, 0.0, 0.0]);
    }

    #[test]
    fn steady_ramp_is_trending() {
        let mut up = RegimeClassifier::new(cfg());
        let prices: Vec<f64> = (0..100).map(|i| 100.0 + i as f64 * 0.5).collect();
        run(&mut up, &prices, 0);
        assert_eq!(up.current("BTC").unwrap().label, RegimeLabel::TrendingUp);

        let mut down = RegimeClassifier::new(cfg());
        let prices: Vec<f64> = (0..100).map(|i| 100.0 - i as f64 * 0.4).collect();
        run(&mut down, &prices, 0);
        assert_eq!(down.current("BTC").unwrap().label, RegimeLabel::TrendingDown);
    }

    #[test]
    fn volatility_burst_after_calm() {
        let mut c = RegimeClassifier::new(cfg());
        let mut prices: Vec<f64> = (0..300).map(|i| 100.0 + if i % 2 == 0 { 0.01 } else { -0.01 }).collect();
        prices.extend((0..40).map(|i| if i % 2 == 0 { 105.0 } else { 95.0 }));
        run(&mut c, &prices, 0);
        assert_eq!(c.current("BTC").unwrap().label, RegimeLabel::HighVolatility);
    }

    #[test]
    fn first_emission_has_no_previous_label() {
        let mut c = RegimeClassifier::new(cfg());
        let changes = run(&mut c, &vec![50.0; 25], 0);
        assert_eq!(changes.len(), 1);
        assert!(changes[0].from.is_none());
        assert_eq!(changes[0].state.started_at, 19_000);
    }

    #[test]
    fn dwell_time_limits_changes() {
        let dwell = 60_000;
        let mut c = RegimeClassifier::new(RegimeConfig { window: 10, min_dwell_ms: dwell, hysteresis_margin: 0.0, ..Default::default() });
        // Alternate ramps up and down every 15 observations.
        let mut p = 100.0;
        let mut changes = Vec::new();
        for i in 0..600u64 {
            p += if (i / 15) % 2 == 0 { 0.5 } else { -0.5 };
            if let Some(ch) = c.observe("BTC", i * 1000, p) {
                changes.push(ch.state.started_at);
            }
        }
        for pair in changes.windows(2) {
            assert!(pair[1] - pair[0] >= dwell);
        }
    }

    #[test]
    fn refit_keeps_label_anchors() {
        let mut m = Mixture::anchored(20.0);
        let flat = vec![[0.0, 0.5, 0.0, 0.0]; 300];
        m.refit(&flat, 5);
        let post = m.posteriors(&[0.0, 0.5, 0.0, 0.0]);
        assert!(post[RegimeLabel::RangeBound.index()] > 0.99);
        // Components without data stay near their anchors.
        assert!(m.mean(RegimeLabel::TrendingUp)[0] > 1.5);
        let up = m.posteriors(&[2.5, 0.5, 0.0, 2.0]);
        assert!(up[RegimeLabel::TrendingUp.index()] > 0.5);
    }

    #[test]
    fn correlation_uses_reference_symbol() {
        let mut c = RegimeClassifier::new(RegimeConfig { window: 10, reference_symbol: Some("REF".into()), ..cfg() });
        let mut last = None;
        for i in 0..40u64 {
            let p = 100.0 + ((i * 7) % 5) as f64;
            c.observe("REF", i, p);
            c.observe("BTC", i, p * 2.0);
            last = c.last_posteriors("BTC");
        }
        assert!(last.is_some());
        assert!(c.current("BTC").unwrap().features[2] > 0.99);
    }
}
