//! Signal sources and their aggregation into one confidence per symbol.
//!
//! Each source turns closed bars into a reading in [-1, 1]. The aggregator
//! keeps the latest reading per source, drops stale ones, and combines the
//! rest into a weighted mean. When the sources disagree too much the
//! update is marked conflicted and sizing sees zero confidence.

use std::collections::BTreeMap;

use crate::config::env_or;
use crate::events::{Bar, SignalUpdate, SourceReading, Tick, Timestamp};
use crate::indicators::{Atr, Donchian, Ema, RollingStd};
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::strategy::SourceSpec;

/// A pluggable producer of directional readings.
pub trait SignalSource: Send {
    fn name(&self) -> &str;
    fn weight(&self) -> f64;
    /// Reading for the bar just closed, or `None` while warming up.
    fn on_bar(&mut self, bar: &Bar) -> Option<f64>;
}

// =============================================================================
// Built-in sources
// =============================================================================

/// Fast/slow EMA spread normalized by ATR.
pub struct Momentum {
    fast: Ema,
    slow: Ema,
    atr: Atr,
    weight: f64,
}

impl Momentum {
    pub fn new(fast: usize, slow: usize, atr_period: usize, weight: f64) -> Self {
        Self { fast: Ema::new(fast), slow: Ema::new(slow), atr: Atr::new(atr_period), weight }
    }
}

impl SignalSource for Momentum {
    fn name(&self) -> &str {
        "momentum"
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn on_bar(&mut self, bar: &Bar) -> Option<f64> {
        let f = self.fast.update(bar.c);
        let s = self.slow.update(bar.c);
        let atr = self.atr.update(bar.h, bar.l, bar.c);
        if !self.slow.is_ready() {
            return None;
        }
        if atr <= f64::EPSILON {
            return Some(0.0);
        }
        Some(((f - s) / atr).tanh())
    }
}

/// Fades stretches from the rolling mean.
pub struct MeanReversion {
    stats: RollingStd,
    weight: f64,
}

impl MeanReversion {
    pub fn new(window: usize, weight: f64) -> Self {
        Self { stats: RollingStd::new(window), weight }
    }
}

impl SignalSource for MeanReversion {
    fn name(&self) -> &str {
        "mean_reversion"
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn on_bar(&mut self, bar: &Bar) -> Option<f64> {
        self.stats.update(bar.c);
        if !self.stats.is_ready() {
            return None;
        }
        Some(-(self.stats.zscore(bar.c) / 2.0).tanh())
    }
}

/// Close against the channel of the previous `window` bars.
pub struct Breakout {
    channel: Donchian,
    weight: f64,
}

impl Breakout {
    pub fn new(window: usize, weight: f64) -> Self {
        Self { channel: Donchian::new(window), weight }
    }
}

impl SignalSource for Breakout {
    fn name(&self) -> &str {
        "breakout"
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn on_bar(&mut self, bar: &Bar) -> Option<f64> {
        let reading = self.channel.is_ready().then(|| self.channel.position(bar.c));
        self.channel.update(bar.h, bar.l);
        reading
    }
}

pub fn build_source(spec: &SourceSpec) -> Box<dyn SignalSource> {
    match *spec {
        SourceSpec::Momentum { fast, slow, atr_period, weight } => Box::new(Momentum::new(fast, slow, atr_period, weight)),
        SourceSpec::MeanReversion { window, weight } => Box::new(MeanReversion::new(window, weight)),
        SourceSpec::Breakout { window, weight } => Box::new(Breakout::new(window, weight)),
    }
}

// =============================================================================
// Aggregation
// =============================================================================

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Readings older than this are discarded before combining.
    pub staleness_ms: u64,
    /// Weighted std of readings above which the update is conflicted.
    pub divergence_threshold: f64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self { staleness_ms: 5 * 60_000, divergence_threshold: 0.6 }
    }
}

impl AggregatorConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            staleness_ms: env_or("SIGNAL_STALENESS_MS", d.staleness_ms),
            divergence_threshold: env_or("SIGNAL_DIVERGENCE", d.divergence_threshold),
        }
    }
}

#[derive(Debug, Default)]
pub struct SignalAggregator {
    cfg: AggregatorConfig,
    latest: BTreeMap<String, BTreeMap<String, SourceReading>>,
}

impl SignalAggregator {
    pub fn new(cfg: AggregatorConfig) -> Self {
        Self { cfg, latest: BTreeMap::new() }
    }

    pub fn update(&mut self, symbol: &str, reading: SourceReading) {
        self.latest.entry(symbol.to_string()).or_default().insert(reading.source.clone(), reading);
    }

    /// Combine the fresh readings for `symbol` as of `now`.
    pub fn aggregate(&mut self, symbol: &str, now: Timestamp) -> SignalUpdate {
        let staleness = self.cfg.staleness_ms;
        let readings = self.latest.entry(symbol.to_string()).or_default();

        let mut expired = Vec::new();
        readings.retain(|name, r| {
            let fresh = now.saturating_sub(r.ts) <= staleness;
            if !fresh {
                expired.push(name.clone());
            }
            fresh
        });

        let inputs: Vec<SourceReading> = readings.values().cloned().collect();
        let total_w: f64 = inputs.iter().map(|r| r.weight).sum();
        let (confidence, divergence) = if total_w <= 0.0 {
            (0.0, 0.0)
        } else {
            let mean = inputs.iter().map(|r| r.weight * r.value).sum::<f64>() / total_w;
            let var = inputs.iter().map(|r| r.weight * (r.value - mean).powi(2)).sum::<f64>() / total_w;
            (mean.clamp(-1.0, 1.0), var.sqrt())
        };
        let conflicted = divergence > self.cfg.divergence_threshold;

        if !expired.is_empty() {
            log(
                Level::Debug,
                Domain::Signal,
                "signal_expired",
                obj(&[("symbol", v_str(symbol)), ("sources", v_str(&expired.join(",")))]),
            );
        }
        if conflicted {
            log(
                Level::Info,
                Domain::Signal,
                "signal_conflicted",
                obj(&[("symbol", v_str(symbol)), ("confidence", v_num(confidence)), ("divergence", v_num(divergence))]),
            );
        }

        SignalUpdate { symbol: symbol.to_string(), confidence, conflicted, divergence, inputs, expired }
    }
}

/// Per-symbol source instances feeding one aggregator.
pub struct SignalEngine {
    specs: Vec<SourceSpec>,
    sources: BTreeMap<String, Vec<Box<dyn SignalSource>>>,
    aggregator: SignalAggregator,
}

impl SignalEngine {
    pub fn new(specs: Vec<SourceSpec>, cfg: AggregatorConfig) -> Self {
        Self { specs, sources: BTreeMap::new(), aggregator: SignalAggregator::new(cfg) }
    }

    /// Only closing ticks carry a bar, so only they produce an update.
    pub fn on_tick(&mut self, ts: Timestamp, tick: &Tick) -> Option<SignalUpdate> {
        let bar = tick.bar.as_ref()?;
        let specs = &self.specs;
        let sources = self
            .sources
            .entry(tick.symbol.clone())
            .or_insert_with(|| specs.iter().map(build_source).collect());
        for src in sources.iter_mut() {
            if let Some(value) = src.on_bar(bar) {
                let reading = SourceReading {
                    source: src.name().to_string(),
                    value: value.clamp(-1.0, 1.0),
                    weight: src.weight(),
                    ts,
                };
                self.aggregator.update(&tick.symbol, reading);
            }
        }
        Some(self.aggregator.aggregate(&tick.symbol, ts))
    }
}
