//! Synthetic bar generators shared by the integration tests.

#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use replayfx::data::HistoryCache;
use replayfx::events::Bar;

pub const MINUTE: u64 = 60_000;

fn bar(ts: u64, o: f64, c: f64, wick: f64) -> Bar {
    Bar { ts, interval_ms: MINUTE, o, h: o.max(c) * (1.0 + wick), l: o.min(c) * (1.0 - wick), c, v: 1_000.0 }
}

pub fn flat(n: usize, price: f64) -> Vec<Bar> {
    (0..n).map(|i| Bar { ts: i as u64 * MINUTE, interval_ms: MINUTE, o: price, h: price, l: price, c: price, v: 0.0 }).collect()
}

/// Random walk whose drift flips between up, flat and down every
/// `segment` bars, so trends form and reverse.
pub fn trending_walk(n: usize, seed: u64, drift: f64, noise: f64, segment: usize) -> Vec<Bar> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut price = 100.0;
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let d = match (i / segment.max(1)) % 4 {
            0 => drift,
            1 => 0.0,
            2 => -drift,
            _ => 0.0,
        };
        let r = d + rng.gen_range(-noise..=noise);
        let close = price * (1.0 + r);
        out.push(bar(i as u64 * MINUTE, price, close, rng.gen_range(0.0..noise.max(1e-6))));
        price = close;
    }
    out
}

/// Multiply the close of bar `at` (and every later bar) by `factor`.
pub fn with_jump(mut bars: Vec<Bar>, at: usize, factor: f64) -> Vec<Bar> {
    for (i, b) in bars.iter_mut().enumerate().skip(at) {
        if i == at {
            b.c *= factor;
            b.h = b.h.max(b.c);
            b.l = b.l.min(b.c);
        } else {
            b.o *= factor;
            b.h *= factor;
            b.l *= factor;
            b.c *= factor;
        }
    }
    bars
}

pub fn cache(symbol: &str, bars: Vec<Bar>) -> HistoryCache {
    let c = HistoryCache::new(MINUTE);
    c.insert(symbol, bars);
    c
}
