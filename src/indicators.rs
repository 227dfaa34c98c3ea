//! Incremental indicators over price series.
//!
//! Every indicator owns its rolling state and is fed one value at a time,
//! so memory is bounded by the window and never by the replay length.

use std::collections::VecDeque;

// =============================================================================
// Averages
// =============================================================================

/// Exponential moving average seeded with the first observation.
#[derive(Debug, Clone)]
pub struct Ema {
    value: f64,
    alpha: f64,
    count: usize,
    period: usize,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        let period = period.max(1);
        Self { value: 0.0, alpha: 2.0 / (period as f64 + 1.0), count: 0, period }
    }

    pub fn update(&mut self, x: f64) -> f64 {
        if self.count == 0 {
            self.value = x;
        } else {
            self.value += self.alpha * (x - self.value);
        }
        self.count += 1;
        self.value
    }

    pub fn get(&self) -> f64 {
        self.value
    }

    pub fn is_ready(&self) -> bool {
        self.count >= self.period
    }
}

// =============================================================================
// Dispersion
// =============================================================================

/// Rolling mean and sample standard deviation.
///
/// Recomputed from the window on each update; windows here are small and
/// the two-pass form avoids drift from running sums on long replays.
#[derive(Debug, Clone)]
pub struct RollingStd {
    window: VecDeque<f64>,
    period: usize,
    mean: f64,
    std: f64,
}

impl RollingStd {
    pub fn new(period: usize) -> Self {
        let period = period.max(2);
        Self { window: VecDeque::with_capacity(period + 1), period, mean: 0.0, std: 0.0 }
    }

    pub fn update(&mut self, x: f64) -> f64 {
        self.window.push_back(x);
        if self.window.len() > self.period {
            self.window.pop_front();
        }
        let n = self.window.len() as f64;
        self.mean = self.window.iter().sum::<f64>() / n;
        self.std = if n < 2.0 {
            0.0
        } else {
            let m2: f64 = self.window.iter().map(|v| (v - self.mean).powi(2)).sum();
            (m2 / (n - 1.0)).sqrt()
        };
        self.std
    }

    pub fn get(&self) -> f64 {
        self.std
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn is_ready(&self) -> bool {
        self.window.len() >= self.period
    }

    /// Z-score of `x` against the current window; 0 when the window is flat.
    pub fn zscore(&self, x: f64) -> f64 {
        if self.std <= f64::EPSILON {
            0.0
        } else {
            (x - self.mean) / self.std
        }
    }
}

/// Realized volatility of simple returns over a window.
#[derive(Debug, Clone)]
pub struct ReturnVol {
    prev: Option<f64>,
    std: RollingStd,
    last_return: f64,
}

impl ReturnVol {
    pub fn new(period: usize) -> Self {
        Self { prev: None, std: RollingStd::new(period), last_return: 0.0 }
    }

    pub fn update(&mut self, price: f64) -> f64 {
        if let Some(prev) = self.prev {
            if prev > 0.0 {
                self.last_return = price / prev - 1.0;
                self.std.update(self.last_return);
            }
        }
        self.prev = Some(price);
        self.std.get()
    }

    pub fn get(&self) -> f64 {
        self.std.get()
    }

    pub fn last_return(&self) -> f64 {
        self.last_return
    }

    pub fn is_ready(&self) -> bool {
        self.std.is_ready()
    }
}

// =============================================================================
// Ranges
// =============================================================================

/// Average True Range (EMA-smoothed true range).
#[derive(Debug, Clone)]
pub struct Atr {
    ema: Ema,
    prev_close: Option<f64>,
}

impl Atr {
    pub fn new(period: usize) -> Self {
        Self { ema: Ema::new(period), prev_close: None }
    }

    pub fn update(&mut self, high: f64, low: f64, close: f64) -> f64 {
        let tr = match self.prev_close {
            Some(pc) => (high - low).max((high - pc).abs()).max((low - pc).abs()),
            None => high - low,
        };
        self.prev_close = Some(close);
        self.ema.update(tr)
    }

    pub fn get(&self) -> f64 {
        self.ema.get()
    }

    pub fn is_ready(&self) -> bool {
        self.ema.is_ready()
    }
}

/// Donchian channel: highest high and lowest low over the window.
#[derive(Debug, Clone)]
pub struct Donchian {
    highs: VecDeque<f64>,
    lows: VecDeque<f64>,
    period: usize,
}

impl Donchian {
    pub fn new(period: usize) -> Self {
        let period = period.max(1);
        Self {
            highs: VecDeque::with_capacity(period + 1),
            lows: VecDeque::with_capacity(period + 1),
            period,
        }
    }

    pub fn update(&mut self, high: f64, low: f64) {
        self.highs.push_back(high);
        self.lows.push_back(low);
        if self.highs.len() > self.period {
            self.highs.pop_front();
            self.lows.pop_front();
        }
    }

    pub fn upper(&self) -> f64 {
        self.highs.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn lower(&self) -> f64 {
        self.lows.iter().cloned().fold(f64::INFINITY, f64::min)
    }

    /// Position of `price` in the channel mapped to [-1, 1]. Flat channel is 0.
    pub fn position(&self, price: f64) -> f64 {
        if self.highs.is_empty() {
            return 0.0;
        }
        let (lo, hi) = (self.lower(), self.upper());
        if hi - lo <= f64::EPSILON {
            return 0.0;
        }
        (2.0 * (price - lo) / (hi - lo) - 1.0).clamp(-1.0, 1.0)
    }

    pub fn is_ready(&self) -> bool {
        self.highs.len() >= self.period
    }
}

// =============================================================================
// Regression
// =============================================================================

/// OLS slope of `ys` against their index and the t-statistic of that slope.
///
/// Returns `(0, 0)` for fewer than three points. A perfect fit with nonzero
/// slope saturates the t-stat at `±T_CAP`.
pub fn slope_tstat(ys: &[f64]) -> (f64, f64) {
    const T_CAP: f64 = 50.0;
    let n = ys.len();
    if n < 3 {
        return (0.0, 0.0);
    }
    let nf = n as f64;
    let mean_x = (nf - 1.0) / 2.0;
    let mean_y = ys.iter().sum::<f64>() / nf;
    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (i, y) in ys.iter().enumerate() {
        let dx = i as f64 - mean_x;
        sxx += dx * dx;
        sxy += dx * (y - mean_y);
    }
    if sxx <= 0.0 {
        return (0.0, 0.0);
    }
    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;
    let sse: f64 = ys
        .iter()
        .enumerate()
        .map(|(i, y)| (y - (intercept + slope * i as f64)).powi(2))
        .sum();
    let se = (sse / (nf - 2.0) / sxx).sqrt();
    let t = if se <= 1e-12 {
        if slope.abs() <= 1e-12 {
            0.0
        } else {
            T_CAP * slope.signum()
        }
    } else {
        (slope / se).clamp(-T_CAP, T_CAP)
    };
    (slope, t)
}

/// Pearson correlation; 0 when either side has no variance.
pub fn correlation(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let (a, b) = (&a[a.len() - n..], &b[b.len() - n..]);
    let ma = a.iter().sum::<f64>() / n as f64;
    let mb = b.iter().sum::<f64>() / n as f64;
    let mut cov = 0.0;
    let mut va = 0.0;
    let mut vb = 0.0;
    for (x, y) in a.iter().zip(b) {
        cov += (x - ma) * (y - mb);
        va += (x - ma).powi(2);
        vb += (y - mb).powi(2);
    }
    if va <= 1e-18 || vb <= 1e-18 {
        0.0
    } else {
        (cov / (va.sqrt() * vb.sqrt())).clamp(-1.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ema() {
        let mut ema = Ema::new(10);
        for i in 1..=20 {
            ema.update(i as f64);
        }
        assert!(ema.get() > 10.0 && ema.get() < 20.0);
        assert!(ema.is_ready());
    }

    #[test]
    fn rolling_std_flat_is_zero() {
        let mut s = RollingStd::new(10);
        for _ in 0..20 {
            s.update(100.0);
        }
        assert_eq!(s.get(), 0.0);
        assert_eq!(s.zscore(101.0), 0.0);
    }

    #[test]
    fn atr_tracks_range() {
        let mut atr = Atr::new(5);
        for _ in 0..30 {
            atr.update(102.0, 98.0, 100.0);
        }
        assert!((atr.get() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn donchian_position() {
        let mut d = Donchian::new(3);
        d.update(110.0, 90.0);
        assert_eq!(d.position(110.0), 1.0);
        assert_eq!(d.position(90.0), -1.0);
        assert_eq!(d.position(100.0), 0.0);
    }

    #[test]
    fn slope_of_line_saturates() {
        let ys: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        let (slope, t) = slope_tstat(&ys);
        assert!((slope - 1.0).abs() < 1e-9);
        assert_eq!(t, 50.0);
        assert_eq!(slope_tstat(&[5.0; 20]), (0.0, 0.0));
    }

    #[test]
    fn correlation_of_flat_series_is_zero() {
        let a = vec![1.0, 2.0, 3.0, 4.0];
        assert!((correlation(&a, &a) - 1.0).abs() < 1e-12);
        assert_eq!(correlation(&a, &[2.0; 4]), 0.0);
    }
}
