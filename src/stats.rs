//! Small statistics toolkit shared by the analyzers.
//!
//! Everything here works on plain `f64` slices and treats non-finite values
//! as missing. Functions return `NaN` rather than panicking when a statistic
//! is undefined, so callers can decide how to degrade.

use std::collections::VecDeque;

/// Fixed-size rolling window with running sum / sum of squares.
#[derive(Debug, Clone)]
pub struct RollingStats {
    window: usize,
    buf: VecDeque<f64>,
    sum: f64,
    sumsq: f64,
}

impl RollingStats {
    pub fn new(window: usize) -> Self {
        Self { window: window.max(1), buf: VecDeque::with_capacity(window), sum: 0.0, sumsq: 0.0 }
    }

    pub fn push(&mut self, x: f64) {
        self.buf.push_back(x);
        self.sum += x;
        self.sumsq += x * x;
        if self.buf.len() > self.window {
            if let Some(old) = self.buf.pop_front() {
                self.sum -= old;
                self.sumsq -= old * old;
            }
        }
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.window
    }

    pub fn mean(&self) -> f64 {
        if self.buf.is_empty() { f64::NAN } else { self.sum / self.buf.len() as f64 }
    }

    /// Sample variance (ddof = 1).
    pub fn variance(&self) -> f64 {
        let n = self.buf.len() as f64;
        if n < 2.0 {
            return f64::NAN;
        }
        ((self.sumsq - (self.sum * self.sum) / n) / (n - 1.0)).max(0.0)
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Finite values only.
pub fn finite(values: &[f64]) -> Vec<f64> {
    values.iter().copied().filter(|v| v.is_finite()).collect()
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (ddof = 1).
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return f64::NAN;
    }
    let m = mean(values);
    let ss: f64 = values.iter().map(|v| (v - m) * (v - m)).sum();
    (ss / (values.len() as f64 - 1.0)).sqrt()
}

/// Empirical quantile with linear interpolation between order statistics.
/// Non-finite inputs are ignored; `None` when nothing is left.
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    let mut v = finite(values);
    if v.is_empty() {
        return None;
    }
    v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let pos = (v.len() - 1) as f64 * q.clamp(0.0, 1.0);
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(v[lo] + (v[hi] - v[lo]) * frac)
}

/// Pearson correlation of two equally long samples.
pub fn pearson(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len().min(y.len());
    if n < 2 {
        return f64::NAN;
    }
    let (x, y) = (&x[..n], &y[..n]);
    let mx = mean(x);
    let my = mean(y);
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for i in 0..n {
        let dx = x[i] - mx;
        let dy = y[i] - my;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    let denom = (sxx * syy).sqrt();
    if !denom.is_finite() || denom <= 1e-18 {
        return f64::NAN;
    }
    sxy / denom
}

/// Regression slope of `asset` on `market`: cov(asset, market) / var(market).
pub fn beta(asset: &[f64], market: &[f64]) -> f64 {
    let n = asset.len().min(market.len());
    if n < 2 {
        return f64::NAN;
    }
    let (a, m) = (&asset[..n], &market[..n]);
    let ma = mean(a);
    let mm = mean(m);
    let mut cov = 0.0;
    let mut var = 0.0;
    for i in 0..n {
        let dm = m[i] - mm;
        cov += (a[i] - ma) * dm;
        var += dm * dm;
    }
    let denom = (n - 1) as f64;
    let var = var / denom;
    if !var.is_finite() || var.abs() <= 1e-12 {
        return f64::NAN;
    }
    (cov / denom) / var
}

/// Simple returns `x[i] / x[i-1] - 1`; the output is one shorter than the input.
pub fn simple_returns(values: &[f64]) -> Vec<f64> {
    values
        .windows(2)
        .map(|w| if w[0] != 0.0 { w[1] / w[0] - 1.0 } else { f64::NAN })
        .collect()
}
