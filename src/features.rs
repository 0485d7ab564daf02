//! Feature columns computed from a price table.
//!
//! The engine depends only on the [`FeatureProvider`] trait. [`StandardFeatures`]
//! is the default implementation and produces the columns the regime
//! classifier needs (`return_12`, `volatility_12`, `ema_spread`) plus a few
//! generic ones models commonly train on.

use anyhow::{bail, Result};
use std::collections::BTreeMap;

use crate::stats::RollingStats;
use crate::table::Bar;

pub const RETURN_12: &str = "return_12";
pub const VOLATILITY_12: &str = "volatility_12";
pub const EMA_SPREAD: &str = "ema_spread";

/// Named numeric columns aligned to a timestamp index. Undefined values
/// (warmup rows, divisions by zero) are `NaN`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureFrame {
    timestamps: Vec<i64>,
    columns: BTreeMap<String, Vec<f64>>,
}

impl FeatureFrame {
    pub fn new(timestamps: Vec<i64>) -> Self {
        Self { timestamps, columns: BTreeMap::new() }
    }

    pub fn insert(&mut self, name: &str, values: Vec<f64>) -> Result<()> {
        if values.len() != self.timestamps.len() {
            bail!(
                "column {} has {} rows, frame has {}",
                name,
                values.len(),
                self.timestamps.len()
            );
        }
        self.columns.insert(name.to_string(), values);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn timestamps(&self) -> &[i64] {
        &self.timestamps
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(|c| c.as_slice())
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(|k| k.as_str())
    }

    /// Latest value of a column, `None` if the column is absent or the frame empty.
    pub fn last(&self, name: &str) -> Option<f64> {
        self.columns.get(name).and_then(|c| c.last().copied())
    }

    /// Last `n` rows of every column.
    pub fn tail(&self, n: usize) -> FeatureFrame {
        let start = self.timestamps.len().saturating_sub(n);
        FeatureFrame {
            timestamps: self.timestamps[start..].to_vec(),
            columns: self
                .columns
                .iter()
                .map(|(k, v)| (k.clone(), v[start..].to_vec()))
                .collect(),
        }
    }
}

pub trait FeatureProvider: Send {
    fn compute(&self, bars: &[Bar]) -> Result<FeatureFrame>;
}

/// Return / volatility / trend features over close prices.
#[derive(Debug, Clone)]
pub struct StandardFeatures {
    pub short_horizon: usize,
    pub long_horizon: usize,
    pub ema_fast: usize,
    pub ema_slow: usize,
}

impl Default for StandardFeatures {
    fn default() -> Self {
        Self { short_horizon: 12, long_horizon: 48, ema_fast: 12, ema_slow: 48 }
    }
}

impl FeatureProvider for StandardFeatures {
    fn compute(&self, bars: &[Bar]) -> Result<FeatureFrame> {
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let mut frame = FeatureFrame::new(bars.iter().map(|b| b.ts).collect());

        let r1 = pct_change(&closes, 1);
        frame.insert(
            &format!("return_{}", self.short_horizon),
            pct_change(&closes, self.short_horizon),
        )?;
        frame.insert(
            &format!("return_{}", self.long_horizon),
            pct_change(&closes, self.long_horizon),
        )?;
        frame.insert(
            &format!("volatility_{}", self.short_horizon),
            rolling_std(&r1, self.short_horizon),
        )?;
        frame.insert(
            &format!("volatility_{}", self.long_horizon),
            rolling_std(&r1, self.long_horizon),
        )?;
        frame.insert("return_1", r1)?;

        let fast = ema(&closes, self.ema_fast);
        let slow = ema(&closes, self.ema_slow);
        let spread = fast
            .iter()
            .zip(&slow)
            .map(|(f, s)| if *s != 0.0 { f / s - 1.0 } else { f64::NAN })
            .collect();
        frame.insert(EMA_SPREAD, spread)?;

        let hl = bars
            .iter()
            .map(|b| if b.close > 0.0 { (b.high - b.low) / b.close } else { f64::NAN })
            .collect();
        frame.insert("hl_range", hl)?;

        let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();
        frame.insert(&format!("volume_z_{}", self.long_horizon), rolling_z(&volumes, self.long_horizon))?;

        Ok(frame)
    }
}

fn pct_change(values: &[f64], lag: usize) -> Vec<f64> {
    (0..values.len())
        .map(|i| {
            if i < lag || values[i - lag] == 0.0 {
                f64::NAN
            } else {
                values[i] / values[i - lag] - 1.0
            }
        })
        .collect()
}

fn rolling_std(values: &[f64], window: usize) -> Vec<f64> {
    let mut rs = RollingStats::new(window);
    let mut out = Vec::with_capacity(values.len());
    let mut nan_run = 0usize;
    for &v in values {
        // A window containing NaN is undefined; track the distance to the last NaN.
        if v.is_finite() {
            rs.push(v);
            nan_run += 1;
        } else {
            rs = RollingStats::new(window);
            nan_run = 0;
        }
        out.push(if nan_run >= window && rs.is_full() { rs.stddev() } else { f64::NAN });
    }
    out
}

fn rolling_z(values: &[f64], window: usize) -> Vec<f64> {
    let mut rs = RollingStats::new(window);
    values
        .iter()
        .map(|&v| {
            if !v.is_finite() {
                rs = RollingStats::new(window);
                return f64::NAN;
            }
            rs.push(v);
            if !rs.is_full() {
                return f64::NAN;
            }
            let sd = rs.stddev();
            if sd > 1e-12 { (v - rs.mean()) / sd } else { 0.0 }
        })
        .collect()
}

/// Exponential moving average seeded with the first finite value
/// (`adjust = false`). Non-finite inputs carry the previous average forward.
fn ema(values: &[f64], span: usize) -> Vec<f64> {
    let alpha = 2.0 / (span.max(1) as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    let mut prev: Option<f64> = None;
    for &v in values {
        if v.is_finite() {
            prev = Some(match prev {
                Some(p) => alpha * v + (1.0 - alpha) * p,
                None => v,
            });
        }
        out.push(prev.unwrap_or(f64::NAN));
    }
    out
}
