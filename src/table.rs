//! Price/volume table: the narrow typed interface the engine reads market
//! data through.
//!
//! Rows are strictly ordered by timestamp (epoch milliseconds). Analyzers
//! only ever look at `slice_up_to(as_of)`, which is what keeps live and
//! replayed evaluation free of lookahead.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const COLUMNS: [&str; 6] = ["timestamp", "open", "high", "low", "close", "volume"];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceTable {
    bars: Vec<Bar>,
}

impl PriceTable {
    /// Build a table, rejecting rows that are not strictly increasing in time.
    pub fn new(bars: Vec<Bar>) -> Result<Self> {
        if let Some(w) = bars.windows(2).find(|w| w[1].ts <= w[0].ts) {
            bail!("non_monotonic_ts: prev={} current={}", w[0].ts, w[1].ts);
        }
        Ok(Self { bars })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn last_timestamp(&self) -> Option<i64> {
        self.bars.last().map(|b| b.ts)
    }

    /// Rows with `ts <= as_of`.
    pub fn slice_up_to(&self, as_of: i64) -> &[Bar] {
        let end = self.bars.partition_point(|b| b.ts <= as_of);
        &self.bars[..end]
    }

    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.close).collect()
    }

    /// Parse `timestamp,open,high,low,close,volume` lines. Header and `#`
    /// comment lines are skipped.
    pub fn from_csv_str(content: &str) -> Result<Self> {
        let mut bars = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty()
                || trimmed.starts_with('#')
                || trimmed.to_lowercase().starts_with("timestamp")
                || trimmed.to_lowercase().starts_with("ts,")
            {
                continue;
            }
            let bar = parse_csv_line(trimmed).with_context(|| format!("line {}", lineno + 1))?;
            bars.push(bar);
        }
        Self::new(bars)
    }

    pub fn from_csv_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_csv_str(&content)
    }
}

pub fn parse_csv_line(line: &str) -> Result<Bar> {
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() < COLUMNS.len() {
        return Err(anyhow!("expected {} columns, got {}", COLUMNS.len(), parts.len()));
    }
    Ok(Bar {
        ts: parts[0].trim().parse()?,
        open: parts[1].trim().parse()?,
        high: parts[2].trim().parse()?,
        low: parts[3].trim().parse()?,
        close: parts[4].trim().parse()?,
        volume: parts[5].trim().parse()?,
    })
}
