//! Decision value and the small status enums it is built from.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::regime::Regime;

/// Trade direction a decision is evaluated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "long" => Some(Side::Long),
            "short" => Some(Side::Short),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftStatus {
    Ok,
    Warn,
    Crit,
    Unknown,
}

impl DriftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriftStatus::Ok => "ok",
            DriftStatus::Warn => "warn",
            DriftStatus::Crit => "crit",
            DriftStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DriftStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketContextStatus {
    Ok,
    Warn,
    Crit,
    Unknown,
    Disabled,
}

impl MarketContextStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketContextStatus::Ok => "ok",
            MarketContextStatus::Warn => "warn",
            MarketContextStatus::Crit => "crit",
            MarketContextStatus::Unknown => "unknown",
            MarketContextStatus::Disabled => "disabled",
        }
    }
}

impl fmt::Display for MarketContextStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of an analyzer step: either a value, or a degraded marker carrying
/// the reason tag the orchestrator should surface.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Ok(T),
    Degraded(String),
}

impl<T> Outcome<T> {
    pub fn degraded(reason: impl Into<String>) -> Self {
        Outcome::Degraded(reason.into())
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Outcome::Ok(v) => Some(v),
            Outcome::Degraded(_) => None,
        }
    }
}

/// One risk decision. Built once per evaluated candle and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub enabled: bool,
    pub allow_entry: bool,
    pub stake_scale: f64,
    pub leverage_scale: f64,
    pub regime: Regime,
    pub drift_status: DriftStatus,
    pub market_context_status: MarketContextStatus,
    pub market_context_scale: f64,
    pub reasons: Vec<String>,
}

impl Decision {
    /// Allow-everything decision used whenever the engine cannot or should not
    /// evaluate.
    pub fn permissive(enabled: bool, reason: &str) -> Self {
        Self {
            enabled,
            allow_entry: true,
            stake_scale: 1.0,
            leverage_scale: 1.0,
            regime: Regime::Unknown,
            drift_status: DriftStatus::Unknown,
            market_context_status: MarketContextStatus::Unknown,
            market_context_scale: 1.0,
            reasons: vec![reason.to_string()],
        }
    }

    /// Drift / market-context / blocking summary used to deduplicate reports.
    pub fn status_key(&self, blocked: bool) -> String {
        format!(
            "drift={}|mc={}|blocked={}|entry={}",
            self.drift_status, self.market_context_status, blocked, self.allow_entry
        )
    }

    pub fn is_noteworthy(&self, blocked: bool) -> bool {
        blocked
            || !self.allow_entry
            || matches!(self.drift_status, DriftStatus::Warn | DriftStatus::Crit)
            || matches!(
                self.market_context_status,
                MarketContextStatus::Warn | MarketContextStatus::Crit
            )
    }
}

pub fn clamp_unit(x: f64) -> f64 {
    if x.is_finite() { x.clamp(0.0, 1.0) } else { 1.0 }
}
