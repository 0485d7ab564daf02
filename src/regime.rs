//! Regime classification from the latest feature row.
//!
//! A bar is `crisis` when volatility sits in the top decile, a trend when both
//! the EMA spread and the return/volatility ratio are strong, `range`
//! otherwise. Thresholds come from trained model metadata or are estimated
//! from a trailing window of the same features.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::RegimeConfig;
use crate::decision::{Outcome, Side};
use crate::features::{FeatureFrame, EMA_SPREAD, RETURN_12, VOLATILITY_12};
use crate::stats::quantile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    Unknown,
    Crisis,
    BullTrend,
    BearTrend,
    Range,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::Unknown => "unknown",
            Regime::Crisis => "crisis",
            Regime::BullTrend => "bull_trend",
            Regime::BearTrend => "bear_trend",
            Regime::Range => "range",
        }
    }

    /// Trend regimes that run with the side.
    pub fn is_favorable(&self, side: Side) -> bool {
        matches!((self, side), (Regime::BullTrend, Side::Long) | (Regime::BearTrend, Side::Short))
    }

    fn is_trend(&self) -> bool {
        matches!(self, Regime::BullTrend | Regime::BearTrend)
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest-bar inputs to [`classify`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegimeFeatures {
    pub return_12: f64,
    pub volatility_12: f64,
    pub ema_spread: f64,
}

impl RegimeFeatures {
    pub fn from_frame(frame: &FeatureFrame) -> Option<Self> {
        Some(Self {
            return_12: frame.last(RETURN_12)?,
            volatility_12: frame.last(VOLATILITY_12)?,
            ema_spread: frame.last(EMA_SPREAD)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdSource {
    FromModel,
    FromHistory,
    Unavailable,
}

impl ThresholdSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdSource::FromModel => "model",
            ThresholdSource::FromHistory => "history",
            ThresholdSource::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeThresholds {
    pub volatility_q90: f64,
    pub abs_spread_q70: f64,
    pub trend_strength_q70: f64,
}

impl RegimeThresholds {
    pub fn is_complete(&self) -> bool {
        self.volatility_q90.is_finite()
            && self.abs_spread_q70.is_finite()
            && self.trend_strength_q70.is_finite()
    }

    /// Estimate from the trailing `window` rows of a feature frame.
    pub fn from_history(frame: &FeatureFrame, window: usize, min_samples: usize) -> Option<Self> {
        let tail = frame.tail(window);
        let vol = tail.column(VOLATILITY_12)?;
        let ret = tail.column(RETURN_12)?;
        let spread = tail.column(EMA_SPREAD)?;

        let abs_spread: Vec<f64> = spread.iter().map(|s| s.abs()).collect();
        let strength: Vec<f64> = ret
            .iter()
            .zip(vol)
            .map(|(r, v)| if *v > 0.0 { r.abs() / v } else { f64::NAN })
            .collect();

        let samples = strength.iter().filter(|s| s.is_finite()).count();
        if samples < min_samples.max(1) {
            return None;
        }
        let t = Self {
            volatility_q90: quantile(vol, 0.90)?,
            abs_spread_q70: quantile(&abs_spread, 0.70)?,
            trend_strength_q70: quantile(&strength, 0.70)?,
        };
        t.is_complete().then_some(t)
    }
}

/// Thresholds together with where they came from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolvedThresholds {
    pub source: ThresholdSource,
    pub thresholds: Option<RegimeThresholds>,
}

/// Pick model thresholds when preferred and complete, else the history
/// estimate, else nothing.
pub fn resolve_thresholds(
    from_model: Option<RegimeThresholds>,
    from_history: Option<RegimeThresholds>,
    prefer_model: bool,
) -> ResolvedThresholds {
    let model = from_model.filter(|t| t.is_complete());
    let history = from_history.filter(|t| t.is_complete());
    let (source, thresholds) = match (prefer_model, model, history) {
        (true, Some(m), _) => (ThresholdSource::FromModel, Some(m)),
        (_, _, Some(h)) => (ThresholdSource::FromHistory, Some(h)),
        (false, Some(m), None) => (ThresholdSource::FromModel, Some(m)),
        _ => (ThresholdSource::Unavailable, None),
    };
    ResolvedThresholds { source, thresholds }
}

/// Pure classification of one bar.
pub fn classify(f: &RegimeFeatures, t: &RegimeThresholds) -> Regime {
    if !f.return_12.is_finite() || !f.volatility_12.is_finite() || !f.ema_spread.is_finite() {
        return Regime::Unknown;
    }
    if f.volatility_12 <= 0.0 || !t.is_complete() {
        return Regime::Unknown;
    }
    if f.volatility_12 >= t.volatility_q90 {
        return Regime::Crisis;
    }
    let strength = f.return_12.abs() / f.volatility_12;
    if f.ema_spread.abs() >= t.abs_spread_q70 && strength >= t.trend_strength_q70 {
        if f.ema_spread > 0.0 { Regime::BullTrend } else { Regime::BearTrend }
    } else {
        Regime::Range
    }
}

/// Orchestrator-facing regime verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct RegimeAssessment {
    pub regime: Regime,
    pub scale: f64,
    pub allow_entry: bool,
    pub source: ThresholdSource,
    pub reasons: Vec<String>,
}

impl RegimeAssessment {
    pub fn neutral(reason: &str) -> Self {
        Self {
            regime: Regime::Unknown,
            scale: 1.0,
            allow_entry: true,
            source: ThresholdSource::Unavailable,
            reasons: vec![reason.to_string()],
        }
    }

    /// Regime classification switched off: no scaling, no tags.
    pub fn disabled() -> Self {
        Self { reasons: Vec::new(), ..Self::neutral("") }
    }
}

/// Scale and entry gate for a regime on a given side.
pub fn regime_scale(cfg: &RegimeConfig, regime: Regime, side: Side) -> f64 {
    if regime.is_trend() && !regime.is_favorable(side) {
        cfg.scale_for("against_trend")
    } else {
        cfg.scale_for(regime.as_str())
    }
}

/// Classify the latest bar of `frame` and map it to a scale for `side`.
pub fn assess(
    cfg: &RegimeConfig,
    frame: &FeatureFrame,
    model_thresholds: Option<RegimeThresholds>,
    side: Side,
) -> Outcome<RegimeAssessment> {
    if frame.is_empty() {
        return Outcome::degraded("regime_features_missing");
    }
    let mut reasons = Vec::new();
    let features = RegimeFeatures::from_frame(frame);
    if features.is_none() {
        reasons.push("regime_features_missing".to_string());
    }

    let history = if cfg.prefer_model_thresholds && model_thresholds.map_or(false, |t| t.is_complete()) {
        None
    } else {
        RegimeThresholds::from_history(frame, cfg.history_window, cfg.min_history)
    };
    let resolved = resolve_thresholds(model_thresholds, history, cfg.prefer_model_thresholds);
    if resolved.thresholds.is_none() {
        reasons.push("regime_thresholds_unavailable".to_string());
    }

    let regime = match (features, resolved.thresholds) {
        (Some(f), Some(t)) => classify(&f, &t),
        _ => Regime::Unknown,
    };

    let mut allow_entry = true;
    if regime == Regime::Crisis && cfg.crisis_block_entries {
        allow_entry = false;
        reasons.push("regime_crisis_block_entries".to_string());
    }
    reasons.insert(0, format!("regime={}", regime));

    Outcome::Ok(RegimeAssessment {
        regime,
        scale: regime_scale(cfg, regime, side),
        allow_entry,
        source: resolved.source,
        reasons,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> RegimeThresholds {
        RegimeThresholds { volatility_q90: 0.03, abs_spread_q70: 0.01, trend_strength_q70: 1.0 }
    }

    fn frame_with_last(ret: f64, vol: f64, spread: f64) -> FeatureFrame {
        let mut f = FeatureFrame::new(vec![1]);
        f.insert(RETURN_12, vec![ret]).unwrap();
        f.insert(VOLATILITY_12, vec![vol]).unwrap();
        f.insert(EMA_SPREAD, vec![spread]).unwrap();
        f
    }

    #[test]
    fn test_classify_crisis() {
        let f = RegimeFeatures { return_12: 0.01, volatility_12: 0.05, ema_spread: 0.0 };
        assert_eq!(classify(&f, &thresholds()), Regime::Crisis);
    }

    #[test]
    fn test_classify_trends_and_range() {
        let t = thresholds();
        let bull = RegimeFeatures { return_12: 0.04, volatility_12: 0.02, ema_spread: 0.02 };
        let bear = RegimeFeatures { return_12: -0.04, volatility_12: 0.02, ema_spread: -0.02 };
        let weak = RegimeFeatures { return_12: 0.001, volatility_12: 0.02, ema_spread: 0.02 };
        assert_eq!(classify(&bull, &t), Regime::BullTrend);
        assert_eq!(classify(&bear, &t), Regime::BearTrend);
        assert_eq!(classify(&weak, &t), Regime::Range);
    }

    #[test]
    fn test_classify_unknown_on_bad_inputs() {
        let t = thresholds();
        let nan = RegimeFeatures { return_12: f64::NAN, volatility_12: 0.02, ema_spread: 0.0 };
        let zero_vol = RegimeFeatures { return_12: 0.01, volatility_12: 0.0, ema_spread: 0.0 };
        assert_eq!(classify(&nan, &t), Regime::Unknown);
        assert_eq!(classify(&zero_vol, &t), Regime::Unknown);
        let ok = RegimeFeatures { return_12: 0.01, volatility_12: 0.02, ema_spread: 0.0 };
        let broken = RegimeThresholds { volatility_q90: f64::NAN, ..t };
        assert_eq!(classify(&ok, &broken), Regime::Unknown);
    }

    #[test]
    fn test_classify_is_deterministic() {
        let f = RegimeFeatures { return_12: 0.03, volatility_12: 0.015, ema_spread: 0.012 };
        let first = classify(&f, &thresholds());
        for _ in 0..100 {
            assert_eq!(classify(&f, &thresholds()), first);
        }
    }

    #[test]
    fn test_resolve_prefers_model() {
        let model = thresholds();
        let hist = RegimeThresholds { volatility_q90: 0.5, ..model };
        let r = resolve_thresholds(Some(model), Some(hist), true);
        assert_eq!(r.source, ThresholdSource::FromModel);
        assert_eq!(r.thresholds, Some(model));

        let r = resolve_thresholds(Some(model), Some(hist), false);
        assert_eq!(r.source, ThresholdSource::FromHistory);

        let incomplete = RegimeThresholds { abs_spread_q70: f64::INFINITY, ..model };
        let r = resolve_thresholds(Some(incomplete), None, true);
        assert_eq!(r.source, ThresholdSource::Unavailable);
        assert!(r.thresholds.is_none());
    }

    #[test]
    fn test_from_history_needs_samples() {
        let f = frame_with_last(0.01, 0.02, 0.001);
        assert!(RegimeThresholds::from_history(&f, 1500, 100).is_none());
    }

    #[test]
    fn test_against_trend_scale() {
        let cfg = RegimeConfig::default();
        assert_eq!(regime_scale(&cfg, Regime::BullTrend, Side::Long), 1.0);
        assert_eq!(regime_scale(&cfg, Regime::BullTrend, Side::Short), 0.6);
        assert_eq!(regime_scale(&cfg, Regime::BearTrend, Side::Short), 1.0);
        assert_eq!(regime_scale(&cfg, Regime::Range, Side::Short), 0.8);
        assert_eq!(regime_scale(&cfg, Regime::Crisis, Side::Long), 0.5);
    }

    #[test]
    fn test_assess_crisis_soft_by_default() {
        let cfg = RegimeConfig::default();
        let f = frame_with_last(0.01, 0.05, 0.0);
        let a = assess(&cfg, &f, Some(thresholds()), Side::Long).ok().unwrap();
        assert_eq!(a.regime, Regime::Crisis);
        assert!(a.allow_entry);
        assert_eq!(a.scale, 0.5);
        assert_eq!(a.source, ThresholdSource::FromModel);
    }

    #[test]
    fn test_assess_crisis_block_when_configured() {
        let cfg = RegimeConfig { crisis_block_entries: true, ..RegimeConfig::default() };
        let f = frame_with_last(0.01, 0.05, 0.0);
        let a = assess(&cfg, &f, Some(thresholds()), Side::Short).ok().unwrap();
        assert!(!a.allow_entry);
        assert!(a.reasons.iter().any(|r| r == "regime_crisis_block_entries"));
    }

    #[test]
    fn test_assess_missing_columns_degrades_to_unknown() {
        let cfg = RegimeConfig::default();
        let mut f = FeatureFrame::new(vec![1]);
        f.insert("return_1", vec![0.0]).unwrap();
        let a = assess(&cfg, &f, Some(thresholds()), Side::Long).ok().unwrap();
        assert_eq!(a.regime, Regime::Unknown);
        assert!(a.reasons.iter().any(|r| r == "regime_features_missing"));
        assert_eq!(a.scale, 0.8);
    }
}
