//! Market-context breakage: has the asset's co-movement with the reference
//! proxy changed recently?
//!
//! Correlation and beta are measured on a short and a long trailing sample of
//! aligned returns. The larger of the two normalised deltas becomes a score in
//! [0, 1] that throttles size. This analyzer never blocks entries.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::MarketContextConfig;
use crate::decision::{clamp_unit, MarketContextStatus};
use crate::stats::{beta, pearson, simple_returns};
use crate::table::Bar;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketContextReport {
    pub proxy: String,
    pub rows_short: usize,
    pub rows_long: usize,
    pub corr_short: f64,
    pub corr_long: f64,
    pub beta_short: f64,
    pub beta_long: f64,
    pub corr_delta: f64,
    pub beta_delta: f64,
    pub corr_score: f64,
    pub beta_score: f64,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarketContextResult {
    pub status: MarketContextStatus,
    pub scale: f64,
    pub report: Option<MarketContextReport>,
    pub reasons: Vec<String>,
}

impl MarketContextResult {
    fn fail_open(reason: &str) -> Self {
        Self {
            status: MarketContextStatus::Unknown,
            scale: 1.0,
            report: None,
            reasons: vec![reason.to_string()],
        }
    }

    pub fn disabled() -> Self {
        Self { status: MarketContextStatus::Disabled, scale: 1.0, report: None, reasons: Vec::new() }
    }
}

/// Piecewise-linear score: 0 at or below `warn`, 1 at or above `crit`.
pub fn delta_score(delta: f64, warn: f64, crit: f64) -> f64 {
    if !delta.is_finite() || delta <= warn {
        return 0.0;
    }
    if delta >= crit || crit <= warn {
        return 1.0;
    }
    ((delta - warn) / (crit - warn)).clamp(0.0, 1.0)
}

/// Inner-join closes on timestamp, then turn both into simple returns.
fn aligned_returns(asset: &[Bar], market: &[Bar]) -> (Vec<f64>, Vec<f64>) {
    let market_close: HashMap<i64, f64> = market.iter().map(|b| (b.ts, b.close)).collect();
    let (a, m): (Vec<f64>, Vec<f64>) = asset
        .iter()
        .filter_map(|b| market_close.get(&b.ts).map(|mc| (b.close, *mc)))
        .unzip();
    let ra = simple_returns(&a);
    let rm = simple_returns(&m);
    ra.into_iter().zip(rm).filter(|(x, y)| x.is_finite() && y.is_finite()).unzip()
}

/// Both slices must already be cut at the evaluation time.
pub fn analyze(
    cfg: &MarketContextConfig,
    instrument: &str,
    asset: &[Bar],
    market: Option<&[Bar]>,
) -> MarketContextResult {
    if !cfg.enabled {
        return MarketContextResult::disabled();
    }
    if cfg.proxy.trim().is_empty() {
        return MarketContextResult::fail_open("market_context_market_pair_missing");
    }
    if instrument == cfg.proxy {
        return MarketContextResult {
            status: MarketContextStatus::Ok,
            scale: 1.0,
            report: None,
            reasons: vec!["market_context_self".to_string()],
        };
    }
    let Some(market) = market.filter(|m| !m.is_empty()) else {
        return MarketContextResult::fail_open("market_context_market_df_missing");
    };

    let (ra, rm) = aligned_returns(asset, market);
    if ra.is_empty() {
        return MarketContextResult::fail_open("market_context_no_overlap");
    }

    let min_rows = cfg.min_periods.max(2);
    let long_start = ra.len().saturating_sub(cfg.reference_window);
    let short_start = ra.len().saturating_sub(cfg.window);
    let (long_a, long_m) = (&ra[long_start..], &rm[long_start..]);
    let (short_a, short_m) = (&ra[short_start..], &rm[short_start..]);
    if long_a.len() < min_rows || short_a.len() < min_rows {
        return MarketContextResult::fail_open("market_context_insufficient_data");
    }

    let corr_short = pearson(short_a, short_m);
    let corr_long = pearson(long_a, long_m);
    let beta_short = beta(short_a, short_m);
    let beta_long = beta(long_a, long_m);
    if ![corr_short, corr_long, beta_short, beta_long].iter().all(|v| v.is_finite()) {
        return MarketContextResult::fail_open("market_context_invalid_metrics");
    }

    let corr_delta = (corr_short - corr_long).abs();
    let beta_delta = (beta_short - beta_long).abs();
    let corr_score = delta_score(corr_delta, cfg.corr_warn, cfg.corr_crit);
    let beta_score = delta_score(beta_delta, cfg.beta_warn, cfg.beta_crit);
    let score = corr_score.max(beta_score);

    let mut reasons = Vec::new();
    for (name, s) in [("corr", corr_score), ("beta", beta_score)] {
        if s >= 1.0 {
            reasons.push(format!("market_context_{}_crit", name));
        } else if s > 0.0 {
            reasons.push(format!("market_context_{}_warn", name));
        }
    }
    let status = if score <= 0.0 {
        MarketContextStatus::Ok
    } else if score >= 1.0 {
        reasons.push("market_context_crit".to_string());
        MarketContextStatus::Crit
    } else {
        reasons.push("market_context_warn".to_string());
        MarketContextStatus::Warn
    };

    MarketContextResult {
        status,
        scale: clamp_unit(1.0 - score * (1.0 - cfg.min_scale)),
        report: Some(MarketContextReport {
            proxy: cfg.proxy.clone(),
            rows_short: short_a.len(),
            rows_long: long_a.len(),
            corr_short,
            corr_long,
            beta_short,
            beta_long,
            corr_delta,
            beta_delta,
            corr_score,
            beta_score,
            score,
        }),
        reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn series(returns: &[f64], start_ts: i64) -> Vec<Bar> {
        let mut px = 100.0;
        let mut out = vec![Bar { ts: start_ts, open: px, high: px, low: px, close: px, volume: 1.0 }];
        for (i, r) in returns.iter().enumerate() {
            px *= 1.0 + r;
            out.push(Bar { ts: start_ts + (i as i64 + 1) * 60_000, open: px, high: px, low: px, close: px, volume: 1.0 });
        }
        out
    }

    fn market_returns(n: usize, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n).map(|_| rng.gen_range(-0.02..0.02)).collect()
    }

    #[test]
    fn test_delta_score_boundaries() {
        assert_eq!(delta_score(0.1, 0.3, 0.6), 0.0);
        assert_eq!(delta_score(0.3, 0.3, 0.6), 0.0);
        assert_eq!(delta_score(0.6, 0.3, 0.6), 1.0);
        assert_eq!(delta_score(0.9, 0.3, 0.6), 1.0);
        assert!((delta_score(0.45, 0.3, 0.6) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_stable_relationship_is_ok() {
        let cfg = MarketContextConfig::default();
        let m = market_returns(400, 7);
        let a: Vec<f64> = m.iter().map(|r| 1.5 * r).collect();
        let res = analyze(&cfg, "ABC", &series(&a, 0), Some(&series(&m, 0)));
        assert_eq!(res.status, MarketContextStatus::Ok);
        assert_eq!(res.scale, 1.0);
        let report = res.report.unwrap();
        assert!((report.beta_short - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_decoupling_is_crit_and_scaled() {
        let cfg = MarketContextConfig::default();
        let m = market_returns(400, 11);
        let noise = market_returns(400, 99);
        // Tightly coupled for most of the history, independent in the last 48 bars.
        let a: Vec<f64> = m
            .iter()
            .zip(&noise)
            .enumerate()
            .map(|(i, (mr, nr))| if i < 352 { *mr } else { *nr })
            .collect();
        let res = analyze(&cfg, "ABC", &series(&a, 0), Some(&series(&m, 0)));
        assert!(matches!(res.status, MarketContextStatus::Warn | MarketContextStatus::Crit));
        assert!(res.scale < 1.0 && res.scale >= cfg.min_scale);
        assert!(res.reasons.iter().any(|r| r.starts_with("market_context_corr")));
    }

    #[test]
    fn test_self_short_circuits() {
        let cfg = MarketContextConfig::default();
        let res = analyze(&cfg, &cfg.proxy.clone(), &[], None);
        assert_eq!(res.status, MarketContextStatus::Ok);
        assert_eq!(res.scale, 1.0);
    }

    #[test]
    fn test_fail_open_paths() {
        let cfg = MarketContextConfig::default();
        let m = market_returns(100, 3);
        let asset = series(&m, 0);

        let res = analyze(&cfg, "ABC", &asset, None);
        assert_eq!(res.reasons, vec!["market_context_market_df_missing".to_string()]);

        let far = series(&m, 10_000_000_000);
        let res = analyze(&cfg, "ABC", &asset, Some(&far));
        assert_eq!(res.status, MarketContextStatus::Unknown);
        assert_eq!(res.reasons, vec!["market_context_no_overlap".to_string()]);

        let short = series(&m[..10], 0);
        let res = analyze(&cfg, "ABC", &short, Some(&short));
        assert_eq!(res.reasons, vec!["market_context_insufficient_data".to_string()]);

        let flat = series(&vec![0.0; 100], 0);
        let res = analyze(&cfg, "ABC", &asset, Some(&flat));
        assert_eq!(res.reasons, vec!["market_context_invalid_metrics".to_string()]);
        assert_eq!(res.scale, 1.0);

        let empty_proxy = MarketContextConfig { proxy: String::new(), ..cfg.clone() };
        let res = analyze(&empty_proxy, "ABC", &asset, Some(&asset));
        assert_eq!(res.reasons, vec!["market_context_market_pair_missing".to_string()]);

        let off = MarketContextConfig { enabled: false, ..cfg };
        assert_eq!(analyze(&off, "ABC", &asset, None).status, MarketContextStatus::Disabled);
    }
}
