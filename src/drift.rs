//! Feature drift against a stored baseline.
//!
//! Each feature gets three tests: PSI over the baseline's quantile buckets,
//! the z-score of the mean shift, and the missing-value rate. Feature
//! verdicts are aggregated with count/ratio quorums rather than "any crit",
//! and the hysteresis gate turns the aggregate into a sticky entry block that
//! needs several consecutive clean checks to clear.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::config::DriftConfig;
use crate::decision::{DriftStatus, Outcome};
use crate::features::FeatureFrame;
use crate::stats::{finite, mean, quantile, std_dev};

/// Floor applied to bucket fractions so empty buckets don't blow up the log.
const PSI_EPS: f64 = 1e-4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftThresholds {
    pub psi_warn: f64,
    pub psi_crit: f64,
    pub mean_z_warn: f64,
    pub mean_z_crit: f64,
    pub missing_rate_warn: f64,
    pub missing_rate_crit: f64,
}

impl Default for DriftThresholds {
    fn default() -> Self {
        Self {
            psi_warn: 0.10,
            psi_crit: 0.25,
            mean_z_warn: 2.0,
            mean_z_crit: 3.0,
            missing_rate_warn: 0.05,
            missing_rate_crit: 0.20,
        }
    }
}

// =============================================================================
// Baseline
// =============================================================================

/// Reference distribution of one feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDistribution {
    pub mean: f64,
    pub std: f64,
    /// Inner quantile cut points, strictly increasing. `k` edges give `k + 1` buckets.
    #[serde(default, alias = "bins")]
    pub bin_edges: Vec<f64>,
    /// Expected share per bucket; uniform when absent.
    #[serde(default)]
    pub bin_fractions: Vec<f64>,
    #[serde(default)]
    pub missing_rate: f64,
}

impl FeatureDistribution {
    fn expected_fractions(&self) -> Option<Vec<f64>> {
        let buckets = self.bin_edges.len() + 1;
        if self.bin_edges.is_empty() {
            return None;
        }
        if self.bin_fractions.is_empty() {
            return Some(vec![1.0 / buckets as f64; buckets]);
        }
        (self.bin_fractions.len() == buckets).then(|| self.bin_fractions.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaselineMetadata {
    #[serde(default)]
    pub instrument: String,
    #[serde(default)]
    pub timeframe: String,
    #[serde(default)]
    pub sample_start: Option<i64>,
    #[serde(default)]
    pub sample_end: Option<i64>,
    #[serde(default)]
    pub rows: usize,
    #[serde(default)]
    pub feature_set: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureBaseline {
    pub features: BTreeMap<String, FeatureDistribution>,
    #[serde(default)]
    pub metadata: BaselineMetadata,
    /// SHA-256 of the document this baseline was parsed from.
    #[serde(skip)]
    pub fingerprint: Option<String>,
}

impl FeatureBaseline {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut baseline: FeatureBaseline =
            serde_json::from_slice(bytes).context("invalid baseline document")?;
        baseline.fingerprint = Some(hex::encode(Sha256::digest(bytes)));
        Ok(baseline)
    }

    /// Build a baseline from a feature frame using `bins` quantile buckets.
    pub fn fit(frame: &FeatureFrame, bins: usize, metadata: BaselineMetadata) -> Self {
        let mut features = BTreeMap::new();
        for name in frame.column_names() {
            let Some(values) = frame.column(name) else { continue };
            let clean = finite(values);
            if clean.len() < 2 {
                continue;
            }
            let mut edges: Vec<f64> = (1..bins.max(2))
                .filter_map(|i| quantile(&clean, i as f64 / bins.max(2) as f64))
                .collect();
            edges.dedup_by(|b, a| (*b - *a).abs() <= f64::EPSILON);
            let fractions = bucket_fractions(&clean, &edges);
            features.insert(
                name.to_string(),
                FeatureDistribution {
                    mean: mean(&clean),
                    std: std_dev(&clean),
                    bin_edges: edges,
                    bin_fractions: fractions,
                    missing_rate: 1.0 - clean.len() as f64 / values.len() as f64,
                },
            );
        }
        Self {
            features,
            metadata: BaselineMetadata { rows: frame.len(), ..metadata },
            fingerprint: None,
        }
    }
}

fn bucket_fractions(values: &[f64], edges: &[f64]) -> Vec<f64> {
    let mut counts = vec![0usize; edges.len() + 1];
    for v in values {
        counts[edges.partition_point(|e| e < v)] += 1;
    }
    let n = values.len().max(1) as f64;
    counts.into_iter().map(|c| c as f64 / n).collect()
}

/// Population stability index between a recent sample and a stored
/// distribution. `NaN` when it cannot be computed.
pub fn psi(recent: &[f64], dist: &FeatureDistribution) -> f64 {
    let Some(expected) = dist.expected_fractions() else {
        return f64::NAN;
    };
    if recent.is_empty() {
        return f64::NAN;
    }
    let actual = bucket_fractions(recent, &dist.bin_edges);
    actual
        .iter()
        .zip(&expected)
        .map(|(a, e)| {
            let a = a.max(PSI_EPS);
            let e = e.max(PSI_EPS);
            (a - e) * (a / e).ln()
        })
        .sum()
}

// =============================================================================
// Per-feature verdicts and aggregation
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    Ok,
    Warn,
    Crit,
    MissingColumn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDriftReport {
    pub feature: String,
    pub status: FeatureStatus,
    pub psi: f64,
    pub mean_z: f64,
    pub missing_rate: f64,
    pub recent_mean: f64,
    pub baseline_mean: f64,
    pub baseline_std: f64,
}

fn grade(value: f64, warn: f64, crit: f64) -> FeatureStatus {
    if value.is_nan() {
        FeatureStatus::Ok
    } else if value >= crit {
        FeatureStatus::Crit
    } else if value >= warn {
        FeatureStatus::Warn
    } else {
        FeatureStatus::Ok
    }
}

pub fn evaluate_feature(
    name: &str,
    recent: Option<&[f64]>,
    dist: &FeatureDistribution,
    t: &DriftThresholds,
) -> FeatureDriftReport {
    let Some(values) = recent else {
        return FeatureDriftReport {
            feature: name.to_string(),
            status: FeatureStatus::MissingColumn,
            psi: f64::NAN,
            mean_z: f64::NAN,
            missing_rate: 1.0,
            recent_mean: f64::NAN,
            baseline_mean: dist.mean,
            baseline_std: dist.std,
        };
    };

    let clean = finite(values);
    let missing_rate = if values.is_empty() {
        1.0
    } else {
        1.0 - clean.len() as f64 / values.len() as f64
    };
    let recent_mean = mean(&clean);
    let mean_z = if dist.std.is_finite() && dist.std > 0.0 && recent_mean.is_finite() {
        (recent_mean - dist.mean).abs() / dist.std
    } else {
        f64::NAN
    };
    let psi = psi(&clean, dist);

    let status = [
        grade(psi, t.psi_warn, t.psi_crit),
        grade(mean_z, t.mean_z_warn, t.mean_z_crit),
        grade(missing_rate, t.missing_rate_warn, t.missing_rate_crit),
    ]
    .into_iter()
    .max()
    .unwrap_or(FeatureStatus::Ok);

    FeatureDriftReport {
        feature: name.to_string(),
        status,
        psi,
        mean_z,
        missing_rate,
        recent_mean,
        baseline_mean: dist.mean,
        baseline_std: dist.std,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftAggregate {
    pub status: DriftStatus,
    pub total: usize,
    pub crit_count: usize,
    pub warn_count: usize,
    pub missing_columns: Vec<String>,
    pub crit_required: usize,
    pub warn_required: usize,
}

impl DriftAggregate {
    pub fn reason_tag(&self) -> String {
        format!(
            "drift_agg:crit={}/{},warn={}/{},total={}",
            self.crit_count, self.crit_required, self.warn_count, self.warn_required, self.total
        )
    }
}

fn required(total: usize, min_count: usize, min_ratio: f64) -> usize {
    let by_ratio = (total as f64 * min_ratio.max(0.0)).ceil() as usize;
    min_count.max(by_ratio)
}

/// Quorum aggregation of per-feature verdicts. Any missing column is `crit`.
pub fn aggregate(reports: &[FeatureDriftReport], cfg: &DriftConfig) -> DriftAggregate {
    let total = reports.len();
    let missing_columns: Vec<String> = reports
        .iter()
        .filter(|r| r.status == FeatureStatus::MissingColumn)
        .map(|r| r.feature.clone())
        .collect();
    let crit_count = reports.iter().filter(|r| r.status == FeatureStatus::Crit).count();
    let warn_count = reports.iter().filter(|r| r.status == FeatureStatus::Warn).count();
    let crit_required = required(total, cfg.crit_min_count, cfg.crit_min_ratio);
    let warn_required = required(total, cfg.warn_min_count, cfg.warn_min_ratio);

    let status = if !missing_columns.is_empty() || crit_count >= crit_required {
        DriftStatus::Crit
    } else if crit_count + warn_count >= warn_required {
        DriftStatus::Warn
    } else {
        DriftStatus::Ok
    };

    DriftAggregate { status, total, crit_count, warn_count, missing_columns, crit_required, warn_required }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub aggregate: DriftAggregate,
    pub features: Vec<FeatureDriftReport>,
    pub window_rows: usize,
    pub baseline_fingerprint: Option<String>,
}

impl DriftReport {
    pub fn status(&self) -> DriftStatus {
        self.aggregate.status
    }
}

/// Last `window` values of `column` after its leading non-finite run.
///
/// Rolling features are NaN until their lookback fills; that prefix is not
/// missing data and must not count towards the missing rate.
fn settled_tail(column: &[f64], window: usize) -> &[f64] {
    let start = column.iter().position(|v| v.is_finite()).unwrap_or(column.len());
    let settled = &column[start..];
    &settled[settled.len().saturating_sub(window)..]
}

/// Compare the trailing `cfg.window` rows of `frame` to `baseline`.
///
/// `model_features` restricts the comparison to the features a model
/// actually consumes.
pub fn detect(
    frame: &FeatureFrame,
    baseline: &FeatureBaseline,
    model_features: &[String],
    cfg: &DriftConfig,
) -> Outcome<DriftReport> {
    if frame.len() < cfg.warmup {
        return Outcome::degraded("drift_warmup");
    }
    let names: Vec<&String> = baseline
        .features
        .keys()
        .filter(|k| model_features.is_empty() || model_features.contains(k))
        .collect();
    if names.is_empty() {
        return Outcome::degraded("drift_features_empty");
    }

    let features: Vec<FeatureDriftReport> = names
        .into_iter()
        .map(|name| {
            let recent = frame.column(name).map(|c| settled_tail(c, cfg.window));
            evaluate_feature(name, recent, &baseline.features[name], &cfg.thresholds)
        })
        .collect();

    Outcome::Ok(DriftReport {
        aggregate: aggregate(&features, cfg),
        features,
        window_rows: frame.len().min(cfg.window),
        baseline_fingerprint: baseline.fingerprint.clone(),
    })
}

// =============================================================================
// Hysteresis gate
// =============================================================================

/// Sticky block state carried between evaluations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateState {
    pub blocked: bool,
    pub ok_streak: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GateVerdict {
    pub scale: f64,
    pub allow_entry: bool,
    pub reasons: Vec<String>,
}

/// One step of the drift state machine.
///
/// `crit` blocks and resets the streak; `ok` while blocked grows the streak
/// and unblocks once it reaches `recover_ok_checks`; `unknown` neither clears
/// a block nor counts toward recovery.
pub fn step(state: GateState, status: DriftStatus, cfg: &DriftConfig) -> (GateState, GateVerdict) {
    let mut next = state;
    let mut reasons = Vec::new();
    let mut scale = 1.0;

    match status {
        DriftStatus::Crit => {
            next.blocked = true;
            next.ok_streak = 0;
            scale = cfg.crit_scale;
            reasons.push("drift_crit".to_string());
        }
        DriftStatus::Warn => {
            next.ok_streak = 0;
            scale = cfg.warn_scale;
            reasons.push("drift_warn".to_string());
        }
        DriftStatus::Ok if state.blocked => {
            next.ok_streak = state.ok_streak.saturating_add(1);
            reasons.push(format!("drift_recover_ok_streak={}/{}", next.ok_streak, cfg.recover_ok_checks));
            if next.ok_streak >= cfg.recover_ok_checks {
                next.blocked = false;
                next.ok_streak = 0;
            } else {
                reasons.push("drift_block_recovering".to_string());
            }
        }
        DriftStatus::Ok => {}
        DriftStatus::Unknown => {
            reasons.push(if state.blocked { "drift_block_unknown" } else { "drift_unknown" }.to_string());
        }
    }

    if next.blocked {
        scale = scale.min(cfg.crit_scale);
    }
    let allow_entry = !(next.blocked && cfg.crit_block_entries);
    if !allow_entry {
        reasons.push("drift_block_entries".to_string());
    }

    (next, GateVerdict { scale, allow_entry, reasons })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> DriftConfig {
        DriftConfig { warmup: 0, ..DriftConfig::default() }
    }

    fn report(status: FeatureStatus) -> FeatureDriftReport {
        FeatureDriftReport {
            feature: "f".into(),
            status,
            psi: 0.0,
            mean_z: 0.0,
            missing_rate: 0.0,
            recent_mean: 0.0,
            baseline_mean: 0.0,
            baseline_std: 1.0,
        }
    }

    fn panel(crit: usize, warn: usize, total: usize) -> Vec<FeatureDriftReport> {
        let mut v = Vec::new();
        v.extend((0..crit).map(|_| report(FeatureStatus::Crit)));
        v.extend((0..warn).map(|_| report(FeatureStatus::Warn)));
        v.extend((crit + warn..total).map(|_| report(FeatureStatus::Ok)));
        v
    }

    fn uniform_dist(values: &[f64]) -> FeatureDistribution {
        let mut frame = FeatureFrame::new((0..values.len() as i64).collect());
        frame.insert("x", values.to_vec()).unwrap();
        FeatureBaseline::fit(&frame, 10, BaselineMetadata::default()).features["x"].clone()
    }

    #[test]
    fn test_three_of_twenty_crit_is_crit() {
        let c = DriftConfig { crit_min_count: 2, crit_min_ratio: 0.05, ..cfg() };
        let agg = aggregate(&panel(3, 0, 20), &c);
        assert_eq!(agg.crit_required, 2);
        assert_eq!(agg.status, DriftStatus::Crit);
    }

    #[test]
    fn test_single_crit_is_only_warn_with_quorum() {
        let agg = aggregate(&panel(1, 1, 20), &cfg());
        assert_eq!(agg.status, DriftStatus::Warn);
        let agg = aggregate(&panel(1, 0, 20), &cfg());
        assert_eq!(agg.status, DriftStatus::Ok);
    }

    #[test]
    fn test_missing_column_forces_crit() {
        let mut reports = panel(0, 0, 20);
        reports[5].status = FeatureStatus::MissingColumn;
        let agg = aggregate(&reports, &cfg());
        assert_eq!(agg.status, DriftStatus::Crit);
        assert_eq!(agg.missing_columns.len(), 1);
    }

    #[test]
    fn test_more_crit_never_relaxes_status() {
        let c = cfg();
        let total = 20;
        for warn in 0..total {
            let mut seen_crit = false;
            for crit in 0..=(total - warn) {
                let status = aggregate(&panel(crit, warn, total), &c).status;
                if seen_crit {
                    assert_eq!(status, DriftStatus::Crit, "crit={} warn={}", crit, warn);
                }
                seen_crit |= status == DriftStatus::Crit;
            }
        }
    }

    #[test]
    fn test_psi_zero_for_same_distribution() {
        let values: Vec<f64> = (0..1000).map(|i| (i % 100) as f64).collect();
        let dist = uniform_dist(&values);
        assert!(psi(&values, &dist).abs() < 1e-9);
    }

    #[test]
    fn test_psi_large_for_shifted_distribution() {
        let values: Vec<f64> = (0..1000).map(|i| (i % 100) as f64).collect();
        let dist = uniform_dist(&values);
        let shifted: Vec<f64> = values.iter().map(|v| v + 80.0).collect();
        assert!(psi(&shifted, &dist) > 0.25);
    }

    #[test]
    fn test_psi_nan_without_bins() {
        let dist = FeatureDistribution { mean: 0.0, std: 1.0, bin_edges: vec![], bin_fractions: vec![], missing_rate: 0.0 };
        assert!(psi(&[1.0, 2.0], &dist).is_nan());
    }

    #[test]
    fn test_evaluate_feature_worst_test_wins() {
        let t = DriftThresholds::default();
        let dist = FeatureDistribution { mean: 0.0, std: 1.0, bin_edges: vec![], bin_fractions: vec![], missing_rate: 0.0 };
        let r = evaluate_feature("x", Some(&[2.5, 2.5, 2.5]), &dist, &t);
        assert_eq!(r.status, FeatureStatus::Warn);
        let r = evaluate_feature("x", Some(&[f64::NAN, f64::NAN, 0.0]), &dist, &t);
        assert_eq!(r.status, FeatureStatus::Crit);
        let r = evaluate_feature("x", None, &dist, &t);
        assert_eq!(r.status, FeatureStatus::MissingColumn);
    }

    #[test]
    fn test_detect_restricts_to_model_features() {
        let values: Vec<f64> = (0..300).map(|i| (i % 50) as f64).collect();
        let mut frame = FeatureFrame::new((0..300).collect());
        frame.insert("a", values.clone()).unwrap();
        frame.insert("b", values).unwrap();
        let baseline = FeatureBaseline::fit(&frame, 10, BaselineMetadata::default());
        let report = detect(&frame, &baseline, &["a".to_string()], &cfg()).ok().unwrap();
        assert_eq!(report.features.len(), 1);
        assert_eq!(report.status(), DriftStatus::Ok);

        let none = detect(&frame, &baseline, &["zzz".to_string()], &cfg());
        assert_eq!(none, Outcome::Degraded("drift_features_empty".into()));
    }

    #[test]
    fn test_detect_warmup() {
        let frame = FeatureFrame::new(vec![1, 2]);
        let c = DriftConfig { warmup: 10, ..DriftConfig::default() };
        let out = detect(&frame, &FeatureBaseline::default(), &[], &c);
        assert_eq!(out, Outcome::Degraded("drift_warmup".into()));
    }

    #[test]
    fn test_baseline_parse_sets_fingerprint() {
        let doc = br#"{"features": {"x": {"mean": 0.0, "std": 1.0, "bins": [-1.0, 0.0, 1.0]}}, "metadata": {"instrument": "ABC"}}"#;
        let b = FeatureBaseline::parse(doc).unwrap();
        assert_eq!(b.features["x"].bin_edges.len(), 3);
        assert_eq!(b.metadata.instrument, "ABC");
        assert_eq!(b.fingerprint.as_deref().map(str::len), Some(64));
    }

    #[test]
    fn test_gate_recovers_on_third_ok() {
        let c = DriftConfig { recover_ok_checks: 3, ..cfg() };
        let mut s = GateState::default();
        let mut allowed = Vec::new();
        for status in [DriftStatus::Crit, DriftStatus::Ok, DriftStatus::Ok, DriftStatus::Ok] {
            let (next, v) = step(s, status, &c);
            s = next;
            allowed.push(v.allow_entry);
        }
        assert_eq!(allowed, vec![false, false, false, true]);
        assert!(!s.blocked);
    }

    #[test]
    fn test_gate_crit_resets_streak() {
        let c = DriftConfig { recover_ok_checks: 3, ..cfg() };
        let mut s = GateState::default();
        for status in [DriftStatus::Crit, DriftStatus::Ok, DriftStatus::Ok, DriftStatus::Crit, DriftStatus::Ok] {
            s = step(s, status, &c).0;
        }
        assert!(s.blocked);
        assert_eq!(s.ok_streak, 1);
    }

    #[test]
    fn test_gate_unknown_keeps_block() {
        let c = cfg();
        let (mut s, _) = step(GateState::default(), DriftStatus::Crit, &c);
        for _ in 0..50 {
            let (next, v) = step(s, DriftStatus::Unknown, &c);
            assert!(!v.allow_entry);
            assert!(v.reasons.iter().any(|r| r == "drift_block_unknown"));
            s = next;
        }
        assert!(s.blocked);
        assert_eq!(s.ok_streak, 0);
    }

    fn cycle(n: usize) -> Vec<f64> {
        (0..n).map(|i| ((i * 37) % 100) as f64).collect()
    }

    fn padded(lead: usize, settled: usize) -> Vec<f64> {
        let mut v = vec![f64::NAN; lead];
        v.extend(cycle(settled));
        v
    }

    #[test]
    fn test_lookback_prefix_is_not_missing() {
        let mut fit_frame = FeatureFrame::new((0..1000).collect());
        fit_frame.insert("slow", cycle(1000)).unwrap();
        fit_frame.insert("fast", cycle(1000)).unwrap();
        let baseline = FeatureBaseline::fit(&fit_frame, 10, BaselineMetadata::default());

        // Just past warm-up, with rolling columns still filling their lookback.
        let mut frame = FeatureFrame::new((0..300).collect());
        frame.insert("slow", padded(100, 200)).unwrap();
        frame.insert("fast", padded(200, 100)).unwrap();
        let report = match detect(&frame, &baseline, &[], &DriftConfig::default()) {
            Outcome::Ok(r) => r,
            Outcome::Degraded(reason) => panic!("degraded: {}", reason),
        };
        for f in &report.features {
            assert_eq!(f.missing_rate, 0.0, "{}", f.feature);
            assert_eq!(f.status, FeatureStatus::Ok, "{}", f.feature);
        }
        assert_eq!(report.status(), DriftStatus::Ok);
        assert_eq!(report.window_rows, 300);
    }

    #[test]
    fn test_gaps_after_lookback_still_count() {
        let column = [f64::NAN, f64::NAN, 1.0, f64::NAN, 2.0, 3.0];
        let tail = settled_tail(&column, 10);
        assert_eq!(tail.len(), 4);
        assert_eq!(tail[0], 1.0);
        assert!(tail[1].is_nan());
        assert_eq!(settled_tail(&column, 2), &[2.0, 3.0]);
        assert!(settled_tail(&[f64::NAN; 3], 10).is_empty());

        let dist = uniform_dist(&[1.0, 2.0, 3.0, 4.0]);
        let r = evaluate_feature("x", Some(tail), &dist, &DriftThresholds::default());
        assert_eq!(r.missing_rate, 0.25);
        assert_eq!(r.status, FeatureStatus::Crit);
    }

    #[test]
    fn test_gate_warn_scales_without_blocking() {
        let (s, v) = step(GateState::default(), DriftStatus::Warn, &cfg());
        assert!(!s.blocked);
        assert!(v.allow_entry);
        assert_eq!(v.scale, 0.7);
    }
}
