//! Decision orchestrator.
//!
//! [`AutoRisk::evaluate`] runs drift, regime and market-context analysis for
//! one (instrument, timeframe, side) at most once per candle, folds their
//! scales into a single [`Decision`], advances the drift hysteresis gate and
//! writes a diagnostics report when the composite status changes into
//! something worth looking at.
//!
//! Nothing in here returns an error to the caller. Analyzer failures become
//! reason tags and bias toward allowing trading unless drift is configured
//! fail-closed.

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use std::sync::Arc;

use crate::artifacts::{symbol_dir, FsArtifactStore, ModelArtifact, ModelArtifactStore};
use crate::config::{AutoRiskConfig, DriftConfig};
use crate::decision::{clamp_unit, Decision, DriftStatus, Outcome, Side};
use crate::drift::{self, DriftReport};
use crate::features::{FeatureFrame, FeatureProvider, StandardFeatures};
use crate::logging::{
    log, log_decision, log_drift, log_failure, log_market_context, log_regime, obj, v_str, Domain,
    Level, ProfileScope,
};
use crate::market_context::{self, MarketContextResult};
use crate::persist::{candle_time, sink_from_config, DiagnosticsReport, PersistenceSink};
use crate::regime::{self, RegimeAssessment};
use crate::state::{EvaluationState, StateKey, StateStore};
use crate::table::{Bar, PriceTable};

/// Drift verdict before the hysteresis gate is applied.
struct DriftAssessment {
    status: DriftStatus,
    report: Option<DriftReport>,
    reasons: Vec<String>,
    fail_closed: bool,
}

impl DriftAssessment {
    fn unknown(reason: &str, fail_closed: bool) -> Self {
        Self {
            status: DriftStatus::Unknown,
            report: None,
            reasons: vec![reason.to_string()],
            fail_closed,
        }
    }
}

fn assess_drift(
    cfg: &DriftConfig,
    frame: Option<&FeatureFrame>,
    artifact: Option<&ModelArtifact>,
) -> DriftAssessment {
    let Some(frame) = frame else {
        return DriftAssessment::unknown("drift_error", !cfg.fail_open);
    };
    let Some(baseline) = artifact.and_then(|a| a.baseline.as_ref()) else {
        return DriftAssessment::unknown("drift_baseline_missing", !cfg.fail_open);
    };
    let model_features = artifact.map(|a| a.info.features.as_slice()).unwrap_or_default();
    match drift::detect(frame, baseline, model_features, cfg) {
        Outcome::Ok(report) => DriftAssessment {
            status: report.status(),
            reasons: vec![report.aggregate.reason_tag()],
            report: Some(report),
            fail_closed: false,
        },
        Outcome::Degraded(reason) => DriftAssessment::unknown(&reason, false),
    }
}

pub struct AutoRisk {
    cfg: AutoRiskConfig,
    artifacts: Box<dyn ModelArtifactStore>,
    features: Box<dyn FeatureProvider>,
    sink: Box<dyn PersistenceSink>,
    states: StateStore,
}

impl AutoRisk {
    pub fn new(
        cfg: AutoRiskConfig,
        artifacts: Box<dyn ModelArtifactStore>,
        features: Box<dyn FeatureProvider>,
        sink: Box<dyn PersistenceSink>,
    ) -> Self {
        Self { cfg, artifacts, features, sink, states: StateStore::new() }
    }

    /// Filesystem artifacts, standard features and the configured sink.
    pub fn from_config(cfg: AutoRiskConfig) -> Result<Self> {
        let sink = sink_from_config(&cfg.persist)?;
        let artifacts = FsArtifactStore::new(cfg.artifacts.clone());
        log(
            Level::Info,
            Domain::System,
            "auto_risk_init",
            obj(&[
                ("enabled", serde_json::Value::Bool(cfg.enabled)),
                ("model_root", v_str(&cfg.artifacts.root.to_string_lossy())),
                ("persist", serde_json::Value::Bool(cfg.persist.enabled)),
            ]),
        );
        Ok(Self::new(cfg, Box::new(artifacts), Box::new(StandardFeatures::default()), sink))
    }

    pub fn from_env() -> Result<Self> {
        Self::from_config(AutoRiskConfig::from_env())
    }

    pub fn config(&self) -> &AutoRiskConfig {
        &self.cfg
    }

    pub fn state(&self, instrument: &str, timeframe: &str, side: Side) -> Option<&EvaluationState> {
        self.states.get(&StateKey::new(instrument, timeframe, side))
    }

    /// Decision for the candle that is current at `as_of`. Repeated calls for
    /// the same key and candle return the cached decision unchanged.
    pub fn evaluate(
        &mut self,
        prices: &PriceTable,
        reference: Option<&PriceTable>,
        instrument: &str,
        timeframe: &str,
        as_of: i64,
        side: &str,
    ) -> Decision {
        if !self.cfg.enabled {
            return Decision::permissive(false, "auto_risk_disabled");
        }
        let Some(side) = Side::parse(side) else {
            return Decision::permissive(true, "side_invalid");
        };
        let bars = prices.slice_up_to(as_of);
        let Some(candle_ts) = bars.last().map(|b| b.ts) else {
            return Decision::permissive(true, "no_dataframe");
        };

        let key = StateKey::new(instrument, timeframe, side);
        {
            let state = self.states.get_or_create(key.clone());
            if let Some(cached) = state.cached_for(candle_ts) {
                return cached.clone();
            }
            state.observe_candle(candle_ts);
            if state.skips_check(self.cfg.drift.check_interval) {
                return state
                    .last_decision
                    .clone()
                    .unwrap_or_else(|| Decision::permissive(true, "skip_check_interval"));
            }
        }

        let _profile = ProfileScope::with_context(
            "auto_risk_evaluate",
            &[
                ("instrument", v_str(instrument)),
                ("timeframe", v_str(timeframe)),
                ("side", v_str(side.as_str())),
            ],
        );

        let artifact = self.load_artifact(instrument, timeframe);
        let frame = self.compute_features(instrument, bars);

        // Drift
        let drift = if self.cfg.drift.enabled {
            assess_drift(&self.cfg.drift, frame.as_ref(), artifact.as_deref())
        } else {
            DriftAssessment { status: DriftStatus::Unknown, report: None, reasons: Vec::new(), fail_closed: false }
        };

        // Regime
        let regime = if !self.cfg.regime.enabled {
            RegimeAssessment::disabled()
        } else if let Some(frame) = frame.as_ref() {
            let model_thresholds = artifact.as_ref().and_then(|a| a.info.regime_thresholds);
            match regime::assess(&self.cfg.regime, frame, model_thresholds, side) {
                Outcome::Ok(a) => a,
                Outcome::Degraded(reason) => RegimeAssessment::neutral(&reason),
            }
        } else {
            RegimeAssessment::neutral("regime_error")
        };
        log_regime(instrument, regime.regime.as_str(), regime.source.as_str(), regime.scale);

        // Market context
        let mc = self.market_context(instrument, bars, reference, as_of);
        if let Some(r) = mc.report.as_ref() {
            log_market_context(instrument, mc.status.as_str(), mc.scale, r.corr_delta, r.beta_delta);
        } else {
            log_market_context(instrument, mc.status.as_str(), mc.scale, f64::NAN, f64::NAN);
        }

        let state = self.states.get_or_create(key);
        let mut reasons = drift.reasons;
        let (drift_scale, mut allow_entry) = if self.cfg.drift.enabled {
            let verdict = state.apply_drift(drift.status, &self.cfg.drift);
            reasons.extend(verdict.reasons);
            (verdict.scale, verdict.allow_entry)
        } else {
            (1.0, true)
        };
        if drift.fail_closed {
            allow_entry = false;
            reasons.push("drift_fail_closed".to_string());
        }
        if let Some(report) = drift.report.as_ref() {
            log_drift(
                instrument,
                drift.status.as_str(),
                drift_scale,
                &[
                    ("crit_count", report.aggregate.crit_count as f64),
                    ("warn_count", report.aggregate.warn_count as f64),
                    ("total", report.aggregate.total as f64),
                ],
            );
        }

        reasons.extend(regime.reasons);
        reasons.extend(mc.reasons);
        allow_entry &= regime.allow_entry;

        let scale = clamp_unit(drift_scale * regime.scale * mc.scale);
        let decision = Decision {
            enabled: true,
            allow_entry,
            stake_scale: scale,
            leverage_scale: scale,
            regime: regime.regime,
            drift_status: drift.status,
            market_context_status: mc.status,
            market_context_scale: clamp_unit(mc.scale),
            reasons,
        };
        state.store(candle_ts, decision.clone());
        log_decision(
            instrument,
            timeframe,
            side.as_str(),
            candle_ts,
            decision.allow_entry,
            decision.stake_scale,
            &decision.reasons,
        );

        if !self.cfg.persist.enabled {
            return decision;
        }
        let status_key = decision.status_key(state.blocked);
        if state.last_persist_key.as_deref() == Some(status_key.as_str())
            || !decision.is_noteworthy(state.blocked)
        {
            return decision;
        }
        let report = DiagnosticsReport {
            instrument: instrument.to_string(),
            symbol: symbol_dir(instrument),
            timeframe: timeframe.to_string(),
            side: side.as_str().to_string(),
            evaluation_time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            candle_time: candle_time(candle_ts),
            candle_ts,
            status_key: status_key.clone(),
            decision: decision.clone(),
            drift_report: drift.report,
            baseline_path: artifact.as_ref().and_then(|a| a.baseline_path.clone()),
            market_context_report: mc.report,
        };
        match self.sink.write(&report) {
            Ok(()) => {
                state.last_persist_key = Some(status_key);
                log(
                    Level::Info,
                    Domain::Persist,
                    "diagnostics_written",
                    obj(&[
                        ("instrument", v_str(instrument)),
                        ("side", v_str(side.as_str())),
                        ("status_key", v_str(&report.status_key)),
                    ]),
                );
            }
            Err(err) => log_failure(Domain::Persist, "diagnostics_write_failed", instrument, &err),
        }
        decision
    }

    fn load_artifact(&mut self, instrument: &str, timeframe: &str) -> Option<Arc<ModelArtifact>> {
        if !self.cfg.drift.enabled && !self.cfg.regime.enabled {
            return None;
        }
        match self.artifacts.load(instrument, timeframe) {
            Ok(artifact) => artifact,
            Err(err) => {
                log_failure(Domain::Artifacts, "model_artifact_error", instrument, &err);
                None
            }
        }
    }

    fn compute_features(&self, instrument: &str, bars: &[Bar]) -> Option<FeatureFrame> {
        if !self.cfg.drift.enabled && !self.cfg.regime.enabled {
            return None;
        }
        let start = bars.len().saturating_sub(self.cfg.feature_lookback());
        match self.features.compute(&bars[start..]) {
            Ok(frame) => Some(frame),
            Err(err) => {
                log_failure(Domain::Decision, "feature_error", instrument, &err);
                None
            }
        }
    }

    fn market_context(
        &self,
        instrument: &str,
        bars: &[Bar],
        reference: Option<&PriceTable>,
        as_of: i64,
    ) -> MarketContextResult {
        let cfg = &self.cfg.market_context;
        let start = bars.len().saturating_sub(cfg.reference_window + 1);
        let asset = &bars[start..];
        let market = reference.map(|r| {
            let upto = r.slice_up_to(as_of);
            let from = asset.first().map_or(0, |first| upto.partition_point(|b| b.ts < first.ts));
            &upto[from..]
        });
        market_context::analyze(cfg, instrument, asset, market)
    }
}
