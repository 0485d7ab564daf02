//! Per-(instrument, timeframe, side) evaluation state.

use std::collections::HashMap;

use crate::config::DriftConfig;
use crate::decision::{Decision, DriftStatus, Side};
use crate::drift::{self, GateState, GateVerdict};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateKey {
    pub instrument: String,
    pub timeframe: String,
    pub side: Side,
}

impl StateKey {
    pub fn new(instrument: &str, timeframe: &str, side: Side) -> Self {
        Self { instrument: instrument.to_string(), timeframe: timeframe.to_string(), side }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EvaluationState {
    pub last_seen_candle_ts: Option<i64>,
    /// Distinct candles observed; drives sparse evaluation.
    pub seen_candle_count: u64,
    pub last_checked_candle_ts: Option<i64>,
    pub last_decision: Option<Decision>,
    /// Sticky drift lockout.
    pub blocked: bool,
    pub ok_streak: u32,
    pub last_persist_key: Option<String>,
}

impl EvaluationState {
    /// Count `candle_ts` if it has not been seen yet.
    pub fn observe_candle(&mut self, candle_ts: i64) {
        if self.last_seen_candle_ts != Some(candle_ts) {
            self.last_seen_candle_ts = Some(candle_ts);
            self.seen_candle_count += 1;
        }
    }

    /// True when this candle falls between sparse evaluation points.
    pub fn skips_check(&self, interval: u64) -> bool {
        interval > 1 && self.seen_candle_count.saturating_sub(1) % interval != 0
    }

    pub fn cached_for(&self, candle_ts: i64) -> Option<&Decision> {
        if self.last_checked_candle_ts == Some(candle_ts) {
            self.last_decision.as_ref()
        } else {
            None
        }
    }

    /// Advance the drift hysteresis gate.
    pub fn apply_drift(&mut self, status: DriftStatus, cfg: &DriftConfig) -> GateVerdict {
        let gate = GateState { blocked: self.blocked, ok_streak: self.ok_streak };
        let (next, verdict) = drift::step(gate, status, cfg);
        self.blocked = next.blocked;
        self.ok_streak = next.ok_streak;
        verdict
    }

    pub fn store(&mut self, candle_ts: i64, decision: Decision) {
        self.last_checked_candle_ts = Some(candle_ts);
        self.last_decision = Some(decision);
    }
}

/// Owns every `EvaluationState` of one engine instance.
#[derive(Debug, Default)]
pub struct StateStore {
    states: HashMap<StateKey, EvaluationState>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, key: StateKey) -> &mut EvaluationState {
        self.states.entry(key).or_default()
    }

    pub fn get(&self, key: &StateKey) -> Option<&EvaluationState> {
        self.states.get(key)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
