//! Structured JSON-lines logging.
//!
//! One record per line: `ts`, `run_id`, `seq`, `lvl`, `component`, `event`,
//! `msg`, the identity fields (`instrument`, `timeframe`, `side`) when
//! present, and everything else under `data`. Records are printed to stdout
//! and, when `LOG_DIR` is set, appended to `<LOG_DIR>/<RUN_ID>/events.jsonl`
//! (trace and debug go to `trace.jsonl` instead).
//!
//! `LOG_LEVEL` sets the minimum level (default `info`). `LOG_DOMAINS` is a
//! comma-separated allow list of components (default all). Both are read once.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw.trim().to_ascii_lowercase().as_str() {
            "trace" => Level::Trace,
            "debug" => Level::Debug,
            "info" => Level::Info,
            "warn" | "warning" => Level::Warn,
            "error" => Level::Error,
            _ => return None,
        })
    }

    fn threshold() -> Level {
        static MIN: OnceLock<Level> = OnceLock::new();
        *MIN.get_or_init(|| {
            std::env::var("LOG_LEVEL").ok().and_then(|v| Level::parse(&v)).unwrap_or(Level::Info)
        })
    }
}

/// Component a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Regime,
    Drift,
    MarketContext,
    Decision,
    Persist,
    Artifacts,
    System,
    Profile,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Regime => "regime",
            Domain::Drift => "drift",
            Domain::MarketContext => "market_context",
            Domain::Decision => "decision",
            Domain::Persist => "persist",
            Domain::Artifacts => "artifacts",
            Domain::System => "system",
            Domain::Profile => "profile",
        }
    }

    pub fn is_enabled(&self) -> bool {
        static ALLOWED: OnceLock<Option<Vec<String>>> = OnceLock::new();
        let allowed = ALLOWED.get_or_init(|| {
            std::env::var("LOG_DOMAINS")
                .ok()
                .filter(|v| v.trim() != "all")
                .map(|v| v.split(',').map(|d| d.trim().to_string()).collect())
        });
        allowed.as_ref().map_or(true, |list| list.iter().any(|d| d == self.as_str()))
    }
}

type LineSink = Mutex<BufWriter<std::fs::File>>;

struct Output {
    run_id: String,
    events: Option<LineSink>,
    trace: Option<LineSink>,
}

impl Output {
    fn from_env() -> Self {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), std::process::id()));
        let (events, trace) = match std::env::var("LOG_DIR") {
            Ok(base) => {
                let dir = Path::new(&base).join(&run_id);
                match std::fs::create_dir_all(&dir) {
                    Ok(()) => (append(&dir.join("events.jsonl")), append(&dir.join("trace.jsonl"))),
                    Err(err) => {
                        eprintln!("[log] cannot create {}: {}", dir.display(), err);
                        (None, None)
                    }
                }
            }
            Err(_) => (None, None),
        };
        Self { run_id, events, trace }
    }

    fn get() -> &'static Output {
        static OUTPUT: OnceLock<Output> = OnceLock::new();
        OUTPUT.get_or_init(Output::from_env)
    }
}

fn append(path: &Path) -> Option<LineSink> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(|f| Mutex::new(BufWriter::new(f)))
        .map_err(|err| eprintln!("[log] cannot open {}: {}", path.display(), err))
        .ok()
}

static SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Serialize)]
struct Record<'a> {
    ts: String,
    run_id: &'a str,
    seq: u64,
    lvl: Level,
    component: &'a str,
    event: &'a str,
    msg: Value,
    #[serde(flatten)]
    identity: Map<String, Value>,
    data: Map<String, Value>,
}

const IDENTITY_KEYS: [&str; 3] = ["instrument", "timeframe", "side"];

fn build_record<'a>(
    run_id: &'a str,
    level: Level,
    component: &'a str,
    event: &'a str,
    mut data: Map<String, Value>,
) -> Record<'a> {
    let msg = data.remove("msg").unwrap_or_else(|| Value::String(String::new()));
    let identity = IDENTITY_KEYS
        .iter()
        .filter_map(|k| data.remove(*k).map(|v| (k.to_string(), v)))
        .collect();
    Record {
        ts: ts_now(),
        run_id,
        seq: SEQ.fetch_add(1, Ordering::Relaxed),
        lvl: level,
        component,
        event,
        msg,
        identity,
        data,
    }
}

/// RFC3339 with milliseconds.
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    if level < Level::threshold() || !domain.is_enabled() {
        return;
    }
    let out = Output::get();
    let record = build_record(&out.run_id, level, domain.as_str(), event, fields);
    let Ok(line) = serde_json::to_string(&record) else { return };
    let file = if level <= Level::Debug { &out.trace } else { &out.events };
    if let Some(Ok(mut w)) = file.as_ref().map(|m| m.lock()) {
        let _ = writeln!(w, "{}", line).and_then(|_| w.flush());
    }
    println!("{}", line);
}

/// A freshly computed (not cached) decision.
pub fn log_decision(
    instrument: &str,
    timeframe: &str,
    side: &str,
    candle_ts: i64,
    allow_entry: bool,
    stake_scale: f64,
    reasons: &[String],
) {
    log(
        Level::Info,
        Domain::Decision,
        "decision",
        obj(&[
            ("instrument", v_str(instrument)),
            ("timeframe", v_str(timeframe)),
            ("side", v_str(side)),
            ("candle_ts", Value::from(candle_ts)),
            ("allow_entry", Value::Bool(allow_entry)),
            ("stake_scale", v_num(stake_scale)),
            ("reasons", reasons.iter().map(|r| v_str(r)).collect()),
        ]),
    );
}

pub fn log_regime(instrument: &str, regime: &str, source: &str, scale: f64) {
    log(
        Level::Debug,
        Domain::Regime,
        "regime",
        obj(&[
            ("instrument", v_str(instrument)),
            ("label", v_str(regime)),
            ("threshold_source", v_str(source)),
            ("scale", v_num(scale)),
        ]),
    );
}

/// Warn level unless the status is `ok`.
pub fn log_drift(instrument: &str, status: &str, scale: f64, counts: &[(&str, f64)]) {
    let mut fields = obj(&[
        ("instrument", v_str(instrument)),
        ("status", v_str(status)),
        ("scale", v_num(scale)),
    ]);
    for (k, v) in counts {
        fields.insert((*k).to_string(), v_num(*v));
    }
    let level = if status == "ok" { Level::Debug } else { Level::Warn };
    log(level, Domain::Drift, "drift_status", fields);
}

pub fn log_market_context(instrument: &str, status: &str, scale: f64, corr_delta: f64, beta_delta: f64) {
    log(
        Level::Debug,
        Domain::MarketContext,
        "market_context",
        obj(&[
            ("instrument", v_str(instrument)),
            ("status", v_str(status)),
            ("scale", v_num(scale)),
            ("corr_delta", v_num(corr_delta)),
            ("beta_delta", v_num(beta_delta)),
        ]),
    );
}

pub fn log_failure(domain: Domain, event: &str, instrument: &str, err: &anyhow::Error) {
    log(
        Level::Error,
        domain,
        event,
        obj(&[("instrument", v_str(instrument)), ("error", v_str(&format!("{:#}", err)))]),
    );
}

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
}

pub fn v_str(s: &str) -> Value {
    Value::from(s)
}

/// Non-finite numbers become `null`.
pub fn v_num(n: f64) -> Value {
    serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
}

/// Logs `elapsed_ms` at trace level when dropped.
pub struct ProfileScope {
    label: &'static str,
    fields: Map<String, Value>,
    start: Instant,
}

impl ProfileScope {
    pub fn with_context(label: &'static str, fields: &[(&str, Value)]) -> Self {
        Self { label, fields: obj(fields), start: Instant::now() }
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        let mut fields = std::mem::take(&mut self.fields);
        fields.insert("label".into(), v_str(self.label));
        fields.insert("elapsed_ms".into(), v_num(self.start.elapsed().as_secs_f64() * 1e3));
        log(Level::Trace, Domain::Profile, "profile", fields);
    }
}
