//! Diagnostics reports written on noteworthy status changes.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::config::{PersistBackend, PersistConfig};
use crate::decision::Decision;
use crate::drift::DriftReport;
use crate::market_context::MarketContextReport;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsReport {
    pub instrument: String,
    /// Filesystem-safe form of the instrument id.
    pub symbol: String,
    pub timeframe: String,
    pub side: String,
    pub evaluation_time: String,
    pub candle_time: String,
    pub candle_ts: i64,
    pub status_key: String,
    pub decision: Decision,
    pub drift_report: Option<DriftReport>,
    pub baseline_path: Option<PathBuf>,
    pub market_context_report: Option<MarketContextReport>,
}

/// RFC3339 for an epoch-millisecond candle timestamp.
pub fn candle_time(ts_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ts_ms)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| ts_ms.to_string())
}

pub trait PersistenceSink: Send {
    fn write(&mut self, report: &DiagnosticsReport) -> Result<()>;
}

/// Build the sink named by the config; `NullSink` when persistence is off.
pub fn sink_from_config(cfg: &PersistConfig) -> Result<Box<dyn PersistenceSink>> {
    if !cfg.enabled {
        return Ok(Box::new(NullSink));
    }
    Ok(match cfg.backend {
        PersistBackend::Json => Box::new(JsonReportSink::new(&cfg.dir)),
        PersistBackend::Sqlite => {
            std::fs::create_dir_all(&cfg.dir)
                .with_context(|| format!("failed to create {}", cfg.dir.display()))?;
            let mut sink = SqliteReportSink::open(&cfg.dir.join("auto_risk.sqlite"))?;
            sink.init()?;
            Box::new(sink)
        }
    })
}

pub struct NullSink;

impl PersistenceSink for NullSink {
    fn write(&mut self, _report: &DiagnosticsReport) -> Result<()> {
        Ok(())
    }
}

/// One pretty-printed JSON file per report:
/// `<dir>/<SYMBOL>/<side>/<candle_ts>_<drift status>.json`.
pub struct JsonReportSink {
    dir: PathBuf,
}

impl JsonReportSink {
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf() }
    }

    pub fn path_for(&self, report: &DiagnosticsReport) -> PathBuf {
        self.dir
            .join(&report.symbol)
            .join(&report.side)
            .join(format!("{}_{}.json", report.candle_ts, report.decision.drift_status))
    }
}

impl PersistenceSink for JsonReportSink {
    fn write(&mut self, report: &DiagnosticsReport) -> Result<()> {
        let path = self.path_for(report);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let body = serde_json::to_vec_pretty(report)?;
        std::fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

/// Reports as rows of `auto_risk_reports`, full document in `body`.
pub struct SqliteReportSink {
    conn: Connection,
}

impl SqliteReportSink {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: Connection::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?,
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self { conn: Connection::open_in_memory()? })
    }

    pub fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS auto_risk_reports (
                candle_ts INTEGER NOT NULL,
                instrument TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                side TEXT NOT NULL,
                status_key TEXT NOT NULL,
                allow_entry INTEGER NOT NULL,
                stake_scale REAL NOT NULL,
                evaluation_time TEXT NOT NULL,
                body TEXT NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    pub fn count(&self, instrument: &str, side: &str) -> Result<u64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM auto_risk_reports WHERE instrument = ?1 AND side = ?2",
            params![instrument, side],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }
}

impl PersistenceSink for SqliteReportSink {
    fn write(&mut self, report: &DiagnosticsReport) -> Result<()> {
        let body = serde_json::to_string(report)?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO auto_risk_reports
                (candle_ts, instrument, timeframe, side, status_key, allow_entry, stake_scale, evaluation_time, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                report.candle_ts,
                report.instrument,
                report.timeframe,
                report.side,
                report.status_key,
                report.decision.allow_entry as i64,
                report.decision.stake_scale,
                report.evaluation_time,
                body
            ],
        )?;
        tx.commit()?;
        Ok(())
    }
}

/// Collects reports in memory; clones share the same buffer.
#[derive(Clone, Default)]
pub struct MemorySink {
    reports: Arc<Mutex<Vec<DiagnosticsReport>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<DiagnosticsReport> {
        self.reports.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl PersistenceSink for MemorySink {
    fn write(&mut self, report: &DiagnosticsReport) -> Result<()> {
        self.reports
            .lock()
            .map_err(|_| anyhow::anyhow!("report buffer poisoned"))?
            .push(report.clone());
        Ok(())
    }
}
