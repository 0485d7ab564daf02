//! Engine configuration.
//!
//! `Default` carries the production defaults; `from_env` overlays
//! `AUTO_RISK_*` environment variables on top of them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::drift::DriftThresholds;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoRiskConfig {
    pub enabled: bool,
    pub drift: DriftConfig,
    pub regime: RegimeConfig,
    pub market_context: MarketContextConfig,
    pub persist: PersistConfig,
    pub artifacts: ArtifactConfig,
}

impl Default for AutoRiskConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            drift: DriftConfig::default(),
            regime: RegimeConfig::default(),
            market_context: MarketContextConfig::default(),
            persist: PersistConfig::default(),
            artifacts: ArtifactConfig::default(),
        }
    }
}

impl AutoRiskConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: env_flag("AUTO_RISK_ENABLED", true),
            drift: DriftConfig::from_env(),
            regime: RegimeConfig::from_env(),
            market_context: MarketContextConfig::from_env(),
            persist: PersistConfig::from_env(),
            artifacts: ArtifactConfig::from_env(),
        }
    }

    /// Number of trailing bars the feature provider needs to see so every
    /// analyzer has a full window after warmup.
    pub fn feature_lookback(&self) -> usize {
        self.regime.history_window.max(self.drift.window) + 64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftConfig {
    pub enabled: bool,
    /// Recent rows compared against the baseline.
    pub window: usize,
    /// Minimum rows in the price table before drift is evaluated.
    pub warmup: usize,
    /// Evaluate every N-th new candle; 0 or 1 evaluates every candle.
    pub check_interval: u64,
    pub thresholds: DriftThresholds,
    pub crit_min_count: usize,
    pub crit_min_ratio: f64,
    pub warn_min_count: usize,
    pub warn_min_ratio: f64,
    pub warn_scale: f64,
    pub crit_scale: f64,
    pub crit_block_entries: bool,
    pub recover_ok_checks: u32,
    /// Proceed without drift protection when no baseline exists.
    pub fail_open: bool,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: 500,
            warmup: 200,
            check_interval: 1,
            thresholds: DriftThresholds::default(),
            crit_min_count: 2,
            crit_min_ratio: 0.05,
            warn_min_count: 2,
            warn_min_ratio: 0.10,
            warn_scale: 0.7,
            crit_scale: 0.3,
            crit_block_entries: true,
            recover_ok_checks: 3,
            fail_open: true,
        }
    }
}

impl DriftConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let t = d.thresholds.clone();
        Self {
            enabled: env_flag("AUTO_RISK_DRIFT_ENABLED", d.enabled),
            window: env_parse("AUTO_RISK_DRIFT_WINDOW", d.window),
            warmup: env_parse("AUTO_RISK_DRIFT_WARMUP", d.warmup),
            check_interval: env_parse("AUTO_RISK_DRIFT_CHECK_INTERVAL", d.check_interval),
            thresholds: DriftThresholds {
                psi_warn: env_parse("AUTO_RISK_DRIFT_PSI_WARN", t.psi_warn),
                psi_crit: env_parse("AUTO_RISK_DRIFT_PSI_CRIT", t.psi_crit),
                mean_z_warn: env_parse("AUTO_RISK_DRIFT_MEAN_Z_WARN", t.mean_z_warn),
                mean_z_crit: env_parse("AUTO_RISK_DRIFT_MEAN_Z_CRIT", t.mean_z_crit),
                missing_rate_warn: env_parse("AUTO_RISK_DRIFT_MISSING_WARN", t.missing_rate_warn),
                missing_rate_crit: env_parse("AUTO_RISK_DRIFT_MISSING_CRIT", t.missing_rate_crit),
            },
            crit_min_count: env_parse("AUTO_RISK_DRIFT_CRIT_MIN_COUNT", d.crit_min_count),
            crit_min_ratio: env_parse("AUTO_RISK_DRIFT_CRIT_MIN_RATIO", d.crit_min_ratio),
            warn_min_count: env_parse("AUTO_RISK_DRIFT_WARN_MIN_COUNT", d.warn_min_count),
            warn_min_ratio: env_parse("AUTO_RISK_DRIFT_WARN_MIN_RATIO", d.warn_min_ratio),
            warn_scale: env_parse("AUTO_RISK_DRIFT_WARN_SCALE", d.warn_scale),
            crit_scale: env_parse("AUTO_RISK_DRIFT_CRIT_SCALE", d.crit_scale),
            crit_block_entries: env_flag("AUTO_RISK_DRIFT_CRIT_BLOCK_ENTRIES", d.crit_block_entries),
            recover_ok_checks: env_parse("AUTO_RISK_DRIFT_RECOVER_OK_CHECKS", d.recover_ok_checks),
            fail_open: env_flag("AUTO_RISK_DRIFT_FAIL_OPEN", d.fail_open),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeConfig {
    pub enabled: bool,
    /// Scale per regime label, plus `against_trend` for trend regimes that
    /// oppose the evaluated side.
    pub scales: BTreeMap<String, f64>,
    pub prefer_model_thresholds: bool,
    /// Trailing bars used when thresholds are estimated from history.
    pub history_window: usize,
    /// Minimum finite samples needed for a history estimate.
    pub min_history: usize,
    pub crisis_block_entries: bool,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        let scales = [
            ("bull_trend", 1.0),
            ("bear_trend", 1.0),
            ("against_trend", 0.6),
            ("range", 0.8),
            ("unknown", 0.8),
            ("crisis", 0.5),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), *v))
        .collect();
        Self {
            enabled: true,
            scales,
            prefer_model_thresholds: true,
            history_window: 1500,
            min_history: 100,
            crisis_block_entries: false,
        }
    }
}

impl RegimeConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let mut scales = d.scales.clone();
        if let Ok(raw) = std::env::var("AUTO_RISK_REGIME_SCALES") {
            scales.extend(parse_scale_map(&raw));
        }
        Self {
            enabled: env_flag("AUTO_RISK_REGIME_ENABLED", d.enabled),
            scales,
            prefer_model_thresholds: env_flag(
                "AUTO_RISK_REGIME_PREFER_MODEL_THRESHOLDS",
                d.prefer_model_thresholds,
            ),
            history_window: env_parse("AUTO_RISK_REGIME_HISTORY_WINDOW", d.history_window),
            min_history: env_parse("AUTO_RISK_REGIME_MIN_HISTORY", d.min_history),
            crisis_block_entries: env_flag(
                "AUTO_RISK_REGIME_CRISIS_BLOCK_ENTRIES",
                d.crisis_block_entries,
            ),
        }
    }

    /// Scale for a label; unlisted labels fall back to 1.0.
    pub fn scale_for(&self, label: &str) -> f64 {
        self.scales.get(label).copied().unwrap_or(1.0)
    }
}

/// `crisis:0.5,range:0.8` -> map. Malformed pairs are skipped.
pub fn parse_scale_map(raw: &str) -> BTreeMap<String, f64> {
    raw.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once(':')?;
            let v: f64 = v.trim().parse().ok()?;
            Some((k.trim().to_string(), v))
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketContextConfig {
    pub enabled: bool,
    /// Reference proxy instrument id (e.g. `BTC/USDT:USDT`).
    pub proxy: String,
    pub window: usize,
    pub reference_window: usize,
    pub min_periods: usize,
    pub corr_warn: f64,
    pub corr_crit: f64,
    pub beta_warn: f64,
    pub beta_crit: f64,
    pub min_scale: f64,
}

impl Default for MarketContextConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            proxy: "BTC/USDT:USDT".to_string(),
            window: 48,
            reference_window: 336,
            min_periods: 24,
            corr_warn: 0.30,
            corr_crit: 0.60,
            beta_warn: 0.50,
            beta_crit: 1.00,
            min_scale: 0.5,
        }
    }
}

impl MarketContextConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            enabled: env_flag("AUTO_RISK_MC_ENABLED", d.enabled),
            proxy: std::env::var("AUTO_RISK_MC_PROXY").unwrap_or(d.proxy),
            window: env_parse("AUTO_RISK_MC_WINDOW", d.window),
            reference_window: env_parse("AUTO_RISK_MC_REFERENCE_WINDOW", d.reference_window),
            min_periods: env_parse("AUTO_RISK_MC_MIN_PERIODS", d.min_periods),
            corr_warn: env_parse("AUTO_RISK_MC_CORR_WARN", d.corr_warn),
            corr_crit: env_parse("AUTO_RISK_MC_CORR_CRIT", d.corr_crit),
            beta_warn: env_parse("AUTO_RISK_MC_BETA_WARN", d.beta_warn),
            beta_crit: env_parse("AUTO_RISK_MC_BETA_CRIT", d.beta_crit),
            min_scale: env_parse("AUTO_RISK_MC_MIN_SCALE", d.min_scale),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistBackend {
    Json,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistConfig {
    pub enabled: bool,
    pub dir: PathBuf,
    pub backend: PersistBackend,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self { enabled: false, dir: PathBuf::from("out/auto_risk"), backend: PersistBackend::Json }
    }
}

impl PersistConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let backend = match std::env::var("AUTO_RISK_PERSIST_BACKEND").as_deref() {
            Ok("sqlite") => PersistBackend::Sqlite,
            Ok("json") => PersistBackend::Json,
            _ => d.backend,
        };
        Self {
            enabled: env_flag("AUTO_RISK_PERSIST_ENABLED", d.enabled),
            dir: std::env::var("AUTO_RISK_PERSIST_DIR").map(PathBuf::from).unwrap_or(d.dir),
            backend,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactConfig {
    pub root: PathBuf,
    pub model_version: String,
    pub exchange: String,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("models"),
            model_version: "latest".to_string(),
            exchange: "binance".to_string(),
        }
    }
}

impl ArtifactConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            root: std::env::var("AUTO_RISK_MODEL_ROOT").map(PathBuf::from).unwrap_or(d.root),
            model_version: std::env::var("AUTO_RISK_MODEL_VERSION").unwrap_or(d.model_version),
            exchange: std::env::var("AUTO_RISK_EXCHANGE").unwrap_or(d.exchange),
        }
    }
}
