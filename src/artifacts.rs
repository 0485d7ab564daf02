//! Model artifacts: the feature list a model expects, optional regime
//! thresholds from training, and the baseline distribution drift is measured
//! against.
//!
//! Layout on disk:
//!
//! ```text
//! <root>/<model_version>/<exchange>/<timeframe>/<SYMBOL>/model_info.json
//! <root>/<model_version>/<exchange>/<timeframe>/<SYMBOL>/<baseline_file>
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::ArtifactConfig;
use crate::drift::FeatureBaseline;
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::regime::RegimeThresholds;

pub const MODEL_INFO_FILE: &str = "model_info.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelInfo {
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub regime_thresholds: Option<RegimeThresholds>,
    #[serde(default = "default_baseline_file")]
    pub baseline_file: String,
}

fn default_baseline_file() -> String {
    "baseline.json".to_string()
}

#[derive(Debug, Clone)]
pub struct ModelArtifact {
    pub info: ModelInfo,
    /// `None` when the model directory exists but carries no baseline.
    pub baseline: Option<FeatureBaseline>,
    pub baseline_path: Option<PathBuf>,
}

pub trait ModelArtifactStore: Send {
    /// `Ok(None)` when no artifact exists for the key.
    fn load(&mut self, instrument: &str, timeframe: &str) -> Result<Option<Arc<ModelArtifact>>>;
}

/// `BTC/USDT:USDT` -> `BTC_USDT_USDT`.
pub fn symbol_dir(instrument: &str) -> String {
    instrument.replace(['/', ':'], "_")
}

/// Filesystem store with a per-key cache. Misses are cached too, so an
/// absent model costs one directory lookup per process.
pub struct FsArtifactStore {
    cfg: ArtifactConfig,
    cache: HashMap<(String, String), Option<Arc<ModelArtifact>>>,
}

impl FsArtifactStore {
    pub fn new(cfg: ArtifactConfig) -> Self {
        Self { cfg, cache: HashMap::new() }
    }

    pub fn model_dir(&self, instrument: &str, timeframe: &str) -> PathBuf {
        self.cfg
            .root
            .join(&self.cfg.model_version)
            .join(&self.cfg.exchange)
            .join(timeframe)
            .join(symbol_dir(instrument))
    }

    fn read(&self, dir: &Path) -> Result<Option<ModelArtifact>> {
        let info_path = dir.join(MODEL_INFO_FILE);
        if !info_path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read(&info_path)
            .with_context(|| format!("failed to read {}", info_path.display()))?;
        let info: ModelInfo = serde_json::from_slice(&raw)
            .with_context(|| format!("invalid model info {}", info_path.display()))?;

        let baseline_path = dir.join(&info.baseline_file);
        let baseline = if baseline_path.exists() {
            let bytes = std::fs::read(&baseline_path)
                .with_context(|| format!("failed to read {}", baseline_path.display()))?;
            Some(
                FeatureBaseline::parse(&bytes)
                    .with_context(|| format!("baseline {}", baseline_path.display()))?,
            )
        } else {
            None
        };

        Ok(Some(ModelArtifact {
            info,
            baseline_path: baseline.as_ref().map(|_| baseline_path),
            baseline,
        }))
    }
}

impl ModelArtifactStore for FsArtifactStore {
    fn load(&mut self, instrument: &str, timeframe: &str) -> Result<Option<Arc<ModelArtifact>>> {
        let key = (instrument.to_string(), timeframe.to_string());
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit.clone());
        }
        let dir = self.model_dir(instrument, timeframe);
        let artifact = self.read(&dir)?.map(Arc::new);
        log(
            Level::Info,
            Domain::Artifacts,
            "model_artifact_loaded",
            obj(&[
                ("instrument", v_str(instrument)),
                ("timeframe", v_str(timeframe)),
                ("dir", v_str(&dir.to_string_lossy())),
                ("found", serde_json::Value::Bool(artifact.is_some())),
                (
                    "has_baseline",
                    serde_json::Value::Bool(artifact.as_ref().map_or(false, |a| a.baseline.is_some())),
                ),
            ]),
        );
        self.cache.insert(key, artifact.clone());
        Ok(artifact)
    }
}

/// In-memory store keyed by (instrument, timeframe).
#[derive(Default)]
pub struct MemoryArtifactStore {
    artifacts: HashMap<(String, String), Arc<ModelArtifact>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, instrument: &str, timeframe: &str, artifact: ModelArtifact) {
        self.artifacts
            .insert((instrument.to_string(), timeframe.to_string()), Arc::new(artifact));
    }
}

impl ModelArtifactStore for MemoryArtifactStore {
    fn load(&mut self, instrument: &str, timeframe: &str) -> Result<Option<Arc<ModelArtifact>>> {
        Ok(self
            .artifacts
            .get(&(instrument.to_string(), timeframe.to_string()))
            .cloned())
    }
}
