//! Engine configuration, loadable from JSON.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::decode::DetectParams;
use crate::engine::EngineKind;
use crate::{DetectError, Result};

/// Configuration for engine construction and the default detection
/// thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// `"ONNXRuntime"` or `"OpenCV"`
    pub engine: EngineKind,
    /// Model to load once the engine is built
    pub model_path: Option<PathBuf>,
    /// `"CPU"`, `"GPU"` / `"OpenCL"`, `"NNAPI"`
    pub backend: String,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    /// Class indices to keep; empty keeps all
    pub allowed_classes: BTreeSet<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::OnnxRuntime,
            model_path: None,
            backend: "CPU".into(),
            confidence_threshold: 0.5,
            iou_threshold: 0.45,
            allowed_classes: BTreeSet::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        check_threshold("confidence_threshold", self.confidence_threshold)?;
        check_threshold("iou_threshold", self.iou_threshold)
    }

    pub fn params(&self) -> DetectParams {
        DetectParams {
            confidence: self.confidence_threshold,
            iou: self.iou_threshold,
            allowed_classes: self.allowed_classes.clone(),
        }
    }
}

/// Thresholds are probabilities: finite and within [0, 1].
pub fn check_threshold(name: &str, value: f32) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(DetectError::Config(format!("{name} must be within [0, 1], got {value}")))
    }
}
