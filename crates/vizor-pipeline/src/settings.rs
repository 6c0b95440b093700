//! Live per-frame configuration.

use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock};

use log::warn;
use serde::{Deserialize, Serialize};
use vizor_detect::{check_threshold, class_id_for, DetectParams, EngineConfig};

/// Filter name that means "leave the frame alone".
pub const NO_FILTER: &str = "Normal";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineMode {
    /// Preview only; the detection stream is drained and discarded.
    #[default]
    DisplayOnly,
    /// Preview plus detection.
    Detect,
}

/// Values read on every frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameSettings {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub allowed_classes: BTreeSet<usize>,
    pub filter: String,
    pub mode: PipelineMode,
}

impl Default for FrameSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            iou_threshold: 0.45,
            allowed_classes: BTreeSet::new(),
            filter: NO_FILTER.into(),
            mode: PipelineMode::DisplayOnly,
        }
    }
}

impl FrameSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            iou_threshold: config.iou_threshold,
            allowed_classes: config.allowed_classes.clone(),
            ..Self::default()
        }
    }

    pub fn params(&self) -> DetectParams {
        DetectParams {
            confidence: self.confidence_threshold,
            iou: self.iou_threshold,
            allowed_classes: self.allowed_classes.clone(),
        }
    }

    /// The filter to run, if any.
    pub fn active_filter(&self) -> Option<&str> {
        let name = self.filter.trim();
        (!name.is_empty() && name != NO_FILTER).then_some(name)
    }
}

/// Where the pipeline reads its live settings from. Implementations must
/// tolerate concurrent reads from capture threads.
pub trait SettingsSource: Send + Sync {
    fn snapshot(&self) -> FrameSettings;
}

/// Settings shared between the pipeline and whoever drives it.
#[derive(Clone, Debug, Default)]
pub struct SharedSettings {
    inner: Arc<RwLock<FrameSettings>>,
}

impl SharedSettings {
    pub fn new(settings: FrameSettings) -> Self {
        Self { inner: Arc::new(RwLock::new(settings)) }
    }

    pub fn update(&self, f: impl FnOnce(&mut FrameSettings)) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut *guard);
    }

    pub fn set_mode(&self, mode: PipelineMode) {
        self.update(|s| s.mode = mode);
    }

    pub fn set_filter(&self, name: &str) {
        self.update(|s| s.filter = name.to_owned());
    }

    /// Both values must lie in [0, 1]; otherwise nothing changes and
    /// `false` is returned.
    pub fn set_thresholds(&self, confidence: f32, iou: f32) -> bool {
        let checked = check_threshold("confidence_threshold", confidence)
            .and_then(|()| check_threshold("iou_threshold", iou));
        if let Err(e) = checked {
            warn!("ignoring thresholds: {e}");
            return false;
        }
        self.update(|s| {
            s.confidence_threshold = confidence;
            s.iou_threshold = iou;
        });
        true
    }

    /// Restrict detection to the named classes; unknown names are skipped.
    /// An empty list allows every class again.
    pub fn set_allowed_labels<S: AsRef<str>>(&self, labels: &[S]) {
        let ids = labels
            .iter()
            .filter_map(|l| {
                let id = class_id_for(l.as_ref());
                if id.is_none() {
                    warn!("unknown class label {:?}", l.as_ref());
                }
                id
            })
            .collect();
        self.update(|s| s.allowed_classes = ids);
    }
}

impl SettingsSource for SharedSettings {
    fn snapshot(&self) -> FrameSettings {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
