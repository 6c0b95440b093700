//! One object owning the controller, the engine and their configuration.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use log::info;
use vizor_camera::{CameraHal, LensFacing, RenderSurface};
use vizor_detect::{Detection, EngineConfig, EngineHandle, EngineKind};
use vizor_preprocess::Frame;

use crate::controller::{CaptureController, CaptureControllerBuilder};
use crate::settings::{FrameSettings, SettingsSource, SharedSettings};
use crate::sinks::{DetectionSink, FrameFilter, MetricsSink};
use crate::Result;

/// Entry point for whatever drives the pipeline (UI, CLI, service).
/// Construct once and pass by reference.
pub struct PipelineContext {
    controller: CaptureController,
    engine: Arc<EngineHandle>,
    config: Mutex<EngineConfig>,
    settings: SharedSettings,
}

pub struct PipelineContextBuilder {
    controller: CaptureControllerBuilder,
    engine: Arc<EngineHandle>,
    config: EngineConfig,
    settings: SharedSettings,
}

impl PipelineContextBuilder {
    pub fn filter(mut self, filter: Arc<dyn FrameFilter>) -> Self {
        self.controller = self.controller.filter(filter);
        self
    }

    pub fn detection_sink(mut self, sink: Arc<dyn DetectionSink>) -> Self {
        self.controller = self.controller.detection_sink(sink);
        self
    }

    pub fn metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.controller = self.controller.metrics_sink(sink);
        self
    }

    pub fn build(self) -> PipelineContext {
        let controller = self
            .controller
            .settings(Arc::new(self.settings.clone()))
            .build();
        PipelineContext {
            controller,
            engine: self.engine,
            config: Mutex::new(self.config),
            settings: self.settings,
        }
    }
}

impl PipelineContext {
    /// Live settings start from the config's thresholds and class filter.
    pub fn builder(hal: Arc<dyn CameraHal>, config: EngineConfig) -> PipelineContextBuilder {
        let engine = Arc::new(EngineHandle::new());
        PipelineContextBuilder {
            controller: CaptureController::builder(hal, engine.clone()),
            engine,
            settings: SharedSettings::new(FrameSettings::from_config(&config)),
            config,
        }
    }

    pub fn from_config_file(hal: Arc<dyn CameraHal>, path: impl AsRef<Path>) -> Result<Self> {
        let config = EngineConfig::from_json_file(path)?;
        Ok(Self::builder(hal, config).build())
    }

    /// Build the configured engine and load its model.
    pub fn init_engine(&self) -> bool {
        let config = self.config();
        let loaded = self.engine.init(&config);
        info!(
            "engine {} initialised, model {}",
            config.engine,
            if loaded { "loaded" } else { "not loaded" }
        );
        loaded
    }

    /// Switch engines by name (`"ONNXRuntime"`, anything else is OpenCV).
    pub fn set_engine(&self, name: &str) -> bool {
        let kind = EngineKind::from_name(name);
        self.lock_config().engine = kind;
        self.engine.set_engine(kind)
    }

    pub fn set_backend(&self, name: &str) {
        self.lock_config().backend = name.to_owned();
        self.engine.set_backend(name);
    }

    pub fn load_model(&self, path: &Path) -> bool {
        self.lock_config().model_path = Some(path.to_path_buf());
        self.engine.load_model(path)
    }

    pub fn start(
        &self,
        facing: LensFacing,
        width: u32,
        height: u32,
        display: Box<dyn RenderSurface>,
        overlay: Option<Box<dyn RenderSurface>>,
    ) -> bool {
        self.controller.start(facing, width, height, display, overlay)
    }

    pub fn stop(&self) {
        self.controller.stop();
    }

    /// Detect on a still frame with the current live settings. Waits for
    /// any in-flight capture inference. Boxes are in pixels of `frame`.
    pub fn run_detection(&self, frame: &Frame) -> Vec<Detection> {
        self.engine.detect(frame, &self.settings.snapshot().params())
    }

    pub fn settings(&self) -> &SharedSettings {
        &self.settings
    }

    pub fn controller(&self) -> &CaptureController {
        &self.controller
    }

    pub fn engine(&self) -> &Arc<EngineHandle> {
        &self.engine
    }

    pub fn config(&self) -> EngineConfig {
        self.lock_config().clone()
    }

    fn lock_config(&self) -> std::sync::MutexGuard<'_, EngineConfig> {
        self.config.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
