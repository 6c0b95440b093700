// vizor-pipeline/src/lib.rs
// ============================================================
// Capture → normalise → {render, detect} wiring
// ------------------------------------------------------------
// Public API:
//   * CaptureController::start()/stop() – dual-stream session
//   * PipelineContext                   – controller + engine
//                                         + config in one place
//   * detection_stream(depth)           – async detection feed
// ============================================================

//! vizor – capture pipeline
//!
//! A [`CaptureController`] opens one camera session feeding two image
//! queues: a display queue at the requested size and a square detection
//! queue at the engine's input size. Every "frame ready" notification takes
//! only the newest buffer, so a slow consumer drops frames instead of
//! building a backlog.

use thiserror::Error;

pub mod context;
pub mod controller;
pub mod metrics;
pub mod settings;
pub mod sinks;
pub mod stream;

pub use context::{PipelineContext, PipelineContextBuilder};
pub use controller::{CaptureController, CaptureControllerBuilder};
pub use metrics::{Metrics, PerfSample};
pub use settings::{FrameSettings, PipelineMode, SettingsSource, SharedSettings};
pub use sinks::{DetectionSink, FrameFilter, MetricsSink, NamedFilters, NullSink};
pub use stream::{detection_stream, ChannelSink};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Camera(#[from] vizor_camera::CameraError),
    #[error(transparent)]
    Detect(#[from] vizor_detect::DetectError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
