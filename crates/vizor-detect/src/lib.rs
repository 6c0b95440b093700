// vizor-detect/src/lib.rs
// ============================================================
// vizor-detect  –  Object-detection stage
// Runs a YOLOv8-style detector (raw [1, 4+nc, anchors] head)
// through one of two interchangeable engines.
// ------------------------------------------------------------
// Pipeline: Frame → Array4<f32> → raw tensor → Vec<Detection>
// ------------------------------------------------------------
// Public API
//   * create_engine(kind)           – boxed InferenceEngine
//   * InferenceEngine::detect(..)   – returns Vec<Detection>
//   * EngineHandle                  – one live engine, swappable
//   * decode(..) / non_max_suppression(..)
// ------------------------------------------------------------
//   Build notes
//     * Default engine = ONNX Runtime (`ort`, binaries downloaded).
//     * `--features opencv` adds the OpenCV DNN engine.
// ============================================================

//! vizor – detection layer
//!
//! [`InferenceEngine`] is the backend-agnostic capability: load a model,
//! pick an execution backend, run detection on a [`Frame`]. Both engines
//! share the same [`decode`] routine; they only differ in the physical
//! layout of the tensor they hand to it ([`TensorLayout`]) and in how a
//! backend switch takes effect.
//!
//! Returned boxes are in pixels of the frame passed to `detect`. Use
//! [`Detection::normalized`] before publishing them.

use thiserror::Error;

pub mod classes;
pub mod config;
pub mod decode;
pub mod detection;
pub mod engine;
pub mod engines;
pub mod handle;
pub mod overlay;

pub use classes::{class_id_for, class_label, COCO_CLASSES, UNKNOWN_LABEL};
pub use config::{check_threshold, EngineConfig};
pub use decode::{decode, non_max_suppression, DetectParams, TensorLayout};
pub use detection::{BBox, Detection};
pub use engine::{
    create_engine, Backend, EngineKind, InferenceEngine, ModelInfo, RawOutput, INPUT_SIZE,
};
pub use handle::EngineHandle;
pub use overlay::{caption, draw_detections, LabelFont};

pub use vizor_preprocess::Frame;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("ONNX Runtime error: {0}")]
    Ort(String),
    #[cfg(feature = "opencv")]
    #[error("OpenCV error: {0}")]
    OpenCv(#[from] opencv::Error),
    #[error("no model loaded")]
    NotLoaded,
    #[error("{0} engine is not compiled in")]
    EngineUnavailable(EngineKind),
    #[error("unexpected model layout: {0}")]
    ModelMismatch(String),
    #[error("Invalid output shape: expected [1, 4+nc, anchors], got {0:?}")]
    InvalidOutputShape(Vec<usize>),
    #[error(transparent)]
    Preprocess(#[from] vizor_preprocess::PreprocessError),
    #[error("config: {0}")]
    Config(String),
    #[error("config I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse: {0}")]
    Json(#[from] serde_json::Error),
    #[error("label font: {0}")]
    Font(String),
}

pub type Result<T> = std::result::Result<T, DetectError>;
