//! The engine capability and its runtime identifiers.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use log::{debug, warn};
use ndarray::{Array3, Array4};
use serde::{Deserialize, Serialize};
use vizor_preprocess::{Frame, Preprocessor};

use crate::decode::{decode, DetectParams, TensorLayout};
use crate::detection::Detection;
use crate::engines::OrtEngine;
use crate::Result;

/// Square input side every bundled model is exported at.
pub const INPUT_SIZE: u32 = 640;

/// Which engine implementation to construct.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineKind {
    /// ONNX Runtime. Backend changes wait for the next model load.
    #[default]
    #[serde(rename = "ONNXRuntime")]
    OnnxRuntime,
    /// OpenCV DNN. Backend changes apply to the loaded network.
    #[serde(rename = "OpenCV")]
    OpenCv,
}

impl EngineKind {
    /// Map an engine name. Anything other than `"ONNXRuntime"` selects
    /// OpenCV, mirroring how the selector has always behaved.
    pub fn from_name(name: &str) -> Self {
        match name {
            "ONNXRuntime" => EngineKind::OnnxRuntime,
            _ => EngineKind::OpenCv,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EngineKind::OnnxRuntime => "ONNXRuntime",
            EngineKind::OpenCv => "OpenCV",
        }
    }
}

impl FromStr for EngineKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::from_name(s))
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Backend {
    #[default]
    Cpu,
    /// GPU / OpenCL.
    Gpu,
    /// Neural accelerator (NNAPI or similar).
    Npu,
}

impl Backend {
    /// Recognised names: `CPU`, `GPU`, `OpenCL`, `NNAPI`, `NPU`.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "CPU" => Some(Backend::Cpu),
            "GPU" | "OpenCL" => Some(Backend::Gpu),
            "NNAPI" | "NPU" => Some(Backend::Npu),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Cpu => "CPU",
            Backend::Gpu => "GPU",
            Backend::Npu => "NNAPI",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input/output description recorded at load time.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ModelInfo {
    pub input_name: String,
    /// Symbolic dimensions are reported as -1.
    pub input_shape: Vec<i64>,
    pub output_names: Vec<String>,
    pub half_precision: bool,
}

/// A raw head tensor plus how it is laid out.
#[derive(Clone, Debug)]
pub struct RawOutput {
    pub data: Array3<f32>,
    pub layout: TensorLayout,
}

/// Load a model, pick a backend, detect objects in frames.
///
/// None of the methods fail past this boundary: load reports `false`,
/// detect returns an empty list and logs why.
pub trait InferenceEngine: Send {
    fn kind(&self) -> EngineKind;

    /// Replace any loaded model. On failure the engine is left unloaded.
    fn load_model(&mut self, path: &Path) -> bool;

    fn set_backend(&mut self, name: &str);

    fn is_loaded(&self) -> bool;

    fn model_info(&self) -> Option<&ModelInfo>;

    fn input_size(&self) -> u32 {
        INPUT_SIZE
    }

    /// Run the network on a `[1, 3, S, S]` tensor.
    fn forward(&mut self, input: Array4<f32>) -> Result<RawOutput>;

    /// Full pass: channel check, resize + scale, forward, decode. Boxes are
    /// in pixels of `frame`.
    fn detect(&mut self, frame: &Frame, params: &DetectParams) -> Vec<Detection> {
        if !self.is_loaded() || frame.is_empty() {
            return Vec::new();
        }
        if !matches!(frame.channels, 3 | 4) {
            debug!("{}: rejecting {}-channel frame", self.kind(), frame.channels);
            return Vec::new();
        }
        match run_detect(self, frame, params) {
            Ok(dets) => dets,
            Err(e) => {
                warn!("{}: detection failed: {e}", self.kind());
                Vec::new()
            }
        }
    }
}

fn run_detect<E: InferenceEngine + ?Sized>(
    engine: &mut E,
    frame: &Frame,
    params: &DetectParams,
) -> Result<Vec<Detection>> {
    let size = engine.input_size();
    let input = Preprocessor::new(size, size).run(frame)?;
    let raw = engine.forward(input)?;
    decode(raw.data.view(), raw.layout, size, (frame.width, frame.height), params)
}

/// Construct an unloaded engine of the requested kind.
pub fn create_engine(kind: EngineKind) -> Result<Box<dyn InferenceEngine>> {
    match kind {
        EngineKind::OnnxRuntime => Ok(Box::new(OrtEngine::new())),
        #[cfg(feature = "opencv")]
        EngineKind::OpenCv => Ok(Box::new(crate::engines::DnnEngine::new())),
        #[cfg(not(feature = "opencv"))]
        EngineKind::OpenCv => Err(crate::DetectError::EngineUnavailable(kind)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_names() {
        assert_eq!("ONNXRuntime".parse::<EngineKind>().unwrap(), EngineKind::OnnxRuntime);
        assert_eq!(EngineKind::from_name("OpenCV"), EngineKind::OpenCv);
        assert_eq!(EngineKind::from_name("TensorRT"), EngineKind::OpenCv);
        assert_eq!(EngineKind::default().to_string(), "ONNXRuntime");
    }

    #[test]
    fn backend_names() {
        assert_eq!(Backend::parse("OpenCL"), Some(Backend::Gpu));
        assert_eq!(Backend::parse("NNAPI"), Some(Backend::Npu));
        assert_eq!(Backend::parse("cpu"), None);
    }

    #[test]
    fn onnx_engine_is_always_available() {
        let engine = create_engine(EngineKind::OnnxRuntime).unwrap();
        assert!(!engine.is_loaded());
        assert!(engine.model_info().is_none());
    }
}
