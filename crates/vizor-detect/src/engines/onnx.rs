//! ONNX Runtime engine.
//!
//! The execution backend is baked into the session when it is built, so
//! [`OrtEngine::set_backend`] only records the choice; it takes effect on
//! the next [`load_model`](InferenceEngine::load_model).

use std::fmt::Display;
use std::path::Path;

use half::f16;
use log::{debug, error, info, warn};
use ndarray::{Array3, Array4};
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch, NNAPIExecutionProvider,
};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::tensor::TensorElementType;
use ort::value::{DynValue, Tensor, ValueType};

use crate::decode::TensorLayout;
use crate::engine::{Backend, EngineKind, InferenceEngine, ModelInfo, RawOutput, INPUT_SIZE};
use crate::{DetectError, Result};

fn ort_err(e: impl Display) -> DetectError {
    DetectError::Ort(e.to_string())
}

/// Everything that only exists while a model is loaded.
struct Loaded {
    session: Session,
    info: ModelInfo,
    input_size: u32,
    half_output: bool,
}

#[derive(Default)]
pub struct OrtEngine {
    loaded: Option<Loaded>,
    /// Backend the next session will be built with.
    backend: Backend,
}

impl OrtEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    fn execution_providers(&self) -> Vec<ExecutionProviderDispatch> {
        let mut eps = match self.backend {
            Backend::Cpu => Vec::new(),
            Backend::Gpu => vec![CUDAExecutionProvider::default().build()],
            Backend::Npu => vec![NNAPIExecutionProvider::default().build()],
        };
        eps.push(CPUExecutionProvider::default().build());
        eps
    }

    fn open(&self, path: &Path) -> Result<Loaded> {
        let threads = num_cpus::get().clamp(1, 4);
        let session = Session::builder()
            .map_err(ort_err)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(ort_err)?
            .with_intra_threads(threads)
            .map_err(ort_err)?
            .with_execution_providers(self.execution_providers())
            .map_err(ort_err)?
            .commit_from_file(path)
            .map_err(ort_err)?;

        let input = session
            .inputs
            .first()
            .ok_or_else(|| DetectError::ModelMismatch("model has no inputs".into()))?;
        let (input_ty, input_shape) = match &input.input_type {
            ValueType::Tensor { ty, shape, .. } => {
                (*ty, shape.iter().copied().collect::<Vec<i64>>())
            }
            other => {
                let msg = format!("input is not a tensor: {other:?}");
                return Err(DetectError::ModelMismatch(msg));
            }
        };
        let output = session
            .outputs
            .first()
            .ok_or_else(|| DetectError::ModelMismatch("model has no outputs".into()))?;
        let half_output = matches!(
            output.output_type,
            ValueType::Tensor { ty: TensorElementType::Float16, .. }
        );

        // [1, 3, S, S] with a concrete S, otherwise assume the default export
        let input_size = match input_shape.as_slice() {
            [_, _, h, w] if h == w && *h > 0 => *h as u32,
            _ => INPUT_SIZE,
        };

        let info = ModelInfo {
            input_name: input.name.clone(),
            input_shape,
            output_names: session.outputs.iter().map(|o| o.name.clone()).collect(),
            half_precision: input_ty == TensorElementType::Float16,
        };
        Ok(Loaded { session, info, input_size, half_output })
    }
}

impl InferenceEngine for OrtEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::OnnxRuntime
    }

    fn load_model(&mut self, path: &Path) -> bool {
        // previous session goes first
        self.loaded = None;
        match self.open(path) {
            Ok(loaded) => {
                info!(
                    "ONNXRuntime: loaded {} on {} (input {} {:?}, fp16 {})",
                    path.display(),
                    self.backend,
                    loaded.info.input_name,
                    loaded.info.input_shape,
                    loaded.info.half_precision
                );
                self.loaded = Some(loaded);
                true
            }
            Err(e) => {
                error!("ONNXRuntime: load error for {}: {e}", path.display());
                false
            }
        }
    }

    fn set_backend(&mut self, name: &str) {
        match Backend::parse(name) {
            Some(backend) => {
                self.backend = backend;
                info!("ONNXRuntime: backend switch request to {backend} (requires reload)");
            }
            None => warn!("ONNXRuntime: unknown backend {name:?}, keeping {}", self.backend),
        }
    }

    fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    fn model_info(&self) -> Option<&ModelInfo> {
        self.loaded.as_ref().map(|l| &l.info)
    }

    fn input_size(&self) -> u32 {
        self.loaded.as_ref().map_or(INPUT_SIZE, |l| l.input_size)
    }

    fn forward(&mut self, input: Array4<f32>) -> Result<RawOutput> {
        let loaded = self.loaded.as_mut().ok_or(DetectError::NotLoaded)?;
        let output_name = loaded
            .info
            .output_names
            .first()
            .cloned()
            .ok_or_else(|| DetectError::ModelMismatch("model has no outputs".into()))?;

        let value: DynValue = if loaded.info.half_precision {
            Tensor::from_array(input.mapv(f16::from_f32)).map_err(ort_err)?.into_dyn()
        } else {
            Tensor::from_array(input).map_err(ort_err)?.into_dyn()
        };

        let outputs = loaded
            .session
            .run(ort::inputs![loaded.info.input_name.as_str() => value])
            .map_err(ort_err)?;
        let output = &outputs[output_name.as_str()];

        let (shape, data): (Vec<i64>, Vec<f32>) = if loaded.half_output {
            let (shape, data) = output.try_extract_tensor::<f16>().map_err(ort_err)?;
            (shape.to_vec(), data.iter().map(|v| v.to_f32()).collect())
        } else {
            let (shape, data) = output.try_extract_tensor::<f32>().map_err(ort_err)?;
            (shape.to_vec(), data.to_vec())
        };
        let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
        let &[batch, rows, anchors] = dims.as_slice() else {
            return Err(DetectError::InvalidOutputShape(dims.clone()));
        };
        debug!("ONNXRuntime: output {batch}x{rows}x{anchors}");

        let data = Array3::from_shape_vec((batch, rows, anchors), data)
            .map_err(|e| DetectError::ModelMismatch(e.to_string()))?;
        Ok(RawOutput { data, layout: TensorLayout::ChannelsFirst })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::DetectParams;
    use vizor_preprocess::Frame;

    #[test]
    fn missing_model_leaves_engine_unloaded() {
        let mut engine = OrtEngine::new();
        assert!(!engine.load_model(Path::new("/nonexistent/yolov8n.onnx")));
        assert!(!engine.is_loaded());
        let frame = Frame::new(4, 4, 3, vec![0; 48]).unwrap();
        assert!(engine.detect(&frame, &DetectParams::default()).is_empty());
        assert!(matches!(
            engine.forward(Array4::zeros((1, 3, 640, 640))),
            Err(DetectError::NotLoaded)
        ));
    }

    #[test]
    fn backend_is_recorded_for_next_load() {
        let mut engine = OrtEngine::new();
        engine.set_backend("NNAPI");
        assert_eq!(engine.backend(), Backend::Npu);
        engine.set_backend("Vulkan");
        assert_eq!(engine.backend(), Backend::Npu);
        assert!(!engine.is_loaded());
    }
}
