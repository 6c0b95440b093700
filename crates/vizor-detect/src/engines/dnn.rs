//! OpenCV DNN engine.
//!
//! Unlike ONNX Runtime, OpenCV can retarget a loaded network, so a backend
//! switch is applied on the spot. Unknown backend names fall back to CPU.

use std::path::Path;

use log::{debug, error, info};
use ndarray::{Array3, Array4};
use opencv::core::{self, Mat, Scalar, Vector, CV_32F};
use opencv::dnn::{self, Net};
use opencv::prelude::*;

use crate::decode::TensorLayout;
use crate::engine::{Backend, EngineKind, InferenceEngine, ModelInfo, RawOutput, INPUT_SIZE};
use crate::{DetectError, Result};

/// (preferable backend, preferable target) for a backend choice.
fn dnn_target(backend: Backend) -> (i32, i32) {
    match backend {
        Backend::Cpu => (dnn::DNN_BACKEND_OPENCV, dnn::DNN_TARGET_CPU),
        Backend::Gpu => (dnn::DNN_BACKEND_OPENCV, dnn::DNN_TARGET_OPENCL),
        Backend::Npu => (dnn::DNN_BACKEND_DEFAULT, dnn::DNN_TARGET_NPU),
    }
}

fn apply_backend(net: &mut Net, backend: Backend) -> Result<()> {
    let (backend_id, target_id) = dnn_target(backend);
    net.set_preferable_backend(backend_id)?;
    net.set_preferable_target(target_id)?;
    Ok(())
}

#[derive(Default)]
pub struct DnnEngine {
    net: Option<Net>,
    info: Option<ModelInfo>,
    backend: Backend,
}

impl DnnEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    fn open(&self, path: &Path) -> Result<(Net, ModelInfo)> {
        let path_str = path.to_str().ok_or_else(|| {
            DetectError::ModelMismatch(format!("non UTF-8 path {}", path.display()))
        })?;
        let mut net = dnn::read_net_def(path_str)?;
        apply_backend(&mut net, self.backend)?;

        let size = INPUT_SIZE as i64;
        let info = ModelInfo {
            // the DNN importer does not surface graph input names
            input_name: String::new(),
            input_shape: vec![1, 3, size, size],
            output_names: net.get_unconnected_out_layers_names()?.iter().collect(),
            half_precision: false,
        };
        Ok((net, info))
    }
}

impl InferenceEngine for DnnEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::OpenCv
    }

    fn load_model(&mut self, path: &Path) -> bool {
        self.net = None;
        self.info = None;
        match self.open(path) {
            Ok((net, info)) => {
                info!("OpenCV: model loaded: {} on {}", path.display(), self.backend);
                self.net = Some(net);
                self.info = Some(info);
                true
            }
            Err(e) => {
                error!("OpenCV: load error for {}: {e}", path.display());
                false
            }
        }
    }

    fn set_backend(&mut self, name: &str) {
        self.backend = Backend::parse(name).unwrap_or(Backend::Cpu);
        let Some(net) = self.net.as_mut() else {
            debug!("OpenCV: no model loaded, {} kept for next load", self.backend);
            return;
        };
        info!("OpenCV: setting backend to {} ({name})", self.backend);
        if let Err(e) = apply_backend(net, self.backend) {
            error!("OpenCV: backend switch failed: {e}");
        }
    }

    fn is_loaded(&self) -> bool {
        self.net.is_some()
    }

    fn model_info(&self) -> Option<&ModelInfo> {
        self.info.as_ref()
    }

    fn forward(&mut self, input: Array4<f32>) -> Result<RawOutput> {
        let net = self.net.as_mut().ok_or(DetectError::NotLoaded)?;

        let sizes: Vec<i32> = input.shape().iter().map(|&d| d as i32).collect();
        let mut blob = Mat::new_nd_with_default(&sizes, CV_32F, Scalar::all(0.0))?;
        let input = input.as_standard_layout();
        let src = input
            .as_slice()
            .ok_or_else(|| DetectError::ModelMismatch("input tensor not contiguous".into()))?;
        blob.data_typed_mut::<f32>()?.copy_from_slice(src);
        net.set_input_def(&blob)?;

        let names = net.get_unconnected_out_layers_names()?;
        let mut outputs = Vector::<Mat>::new();
        net.forward(&mut outputs, &names)?;
        let output = outputs.get(0)?;

        // [1, 4+nc, anchors] → [anchors, 4+nc]
        let dims: Vec<usize> = output.mat_size().iter().map(|&d| d.max(0) as usize).collect();
        let &[1, rows, anchors] = dims.as_slice() else {
            return Err(DetectError::InvalidOutputShape(dims.clone()));
        };
        let flat = output.reshape(1, rows as i32)?;
        let mut transposed = Mat::default();
        core::transpose(&*flat, &mut transposed)?;

        let data = transposed.data_typed::<f32>()?.to_vec();
        let data = Array3::from_shape_vec((1, anchors, rows), data)
            .map_err(|e| DetectError::ModelMismatch(e.to_string()))?;
        Ok(RawOutput { data, layout: TensorLayout::AnchorsFirst })
    }
}
