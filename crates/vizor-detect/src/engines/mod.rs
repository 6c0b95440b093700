//! Engine implementations.

#[cfg(feature = "opencv")]
pub mod dnn;
pub mod onnx;

#[cfg(feature = "opencv")]
pub use dnn::DnnEngine;
pub use onnx::OrtEngine;
