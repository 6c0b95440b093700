//! vizor‑preprocess – turn hardware YUV buffers into upright RGBA frames
//! and RGBA frames into NCHW float tensors.

use image::RgbaImage;
use thiserror::Error;

pub mod normalize;
pub mod tensor;

pub use normalize::{center_square_crop, yuv_to_rgba, FrameNormalizer};
pub use tensor::Preprocessor;

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("frame is empty")]
    EmptyFrame,
    #[error("unsupported channel count {0} (expected 3 or 4)")]
    UnsupportedChannels(usize),
    #[error("frame buffer holds {actual} bytes, {width}x{height}x{channels} needs {expected}")]
    BufferSize {
        width: u32,
        height: u32,
        channels: usize,
        expected: usize,
        actual: usize,
    },
    #[error("resize failed: {0}")]
    Resize(#[from] resize::Error),
    #[error(transparent)]
    Camera(#[from] vizor_camera::CameraError),
}

pub type Result<T> = std::result::Result<T, PreprocessError>;

/// Interleaved 8‑bit frame, RGB (3 channels) or RGBA (4 channels).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub channels: usize,
    pub data: Vec<u8>,
}

impl Frame {
    /// Wrap a raw buffer, checking its length against the geometry.
    /// Any channel count is accepted here; consumers reject what they
    /// cannot handle.
    pub fn new(width: u32, height: u32, channels: usize, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * channels;
        if data.len() != expected {
            return Err(PreprocessError::BufferSize {
                width,
                height,
                channels,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { width, height, channels, data })
    }

    pub fn from_rgba(image: RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self { width, height, channels: 4, data: image.into_raw() }
    }

    /// Back to an `RgbaImage`; `None` unless this is a 4‑channel frame.
    pub fn into_rgba(self) -> Option<RgbaImage> {
        if self.channels != 4 {
            return None;
        }
        RgbaImage::from_raw(self.width, self.height, self.data)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.data.is_empty()
    }
}
