//! Frame → model input tensor.

use log::trace;
use ndarray::Array4;
use resize::{new, Pixel, Type};
use rgb::FromSlice;

use crate::{Frame, PreprocessError, Result};

#[derive(Clone, Debug)]
pub struct Preprocessor {
    dst_w: u32,
    dst_h: u32,
}

impl Preprocessor {
    /// Create a pre‑processor that outputs a 1×3×H×W RGB tensor (0‑1.0f32).
    pub fn new(dst_w: u32, dst_h: u32) -> Self {
        Self { dst_w, dst_h }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.dst_w, self.dst_h)
    }

    pub fn run(&self, frame: &Frame) -> Result<Array4<f32>> {
        if frame.is_empty() {
            return Err(PreprocessError::EmptyFrame);
        }
        let w = frame.width as usize;
        let h = frame.height as usize;

        // 1. RGBA → RGB; anything else is refused
        let rgb = match frame.channels {
            3 => frame.data.clone(),
            4 => frame
                .data
                .chunks_exact(4)
                .flat_map(|px| [px[0], px[1], px[2]])
                .collect(),
            n => return Err(PreprocessError::UnsupportedChannels(n)),
        };
        if rgb.len() != w * h * 3 {
            return Err(PreprocessError::BufferSize {
                width: frame.width,
                height: frame.height,
                channels: frame.channels,
                expected: w * h * frame.channels,
                actual: frame.data.len(),
            });
        }

        // 2. Resize to dst size (bilinear)
        let (dw, dh) = (self.dst_w as usize, self.dst_h as usize);
        let dst = if (w, h) == (dw, dh) {
            rgb
        } else {
            trace!("resizing {w}x{h} -> {dw}x{dh}");
            let mut dst = vec![0u8; dw * dh * 3];
            let mut resizer = new(w, h, dw, dh, Pixel::RGB8, Type::Triangle)?;
            resizer.resize(rgb.as_rgb(), dst.as_rgb_mut())?;
            dst
        };

        // 3. Normalize to 0‑1 and pack planar (N,C,H,W)
        let mut arr = Array4::<f32>::zeros((1, 3, dh, dw));
        for (idx, px) in dst.chunks_exact(3).enumerate() {
            let (y, x) = (idx / dw, idx % dw);
            for c in 0..3 {
                arr[[0, c, y, x]] = px[c] as f32 / 255.0;
            }
        }
        Ok(arr)
    }
}
