//! YUV 4:2:0 → RGBA conversion and sensor orientation.
//!
//! The display path is `yuv_to_rgba` → [`FrameNormalizer::display`]; the
//! detection path is `yuv_to_rgba` → [`FrameNormalizer::detection`], which
//! skips the crop because the engine resizes to its own square input.

use image::{imageops, RgbaImage};
use vizor_camera::{AcquiredImage, LensFacing, Rotation};

use crate::Result;

/// Full‑range BT.601 conversion of a hardware image into a fresh RGBA
/// buffer of the same size. Chroma is sampled nearest‑neighbour.
///
/// The returned image owns its pixels, so the caller can drop the
/// hardware buffer as soon as this returns.
pub fn yuv_to_rgba(image: &dyn AcquiredImage) -> Result<RgbaImage> {
    let (w, h) = (image.width(), image.height());
    let planes = image.planes()?;
    let mut out = RgbaImage::new(w, h);
    for (col, row, px) in out.enumerate_pixels_mut() {
        let (col, row) = (col as usize, row as usize);
        let y = planes.y.sample(col, row) as f32;
        let u = planes.u.sample(col / 2, row / 2) as f32 - 128.0;
        let v = planes.v.sample(col / 2, row / 2) as f32 - 128.0;

        let r = (y + 1.402 * v).clamp(0.0, 255.0);
        let g = (y - 0.344_13 * u - 0.714_14 * v).clamp(0.0, 255.0);
        let b = (y + 1.772 * u).clamp(0.0, 255.0);
        px.0 = [r as u8, g as u8, b as u8, 255];
    }
    Ok(out)
}

/// Center square crop with side `min(width, height)`.
pub fn center_square_crop(image: &RgbaImage) -> RgbaImage {
    let (w, h) = image.dimensions();
    let side = w.min(h);
    imageops::crop_imm(image, (w - side) / 2, (h - side) / 2, side, side).to_image()
}

/// Rotation and mirroring for one opened camera.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameNormalizer {
    /// Clockwise rotation from sensor layout to upright.
    pub rotation: Rotation,
    /// Flip horizontally after rotating.
    pub mirror: bool,
}

impl FrameNormalizer {
    pub fn new(rotation: Rotation, mirror: bool) -> Self {
        Self { rotation, mirror }
    }

    pub fn for_camera(orientation: Rotation, facing: LensFacing) -> Self {
        Self::new(orientation, facing.is_mirrored())
    }

    /// Rotate clockwise, then mirror if the lens faces the user.
    pub fn orient(&self, image: RgbaImage) -> RgbaImage {
        let rotated = match self.rotation {
            Rotation::Deg0 => image,
            Rotation::Deg90 => imageops::rotate90(&image),
            Rotation::Deg180 => imageops::rotate180(&image),
            Rotation::Deg270 => imageops::rotate270(&image),
        };
        if self.mirror {
            imageops::flip_horizontal(&rotated)
        } else {
            rotated
        }
    }

    pub fn display(&self, image: RgbaImage) -> RgbaImage {
        center_square_crop(&self.orient(image))
    }

    pub fn detection(&self, image: RgbaImage) -> RgbaImage {
        self.orient(image)
    }
}
