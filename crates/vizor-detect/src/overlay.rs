//! Box overlay for annotated previews.
//!
//! Each detection gets a green outline, two pixels thick, and a filled
//! caption band ("person 87%") sitting on its top edge. The caption text
//! is only rendered when a [`LabelFont`] is supplied; without one the
//! band is still drawn so the box stays tagged.

use std::fs;
use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;

use crate::detection::Detection;
use crate::{DetectError, Result};

const BOX_COLOUR: Rgba<u8> = Rgba([0, 255, 0, 255]);
const TEXT_COLOUR: Rgba<u8> = Rgba([0, 0, 0, 255]);
const LABEL_PX: f32 = 14.0;
/// Padding below the glyphs, like a font baseline.
const BASELINE: u32 = 3;

/// Font used for detection captions.
#[derive(Clone)]
pub struct LabelFont {
    font: FontArc,
    scale: PxScale,
}

impl LabelFont {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let font = FontArc::try_from_vec(bytes).map_err(|e| DetectError::Font(e.to_string()))?;
        Ok(Self { font, scale: PxScale::from(LABEL_PX) })
    }

    /// Load a TTF/OTF file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_bytes(fs::read(path)?)
    }

    pub fn with_scale(mut self, px: f32) -> Self {
        self.scale = PxScale::from(px);
        self
    }

    fn measure(&self, text: &str) -> (u32, u32) {
        text_size(self.scale, &self.font, text)
    }
}

/// "label NN%", confidence truncated to whole percent.
pub fn caption(det: &Detection) -> String {
    format!("{} {}%", det.label, (det.confidence * 100.0) as i32)
}

/// Outline and caption every detection on `image`. Boxes must be in pixel
/// coordinates of `image`; anything degenerate is skipped.
pub fn draw_detections(
    image: &mut RgbaImage,
    detections: &[Detection],
    font: Option<&LabelFont>,
) {
    for det in detections {
        let width = det.bbox.width.round() as i64;
        let height = det.bbox.height.round() as i64;
        if width < 1 || height < 1 {
            continue;
        }
        let x = det.bbox.x.round() as i32;
        let y = det.bbox.y.round() as i32;
        for inset in 0..2 {
            let (w, h) = (width - 2 * inset as i64, height - 2 * inset as i64);
            if w < 1 || h < 1 {
                break;
            }
            let rect = Rect::at(x + inset, y + inset).of_size(w as u32, h as u32);
            draw_hollow_rect_mut(image, rect, BOX_COLOUR);
        }
        draw_caption(image, x, y, &caption(det), font);
    }
}

fn draw_caption(image: &mut RgbaImage, x: i32, y: i32, text: &str, font: Option<&LabelFont>) {
    let (text_w, text_h) = match font {
        Some(font) => font.measure(text),
        // rough glyph box at the default size
        None => ((text.chars().count() as f32 * LABEL_PX * 0.55) as u32, LABEL_PX as u32),
    };
    if text_w == 0 || text_h == 0 {
        return;
    }
    // keep the band inside the image when the box touches the top edge
    let top = y.max(text_h as i32);
    let band = Rect::at(x, top - text_h as i32).of_size(text_w, text_h + BASELINE);
    draw_filled_rect_mut(image, band, BOX_COLOUR);
    if let Some(font) = font {
        draw_text_mut(image, TEXT_COLOUR, x, top - text_h as i32, font.scale, &font.font, text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BBox;

    fn person(x: f32, y: f32, w: f32, h: f32) -> Detection {
        Detection { class_id: 0, label: "person", confidence: 0.876, bbox: BBox::new(x, y, w, h) }
    }

    #[test]
    fn outline_keeps_interior() {
        let mut img = RgbaImage::new(80, 80);
        draw_detections(&mut img, &[person(20.0, 40.0, 30.0, 30.0)], None);
        assert_eq!(*img.get_pixel(20, 40), BOX_COLOUR);
        assert_eq!(*img.get_pixel(21, 41), BOX_COLOUR);
        assert_eq!(*img.get_pixel(49, 69), BOX_COLOUR);
        assert_eq!(img.get_pixel(35, 55).0, [0, 0, 0, 0]);
    }

    #[test]
    fn caption_band_sits_above_the_box() {
        let mut img = RgbaImage::new(120, 80);
        draw_detections(&mut img, &[person(10.0, 40.0, 30.0, 30.0)], None);
        // band spans [top - 14, top + 3) where top = 40
        assert_eq!(*img.get_pixel(12, 30), BOX_COLOUR);
        assert_eq!(*img.get_pixel(60, 27), BOX_COLOUR);
        // nothing above the band
        assert_eq!(img.get_pixel(12, 20).0, [0, 0, 0, 0]);
    }

    #[test]
    fn caption_band_is_clamped_at_top_edge() {
        let mut img = RgbaImage::new(120, 60);
        draw_detections(&mut img, &[person(5.0, 0.0, 30.0, 30.0)], None);
        assert_eq!(*img.get_pixel(8, 0), BOX_COLOUR);
        assert_eq!(*img.get_pixel(8, 16), BOX_COLOUR);
    }

    #[test]
    fn caption_text() {
        assert_eq!(caption(&person(0.0, 0.0, 1.0, 1.0)), "person 87%");
    }

    #[test]
    fn garbage_font_is_rejected() {
        assert!(matches!(LabelFont::from_bytes(vec![0; 16]), Err(DetectError::Font(_))));
    }

    /// Needs a TTF in `VIZOR_FONT`.
    #[test]
    #[ignore]
    fn caption_glyphs_are_drawn_in_black() {
        let Ok(path) = std::env::var("VIZOR_FONT") else { return };
        let font = LabelFont::from_file(path).unwrap();
        let mut img = RgbaImage::new(200, 80);
        draw_detections(&mut img, &[person(10.0, 40.0, 60.0, 30.0)], Some(&font));
        // opaque and not green means a glyph landed on the band
        let dark = (10..150)
            .flat_map(|x| (0..44).map(move |y| (x, y)))
            .filter(|&(x, y)| {
                let [_, g, _, a] = img.get_pixel(x, y).0;
                a == 255 && g < 128
            })
            .count();
        assert!(dark > 0);
    }
}
