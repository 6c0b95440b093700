use serde::Serialize;

/// Axis-aligned box, top-left corner plus size.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn from_center(cx: f32, cy: f32, width: f32, height: f32) -> Self {
        Self::new(cx - 0.5 * width, cy - 0.5 * height, width, height)
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection over union; zero when the union is degenerate.
    pub fn iou(&self, other: &BBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            return 0.0;
        }
        intersection / union
    }
}

/// One decoded object.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub class_id: usize,
    pub label: &'static str,
    pub confidence: f32,
    pub bbox: BBox,
}

impl Detection {
    /// Same detection with the box divided by the frame's own size, so
    /// coordinates land in [0, 1].
    pub fn normalized(&self, frame_width: u32, frame_height: u32) -> Detection {
        let (fw, fh) = (frame_width.max(1) as f32, frame_height.max(1) as f32);
        Detection {
            bbox: BBox::new(
                self.bbox.x / fw,
                self.bbox.y / fh,
                self.bbox.width / fw,
                self.bbox.height / fh,
            ),
            ..self.clone()
        }
    }
}
