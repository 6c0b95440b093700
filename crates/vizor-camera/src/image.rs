//! Multi-plane YUV 4:2:0 buffers as delivered by an image queue.

use crate::{CameraError, Result};

/// One plane of a YUV image.
#[derive(Clone, Copy, Debug)]
pub struct Plane<'a> {
    pub data: &'a [u8],
    /// Bytes between the starts of two consecutive rows.
    pub row_stride: usize,
    /// Bytes between two consecutive samples in a row (2 for semi-planar chroma).
    pub pixel_stride: usize,
}

impl Plane<'_> {
    /// Minimum length for `cols × rows` samples.
    fn needed(&self, cols: usize, rows: usize) -> usize {
        if cols == 0 || rows == 0 {
            return 0;
        }
        (rows - 1) * self.row_stride + (cols - 1) * self.pixel_stride + 1
    }

    #[inline]
    pub fn sample(&self, col: usize, row: usize) -> u8 {
        self.data[row * self.row_stride + col * self.pixel_stride]
    }
}

/// Y, U (Cb) and V (Cr) planes; chroma is subsampled 2×2.
#[derive(Clone, Copy, Debug)]
pub struct YuvPlanes<'a> {
    pub y: Plane<'a>,
    pub u: Plane<'a>,
    pub v: Plane<'a>,
}

impl YuvPlanes<'_> {
    /// Check every plane is long enough for a `width × height` image.
    pub fn validate(&self, width: u32, height: u32) -> Result<()> {
        let (w, h) = (width as usize, height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        for (plane, (p, cols, rows)) in [(self.y, w, h), (self.u, cw, ch), (self.v, cw, ch)]
            .into_iter()
            .enumerate()
        {
            let needed = p.needed(cols, rows);
            if p.data.len() < needed {
                return Err(CameraError::PlaneTooShort { plane, needed, len: p.data.len() });
            }
        }
        Ok(())
    }
}

/// A hardware-owned image acquired from an [`ImageQueue`](crate::ImageQueue).
/// Dropping it returns the buffer to the producer.
pub trait AcquiredImage: Send {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn planes(&self) -> Result<YuvPlanes<'_>>;
}

/// Memory layout of a CPU-resident 4:2:0 frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum YuvLayout {
    /// Y, then U, then V, each tightly packed.
    I420,
    /// Y, then interleaved UV.
    Nv12,
    /// Y, then interleaved VU.
    Nv21,
}

/// Heap copy of a YUV 4:2:0 frame.
#[derive(Clone, Debug)]
pub struct YuvFrame {
    pub layout: YuvLayout,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl YuvFrame {
    /// Bytes a `width × height` 4:2:0 frame occupies.
    pub fn byte_len(width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        w * h + 2 * w.div_ceil(2) * h.div_ceil(2)
    }

    pub fn new(layout: YuvLayout, width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let frame = Self { layout, width, height, data };
        frame.planes()?;
        Ok(frame)
    }

    /// Uniform colour frame, handy for fixtures.
    pub fn filled(layout: YuvLayout, width: u32, height: u32, y: u8, u: u8, v: u8) -> Self {
        let luma = width as usize * height as usize;
        let chroma = width.div_ceil(2) as usize * height.div_ceil(2) as usize;
        let mut data = vec![y; luma];
        match layout {
            YuvLayout::I420 => {
                data.extend(std::iter::repeat(u).take(chroma));
                data.extend(std::iter::repeat(v).take(chroma));
            }
            YuvLayout::Nv12 => (0..chroma).for_each(|_| data.extend([u, v])),
            YuvLayout::Nv21 => (0..chroma).for_each(|_| data.extend([v, u])),
        }
        Self { layout, width, height, data }
    }

    pub fn planes(&self) -> Result<YuvPlanes<'_>> {
        let w = self.width as usize;
        let luma = w * self.height as usize;
        let cw = w.div_ceil(2);
        let chroma = cw * self.height.div_ceil(2) as usize;
        let tail = |start: usize| self.data.get(start..).unwrap_or(&[]);
        let y = Plane {
            data: &self.data[..luma.min(self.data.len())],
            row_stride: w,
            pixel_stride: 1,
        };
        let planes = match self.layout {
            YuvLayout::I420 => YuvPlanes {
                y,
                u: Plane { data: tail(luma), row_stride: cw, pixel_stride: 1 },
                v: Plane { data: tail(luma + chroma), row_stride: cw, pixel_stride: 1 },
            },
            YuvLayout::Nv12 => YuvPlanes {
                y,
                u: Plane { data: tail(luma), row_stride: cw * 2, pixel_stride: 2 },
                v: Plane { data: tail(luma + 1), row_stride: cw * 2, pixel_stride: 2 },
            },
            YuvLayout::Nv21 => YuvPlanes {
                y,
                u: Plane { data: tail(luma + 1), row_stride: cw * 2, pixel_stride: 2 },
                v: Plane { data: tail(luma), row_stride: cw * 2, pixel_stride: 2 },
            },
        };
        planes.validate(self.width, self.height)?;
        Ok(planes)
    }
}

impl AcquiredImage for YuvFrame {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn planes(&self) -> Result<YuvPlanes<'_>> {
        YuvFrame::planes(self)
    }
}
