// vizor-camera/src/lib.rs
// ============================================================
// Camera hardware layer for the vizor capture pipeline
// Abstracts a platform camera stack as devices, capture
// sessions and depth-bounded image queues whose "frame ready"
// notifications arrive on platform threads.
// ------------------------------------------------------------
// Public API:
//   * CameraHal – enumerate / open devices, create image queues
//   * ImageQueue::acquire_latest() – newest buffer, older dropped
//   * RenderSurface – lock / write / unlock an RGBA window
// ------------------------------------------------------------
// Backends
//   * SyntheticCamera – test-pattern producer, always compiled
//   * GstCamera       – libcamerasrc / v4l2src (`gstreamer`)
// ============================================================

//! vizor – camera capture layer
//!
//! The capture controller never talks to a camera stack directly. It goes
//! through the traits in [`hal`], which model the handle-oriented API of a
//! mobile camera service: a device is opened, an output container and a
//! capture session are built over a set of [`SurfaceId`]s, a repeating
//! request is issued, and every image queue fires its listener each time
//! a buffer lands.  Acquired buffers are hardware-owned; dropping the
//! [`AcquiredImage`] hands them back.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

pub mod hal;
pub mod image;
pub mod surface;
pub mod synthetic;

#[cfg(feature = "gstreamer")]
pub mod gstreamer;

pub use hal::{
    CameraDevice, CameraHal, CaptureRequest, CaptureSession, FrameListener, ImageQueue,
    OutputContainer, RenderSurface, SurfaceBuffer,
};
pub use image::{AcquiredImage, Plane, YuvFrame, YuvLayout, YuvPlanes};
pub use surface::{MemorySurface, SurfaceMonitor};
pub use synthetic::{LiveHandles, SyntheticCamera, SyntheticCameraBuilder};

#[cfg(feature = "gstreamer")]
pub use gstreamer::{GstCamera, GstSource};

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("no camera devices available")]
    NoDevices,
    #[error("failed to open camera device {id}: {reason}")]
    OpenDevice { id: String, reason: String },
    #[error("failed to create capture session: {0}")]
    Session(String),
    #[error("failed to issue capture request: {0}")]
    Request(String),
    #[error("image queue {0:?} has been deleted")]
    QueueClosed(SurfaceId),
    #[error("invalid image queue size {width}x{height} (depth {depth})")]
    InvalidQueue { width: u32, height: u32, depth: usize },
    #[error("render surface unavailable: {0}")]
    Surface(String),
    #[error("image plane {plane} too short: need {needed} bytes, have {len}")]
    PlaneTooShort { plane: usize, needed: usize, len: usize },
    #[cfg(feature = "gstreamer")]
    #[error("GStreamer init failed: {0}")]
    GstInit(#[source] ::gst::glib::Error),
    #[cfg(feature = "gstreamer")]
    #[error("Failed to parse pipeline: {0}")]
    ParsePipeline(#[source] ::gst::glib::Error),
    #[cfg(feature = "gstreamer")]
    #[error("Failed to change pipeline state: {0}")]
    StateChange(#[source] ::gst::StateChangeError),
    #[cfg(feature = "gstreamer")]
    #[error("GStreamer element error: {0}")]
    Element(#[source] ::gst::glib::BoolError),
    #[cfg(feature = "gstreamer")]
    #[error("Buffer map failed: {0}")]
    BufferMap(String),
}

pub type Result<T> = std::result::Result<T, CameraError>;

/// Opaque identifier of anything the hardware can stream into: an image
/// queue's producer window or a caller-supplied render surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u64);

static NEXT_SURFACE: AtomicU64 = AtomicU64::new(1);

impl SurfaceId {
    /// Allocate a process-unique id.
    pub fn next() -> Self {
        SurfaceId(NEXT_SURFACE.fetch_add(1, Ordering::Relaxed))
    }
}

/// Which way the lens points.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LensFacing {
    Front,
    Back,
    External,
}

impl LensFacing {
    /// Front lenses are displayed mirrored.
    pub fn is_mirrored(self) -> bool {
        matches!(self, LensFacing::Front)
    }
}

/// Fixed clockwise rotation between the sensor's native layout and the
/// upright display orientation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Map a sensor orientation attribute. Anything other than the four
    /// right angles yields `None`.
    pub fn from_degrees(degrees: i32) -> Option<Self> {
        match degrees.rem_euclid(360) {
            0 => Some(Rotation::Deg0),
            90 => Some(Rotation::Deg90),
            180 => Some(Rotation::Deg180),
            270 => Some(Rotation::Deg270),
            _ => None,
        }
    }

    pub fn degrees(self) -> u32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    /// Quarter turns swap width and height.
    pub fn swaps_axes(self) -> bool {
        matches!(self, Rotation::Deg90 | Rotation::Deg270)
    }
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}°", self.degrees())
    }
}

/// Static description of an enumerable camera device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub facing: LensFacing,
    pub sensor_orientation: Rotation,
}

/// Geometry and depth of an image queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueSpec {
    pub width: u32,
    pub height: u32,
    /// Maximum number of buffers the queue holds before the producer
    /// starts overwriting the oldest one.
    pub depth: usize,
}

impl QueueSpec {
    pub fn new(width: u32, height: u32, depth: usize) -> Result<Self> {
        if width == 0 || height == 0 || depth == 0 {
            return Err(CameraError::InvalidQueue { width, height, depth });
        }
        Ok(Self { width, height, depth })
    }
}
