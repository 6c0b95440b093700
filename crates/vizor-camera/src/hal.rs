//! Handle-oriented camera abstraction.
//!
//! Every handle releases its hardware resource on `Drop`. Callers that care
//! about teardown order must release handles explicitly (take them out of an
//! `Option` and drop them) rather than rely on field drop order.
//!
//! # Threading
//!
//! A [`FrameListener`] may be invoked on arbitrary platform threads, possibly
//! concurrently with the listener of another queue and with a teardown running
//! on a control thread. Once [`CaptureSession::stop_repeating`] and
//! [`CaptureSession::abort_captures`] have returned, the backend issues no new
//! notifications for that session.

use std::sync::Arc;

use crate::{AcquiredImage, DeviceInfo, QueueSpec, Result, SurfaceId};

/// Per-queue "frame ready" handler. Receives the queue that fired so the
/// handler can acquire (or discard) the buffer itself.
pub type FrameListener = Arc<dyn Fn(&dyn ImageQueue) + Send + Sync>;

/// Entry point of a camera stack.
pub trait CameraHal: Send + Sync {
    /// Enumerate devices together with their facing and sensor orientation.
    fn devices(&self) -> Result<Vec<DeviceInfo>>;

    fn open_device(&self, id: &str) -> Result<Box<dyn CameraDevice>>;

    /// Create a buffered image queue producing YUV 4:2:0 images of the given
    /// size. The returned queue exposes a [`SurfaceId`] that can be attached to
    /// a capture session.
    fn create_image_queue(&self, spec: QueueSpec) -> Result<Box<dyn ImageQueue>>;
}

/// Depth-bounded queue of hardware buffers. Dropping it deletes the queue,
/// detaches the listener and returns every buffered image to the producer.
pub trait ImageQueue: Send + Sync {
    fn surface(&self) -> SurfaceId;

    fn spec(&self) -> QueueSpec;

    /// Register the frame-ready handler, replacing any previous one.
    fn set_listener(&self, listener: FrameListener) -> Result<()>;

    /// Acquire the newest buffered image. Any older buffers still queued are
    /// released without being delivered. `Ok(None)` means nothing was queued.
    fn acquire_latest(&self) -> Result<Option<Box<dyn AcquiredImage>>>;
}

/// An opened camera. Dropping it closes the device.
pub trait CameraDevice: Send {
    fn id(&self) -> &str;

    /// Bundle the outputs a session will stream into.
    fn create_output_container(&mut self, outputs: &[SurfaceId])
        -> Result<Box<dyn OutputContainer>>;

    fn create_session(&mut self, outputs: &dyn OutputContainer) -> Result<Box<dyn CaptureSession>>;

    /// Build a preview-template request targeting `targets`.
    fn create_request(&mut self, targets: &[SurfaceId]) -> Result<Box<dyn CaptureRequest>>;
}

/// Session outputs. Dropping it frees the container and its outputs.
pub trait OutputContainer: Send {
    fn outputs(&self) -> &[SurfaceId];
}

/// Capture request with its output targets. Dropping it frees both.
pub trait CaptureRequest: Send {
    fn targets(&self) -> &[SurfaceId];
}

/// A configured capture session. Dropping it closes the session.
pub trait CaptureSession: Send {
    fn set_repeating_request(&mut self, request: &dyn CaptureRequest) -> Result<()>;

    /// Stop issuing new captures. Idempotent.
    fn stop_repeating(&mut self);

    /// Discard captures that are already in flight. Idempotent.
    fn abort_captures(&mut self);
}

/// Locked RGBA_8888 window buffer.
pub struct SurfaceBuffer<'a> {
    pub width: u32,
    pub height: u32,
    /// Row pitch in pixels.
    pub stride: u32,
    pub bits: &'a mut [u8],
}

impl SurfaceBuffer<'_> {
    /// Copy a tightly packed RGBA image of exactly this buffer's size,
    /// honouring the row pitch.
    pub fn write_rows(&mut self, rgba: &[u8]) {
        let row = self.width as usize * 4;
        let pitch = self.stride as usize * 4;
        for (y, src) in rgba.chunks_exact(row).take(self.height as usize).enumerate() {
            let start = y * pitch;
            if let Some(dst) = self.bits.get_mut(start..start + row) {
                dst.copy_from_slice(src);
            }
        }
    }
}

/// Caller-owned display window. Dropping it releases the window handle.
pub trait RenderSurface: Send {
    fn surface(&self) -> SurfaceId;

    /// Current buffer geometry (width, height).
    fn geometry(&self) -> (u32, u32);

    /// One lock → write → unlock-and-post cycle.
    fn with_locked_buffer(&mut self, write: &mut dyn FnMut(&mut SurfaceBuffer<'_>)) -> Result<()>;
}
