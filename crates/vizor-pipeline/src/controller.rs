//! Dual-stream capture controller.
//!
//! ```text
//!                ┌─ display queue (w×h, depth 2) ─► normalise ─► crop ─► filter ─► render
//! camera ─► session
//!                ├─ viewer overlay surface (filled by the camera stack)
//!                └─ detection queue (S×S, depth 2) ─► normalise ─► engine ─► sink
//! ```
//!
//! Listeners run on camera threads and only ever see the controller
//! through a `Weak`, so a late notification after drop is harmless.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Instant;

use image::imageops::{self, FilterType};
use log::{debug, error, info, trace, warn};
use vizor_camera::{
    AcquiredImage, CameraDevice, CameraHal, CaptureRequest, CaptureSession, DeviceInfo,
    ImageQueue, LensFacing, OutputContainer, QueueSpec, RenderSurface, Rotation,
};
use vizor_detect::{Detection, EngineHandle};
use vizor_preprocess::{yuv_to_rgba, Frame, FrameNormalizer};

use crate::metrics::{Metrics, PerfSample};
use crate::settings::{PipelineMode, SettingsSource, SharedSettings};
use crate::sinks::{DetectionSink, FrameFilter, MetricsSink, NullSink};
use crate::Result;

/// Both image queues hold at most this many buffers.
const QUEUE_DEPTH: usize = 2;

/// Geometry and orientation of the running session.
#[derive(Clone, Copy, Debug, Default)]
struct Placement {
    normalizer: FrameNormalizer,
    capture: (u32, u32),
    detection: u32,
}

#[derive(Default)]
struct Surfaces {
    display: Option<Box<dyn RenderSurface>>,
    overlay: Option<Box<dyn RenderSurface>>,
}

/// Hardware handles, released in field order by `teardown`.
#[derive(Default)]
struct SessionResources {
    session: Option<Box<dyn CaptureSession>>,
    device: Option<Box<dyn CameraDevice>>,
    request: Option<Box<dyn CaptureRequest>>,
    container: Option<Box<dyn OutputContainer>>,
    display_queue: Option<Box<dyn ImageQueue>>,
    detection_queue: Option<Box<dyn ImageQueue>>,
}

/// State the frame listeners need.
struct Shared {
    active: AtomicBool,
    placement: RwLock<Placement>,
    surfaces: Mutex<Surfaces>,
    engine: Arc<EngineHandle>,
    settings: Arc<dyn SettingsSource>,
    filter: Arc<dyn FrameFilter>,
    detections: Arc<dyn DetectionSink>,
    perf: Arc<dyn MetricsSink>,
    metrics: Metrics,
}

/// Owns one camera session and routes its two streams.
pub struct CaptureController {
    hal: Arc<dyn CameraHal>,
    shared: Arc<Shared>,
    resources: Mutex<SessionResources>,
}

pub struct CaptureControllerBuilder {
    hal: Arc<dyn CameraHal>,
    engine: Arc<EngineHandle>,
    settings: Arc<dyn SettingsSource>,
    filter: Arc<dyn FrameFilter>,
    detections: Arc<dyn DetectionSink>,
    perf: Arc<dyn MetricsSink>,
}

impl CaptureControllerBuilder {
    pub fn settings(mut self, settings: Arc<dyn SettingsSource>) -> Self {
        self.settings = settings;
        self
    }

    pub fn filter(mut self, filter: Arc<dyn FrameFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn detection_sink(mut self, sink: Arc<dyn DetectionSink>) -> Self {
        self.detections = sink;
        self
    }

    pub fn metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.perf = sink;
        self
    }

    pub fn build(self) -> CaptureController {
        CaptureController {
            hal: self.hal,
            shared: Arc::new(Shared {
                active: AtomicBool::new(false),
                placement: RwLock::new(Placement::default()),
                surfaces: Mutex::new(Surfaces::default()),
                engine: self.engine,
                settings: self.settings,
                filter: self.filter,
                detections: self.detections,
                perf: self.perf,
                metrics: Metrics::new(),
            }),
            resources: Mutex::new(SessionResources::default()),
        }
    }
}

impl CaptureController {
    pub fn builder(hal: Arc<dyn CameraHal>, engine: Arc<EngineHandle>) -> CaptureControllerBuilder {
        CaptureControllerBuilder {
            hal,
            engine,
            settings: Arc::new(SharedSettings::default()),
            filter: Arc::new(NullSink),
            detections: Arc::new(NullSink),
            perf: Arc::new(NullSink),
        }
    }

    /// Open the camera facing `facing` and stream into `display` at
    /// `width × height`. `overlay`, when given, is attached to the session
    /// as a third output that the camera stack fills on its own.
    ///
    /// Any previous session is torn down first. Returns `false` (and leaves
    /// nothing allocated) if the camera could not be brought up.
    pub fn start(
        &self,
        facing: LensFacing,
        width: u32,
        height: u32,
        display: Box<dyn RenderSurface>,
        overlay: Option<Box<dyn RenderSurface>>,
    ) -> bool {
        let mut res = self.lock_resources();
        self.teardown(&mut res);
        match self.setup(&mut res, facing, width, height, display, overlay) {
            Ok(()) => {
                info!("camera started ({width}x{height}, {facing:?})");
                true
            }
            Err(e) => {
                error!("camera start failed: {e}");
                self.teardown(&mut res);
                false
            }
        }
    }

    /// Stop streaming and release every handle. Safe to call at any time,
    /// any number of times.
    pub fn stop(&self) {
        let mut res = self.lock_resources();
        self.teardown(&mut res);
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> &Metrics {
        &self.shared.metrics
    }

    /// Rotation applied to frames of the current (or last) session.
    pub fn sensor_orientation(&self) -> Rotation {
        self.shared.placement().normalizer.rotation
    }

    fn lock_resources(&self) -> MutexGuard<'_, SessionResources> {
        self.resources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn setup(
        &self,
        res: &mut SessionResources,
        facing: LensFacing,
        width: u32,
        height: u32,
        display: Box<dyn RenderSurface>,
        overlay: Option<Box<dyn RenderSurface>>,
    ) -> Result<()> {
        let info = select_device(self.hal.devices()?, facing)?;
        let detection = self.shared.engine.input_size();
        *self.shared.placement.write().unwrap_or_else(PoisonError::into_inner) = Placement {
            normalizer: FrameNormalizer::for_camera(info.sensor_orientation, info.facing),
            capture: (width, height),
            detection,
        };
        self.shared.metrics.reset();

        let device = res.device.insert(self.hal.open_device(&info.id)?);

        let display_queue = res
            .display_queue
            .insert(self.hal.create_image_queue(QueueSpec::new(width, height, QUEUE_DEPTH)?)?);
        let weak = Arc::downgrade(&self.shared);
        display_queue.set_listener(Arc::new(move |q: &dyn ImageQueue| {
            route(&weak, q, Shared::on_display_frame)
        }))?;

        let detection_spec = QueueSpec::new(detection, detection, QUEUE_DEPTH)?;
        let detection_queue =
            res.detection_queue.insert(self.hal.create_image_queue(detection_spec)?);
        let weak = Arc::downgrade(&self.shared);
        detection_queue.set_listener(Arc::new(move |q: &dyn ImageQueue| {
            route(&weak, q, Shared::on_detection_frame)
        }))?;

        let mut outputs = vec![display_queue.surface()];
        {
            let mut surfaces = self.shared.lock_surfaces();
            surfaces.display = Some(display);
            if let Some(overlay) = overlay {
                outputs.push(overlay.surface());
                surfaces.overlay = Some(overlay);
            }
        }
        outputs.push(detection_queue.surface());

        let container = res.container.insert(device.create_output_container(&outputs)?);
        let session = res.session.insert(device.create_session(container.as_ref())?);
        let request = res.request.insert(device.create_request(&outputs)?);

        self.shared.active.store(true, Ordering::SeqCst);
        session.set_repeating_request(request.as_ref())?;
        debug!(
            "session on camera {} ({}), {} outputs, detection {detection}x{detection}",
            info.id,
            info.sensor_orientation,
            outputs.len()
        );
        Ok(())
    }

    /// Release in reverse-dependency order. Every step tolerates a missing
    /// handle, so this also cleans up after a half-finished `setup`.
    fn teardown(&self, res: &mut SessionResources) {
        // callbacks start discarding before anything goes away
        self.shared.active.store(false, Ordering::SeqCst);

        if let Some(mut session) = res.session.take() {
            session.stop_repeating();
            session.abort_captures();
            drop(session);
        }
        drop(res.device.take());
        drop(res.request.take());
        drop(res.container.take());
        drop(res.display_queue.take());
        drop(res.detection_queue.take());

        let mut surfaces = self.shared.lock_surfaces();
        if surfaces.display.is_some() || surfaces.overlay.is_some() {
            debug!("releasing render surfaces");
        }
        drop(surfaces.display.take());
        drop(surfaces.overlay.take());
    }
}

impl Drop for CaptureController {
    fn drop(&mut self) {
        self.stop();
    }
}

/// First device facing the requested way, else the first one listed.
fn select_device(devices: Vec<DeviceInfo>, facing: LensFacing) -> Result<DeviceInfo> {
    let mut first = None;
    for info in devices {
        if info.facing == facing {
            return Ok(info);
        }
        first.get_or_insert(info);
    }
    match first {
        Some(info) => {
            warn!("no {facing:?} camera, falling back to {}", info.id);
            Ok(info)
        }
        None => Err(vizor_camera::CameraError::NoDevices.into()),
    }
}

fn route(weak: &Weak<Shared>, queue: &dyn ImageQueue, handler: fn(&Shared, &dyn ImageQueue)) {
    match weak.upgrade() {
        Some(shared) => handler(&shared, queue),
        None => discard(queue),
    }
}

/// Take the newest buffer and hand it straight back.
fn discard(queue: &dyn ImageQueue) {
    if let Ok(Some(image)) = queue.acquire_latest() {
        trace!("discarding {}x{} buffer", image.width(), image.height());
    }
}

fn acquire(queue: &dyn ImageQueue) -> Option<Box<dyn AcquiredImage>> {
    match queue.acquire_latest() {
        Ok(image) => image,
        Err(e) => {
            debug!("acquire failed: {e}");
            None
        }
    }
}

impl Shared {
    fn lock_surfaces(&self) -> MutexGuard<'_, Surfaces> {
        self.surfaces.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn placement(&self) -> Placement {
        *self.placement.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn on_display_frame(&self, queue: &dyn ImageQueue) {
        if !self.is_active() {
            return discard(queue);
        }
        let Some(image) = acquire(queue) else { return };
        let rgba = match yuv_to_rgba(image.as_ref()) {
            Ok(rgba) => rgba,
            Err(e) => return warn!("display frame conversion failed: {e}"),
        };
        drop(image);

        let placement = self.placement();
        let settings = self.settings.snapshot();
        let mut frame = Frame::from_rgba(placement.normalizer.display(rgba));
        if let Some(name) = settings.active_filter() {
            self.filter.apply(name, &mut frame);
        }
        self.render(frame);

        let fps = self.metrics.record_frame();
        self.perf.publish(PerfSample {
            fps,
            latency_ms: 0.0,
            width: placement.capture.0,
            height: placement.capture.1,
        });
    }

    /// lock → write → unlock-and-post, resized to the surface geometry.
    fn render(&self, frame: Frame) {
        let Some(image) = frame.into_rgba() else {
            return debug!("filter left a non-RGBA frame, not rendering");
        };
        let mut surfaces = self.lock_surfaces();
        if !self.is_active() {
            return;
        }
        let Some(surface) = surfaces.display.as_mut() else { return };
        let (w, h) = surface.geometry();
        if w == 0 || h == 0 {
            return;
        }
        let result = surface.with_locked_buffer(&mut |buf| {
            if image.dimensions() == (buf.width, buf.height) {
                buf.write_rows(image.as_raw());
            } else {
                let scaled = imageops::resize(&image, buf.width, buf.height, FilterType::Triangle);
                buf.write_rows(scaled.as_raw());
            }
        });
        if let Err(e) = result {
            warn!("render failed: {e}");
        }
    }

    fn on_detection_frame(&self, queue: &dyn ImageQueue) {
        if !self.is_active() {
            return discard(queue);
        }
        let Some(image) = acquire(queue) else { return };
        let settings = self.settings.snapshot();
        if settings.mode != PipelineMode::Detect {
            return;
        }

        let started = Instant::now();
        let rgba = match yuv_to_rgba(image.as_ref()) {
            Ok(rgba) => rgba,
            Err(e) => return warn!("detection frame conversion failed: {e}"),
        };
        drop(image);

        let placement = self.placement();
        let frame = Frame::from_rgba(placement.normalizer.detection(rgba));
        let Some(detections) = self.engine.try_detect(&frame, &settings.params()) else {
            return;
        };
        let normalized: Vec<Detection> = detections
            .iter()
            .map(|d| d.normalized(frame.width, frame.height))
            .collect();
        trace!("{} detections", normalized.len());
        self.detections.publish(normalized);

        self.metrics.record_latency(started.elapsed());
        self.perf.publish(PerfSample {
            fps: self.metrics.fps(),
            latency_ms: self.metrics.latency_ms(),
            width: placement.detection,
            height: placement.detection,
        });
    }
}
