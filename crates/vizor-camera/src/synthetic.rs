//! Synthetic camera stack.
//!
//! Each capture session owns one producer thread that renders a moving test
//! pattern into every image queue targeted by its repeating request, at a
//! fixed interval. Queues keep at most `depth` buffers and overwrite the
//! oldest one when full. All handles are counted so callers can assert that
//! teardown released everything.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use crate::hal::{
    CameraDevice, CameraHal, CaptureRequest, CaptureSession, FrameListener, ImageQueue,
    OutputContainer,
};
use crate::{
    AcquiredImage, CameraError, DeviceInfo, LensFacing, QueueSpec, Result, Rotation, SurfaceId,
    YuvFrame, YuvLayout, YuvPlanes,
};

/// Renders frame `index` for a queue of the given geometry.
pub type PatternFn = Arc<dyn Fn(u64, QueueSpec) -> YuvFrame + Send + Sync>;

const DEFAULT_INTERVAL: Duration = Duration::from_millis(33);

/// Handles currently held by callers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LiveHandles {
    pub devices: usize,
    pub containers: usize,
    pub sessions: usize,
    pub requests: usize,
    pub queues: usize,
    pub images: usize,
}

impl LiveHandles {
    pub fn total(&self) -> usize {
        self.devices + self.containers + self.sessions + self.requests + self.queues + self.images
    }
}

#[derive(Clone, Copy)]
enum Kind {
    Device,
    Container,
    Session,
    Request,
    Queue,
    Image,
}

#[derive(Default)]
struct Counters {
    devices: AtomicUsize,
    containers: AtomicUsize,
    sessions: AtomicUsize,
    requests: AtomicUsize,
    queues: AtomicUsize,
    images: AtomicUsize,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn slot(&self, kind: Kind) -> &AtomicUsize {
        match kind {
            Kind::Device => &self.devices,
            Kind::Container => &self.containers,
            Kind::Session => &self.sessions,
            Kind::Request => &self.requests,
            Kind::Queue => &self.queues,
            Kind::Image => &self.images,
        }
    }
}

/// Increments a live-handle counter for as long as it exists.
struct Tracked {
    counters: Arc<Counters>,
    kind: Kind,
}

impl Tracked {
    fn new(counters: &Arc<Counters>, kind: Kind) -> Self {
        counters.slot(kind).fetch_add(1, Ordering::SeqCst);
        Self { counters: counters.clone(), kind }
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.counters.slot(self.kind).fetch_sub(1, Ordering::SeqCst);
    }
}

struct Inner {
    devices: Vec<DeviceInfo>,
    interval: Duration,
    layout: YuvLayout,
    pattern: Option<PatternFn>,
    fail_open: bool,
    fail_session: bool,
    counters: Arc<Counters>,
    queues: Mutex<HashMap<SurfaceId, Weak<QueueCore>>>,
}

impl Inner {
    fn queue(&self, id: SurfaceId) -> Option<Arc<QueueCore>> {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .and_then(Weak::upgrade)
    }

    fn render(&self, index: u64, spec: QueueSpec) -> YuvFrame {
        match &self.pattern {
            Some(pattern) => pattern(index, spec),
            None => test_pattern(self.layout, index, spec),
        }
    }
}

/// Diagonal luma ramp that scrolls one step per frame over a tinted chroma.
fn test_pattern(layout: YuvLayout, index: u64, spec: QueueSpec) -> YuvFrame {
    let mut frame = YuvFrame::filled(layout, spec.width, spec.height, 0, 96, 160);
    let w = spec.width as usize;
    let shift = (index % 256) as usize;
    for (i, px) in frame.data[..w * spec.height as usize].iter_mut().enumerate() {
        let (x, y) = (i % w, i / w);
        *px = ((x + y + shift) % 256) as u8;
    }
    frame
}

/// Builder for [`SyntheticCamera`].
pub struct SyntheticCameraBuilder {
    devices: Vec<DeviceInfo>,
    interval: Duration,
    layout: YuvLayout,
    pattern: Option<PatternFn>,
    fail_open: bool,
    fail_session: bool,
}

impl Default for SyntheticCameraBuilder {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            interval: DEFAULT_INTERVAL,
            layout: YuvLayout::Nv21,
            pattern: None,
            fail_open: false,
            fail_session: false,
        }
    }
}

impl SyntheticCameraBuilder {
    pub fn device(mut self, id: &str, facing: LensFacing, orientation: Rotation) -> Self {
        self.devices.push(DeviceInfo {
            id: id.to_string(),
            facing,
            sensor_orientation: orientation,
        });
        self
    }

    pub fn frame_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn layout(mut self, layout: YuvLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Replace the built-in test pattern.
    pub fn pattern<F>(mut self, pattern: F) -> Self
    where
        F: Fn(u64, QueueSpec) -> YuvFrame + Send + Sync + 'static,
    {
        self.pattern = Some(Arc::new(pattern));
        self
    }

    /// Make every `open_device` call fail.
    pub fn fail_open(mut self, fail: bool) -> Self {
        self.fail_open = fail;
        self
    }

    /// Make every `create_session` call fail.
    pub fn fail_session(mut self, fail: bool) -> Self {
        self.fail_session = fail;
        self
    }

    pub fn build(self) -> SyntheticCamera {
        SyntheticCamera {
            inner: Arc::new(Inner {
                devices: self.devices,
                interval: self.interval,
                layout: self.layout,
                pattern: self.pattern,
                fail_open: self.fail_open,
                fail_session: self.fail_session,
                counters: Arc::new(Counters::default()),
                queues: Mutex::new(HashMap::new()),
            }),
        }
    }
}

/// In-process camera stack producing test-pattern frames.
#[derive(Clone)]
pub struct SyntheticCamera {
    inner: Arc<Inner>,
}

impl Default for SyntheticCamera {
    /// A back camera mounted at 90° and a front camera at 270°, the usual
    /// phone arrangement.
    fn default() -> Self {
        Self::builder()
            .device("0", LensFacing::Back, Rotation::Deg90)
            .device("1", LensFacing::Front, Rotation::Deg270)
            .build()
    }
}

impl SyntheticCamera {
    pub fn builder() -> SyntheticCameraBuilder {
        SyntheticCameraBuilder::default()
    }

    pub fn live_handles(&self) -> LiveHandles {
        let c = &self.inner.counters;
        LiveHandles {
            devices: c.devices.load(Ordering::SeqCst),
            containers: c.containers.load(Ordering::SeqCst),
            sessions: c.sessions.load(Ordering::SeqCst),
            requests: c.requests.load(Ordering::SeqCst),
            queues: c.queues.load(Ordering::SeqCst),
            images: c.images.load(Ordering::SeqCst),
        }
    }

    /// Frames handed to image queues so far.
    pub fn delivered_frames(&self) -> u64 {
        self.inner.counters.delivered.load(Ordering::SeqCst)
    }

    /// Buffers released without ever being delivered to a consumer.
    pub fn dropped_frames(&self) -> u64 {
        self.inner.counters.dropped.load(Ordering::SeqCst)
    }
}

impl CameraHal for SyntheticCamera {
    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        if self.inner.devices.is_empty() {
            return Err(CameraError::NoDevices);
        }
        Ok(self.inner.devices.clone())
    }

    fn open_device(&self, id: &str) -> Result<Box<dyn CameraDevice>> {
        if self.inner.fail_open || !self.inner.devices.iter().any(|d| d.id == id) {
            return Err(CameraError::OpenDevice {
                id: id.to_string(),
                reason: "device unavailable".into(),
            });
        }
        debug!("synthetic camera {id} opened");
        Ok(Box::new(SyntheticDevice {
            id: id.to_string(),
            inner: self.inner.clone(),
            _tracked: Tracked::new(&self.inner.counters, Kind::Device),
        }))
    }

    fn create_image_queue(&self, spec: QueueSpec) -> Result<Box<dyn ImageQueue>> {
        let spec = QueueSpec::new(spec.width, spec.height, spec.depth)?;
        let core = Arc::new(QueueCore {
            id: SurfaceId::next(),
            spec,
            buffered: Mutex::new(Buffered::default()),
            listener: Mutex::new(None),
            counters: self.inner.counters.clone(),
        });
        self.inner
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(core.id, Arc::downgrade(&core));
        Ok(Box::new(SyntheticQueue {
            core,
            inner: self.inner.clone(),
            _tracked: Tracked::new(&self.inner.counters, Kind::Queue),
        }))
    }
}

#[derive(Default)]
struct Buffered {
    frames: VecDeque<YuvFrame>,
    deleted: bool,
}

struct QueueCore {
    id: SurfaceId,
    spec: QueueSpec,
    buffered: Mutex<Buffered>,
    listener: Mutex<Option<FrameListener>>,
    counters: Arc<Counters>,
}

impl QueueCore {
    /// Enqueue a produced frame and fire the listener outside the locks.
    fn deliver(&self, frame: YuvFrame) {
        {
            let mut b = self.buffered.lock().unwrap_or_else(PoisonError::into_inner);
            if b.deleted {
                return;
            }
            while b.frames.len() >= self.spec.depth {
                b.frames.pop_front();
                self.counters.dropped.fetch_add(1, Ordering::SeqCst);
            }
            b.frames.push_back(frame);
        }
        self.counters.delivered.fetch_add(1, Ordering::SeqCst);
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(listener) = listener {
            listener(self);
        }
    }

    fn delete(&self) {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner).take();
        let mut b = self.buffered.lock().unwrap_or_else(PoisonError::into_inner);
        b.deleted = true;
        b.frames.clear();
    }
}

impl ImageQueue for QueueCore {
    fn surface(&self) -> SurfaceId {
        self.id
    }

    fn spec(&self) -> QueueSpec {
        self.spec
    }

    fn set_listener(&self, listener: FrameListener) -> Result<()> {
        if self.buffered.lock().unwrap_or_else(PoisonError::into_inner).deleted {
            return Err(CameraError::QueueClosed(self.id));
        }
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(listener);
        Ok(())
    }

    fn acquire_latest(&self) -> Result<Option<Box<dyn AcquiredImage>>> {
        let mut b = self.buffered.lock().unwrap_or_else(PoisonError::into_inner);
        if b.deleted {
            return Err(CameraError::QueueClosed(self.id));
        }
        let latest = b.frames.pop_back();
        let stale = b.frames.len() as u64;
        b.frames.clear();
        self.counters.dropped.fetch_add(stale, Ordering::SeqCst);
        Ok(latest.map(|frame| {
            Box::new(SyntheticImage {
                frame,
                _tracked: Tracked::new(&self.counters, Kind::Image),
            }) as Box<dyn AcquiredImage>
        }))
    }
}

struct SyntheticQueue {
    core: Arc<QueueCore>,
    inner: Arc<Inner>,
    _tracked: Tracked,
}

impl ImageQueue for SyntheticQueue {
    fn surface(&self) -> SurfaceId {
        self.core.id
    }

    fn spec(&self) -> QueueSpec {
        self.core.spec
    }

    fn set_listener(&self, listener: FrameListener) -> Result<()> {
        self.core.set_listener(listener)
    }

    fn acquire_latest(&self) -> Result<Option<Box<dyn AcquiredImage>>> {
        self.core.acquire_latest()
    }
}

impl Drop for SyntheticQueue {
    fn drop(&mut self) {
        self.core.delete();
        self.inner
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.core.id);
    }
}

struct SyntheticImage {
    frame: YuvFrame,
    _tracked: Tracked,
}

impl AcquiredImage for SyntheticImage {
    fn width(&self) -> u32 {
        self.frame.width
    }

    fn height(&self) -> u32 {
        self.frame.height
    }

    fn planes(&self) -> Result<YuvPlanes<'_>> {
        self.frame.planes()
    }
}

struct SyntheticDevice {
    id: String,
    inner: Arc<Inner>,
    _tracked: Tracked,
}

impl CameraDevice for SyntheticDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn create_output_container(
        &mut self,
        outputs: &[SurfaceId],
    ) -> Result<Box<dyn OutputContainer>> {
        Ok(Box::new(SyntheticContainer {
            outputs: outputs.to_vec(),
            _tracked: Tracked::new(&self.inner.counters, Kind::Container),
        }))
    }

    fn create_session(&mut self, outputs: &dyn OutputContainer) -> Result<Box<dyn CaptureSession>> {
        if self.inner.fail_session {
            return Err(CameraError::Session("session configuration rejected".into()));
        }
        Ok(Box::new(SyntheticSession {
            inner: self.inner.clone(),
            outputs: outputs.outputs().to_vec(),
            producer: None,
            _tracked: Tracked::new(&self.inner.counters, Kind::Session),
        }))
    }

    fn create_request(&mut self, targets: &[SurfaceId]) -> Result<Box<dyn CaptureRequest>> {
        Ok(Box::new(SyntheticRequest {
            targets: targets.to_vec(),
            _tracked: Tracked::new(&self.inner.counters, Kind::Request),
        }))
    }
}

impl Drop for SyntheticDevice {
    fn drop(&mut self) {
        debug!("synthetic camera {} closed", self.id);
    }
}

struct SyntheticContainer {
    outputs: Vec<SurfaceId>,
    _tracked: Tracked,
}

impl OutputContainer for SyntheticContainer {
    fn outputs(&self) -> &[SurfaceId] {
        &self.outputs
    }
}

struct SyntheticRequest {
    targets: Vec<SurfaceId>,
    _tracked: Tracked,
}

impl CaptureRequest for SyntheticRequest {
    fn targets(&self) -> &[SurfaceId] {
        &self.targets
    }
}

struct Producer {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct SyntheticSession {
    inner: Arc<Inner>,
    outputs: Vec<SurfaceId>,
    producer: Option<Producer>,
    _tracked: Tracked,
}

impl CaptureSession for SyntheticSession {
    fn set_repeating_request(&mut self, request: &dyn CaptureRequest) -> Result<()> {
        if let Some(stray) = request.targets().iter().find(|t| !self.outputs.contains(t)) {
            return Err(CameraError::Request(format!(
                "target {stray:?} is not a session output"
            )));
        }
        self.stop_repeating();

        let targets = request.targets().to_vec();
        let inner = self.inner.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name("synthetic-camera".into())
            .spawn(move || {
                let mut index = 0u64;
                while !flag.load(Ordering::SeqCst) {
                    for id in &targets {
                        // render surfaces are fed by the display stack, not by us
                        if let Some(queue) = inner.queue(*id) {
                            queue.deliver(inner.render(index, queue.spec));
                        }
                    }
                    index += 1;
                    thread::sleep(inner.interval);
                }
            })
            .map_err(|e| CameraError::Request(e.to_string()))?;
        info!("synthetic repeating request started ({} targets)", request.targets().len());
        self.producer = Some(Producer { stop, handle });
        Ok(())
    }

    fn stop_repeating(&mut self) {
        let Some(producer) = self.producer.take() else {
            return;
        };
        producer.stop.store(true, Ordering::SeqCst);
        if producer.handle.thread().id() == thread::current().id() {
            warn!("stop_repeating called from the producer thread; not joining");
            return;
        }
        if producer.handle.join().is_err() {
            warn!("synthetic producer thread panicked");
        }
    }

    fn abort_captures(&mut self) {
        // frames are produced synchronously, so nothing is in flight once
        // the producer has been joined
        self.stop_repeating();
    }
}

impl Drop for SyntheticSession {
    fn drop(&mut self) {
        self.stop_repeating();
    }
}
