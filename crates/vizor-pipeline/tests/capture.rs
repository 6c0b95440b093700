use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use ndarray::{Array3, Array4};
use tokio_stream::StreamExt;
use vizor_camera::{
    AcquiredImage, CameraDevice, CameraHal, DeviceInfo, FrameListener, ImageQueue, LensFacing,
    MemorySurface, QueueSpec, Rotation, SurfaceId, SyntheticCamera, YuvFrame, YuvLayout,
    YuvPlanes,
};
use vizor_detect::{
    Detection, EngineConfig, EngineKind, InferenceEngine, ModelInfo, RawOutput, TensorLayout,
};
use vizor_pipeline::{detection_stream, NamedFilters, PerfSample, PipelineContext, PipelineMode};

/// Always reports one person centred in the input, 64 px wide.
struct CentredPerson;

impl InferenceEngine for CentredPerson {
    fn kind(&self) -> EngineKind {
        EngineKind::OnnxRuntime
    }

    fn load_model(&mut self, _path: &Path) -> bool {
        true
    }

    fn set_backend(&mut self, _name: &str) {}

    fn is_loaded(&self) -> bool {
        true
    }

    fn model_info(&self) -> Option<&ModelInfo> {
        None
    }

    fn forward(&mut self, _input: Array4<f32>) -> vizor_detect::Result<RawOutput> {
        let mut head = Array3::<f32>::zeros((1, 84, 1));
        head[[0, 0, 0]] = 320.0;
        head[[0, 1, 0]] = 320.0;
        head[[0, 2, 0]] = 64.0;
        head[[0, 3, 0]] = 64.0;
        head[[0, 4, 0]] = 0.9;
        Ok(RawOutput { data: head, layout: TensorLayout::ChannelsFirst })
    }
}

fn camera() -> SyntheticCamera {
    SyntheticCamera::builder()
        .device("0", LensFacing::Back, Rotation::Deg90)
        .device("1", LensFacing::Front, Rotation::Deg270)
        .frame_interval(Duration::from_millis(2))
        .build()
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[test]
fn display_frames_reach_the_surface() {
    let cam = camera();
    let ctx = PipelineContext::builder(Arc::new(cam.clone()), EngineConfig::default()).build();
    let (surface, monitor) = MemorySurface::new(32, 24);

    assert!(ctx.start(LensFacing::Back, 64, 48, Box::new(surface), None));
    assert!(ctx.controller().is_active());
    assert_eq!(ctx.controller().sensor_orientation(), Rotation::Deg90);
    assert!(wait_until(|| monitor.posted() >= 3));
    assert_eq!(monitor.pixel(0, 0).map(|p| p[3]), Some(255));

    ctx.stop();
    assert!(!ctx.controller().is_active());
    assert!(monitor.is_released());
    assert_eq!(cam.live_handles().total(), 0);
}

#[test]
fn restarting_does_not_leak_handles() {
    let cam = camera();
    let ctx = PipelineContext::builder(Arc::new(cam.clone()), EngineConfig::default()).build();

    let (first, first_monitor) = MemorySurface::new(16, 16);
    assert!(ctx.start(LensFacing::Back, 64, 48, Box::new(first), None));
    let single = cam.live_handles();
    assert_eq!(single.devices, 1);
    assert_eq!(single.sessions, 1);
    assert_eq!(single.queues, 2);

    let (second, second_monitor) = MemorySurface::new(16, 16);
    assert!(ctx.start(LensFacing::Front, 64, 48, Box::new(second), None));
    assert!(first_monitor.is_released());
    assert!(!second_monitor.is_released());
    assert_eq!(ctx.controller().sensor_orientation(), Rotation::Deg270);

    let again = cam.live_handles();
    assert_eq!((again.devices, again.sessions, again.queues), (1, 1, 2));

    drop(ctx);
    assert!(second_monitor.is_released());
    assert_eq!(cam.live_handles().total(), 0);
}

#[test]
fn stop_is_idempotent() {
    let cam = camera();
    let ctx = PipelineContext::builder(Arc::new(cam.clone()), EngineConfig::default()).build();
    ctx.stop();
    ctx.stop();
    assert!(!ctx.controller().is_active());
    assert_eq!(cam.live_handles().total(), 0);
}

#[test]
fn missing_facing_falls_back_to_first_device() {
    let cam = SyntheticCamera::builder()
        .device("only", LensFacing::Back, Rotation::Deg180)
        .frame_interval(Duration::from_millis(2))
        .build();
    let ctx = PipelineContext::builder(Arc::new(cam), EngineConfig::default()).build();
    let (surface, _monitor) = MemorySurface::new(8, 8);
    assert!(ctx.start(LensFacing::Front, 32, 32, Box::new(surface), None));
    assert_eq!(ctx.controller().sensor_orientation(), Rotation::Deg180);
}

#[test]
fn failed_start_releases_everything() {
    for cam in [
        SyntheticCamera::builder()
            .device("0", LensFacing::Back, Rotation::Deg90)
            .fail_open(true)
            .build(),
        SyntheticCamera::builder()
            .device("0", LensFacing::Back, Rotation::Deg90)
            .fail_session(true)
            .build(),
        SyntheticCamera::builder().build(),
    ] {
        let ctx = PipelineContext::builder(Arc::new(cam.clone()), EngineConfig::default()).build();
        let (surface, monitor) = MemorySurface::new(8, 8);
        let (overlay, overlay_monitor) = MemorySurface::new(8, 8);
        assert!(!ctx.start(LensFacing::Back, 32, 32, Box::new(surface), Some(Box::new(overlay))));
        assert!(!ctx.controller().is_active());
        assert!(monitor.is_released());
        assert!(overlay_monitor.is_released());
        assert_eq!(cam.live_handles().total(), 0);
    }
}

#[test]
fn overlay_is_held_for_the_session() {
    let cam = camera();
    let ctx = PipelineContext::builder(Arc::new(cam.clone()), EngineConfig::default()).build();
    let (surface, _monitor) = MemorySurface::new(8, 8);
    let (overlay, overlay_monitor) = MemorySurface::new(8, 8);

    assert!(ctx.start(LensFacing::Back, 32, 32, Box::new(surface), Some(Box::new(overlay))));
    assert!(!overlay_monitor.is_released());
    // the camera stack owns what goes into the overlay
    assert_eq!(overlay_monitor.posted(), 0);
    ctx.stop();
    assert!(overlay_monitor.is_released());
}

#[test]
fn named_filter_applies_to_display_frames() {
    let filters = NamedFilters::new().with("Paint", |frame| {
        for px in frame.data.chunks_exact_mut(4) {
            px.copy_from_slice(&[10, 20, 30, 255]);
        }
    });
    let ctx = PipelineContext::builder(Arc::new(camera()), EngineConfig::default())
        .filter(Arc::new(filters))
        .build();
    let (surface, monitor) = MemorySurface::new(16, 16);
    assert!(ctx.start(LensFacing::Back, 32, 32, Box::new(surface), None));

    ctx.settings().set_filter("Paint");
    assert!(wait_until(|| monitor.pixel(8, 8) == Some([10, 20, 30, 255])));

    ctx.settings().set_filter("Normal");
    assert!(wait_until(|| monitor.pixel(8, 8) != Some([10, 20, 30, 255])));
}

#[test]
fn display_only_mode_publishes_no_detections() {
    let seen = Arc::new(Mutex::new(0usize));
    let counter = seen.clone();
    let ctx = PipelineContext::builder(Arc::new(camera()), EngineConfig::default())
        .detection_sink(Arc::new(move |_: Vec<Detection>| *counter.lock().unwrap() += 1))
        .build();
    ctx.engine().replace_engine(Box::new(CentredPerson));
    let (surface, monitor) = MemorySurface::new(8, 8);

    assert!(ctx.start(LensFacing::Back, 32, 32, Box::new(surface), None));
    assert!(wait_until(|| monitor.posted() >= 10));
    assert_eq!(*seen.lock().unwrap(), 0);

    ctx.settings().set_mode(PipelineMode::Detect);
    assert!(wait_until(|| *seen.lock().unwrap() > 0));
}

#[test]
fn metrics_report_each_stream_geometry() {
    let samples = Arc::new(Mutex::new(Vec::<PerfSample>::new()));
    let sink = samples.clone();
    let ctx = PipelineContext::builder(Arc::new(camera()), EngineConfig::default())
        .metrics_sink(Arc::new(move |s: PerfSample| sink.lock().unwrap().push(s)))
        .build();
    ctx.engine().replace_engine(Box::new(CentredPerson));
    ctx.settings().set_mode(PipelineMode::Detect);
    let (surface, _monitor) = MemorySurface::new(8, 8);

    assert!(ctx.start(LensFacing::Back, 64, 48, Box::new(surface), None));
    assert!(wait_until(|| {
        let s = samples.lock().unwrap();
        s.iter().any(|p| p.width == 640) && s.iter().any(|p| p.width == 64)
    }));
    ctx.stop();

    let samples = samples.lock().unwrap();
    for sample in samples.iter() {
        match (sample.width, sample.height) {
            (64, 48) => assert_eq!(sample.latency_ms, 0.0),
            (640, 640) => assert!(sample.latency_ms >= 0.0),
            other => panic!("unexpected sample geometry {other:?}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn detections_arrive_normalised_on_the_stream() -> anyhow::Result<()> {
    let (sink, stream) = detection_stream(4);
    let ctx = PipelineContext::builder(Arc::new(camera()), EngineConfig::default())
        .detection_sink(Arc::new(sink))
        .build();
    ctx.engine().replace_engine(Box::new(CentredPerson));
    ctx.settings().set_mode(PipelineMode::Detect);
    let (surface, _monitor) = MemorySurface::new(8, 8);
    assert!(ctx.start(LensFacing::Back, 32, 32, Box::new(surface), None));

    let mut stream = Box::pin(stream);
    let batch = tokio::time::timeout(Duration::from_secs(3), stream.next())
        .await
        .context("no detections within 3s")?
        .context("detection stream closed")?;
    ctx.stop();

    assert_eq!(batch.len(), 1);
    let det = &batch[0];
    assert_eq!(det.label, "person");
    let b = det.bbox;
    assert!((b.x - 0.45).abs() < 1e-4 && (b.y - 0.45).abs() < 1e-4);
    assert!((b.width - 0.1).abs() < 1e-4 && (b.height - 0.1).abs() < 1e-4);
    Ok(())
}

#[test]
fn class_filter_from_settings_is_honoured() {
    let seen = Arc::new(Mutex::new(Vec::<usize>::new()));
    let sink = seen.clone();
    let ctx = PipelineContext::builder(Arc::new(camera()), EngineConfig::default())
        .detection_sink(Arc::new(move |d: Vec<Detection>| sink.lock().unwrap().push(d.len())))
        .build();
    ctx.engine().replace_engine(Box::new(CentredPerson));
    ctx.settings().set_allowed_labels(&["car"][..]);
    ctx.settings().set_mode(PipelineMode::Detect);
    let (surface, _monitor) = MemorySurface::new(8, 8);

    assert!(ctx.start(LensFacing::Back, 32, 32, Box::new(surface), None));
    assert!(wait_until(|| seen.lock().unwrap().len() >= 3));
    ctx.stop();
    assert!(seen.lock().unwrap().iter().all(|&n| n == 0));
}

/// Synthetic camera whose queues hand their listeners to the test.
struct ListenerTap {
    cam: SyntheticCamera,
    listeners: Arc<Mutex<Vec<FrameListener>>>,
}

struct TappedQueue {
    inner: Box<dyn ImageQueue>,
    listeners: Arc<Mutex<Vec<FrameListener>>>,
}

impl CameraHal for ListenerTap {
    fn devices(&self) -> vizor_camera::Result<Vec<DeviceInfo>> {
        self.cam.devices()
    }

    fn open_device(&self, id: &str) -> vizor_camera::Result<Box<dyn CameraDevice>> {
        self.cam.open_device(id)
    }

    fn create_image_queue(&self, spec: QueueSpec) -> vizor_camera::Result<Box<dyn ImageQueue>> {
        let inner = self.cam.create_image_queue(spec)?;
        Ok(Box::new(TappedQueue { inner, listeners: self.listeners.clone() }))
    }
}

impl ImageQueue for TappedQueue {
    fn surface(&self) -> SurfaceId {
        self.inner.surface()
    }

    fn spec(&self) -> QueueSpec {
        self.inner.spec()
    }

    fn set_listener(&self, listener: FrameListener) -> vizor_camera::Result<()> {
        self.listeners.lock().unwrap().push(listener.clone());
        self.inner.set_listener(listener)
    }

    fn acquire_latest(&self) -> vizor_camera::Result<Option<Box<dyn AcquiredImage>>> {
        self.inner.acquire_latest()
    }
}

/// Image that counts itself while alive.
struct CountedImage {
    frame: YuvFrame,
    live: Arc<AtomicUsize>,
}

impl AcquiredImage for CountedImage {
    fn width(&self) -> u32 {
        self.frame.width
    }

    fn height(&self) -> u32 {
        self.frame.height
    }

    fn planes(&self) -> vizor_camera::Result<YuvPlanes<'_>> {
        self.frame.planes()
    }
}

impl Drop for CountedImage {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Queue holding buffers that arrive after the session is gone.
struct LateQueue {
    pending: Mutex<Vec<CountedImage>>,
    live: Arc<AtomicUsize>,
}

impl LateQueue {
    fn with_frames(n: usize) -> Self {
        let live = Arc::new(AtomicUsize::new(n));
        let pending = (0..n)
            .map(|_| CountedImage {
                frame: YuvFrame::filled(YuvLayout::Nv21, 640, 640, 200, 128, 128),
                live: live.clone(),
            })
            .collect();
        Self { pending: Mutex::new(pending), live }
    }
}

impl ImageQueue for LateQueue {
    fn surface(&self) -> SurfaceId {
        SurfaceId(0)
    }

    fn spec(&self) -> QueueSpec {
        QueueSpec { width: 640, height: 640, depth: 2 }
    }

    fn set_listener(&self, _listener: FrameListener) -> vizor_camera::Result<()> {
        Ok(())
    }

    fn acquire_latest(&self) -> vizor_camera::Result<Option<Box<dyn AcquiredImage>>> {
        let mut pending = self.pending.lock().unwrap();
        let latest = pending.pop();
        pending.clear();
        Ok(latest.map(|img| Box::new(img) as Box<dyn AcquiredImage>))
    }
}

#[test]
fn notifications_after_stop_are_drained_and_dropped() -> anyhow::Result<()> {
    let cam = camera();
    let listeners = Arc::new(Mutex::new(Vec::new()));
    let hal = ListenerTap { cam: cam.clone(), listeners: listeners.clone() };

    let detections = Arc::new(AtomicUsize::new(0));
    let samples = Arc::new(AtomicUsize::new(0));
    let (d, m) = (detections.clone(), samples.clone());
    let ctx = PipelineContext::builder(Arc::new(hal), EngineConfig::default())
        .detection_sink(Arc::new(move |_: Vec<Detection>| {
            d.fetch_add(1, Ordering::SeqCst);
        }))
        .metrics_sink(Arc::new(move |_: PerfSample| {
            m.fetch_add(1, Ordering::SeqCst);
        }))
        .build();
    ctx.engine().replace_engine(Box::new(CentredPerson));
    ctx.settings().set_mode(PipelineMode::Detect);

    let (surface, monitor) = MemorySurface::new(8, 8);
    anyhow::ensure!(ctx.start(LensFacing::Back, 32, 32, Box::new(surface), None));
    anyhow::ensure!(wait_until(|| monitor.posted() > 0), "no display frame rendered");
    ctx.stop();

    let listeners = listeners.lock().unwrap().clone();
    assert_eq!(listeners.len(), 2);
    let (posted, seen_dets, seen_samples) = (
        monitor.posted(),
        detections.load(Ordering::SeqCst),
        samples.load(Ordering::SeqCst),
    );

    // late notifications while the controller still exists but is inactive
    for listener in &listeners {
        let late = LateQueue::with_frames(2);
        listener(&late);
        assert!(late.pending.lock().unwrap().is_empty());
        assert_eq!(late.live.load(Ordering::SeqCst), 0);
    }
    assert_eq!(monitor.posted(), posted);
    assert_eq!(detections.load(Ordering::SeqCst), seen_dets);
    assert_eq!(samples.load(Ordering::SeqCst), seen_samples);

    // and once it has been dropped entirely
    drop(ctx);
    for listener in &listeners {
        let late = LateQueue::with_frames(2);
        listener(&late);
        assert_eq!(late.live.load(Ordering::SeqCst), 0);
    }
    assert_eq!(cam.live_handles().total(), 0);
    Ok(())
}
