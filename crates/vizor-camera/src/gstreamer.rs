//! GStreamer-backed camera stack.
//!
//! A session is one pipeline: `source ! videoconvert ! tee`, with one
//! `queue ! videoscale ! videoconvert ! appsink` branch per image queue.
//! Each appsink keeps at most `depth` buffers and drops the oldest, and its
//! `new-sample` callback (streaming thread) is the frame-ready notification.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use gst::prelude::*;
use log::{debug, info, warn};

use crate::hal::{
    CameraDevice, CameraHal, CaptureRequest, CaptureSession, FrameListener, ImageQueue,
    OutputContainer,
};
use crate::{
    AcquiredImage, CameraError, DeviceInfo, LensFacing, Plane, QueueSpec, Result, Rotation,
    SurfaceId, YuvPlanes,
};

/// A device plus the launch line of its source element.
#[derive(Clone, Debug)]
pub struct GstSource {
    pub info: DeviceInfo,
    pub launch: String,
}

impl GstSource {
    /// `libcamerasrc` when the plugin exists (Pi / libcamera stack), else the
    /// first V4L2 node.
    pub fn autodetect() -> Self {
        let launch = if gst::ElementFactory::find("libcamerasrc").is_some() {
            "libcamerasrc"
        } else {
            "v4l2src device=/dev/video0"
        };
        Self {
            info: DeviceInfo {
                id: "0".into(),
                facing: LensFacing::Back,
                sensor_orientation: Rotation::Deg0,
            },
            launch: launch.into(),
        }
    }
}

struct Registry {
    sources: Vec<GstSource>,
    sinks: Mutex<HashMap<SurfaceId, gst_app::AppSink>>,
}

impl Registry {
    fn sink(&self, id: SurfaceId) -> Option<gst_app::AppSink> {
        self.sinks.lock().unwrap_or_else(PoisonError::into_inner).get(&id).cloned()
    }
}

/// Camera stack over GStreamer sources.
#[derive(Clone)]
pub struct GstCamera {
    registry: Arc<Registry>,
}

impl GstCamera {
    pub fn new(sources: Vec<GstSource>) -> Result<Self> {
        gst::init().map_err(CameraError::GstInit)?;
        let sources = if sources.is_empty() { vec![GstSource::autodetect()] } else { sources };
        Ok(Self {
            registry: Arc::new(Registry { sources, sinks: Mutex::new(HashMap::new()) }),
        })
    }
}

impl CameraHal for GstCamera {
    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.registry.sources.iter().map(|s| s.info.clone()).collect())
    }

    fn open_device(&self, id: &str) -> Result<Box<dyn CameraDevice>> {
        let source = self
            .registry
            .sources
            .iter()
            .find(|s| s.info.id == id)
            .cloned()
            .ok_or_else(|| CameraError::OpenDevice {
                id: id.to_string(),
                reason: "unknown device".into(),
            })?;
        Ok(Box::new(GstDevice { source, registry: self.registry.clone() }))
    }

    fn create_image_queue(&self, spec: QueueSpec) -> Result<Box<dyn ImageQueue>> {
        let spec = QueueSpec::new(spec.width, spec.height, spec.depth)?;
        let id = SurfaceId::next();
        let caps = gst::Caps::builder("video/x-raw")
            .field("format", "I420")
            .field("width", spec.width as i32)
            .field("height", spec.height as i32)
            .build();
        let appsink = gst_app::AppSink::builder()
            .name(format!("queue{}", id.0))
            .caps(&caps)
            .max_buffers(spec.depth as u32)
            .drop(true)
            .sync(false)
            .build();
        self.registry
            .sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, appsink.clone());
        Ok(Box::new(GstQueue {
            core: Arc::new(SinkQueue { id, spec, appsink }),
            registry: self.registry.clone(),
        }))
    }
}

struct SinkQueue {
    id: SurfaceId,
    spec: QueueSpec,
    appsink: gst_app::AppSink,
}

impl ImageQueue for SinkQueue {
    fn surface(&self) -> SurfaceId {
        self.id
    }

    fn spec(&self) -> QueueSpec {
        self.spec
    }

    fn set_listener(&self, listener: FrameListener) -> Result<()> {
        let core = SinkQueue { id: self.id, spec: self.spec, appsink: self.appsink.clone() };
        self.appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |_| {
                    listener(&core);
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );
        Ok(())
    }

    fn acquire_latest(&self) -> Result<Option<Box<dyn AcquiredImage>>> {
        let mut latest = None;
        while let Some(sample) = self.appsink.try_pull_sample(gst::ClockTime::ZERO) {
            latest = Some(sample);
        }
        latest.map(GstImage::from_sample).transpose()
    }
}

struct GstQueue {
    core: Arc<SinkQueue>,
    registry: Arc<Registry>,
}

impl ImageQueue for GstQueue {
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

impl Drop for GstQueue {
    fn drop(&mut self) {
        // drop the callback closure; it holds a clone of the appsink
        self.core.appsink.set_callbacks(gst_app::AppSinkCallbacks::builder().build());
        self.registry
            .sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.core.id);
    }
}

/// Mapped I420 buffer; unmapped (and returned to the pool) on drop.
struct GstImage {
    width: u32,
    height: u32,
    offsets: [usize; 3],
    strides: [usize; 3],
    map: gst::MappedBuffer<gst::buffer::Readable>,
}

impl GstImage {
    fn from_sample(sample: gst::Sample) -> Result<Box<dyn AcquiredImage>> {
        let caps = sample
            .caps()
            .ok_or_else(|| CameraError::BufferMap("sample has no caps".into()))?;
        let info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|e| CameraError::BufferMap(e.to_string()))?;
        let buffer = sample
            .buffer_owned()
            .ok_or_else(|| CameraError::BufferMap("sample has no buffer".into()))?;

        let (mut offsets, mut strides) = ([0usize; 3], [0usize; 3]);
        match buffer.meta::<gst_video::VideoMeta>() {
            Some(meta) => {
                for p in 0..3 {
                    offsets[p] = meta.offset()[p];
                    strides[p] = meta.stride()[p] as usize;
                }
            }
            None => {
                for p in 0..3 {
                    offsets[p] = info.offset()[p];
                    strides[p] = info.stride()[p] as usize;
                }
            }
        }
        let map = buffer
            .into_mapped_buffer_readable()
            .map_err(|_| CameraError::BufferMap("buffer not readable".into()))?;
        Ok(Box::new(GstImage {
            width: info.width(),
            height: info.height(),
            offsets,
            strides,
            map,
        }))
    }

    fn plane(&self, p: usize) -> Plane<'_> {
        Plane {
            data: self.map.as_slice().get(self.offsets[p]..).unwrap_or(&[]),
            row_stride: self.strides[p],
            pixel_stride: 1,
        }
    }
}

impl AcquiredImage for GstImage {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn planes(&self) -> Result<YuvPlanes<'_>> {
        let planes = YuvPlanes { y: self.plane(0), u: self.plane(1), v: self.plane(2) };
        planes.validate(self.width, self.height)?;
        Ok(planes)
    }
}

struct GstDevice {
    source: GstSource,
    registry: Arc<Registry>,
}

impl CameraDevice for GstDevice {
    fn id(&self) -> &str {
        &self.source.info.id
    }

    fn create_output_container(
        &mut self,
        outputs: &[SurfaceId],
    ) -> Result<Box<dyn OutputContainer>> {
        Ok(Box::new(GstOutputs(outputs.to_vec())))
    }

    fn create_session(&mut self, outputs: &dyn OutputContainer) -> Result<Box<dyn CaptureSession>> {
        let pipeline = gst::Pipeline::new();
        let source = gst::parse::bin_from_description(&self.source.launch, true)
            .map_err(CameraError::ParsePipeline)?;
        let convert = make("videoconvert")?;
        let tee = make("tee")?;
        pipeline
            .add_many([source.upcast_ref::<gst::Element>(), &convert, &tee])
            .map_err(CameraError::Element)?;
        gst::Element::link_many([source.upcast_ref::<gst::Element>(), &convert, &tee])
            .map_err(CameraError::Element)?;

        for id in outputs.outputs() {
            let Some(sink) = self.registry.sink(*id) else {
                // render surfaces are composited by the display stack
                debug!("output {id:?} has no appsink; not linked");
                continue;
            };
            let queue = make("queue")?;
            let scale = make("videoscale")?;
            let conv = make("videoconvert")?;
            pipeline
                .add_many([&queue, &scale, &conv, sink.upcast_ref()])
                .map_err(CameraError::Element)?;
            gst::Element::link_many([&queue, &scale, &conv, sink.upcast_ref()])
                .map_err(CameraError::Element)?;
            tee.link(&queue).map_err(|e| CameraError::Session(e.to_string()))?;
        }
        info!("GStreamer session built for {}", self.source.launch);
        Ok(Box::new(GstSession { pipeline }))
    }

    fn create_request(&mut self, targets: &[SurfaceId]) -> Result<Box<dyn CaptureRequest>> {
        Ok(Box::new(GstRequest(targets.to_vec())))
    }
}

fn make(factory: &str) -> Result<gst::Element> {
    gst::ElementFactory::make(factory).build().map_err(CameraError::Element)
}

struct GstOutputs(Vec<SurfaceId>);

impl OutputContainer for GstOutputs {
    fn outputs(&self) -> &[SurfaceId] {
        &self.0
    }
}

struct GstRequest(Vec<SurfaceId>);

impl CaptureRequest for GstRequest {
    fn targets(&self) -> &[SurfaceId] {
        &self.0
    }
}

struct GstSession {
    pipeline: gst::Pipeline,
}

impl CaptureSession for GstSession {
    fn set_repeating_request(&mut self, _request: &dyn CaptureRequest) -> Result<()> {
        self.pipeline
            .set_state(gst::State::Playing)
            .map_err(CameraError::StateChange)?;
        Ok(())
    }

    fn stop_repeating(&mut self) {
        if let Err(e) = self.pipeline.set_state(gst::State::Paused) {
            warn!("failed to pause pipeline: {e}");
        }
    }

    fn abort_captures(&mut self) {
        // READY flushes every queue and releases the device buffers
        if let Err(e) = self.pipeline.set_state(gst::State::Ready) {
            warn!("failed to flush pipeline: {e}");
        }
    }
}

impl Drop for GstSession {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}
