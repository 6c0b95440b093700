//! Drive the whole capture pipeline from the synthetic camera.
//!
//! ```text
//! synthetic_pipeline --weights yolov8n.onnx --detect --seconds 10
//! synthetic_pipeline --weights yolov8n.onnx --image street.jpg --out street_boxes.png
//! ```
//!
//! Detection batches are printed to stdout as JSON lines; everything else
//! goes through the logger (`RUST_LOG`, default `info`).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use vizor_camera::{LensFacing, MemorySurface, SyntheticCamera};
use vizor_detect::{draw_detections, EngineConfig, EngineKind, LabelFont};
use vizor_pipeline::{detection_stream, NamedFilters, PerfSample, PipelineContext, PipelineMode};
use vizor_preprocess::Frame;

#[derive(Parser)]
#[command(about = "Run the vizor pipeline against a synthetic camera")]
struct CliArgs {
    /// JSON engine configuration; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// ONNX model file.
    #[arg(long)]
    weights: Option<PathBuf>,

    /// "ONNXRuntime" or "OpenCV".
    #[arg(long)]
    engine: Option<String>,

    /// "CPU", "GPU"/"OpenCL" or "NNAPI".
    #[arg(long)]
    backend: Option<String>,

    /// Run inference on the detection stream.
    #[arg(long)]
    detect: bool,

    /// Display filter: "Normal", "Gray" or "Invert".
    #[arg(long, default_value = "Normal")]
    filter: String,

    /// Comma separated COCO labels to keep, e.g. person,car.
    #[arg(long, value_delimiter = ',')]
    classes: Vec<String>,

    #[arg(long, default_value = "5")]
    seconds: u64,

    #[arg(long)]
    front: bool,

    /// Detect on a still image instead of streaming.
    #[arg(long)]
    image: Option<PathBuf>,

    /// Where the annotated still image is written.
    #[arg(long, default_value = "annotated.png")]
    out: PathBuf,

    /// TTF font for box captions; without it only the caption band is drawn.
    #[arg(long)]
    font: Option<PathBuf>,
}

fn load_config(args: &CliArgs) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(name) = &args.engine {
        config.engine = EngineKind::from_name(name);
    }
    if let Some(backend) = &args.backend {
        config.backend = backend.clone();
    }
    if let Some(weights) = &args.weights {
        config.model_path = Some(weights.clone());
    }
    config.validate()?;
    Ok(config)
}

fn filters() -> NamedFilters {
    NamedFilters::new()
        .with("Gray", |frame: &mut Frame| {
            for px in frame.data.chunks_exact_mut(4) {
                let y = (0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32) as u8;
                px[..3].fill(y);
            }
        })
        .with("Invert", |frame: &mut Frame| {
            for px in frame.data.chunks_exact_mut(4) {
                px[..3].iter_mut().for_each(|c| *c = 255 - *c);
            }
        })
}

fn annotate_still(
    ctx: &PipelineContext,
    input: &Path,
    out: &Path,
    font: Option<&LabelFont>,
) -> Result<()> {
    let mut image = image::open(input)
        .with_context(|| format!("opening {}", input.display()))?
        .to_rgba8();
    let detections = ctx.run_detection(&Frame::from_rgba(image.clone()));
    info!("{} detections in {}", detections.len(), input.display());
    println!("{}", serde_json::to_string(&detections)?);

    draw_detections(&mut image, &detections, font);
    image.save(out).with_context(|| format!("writing {}", out.display()))?;
    info!("annotated image written to {}", out.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = CliArgs::parse();
    let config = load_config(&args)?;

    let (sink, stream) = detection_stream(8);
    let ctx = PipelineContext::builder(Arc::new(SyntheticCamera::default()), config)
        .filter(Arc::new(filters()))
        .detection_sink(Arc::new(sink))
        .metrics_sink(Arc::new(|s: PerfSample| {
            debug!("{:.1} fps, {:.1} ms @ {}x{}", s.fps, s.latency_ms, s.width, s.height)
        }))
        .build();

    if !ctx.init_engine() {
        warn!("no model loaded, detection will return nothing");
    }
    if let Some(info) = ctx.engine().model_info() {
        info!(
            "model input {} {:?}, outputs {:?}",
            info.input_name, info.input_shape, info.output_names
        );
    }

    if let Some(image) = &args.image {
        let font = match &args.font {
            Some(path) => Some(
                LabelFont::from_file(path)
                    .with_context(|| format!("loading font {}", path.display()))?,
            ),
            None => None,
        };
        return annotate_still(&ctx, image, &args.out, font.as_ref());
    }

    ctx.settings().set_filter(&args.filter);
    ctx.settings().set_allowed_labels(args.classes.as_slice());
    if args.detect {
        ctx.settings().set_mode(PipelineMode::Detect);
    }

    let (stop_tx, mut stop_rx) = mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        stop_tx.send(()).ok();
    })
    .context("installing Ctrl-C handler")?;

    let facing = if args.front { LensFacing::Front } else { LensFacing::Back };
    let (surface, monitor) = MemorySurface::new(640, 480);
    if !ctx.start(facing, 640, 480, Box::new(surface), None) {
        bail!("camera failed to start");
    }

    let deadline = tokio::time::sleep(Duration::from_secs(args.seconds));
    tokio::pin!(deadline);
    let mut stream = Box::pin(stream);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = stop_rx.recv() => {
                info!("interrupted");
                break;
            }
            batch = stream.next() => match batch {
                Some(batch) if !batch.is_empty() => println!("{}", serde_json::to_string(&batch)?),
                Some(_) => {}
                None => break,
            },
        }
    }

    ctx.stop();
    info!(
        "rendered {} frames, last rate {:.1} fps",
        monitor.posted(),
        ctx.controller().metrics().fps()
    );
    Ok(())
}
