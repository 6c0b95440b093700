//! Collaborators the pipeline hands frames and results to.

use std::collections::HashMap;

use log::trace;
use vizor_detect::Detection;
use vizor_preprocess::Frame;

use crate::metrics::PerfSample;

/// Name-keyed in-place transform of a display frame (RGBA).
pub trait FrameFilter: Send + Sync {
    /// Unknown names must leave `frame` untouched.
    fn apply(&self, name: &str, frame: &mut Frame);
}

/// Receives one detection list per processed detection-path frame, boxes
/// normalised to [0, 1].
pub trait DetectionSink: Send + Sync {
    fn publish(&self, detections: Vec<Detection>);
}

/// Receives a sample after every display frame and every processed
/// detection frame.
pub trait MetricsSink: Send + Sync {
    fn publish(&self, sample: PerfSample);
}

impl<F> DetectionSink for F
where
    F: Fn(Vec<Detection>) + Send + Sync,
{
    fn publish(&self, detections: Vec<Detection>) {
        self(detections)
    }
}

impl<F> MetricsSink for F
where
    F: Fn(PerfSample) + Send + Sync,
{
    fn publish(&self, sample: PerfSample) {
        self(sample)
    }
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl FrameFilter for NullSink {
    fn apply(&self, name: &str, _frame: &mut Frame) {
        trace!("no filters registered, ignoring {name:?}");
    }
}

impl DetectionSink for NullSink {
    fn publish(&self, _detections: Vec<Detection>) {}
}

impl MetricsSink for NullSink {
    fn publish(&self, _sample: PerfSample) {}
}

type FilterFn = Box<dyn Fn(&mut Frame) + Send + Sync>;

/// Filters registered by name.
#[derive(Default)]
pub struct NamedFilters {
    filters: HashMap<String, FilterFn>,
}

impl NamedFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, filter: impl Fn(&mut Frame) + Send + Sync + 'static) -> Self {
        self.filters.insert(name.to_owned(), Box::new(filter));
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.filters.keys().map(String::as_str)
    }
}

impl FrameFilter for NamedFilters {
    fn apply(&self, name: &str, frame: &mut Frame) {
        match self.filters.get(name) {
            Some(filter) => filter(frame),
            None => trace!("unknown filter {name:?}"),
        }
    }
}
