//! Rolling FPS and last detection latency.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

/// FPS is recomputed once this much time has passed since the last update.
const FPS_WINDOW: Duration = Duration::from_millis(1000);

/// What the metrics sink receives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct PerfSample {
    pub fps: f32,
    /// Last detection latency; 0 on display-path samples.
    pub latency_ms: f32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug)]
struct State {
    frames: u32,
    window_start: Instant,
    fps: f32,
    latency_ms: f32,
}

#[derive(Debug)]
pub struct Metrics {
    state: Mutex<State>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                frames: 0,
                window_start: Instant::now(),
                fps: 0.0,
                latency_ms: 0.0,
            }),
        }
    }

    /// Count a displayed frame; returns the current FPS estimate.
    pub fn record_frame(&self) -> f32 {
        self.record_frame_at(Instant::now())
    }

    pub fn record_frame_at(&self, now: Instant) -> f32 {
        let mut s = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        s.frames += 1;
        let elapsed = now.saturating_duration_since(s.window_start);
        if elapsed > FPS_WINDOW {
            s.fps = s.frames as f32 / elapsed.as_secs_f32();
            s.frames = 0;
            s.window_start = now;
        }
        s.fps
    }

    pub fn record_latency(&self, latency: Duration) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).latency_ms =
            latency.as_secs_f32() * 1000.0;
    }

    pub fn fps(&self) -> f32 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).fps
    }

    pub fn latency_ms(&self) -> f32 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).latency_ms
    }

    /// Start a fresh window at `now`, keeping nothing from before.
    pub fn reset_at(&self, now: Instant) {
        let mut s = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *s = State { frames: 0, window_start: now, fps: 0.0, latency_ms: 0.0 };
    }

    pub fn reset(&self) {
        self.reset_at(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fps_updates_after_window() {
        let t0 = Instant::now();
        let m = Metrics::new();
        m.reset_at(t0);
        for i in 1..=10 {
            assert_eq!(m.record_frame_at(t0 + Duration::from_millis(i * 100)), 0.0);
        }
        // 11 frames over 1.1 s
        let fps = m.record_frame_at(t0 + Duration::from_millis(1100));
        assert!((fps - 10.0).abs() < 1e-3);
        assert_eq!(m.record_frame_at(t0 + Duration::from_millis(1150)), fps);
    }

    #[test]
    fn latency_in_millis() {
        let m = Metrics::new();
        m.record_latency(Duration::from_micros(12_500));
        assert!((m.latency_ms() - 12.5).abs() < 1e-3);
    }
}
