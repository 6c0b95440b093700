//! Heap-backed render surface.

use std::sync::{Arc, Mutex, PoisonError};

use crate::hal::{RenderSurface, SurfaceBuffer};
use crate::{Result, SurfaceId};

#[derive(Debug)]
struct SurfaceState {
    width: u32,
    height: u32,
    stride: u32,
    bits: Vec<u8>,
    posted: u64,
    released: bool,
}

/// RGBA_8888 window kept in memory. Pair it with the [`SurfaceMonitor`]
/// returned by [`MemorySurface::new`] to observe what was posted.
pub struct MemorySurface {
    id: SurfaceId,
    state: Arc<Mutex<SurfaceState>>,
}

/// Read side of a [`MemorySurface`]; stays valid after the surface is
/// released.
#[derive(Clone)]
pub struct SurfaceMonitor {
    id: SurfaceId,
    state: Arc<Mutex<SurfaceState>>,
}

impl MemorySurface {
    pub fn new(width: u32, height: u32) -> (Self, SurfaceMonitor) {
        Self::with_stride(width, height, width)
    }

    /// Surface whose rows are padded to `stride` pixels.
    pub fn with_stride(width: u32, height: u32, stride: u32) -> (Self, SurfaceMonitor) {
        let stride = stride.max(width);
        let state = Arc::new(Mutex::new(SurfaceState {
            width,
            height,
            stride,
            bits: vec![0; stride as usize * height as usize * 4],
            posted: 0,
            released: false,
        }));
        let id = SurfaceId::next();
        (Self { id, state: state.clone() }, SurfaceMonitor { id, state })
    }
}

impl RenderSurface for MemorySurface {
    fn surface(&self) -> SurfaceId {
        self.id
    }

    fn geometry(&self) -> (u32, u32) {
        let s = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        (s.width, s.height)
    }

    fn with_locked_buffer(&mut self, write: &mut dyn FnMut(&mut SurfaceBuffer<'_>)) -> Result<()> {
        let mut s = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (width, height, stride) = (s.width, s.height, s.stride);
        let mut buffer = SurfaceBuffer { width, height, stride, bits: &mut s.bits };
        write(&mut buffer);
        s.posted += 1;
        Ok(())
    }
}

impl Drop for MemorySurface {
    fn drop(&mut self) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).released = true;
    }
}

impl SurfaceMonitor {
    pub fn surface(&self) -> SurfaceId {
        self.id
    }

    /// Number of completed lock/write/unlock cycles.
    pub fn posted(&self) -> u64 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).posted
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).released
    }

    /// RGBA value at (x, y), or `None` outside the surface.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        let s = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if x >= s.width || y >= s.height {
            return None;
        }
        let i = (y as usize * s.stride as usize + x as usize) * 4;
        s.bits.get(i..i + 4).map(|p| [p[0], p[1], p[2], p[3]])
    }
}
