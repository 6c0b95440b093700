//! One live engine, swappable at runtime.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

use log::{debug, error, info};

use crate::config::EngineConfig;
use crate::decode::DetectParams;
use crate::detection::Detection;
use crate::engine::{create_engine, EngineKind, InferenceEngine, ModelInfo, INPUT_SIZE};
use crate::Frame;

#[derive(Default)]
struct Slot {
    engine: Option<Box<dyn InferenceEngine>>,
    kind: EngineKind,
    model_path: Option<PathBuf>,
    backend: Option<String>,
}

impl Slot {
    fn load(&mut self) -> bool {
        let (Some(engine), Some(path)) = (self.engine.as_mut(), self.model_path.as_deref()) else {
            return false;
        };
        engine.load_model(path)
    }
}

/// Owns at most one [`InferenceEngine`]. Replacing it drops the old
/// instance before the new one is built, so two engines never coexist.
///
/// Inference serialises on the inner mutex; [`EngineHandle::try_detect`]
/// gives up instead of waiting, which is how the capture path drops
/// frames while a forward pass is still running.
#[derive(Default)]
pub struct EngineHandle {
    slot: Mutex<Slot>,
}

impl EngineHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Build the configured engine, apply its backend and load its model.
    /// Returns whether a model ended up loaded.
    pub fn init(&self, config: &EngineConfig) -> bool {
        {
            let mut slot = self.slot();
            slot.model_path = config.model_path.clone();
            slot.backend = Some(config.backend.clone());
        }
        self.set_engine(config.engine)
    }

    /// Swap in a fresh engine of `kind`, carrying over the backend choice
    /// and reloading the last model path if there is one.
    pub fn set_engine(&self, kind: EngineKind) -> bool {
        let mut slot = self.slot();
        info!("switching engine to {kind}");
        slot.engine = None;
        slot.kind = kind;
        match create_engine(kind) {
            Ok(mut engine) => {
                if let Some(backend) = slot.backend.as_deref() {
                    engine.set_backend(backend);
                }
                slot.engine = Some(engine);
                slot.load()
            }
            Err(e) => {
                error!("cannot create {kind} engine: {e}");
                false
            }
        }
    }

    /// Install an already constructed engine in place of the current one.
    pub fn replace_engine(&self, engine: Box<dyn InferenceEngine>) {
        let mut slot = self.slot();
        slot.engine = None;
        slot.kind = engine.kind();
        slot.engine = Some(engine);
    }

    pub fn set_backend(&self, name: &str) {
        let mut slot = self.slot();
        slot.backend = Some(name.to_owned());
        if let Some(engine) = slot.engine.as_mut() {
            engine.set_backend(name);
        }
    }

    pub fn load_model(&self, path: &Path) -> bool {
        let mut slot = self.slot();
        slot.model_path = Some(path.to_path_buf());
        slot.load()
    }

    pub fn kind(&self) -> EngineKind {
        self.slot().kind
    }

    pub fn is_loaded(&self) -> bool {
        self.slot().engine.as_ref().is_some_and(|e| e.is_loaded())
    }

    /// Square input side of the current engine.
    pub fn input_size(&self) -> u32 {
        self.slot().engine.as_ref().map_or(INPUT_SIZE, |e| e.input_size())
    }

    pub fn model_info(&self) -> Option<ModelInfo> {
        self.slot().engine.as_ref().and_then(|e| e.model_info().cloned())
    }

    /// Detect without waiting. `None` when the engine is busy or absent.
    pub fn try_detect(&self, frame: &Frame, params: &DetectParams) -> Option<Vec<Detection>> {
        let mut slot = match self.slot.try_lock() {
            Ok(slot) => slot,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            Err(TryLockError::WouldBlock) => {
                debug!("engine busy, dropping frame");
                return None;
            }
        };
        let engine = slot.engine.as_mut()?;
        Some(engine.detect(frame, params))
    }

    /// Detect, waiting for any in-flight pass to finish.
    pub fn detect(&self, frame: &Frame, params: &DetectParams) -> Vec<Detection> {
        match self.slot().engine.as_mut() {
            Some(engine) => engine.detect(frame, params),
            None => Vec::new(),
        }
    }
}
