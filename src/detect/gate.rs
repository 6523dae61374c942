use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use image::RgbImage;

use crate::cancel::CancellationToken;
use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::error::InferenceError;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;

/// Bound on a single wait for the backend, so waiters notice cancellation.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Runtime detection settings, changed by bot commands and read every tick.
#[derive(Debug)]
pub struct InferenceSettings {
    activated: AtomicBool,
    /// f32 bit pattern.
    threshold: AtomicU32,
}

impl InferenceSettings {
    pub fn new(activated: bool, threshold: f32) -> Self {
        Self {
            activated: AtomicBool::new(activated),
            threshold: AtomicU32::new(threshold.clamp(0.0, 1.0).to_bits()),
        }
    }

    pub fn is_activated(&self) -> bool {
        self.activated.load(Ordering::SeqCst)
    }

    pub fn set_activated(&self, activated: bool) {
        self.activated.store(activated, Ordering::SeqCst);
    }

    pub fn threshold(&self) -> f32 {
        f32::from_bits(self.threshold.load(Ordering::SeqCst))
    }

    /// Clamped into `0.0..=1.0`.
    pub fn set_threshold(&self, threshold: f32) {
        self.threshold
            .store(threshold.clamp(0.0, 1.0).to_bits(), Ordering::SeqCst);
    }
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self::new(true, DEFAULT_CONFIDENCE_THRESHOLD)
    }
}

/// Exclusive access to the shared detector backend.
///
/// The backend lives in a single slot. A caller takes it out, runs
/// detection without holding any lock, and the lease puts it back on drop
/// (including on unwind). At most one inference is in flight at any time.
pub struct InferenceGate {
    slot: Mutex<Option<Box<dyn DetectorBackend>>>,
    returned: Condvar,
    settings: Arc<InferenceSettings>,
    backend_name: &'static str,
    inferences: AtomicU64,
    failures: AtomicU64,
}

struct Lease<'a> {
    gate: &'a InferenceGate,
    backend: Option<Box<dyn DetectorBackend>>,
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if let Some(backend) = self.backend.take() {
            *self.gate.lock_slot() = Some(backend);
            self.gate.returned.notify_one();
        }
    }
}

impl InferenceGate {
    pub fn new(backend: Box<dyn DetectorBackend>, settings: Arc<InferenceSettings>) -> Self {
        let backend_name = backend.name();
        Self {
            slot: Mutex::new(Some(backend)),
            returned: Condvar::new(),
            settings,
            backend_name,
            inferences: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &Arc<InferenceSettings> {
        &self.settings
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend_name
    }

    pub fn inference_count(&self) -> u64 {
        self.inferences.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Run detection. Returns an empty list without touching the backend
    /// while detection is deactivated.
    pub fn infer(
        &self,
        image: &RgbImage,
        cancel: &CancellationToken,
    ) -> Result<Vec<Detection>, InferenceError> {
        if !self.settings.is_activated() {
            return Ok(Vec::new());
        }

        let mut lease = self.acquire(cancel)?;
        let result = match lease.backend.as_mut() {
            Some(backend) => backend.detect(image),
            None => return Err(InferenceError::Backend("backend lease was empty".to_string())),
        };
        drop(lease);

        self.inferences.fetch_add(1, Ordering::Relaxed);
        result.map_err(|e| {
            self.failures.fetch_add(1, Ordering::Relaxed);
            InferenceError::from(e)
        })
    }

    pub fn warm_up(&self, cancel: &CancellationToken) -> Result<(), InferenceError> {
        let mut lease = self.acquire(cancel)?;
        match lease.backend.as_mut() {
            Some(backend) => backend.warm_up().map_err(InferenceError::from),
            None => Err(InferenceError::Backend("backend lease was empty".to_string())),
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<Box<dyn DetectorBackend>>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn acquire(&self, cancel: &CancellationToken) -> Result<Lease<'_>, InferenceError> {
        let mut slot = self.lock_slot();
        loop {
            if cancel.is_cancelled() {
                return Err(InferenceError::Cancelled);
            }
            if let Some(backend) = slot.take() {
                return Ok(Lease {
                    gate: self,
                    backend: Some(backend),
                });
            }
            let (guard, _) = self
                .returned
                .wait_timeout(slot, WAIT_SLICE)
                .unwrap_or_else(|e| e.into_inner());
            slot = guard;
        }
    }
}
