//! Pipeline lifecycle.
//!
//! Opens every camera, starts one worker thread per camera that came up and
//! one dispatcher thread, and tears everything down in order on shutdown:
//! cancel, join workers, let the dispatcher drain, close sources.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam::channel;

use crate::alert::AlertDispatcher;
use crate::camera::{CameraRegistry, CameraSlot};
use crate::cancel::CancellationToken;
use crate::clock::Clock;
use crate::debounce::DetectionDebouncer;
use crate::detect::InferenceGate;
use crate::frame::{DetectionBuffer, FlushPolicy};
use crate::ingest::{open_feed, source_for, FrameSource, SourceConfig};
use crate::worker::{CameraWorker, WorkerSettings};
use crate::CameraId;

/// Per-camera pipeline parameters shared by every worker.
#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub worker: WorkerSettings,
    pub debounce_threshold: u32,
    pub debounce_interval: Duration,
    pub buffer_capacity: usize,
    pub flush: FlushPolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            worker: WorkerSettings::default(),
            debounce_threshold: crate::debounce::DEFAULT_DETECTION_THRESHOLD,
            debounce_interval: crate::debounce::DEFAULT_DETECTION_INTERVAL,
            buffer_capacity: crate::frame::DEFAULT_BUFFER_CAPACITY,
            flush: FlushPolicy::default(),
        }
    }
}

pub struct Orchestrator {
    registry: CameraRegistry,
    skipped: Vec<CameraId>,
    cancel: CancellationToken,
    dispatcher: Arc<AlertDispatcher>,
    workers: Vec<(CameraId, JoinHandle<Box<dyn FrameSource>>)>,
    dispatcher_thread: Option<JoinHandle<()>>,
}

/// Build sources for the configured cameras. Unsupported URLs are logged and
/// left out.
pub fn build_sources(configs: Vec<SourceConfig>) -> Vec<Box<dyn FrameSource>> {
    configs
        .into_iter()
        .filter_map(|config| {
            let camera = config.camera;
            match source_for(config) {
                Ok(source) => Some(source),
                Err(e) => {
                    log::warn!("camera {}: skipped: {}", camera, e);
                    None
                }
            }
        })
        .collect()
}

impl Orchestrator {
    /// Open every source and start the pipeline. A camera that fails to
    /// open is logged and left out; the rest still run.
    pub fn start(
        sources: Vec<Box<dyn FrameSource>>,
        gate: Arc<InferenceGate>,
        dispatcher: Arc<AlertDispatcher>,
        settings: PipelineSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let cancel = CancellationToken::new();
        let (alerts_tx, alerts_rx) = channel::unbounded();

        let mut opened = Vec::new();
        let mut skipped = Vec::new();
        for mut source in sources {
            let camera = source.camera_id();
            match open_feed(source.as_mut()) {
                Ok(()) => opened.push(source),
                Err(e) => {
                    log::warn!("camera {}: not started: {}", camera, e);
                    skipped.push(camera);
                }
            }
        }
        if opened.is_empty() {
            log::warn!("no camera could be opened; only the dispatcher will run");
        }

        let dispatcher_thread = {
            let dispatcher = dispatcher.clone();
            let cancel = cancel.clone();
            thread::Builder::new()
                .name("dispatcher".to_string())
                .spawn(move || dispatcher.run(alerts_rx, cancel))
                .context("spawn dispatcher thread")?
        };

        let mut orchestrator = Self {
            registry: CameraRegistry::new(),
            skipped,
            cancel,
            dispatcher,
            workers: Vec::new(),
            dispatcher_thread: Some(dispatcher_thread),
        };

        for source in opened {
            let camera = source.camera_id();
            let slot = Arc::new(CameraSlot::new(
                camera,
                source.describe(),
                DetectionBuffer::new(settings.buffer_capacity, settings.flush),
            ));
            orchestrator.registry.insert(slot.clone());

            let worker = CameraWorker::new(
                slot,
                source,
                gate.clone(),
                DetectionDebouncer::new(settings.debounce_threshold, settings.debounce_interval),
                settings.worker.clone(),
                alerts_tx.clone(),
                clock.clone(),
                orchestrator.cancel.clone(),
            );
            let handle = thread::Builder::new()
                .name(format!("camera-{}", camera))
                .spawn(move || worker.run())
                .with_context(|| format!("spawn worker thread for camera {}", camera))?;
            orchestrator.workers.push((camera, handle));
        }

        log::info!(
            "orchestrator started: {} camera(s) running, {} skipped",
            orchestrator.workers.len(),
            orchestrator.skipped.len()
        );
        Ok(orchestrator)
    }

    /// Slots of the cameras that are running.
    pub fn registry(&self) -> &CameraRegistry {
        &self.registry
    }

    /// Cameras that failed to open at start.
    pub fn skipped(&self) -> &[CameraId] {
        &self.skipped
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn dispatcher(&self) -> &Arc<AlertDispatcher> {
        &self.dispatcher
    }

    /// Stop every worker, drain the dispatcher, release every source.
    pub fn shutdown(mut self) {
        log::info!("orchestrator shutting down");
        self.cancel.cancel();

        let mut sources = Vec::new();
        for (camera, handle) in std::mem::take(&mut self.workers) {
            match handle.join() {
                Ok(source) => sources.push(source),
                // The worker closed its own source while unwinding.
                Err(_) => log::error!("camera {}: worker panicked", camera),
            }
        }

        if let Some(handle) = self.dispatcher_thread.take() {
            if handle.join().is_err() {
                log::error!("dispatcher panicked");
            }
        }

        for mut source in sources {
            source.close();
        }
        let stats = self.dispatcher.stats();
        log::info!(
            "orchestrator stopped ({} alert requests, {} deliveries)",
            stats.requests.load(std::sync::atomic::Ordering::Relaxed),
            stats.delivered.load(std::sync::atomic::Ordering::Relaxed)
        );
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
