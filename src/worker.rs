//! Per-camera capture loop.
//!
//! One `CameraWorker` per camera, each on its own thread. A tick reads one
//! frame, publishes it, runs every Kth frame through the shared inference
//! gate, feeds the debouncer, and on a trigger appends an alert frame to the
//! camera's buffer. A flushed buffer becomes an `AlertRequest` on the
//! dispatcher channel.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;

use crate::camera::{AlertKind, AlertRequest, CameraSlot, CameraState};
use crate::cancel::CancellationToken;
use crate::clock::Clock;
use crate::debounce::DetectionDebouncer;
use crate::detect::{Detection, InferenceGate};
use crate::error::InferenceError;
use crate::frame::compose_alert_frame;
use crate::ingest::{open_feed, FrameSource};

pub const DEFAULT_DECIMATION: u32 = 2;
pub const DEFAULT_WORKING_WIDTH: u32 = 640;
pub const DEFAULT_WORKING_HEIGHT: u32 = 480;
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_millis(2000);

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct WorkerSettings {
    /// Run inference on every Kth frame.
    pub decimation: u32,
    pub working_width: u32,
    pub working_height: u32,
    pub reconnect_backoff: Duration,
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    pub alert_kind: AlertKind,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            decimation: DEFAULT_DECIMATION,
            working_width: DEFAULT_WORKING_WIDTH,
            working_height: DEFAULT_WORKING_HEIGHT,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            max_reconnect_attempts: None,
            alert_kind: AlertKind::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    Captured {
        inferred: bool,
        triggered: bool,
        flushed: bool,
    },
    ReadFailed,
    Reconnected,
    ReconnectFailed,
    /// Reconnection abandoned; the worker stops.
    Failed,
    Cancelled,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub frames: u64,
    pub inferences: u64,
    pub inference_errors: u64,
    pub qualifying: u64,
    pub triggers: u64,
    pub alerts: u64,
    pub read_failures: u64,
}

pub struct CameraWorker {
    slot: Arc<CameraSlot>,
    source: Box<dyn FrameSource>,
    gate: Arc<InferenceGate>,
    debouncer: DetectionDebouncer,
    settings: WorkerSettings,
    alerts: Sender<AlertRequest>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    reconnect_attempts: u32,
    last_health_log: Instant,
    stats: WorkerStats,
}

impl CameraWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        slot: Arc<CameraSlot>,
        source: Box<dyn FrameSource>,
        gate: Arc<InferenceGate>,
        debouncer: DetectionDebouncer,
        settings: WorkerSettings,
        alerts: Sender<AlertRequest>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        let last_health_log = clock.now();
        Self {
            slot,
            source,
            gate,
            debouncer,
            settings,
            alerts,
            clock,
            cancel,
            reconnect_attempts: 0,
            last_health_log,
            stats: WorkerStats::default(),
        }
    }

    pub fn slot(&self) -> &Arc<CameraSlot> {
        &self.slot
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    pub fn debouncer(&self) -> &DetectionDebouncer {
        &self.debouncer
    }

    pub fn tick(&mut self) -> TickOutcome {
        if self.cancel.is_cancelled() {
            return TickOutcome::Cancelled;
        }
        match self.slot.state() {
            CameraState::Active => self.capture(),
            CameraState::Reconnecting => self.reconnect(),
            CameraState::Failed => TickOutcome::Failed,
        }
    }

    fn capture(&mut self) -> TickOutcome {
        let id = self.slot.id();
        let frame = match self.source.read_frame() {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("camera {}: read failed: {}", id, e);
                self.stats.read_failures += 1;
                self.source.close();
                self.reconnect_attempts = 0;
                self.slot.set_state(CameraState::Reconnecting);
                return TickOutcome::ReadFailed;
            }
        };

        let frame = frame.downsampled(self.settings.working_width, self.settings.working_height);
        self.slot.publish_latest(frame.clone());
        self.stats.frames += 1;

        let decimation = self.settings.decimation.max(1) as u64;
        if self.stats.frames % decimation != 0 {
            return TickOutcome::Captured {
                inferred: false,
                triggered: false,
                flushed: false,
            };
        }

        let detections = match self.gate.infer(frame.image(), &self.cancel) {
            Ok(detections) => detections,
            Err(InferenceError::Cancelled) => return TickOutcome::Cancelled,
            Err(e) => {
                log::error!("camera {}: {}", id, e);
                self.stats.inference_errors += 1;
                Vec::new()
            }
        };
        self.stats.inferences += 1;

        let threshold = self.gate.settings().threshold();
        let qualifying: Vec<Detection> = detections
            .into_iter()
            .filter(|d| d.qualifies(threshold))
            .collect();
        if !qualifying.is_empty() {
            self.stats.qualifying += 1;
        }

        let now = self.clock.now();
        let triggered = self.debouncer.observe(!qualifying.is_empty(), now);
        let mut flushed = false;
        if triggered {
            self.stats.triggers += 1;
            log::debug!(
                "camera {}: trigger on frame {} ({} detection(s))",
                id,
                frame.sequence(),
                qualifying.len()
            );
            let alert_frame = compose_alert_frame(&frame, &qualifying);
            if let Some(request) =
                self.slot
                    .buffer_alert_frame(alert_frame, now, self.settings.alert_kind)
            {
                flushed = true;
                self.stats.alerts += 1;
                if self.alerts.send(request).is_err() {
                    log::warn!("camera {}: dispatcher is gone, alert dropped", id);
                }
            }
        }

        TickOutcome::Captured {
            inferred: true,
            triggered,
            flushed,
        }
    }

    fn reconnect(&mut self) -> TickOutcome {
        let id = self.slot.id();
        if let Some(max) = self.settings.max_reconnect_attempts {
            if self.reconnect_attempts >= max {
                log::error!(
                    "camera {}: giving up after {} reconnect attempt(s)",
                    id,
                    self.reconnect_attempts
                );
                self.slot.set_state(CameraState::Failed);
                return TickOutcome::Failed;
            }
        }

        if self.cancel.wait_timeout(self.settings.reconnect_backoff) {
            return TickOutcome::Cancelled;
        }
        self.reconnect_attempts += 1;

        match open_feed(self.source.as_mut()) {
            Ok(()) => {
                log::info!(
                    "camera {}: reconnected after {} attempt(s)",
                    id,
                    self.reconnect_attempts
                );
                self.reconnect_attempts = 0;
                self.slot.set_state(CameraState::Active);
                TickOutcome::Reconnected
            }
            Err(e) => {
                log::warn!(
                    "camera {}: reconnect attempt {} failed: {}",
                    id,
                    self.reconnect_attempts,
                    e
                );
                TickOutcome::ReconnectFailed
            }
        }
    }

    fn maybe_log_health(&mut self) {
        let now = self.clock.now();
        if now.saturating_duration_since(self.last_health_log) < HEALTH_LOG_INTERVAL {
            return;
        }
        self.last_health_log = now;
        log::info!(
            "camera {}: {} frames={} inferences={} triggers={} alerts={} read_failures={} buffered={}",
            self.slot.id(),
            self.slot.state(),
            self.stats.frames,
            self.stats.inferences,
            self.stats.triggers,
            self.stats.alerts,
            self.stats.read_failures,
            self.slot.buffered_len()
        );
    }

    /// Tick until cancelled or abandoned. Hands the source back so the
    /// caller can close it.
    pub fn run(mut self) -> Box<dyn FrameSource> {
        log::info!(
            "camera {}: worker started on {}",
            self.slot.id(),
            self.source.describe()
        );
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| loop {
            self.maybe_log_health();
            match self.tick() {
                TickOutcome::Cancelled | TickOutcome::Failed => break,
                _ => {}
            }
        }));
        if let Err(payload) = outcome {
            // The joiner never gets the source back from a panicked thread.
            log::error!("camera {}: worker panicked, closing source", self.slot.id());
            self.source.close();
            panic::resume_unwind(payload);
        }
        log::info!(
            "camera {}: worker stopped ({} frames, {} alerts)",
            self.slot.id(),
            self.stats.frames,
            self.stats.alerts
        );
        self.source
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
