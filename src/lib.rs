//! Sentinela
//!
//! Multi-camera person detection with debounced, rate-limited alerts.
//!
//! # Architecture
//!
//! Every camera runs on its own thread:
//!
//! ```text
//! FrameSource -> CameraWorker -> InferenceGate -> DetectionDebouncer
//!                                              -> DetectionBuffer -> AlertDispatcher -> Notifier
//! ```
//!
//! - Inference is serialized through one `InferenceGate` shared by all cameras.
//! - Each camera owns its debounce state and buffer behind its own lock, so
//!   cameras never contend with each other.
//! - The `AlertDispatcher` is the only path to the notification channel and
//!   enforces the process-wide `RateBudget`.
//!
//! # Module Structure
//!
//! - `ingest`: frame sources (synthetic, HTTP MJPEG/JPEG, RTSP)
//! - `detect`: detector backends and the inference gate
//! - `frame`: frames, alert-frame composition, the detection buffer
//! - `debounce`, `camera`, `worker`: per-camera state and loop
//! - `alert`: rate budget, dispatcher, notifiers, video assembly
//! - `store`, `commands`, `telegram`: subscriber store and bot surface
//! - `orchestrator`: lifecycle

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod alert;
pub mod camera;
pub mod cancel;
pub mod clock;
pub mod commands;
pub mod config;
pub mod debounce;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod orchestrator;
pub mod store;
pub mod telegram;
pub mod worker;

pub use alert::{
    AlertDispatcher, AlertSummary, DispatchOutcome, LogNotifier, MediaArtifact, MjpegAviAssembler,
    Notifier, RateBudget, VideoAssembler,
};
pub use camera::{AlertKind, AlertRequest, CameraRegistry, CameraSlot, CameraState};
pub use cancel::CancellationToken;
pub use clock::{Clock, ManualClock, SystemClock};
pub use commands::{CommandProcessor, IncomingMessage, Reply};
pub use config::SentinelConfig;
pub use debounce::DetectionDebouncer;
pub use detect::{
    BoundingBox, Detection, DetectorBackend, InferenceGate, InferenceSettings, ObjectClass,
    StubBackend,
};
pub use error::{ConnectError, DeliveryError, EncodeError, InferenceError, ReadError};
pub use frame::{compose_alert_frame, BufferedFrame, DetectionBuffer, FlushPolicy, Frame};
pub use ingest::{open_feed, FrameSource, SourceConfig, SyntheticSource};
pub use orchestrator::{build_sources, Orchestrator, PipelineSettings};
pub use store::{JsonStore, Subscriber, SubscriberSource};
pub use worker::{CameraWorker, TickOutcome, WorkerSettings};

/// Camera identifier. Small positive integer, unique per source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraId(pub u16);

impl CameraId {
    pub fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
