//! Alert delivery.
//!
//! - `rate`: the process-wide `RateBudget`
//! - `dispatcher`: turns flushed buffers into deliveries under the budget
//! - `notify`: the outbound channel trait and a log-only implementation
//! - `video`: clip assembly and on-disk media artifacts
//! - `video_ffmpeg`: in-process MP4 encoding (feature `video-ffmpeg`)

pub mod dispatcher;
pub mod notify;
pub mod rate;
pub mod video;
#[cfg(feature = "video-ffmpeg")]
pub mod video_ffmpeg;

pub use dispatcher::{AlertDispatcher, AlertSummary, DispatchOutcome, DispatchStats, MIN_ALERT_FRAMES};
pub use notify::{LogNotifier, Notifier};
pub use rate::{RateBudget, Throttle, DEFAULT_MAX_PER_MINUTE, DEFAULT_MIN_INTERVAL};
pub use video::{MediaArtifact, MjpegAviAssembler, VideoAssembler, DEFAULT_VIDEO_FPS};
#[cfg(feature = "video-ffmpeg")]
pub use video_ffmpeg::FfmpegAssembler;
