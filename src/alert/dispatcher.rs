use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Local};
use crossbeam::channel::{Receiver, RecvTimeoutError};

use crate::alert::notify::Notifier;
use crate::alert::rate::{RateBudget, Throttle};
use crate::alert::video::{MediaArtifact, VideoAssembler};
use crate::camera::{AlertKind, AlertRequest};
use crate::cancel::CancellationToken;
use crate::clock::Clock;
use crate::frame::DEFAULT_VIDEO_THRESHOLD;
use crate::store::{Subscriber, SubscriberSource};
use crate::CameraId;

/// Requests with fewer frames are not worth an alert.
pub const MIN_ALERT_FRAMES: usize = 2;

const RECV_SLICE: Duration = Duration::from_millis(200);

/// What the caption says about an alert.
#[derive(Clone, Debug, PartialEq)]
pub struct AlertSummary {
    pub camera: CameraId,
    pub frame_count: usize,
    /// Oldest to newest buffered frame.
    pub span: Duration,
    pub last_detection: DateTime<Local>,
}

impl AlertSummary {
    pub fn from_request(request: &AlertRequest) -> Option<Self> {
        let first = request.frames.first()?;
        let last = request.frames.last()?;
        Some(Self {
            camera: request.camera,
            frame_count: request.frames.len(),
            span: last.buffered_at.saturating_duration_since(first.buffered_at),
            last_detection: last.frame.captured_wall(),
        })
    }

    pub fn caption(&self) -> String {
        format!(
            "Camera {}: {} detections in {:.1}s. Last detection at {}",
            self.camera,
            self.frame_count,
            self.span.as_secs_f32(),
            self.last_detection.format("%H:%M:%S")
        )
    }
}

#[derive(Debug, PartialEq)]
pub enum DispatchOutcome {
    /// Fewer than `MIN_ALERT_FRAMES`; no budget consumed.
    Discarded,
    /// Dropped by the rate budget.
    Throttled(Throttle),
    NoSubscribers,
    /// Fan-out finished. `skipped` subscribers were not attempted because the
    /// minute cap was reached or shutdown began mid fan-out.
    Delivered {
        delivered: usize,
        failed: usize,
        skipped: usize,
    },
    /// Nothing could be encoded, or the subscriber list was unavailable.
    Failed,
}

#[derive(Debug, Default)]
pub struct DispatchStats {
    pub requests: AtomicU64,
    pub discarded: AtomicU64,
    pub throttled: AtomicU64,
    pub delivered: AtomicU64,
    pub failed: AtomicU64,
}

enum Media {
    Video(MediaArtifact),
    Photo(Vec<u8>),
}

/// Single serialization point in front of the notification channel.
///
/// The rate budget mutex doubles as the global send lock: it is held from
/// the budget check until the last delivery of a fan-out.
pub struct AlertDispatcher {
    budget: Mutex<RateBudget>,
    notifier: Arc<dyn Notifier>,
    assembler: Arc<dyn VideoAssembler>,
    subscribers: Arc<dyn SubscriberSource>,
    clock: Arc<dyn Clock>,
    video_threshold: usize,
    stats: DispatchStats,
}

impl AlertDispatcher {
    pub fn new(
        budget: RateBudget,
        notifier: Arc<dyn Notifier>,
        assembler: Arc<dyn VideoAssembler>,
        subscribers: Arc<dyn SubscriberSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            budget: Mutex::new(budget),
            notifier,
            assembler,
            subscribers,
            clock,
            video_threshold: DEFAULT_VIDEO_THRESHOLD,
            stats: DispatchStats::default(),
        }
    }

    /// Minimum frames for a request to be sent as a clip.
    pub fn with_video_threshold(mut self, video_threshold: usize) -> Self {
        self.video_threshold = video_threshold.max(1);
        self
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    fn lock_budget(&self) -> MutexGuard<'_, RateBudget> {
        self.budget.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliveries inside the rolling minute.
    pub fn sent_in_window(&self) -> u32 {
        let now = self.clock.now();
        self.lock_budget().sent_in_window(now)
    }

    /// Dispatch with pacing waits that cannot be interrupted.
    pub fn dispatch(&self, request: AlertRequest) -> DispatchOutcome {
        self.dispatch_until(request, &CancellationToken::new())
    }

    /// Dispatch one request. A cancel during a pacing wait ends the fan-out
    /// and the remaining subscribers count as skipped.
    pub fn dispatch_until(
        &self,
        request: AlertRequest,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);

        let summary = match AlertSummary::from_request(&request) {
            Some(summary) if request.frames.len() >= MIN_ALERT_FRAMES => summary,
            _ => {
                log::debug!(
                    "camera {}: discarding alert with {} frame(s)",
                    request.camera,
                    request.frames.len()
                );
                self.stats.discarded.fetch_add(1, Ordering::Relaxed);
                return DispatchOutcome::Discarded;
            }
        };

        let mut budget = self.lock_budget();
        if let Err(throttle) = budget.check(self.clock.now()) {
            log::info!("camera {}: alert throttled: {}", request.camera, throttle);
            self.stats.throttled.fetch_add(1, Ordering::Relaxed);
            return DispatchOutcome::Throttled(throttle);
        }

        let subscribers = match self.subscribers.subscribers() {
            Ok(subscribers) if subscribers.is_empty() => {
                log::info!("camera {}: alert has no subscribers", request.camera);
                return DispatchOutcome::NoSubscribers;
            }
            Ok(subscribers) => subscribers,
            Err(e) => {
                log::error!("camera {}: cannot load subscribers: {:#}", request.camera, e);
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                return DispatchOutcome::Failed;
            }
        };

        let Some(media) = self.prepare_media(&request) else {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            return DispatchOutcome::Failed;
        };
        let caption = summary.caption();

        let (mut delivered, mut failed, mut skipped) = (0, 0, 0);
        for (i, subscriber) in subscribers.iter().enumerate() {
            match budget.wait_needed(self.clock.now()) {
                Some(wait) if wait.is_zero() => {}
                Some(wait) => {
                    if self.clock.sleep_or_cancel(wait, cancel) {
                        skipped = subscribers.len() - i;
                        log::info!(
                            "camera {}: shutting down, {} subscriber(s) skipped",
                            request.camera,
                            skipped
                        );
                        break;
                    }
                }
                None => {
                    skipped = subscribers.len() - i;
                    log::warn!(
                        "camera {}: minute cap reached, {} subscriber(s) skipped",
                        request.camera,
                        skipped
                    );
                    break;
                }
            }

            match self.deliver(subscriber, &media, &caption) {
                Ok(()) => {
                    budget.record(self.clock.now());
                    delivered += 1;
                }
                Err(e) => {
                    log::warn!(
                        "camera {}: delivery to {} via {} failed: {}",
                        request.camera,
                        subscriber,
                        self.notifier.name(),
                        e
                    );
                    failed += 1;
                }
            }
        }

        self.stats
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        log::info!(
            "camera {}: alert delivered to {}/{} subscriber(s)",
            request.camera,
            delivered,
            subscribers.len()
        );
        DispatchOutcome::Delivered {
            delivered,
            failed,
            skipped,
        }
    }

    fn deliver(
        &self,
        subscriber: &Subscriber,
        media: &Media,
        caption: &str,
    ) -> Result<(), crate::error::DeliveryError> {
        match media {
            Media::Video(artifact) => self.notifier.send_video(subscriber, artifact, caption),
            Media::Photo(jpeg) => self.notifier.send_photo(subscriber, jpeg, caption),
        }
    }

    /// Clip when requested and long enough, otherwise the newest frame as a
    /// still. A failed clip falls back to the still.
    fn prepare_media(&self, request: &AlertRequest) -> Option<Media> {
        if request.kind == AlertKind::Video && request.frames.len() >= self.video_threshold {
            match self.assembler.assemble(request.camera, &request.frames) {
                Ok(artifact) => return Some(Media::Video(artifact)),
                Err(e) => log::warn!(
                    "camera {}: video assembly failed, sending photo: {}",
                    request.camera,
                    e
                ),
            }
        }

        let frame = request.latest_frame()?;
        match frame.to_jpeg() {
            Ok(jpeg) => Some(Media::Photo(jpeg)),
            Err(e) => {
                log::error!("camera {}: dropping alert, photo encode failed: {}", request.camera, e);
                None
            }
        }
    }

    /// Consume requests until cancelled, then drain whatever is still queued.
    pub fn run(&self, requests: Receiver<AlertRequest>, cancel: CancellationToken) {
        loop {
            match requests.recv_timeout(RECV_SLICE) {
                Ok(request) => {
                    self.dispatch_until(request, &cancel);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }

        let mut drained = 0;
        for request in requests.try_iter() {
            self.dispatch_until(request, &cancel);
            drained += 1;
        }
        if drained > 0 {
            log::info!("dispatcher drained {} queued alert(s)", drained);
        }
    }
}
