use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam::channel::unbounded;
use image::{Rgb, RgbImage};

use sentinela::alert::VideoAssembler;
use sentinela::camera::CameraState;
use sentinela::ingest::{SourceStats, SyntheticMode};
use sentinela::{
    AlertDispatcher, AlertKind, AlertRequest, BoundingBox, BufferedFrame, CameraId, CameraSlot,
    CameraWorker, CancellationToken, Clock, ConnectError, DeliveryError, Detection,
    DetectionBuffer, DetectionDebouncer, DetectorBackend, DispatchOutcome, FlushPolicy, Frame,
    FrameSource, InferenceGate, InferenceSettings, LogNotifier, ManualClock, MediaArtifact,
    MjpegAviAssembler, Notifier, Orchestrator, PipelineSettings, RateBudget, ReadError,
    SourceConfig, Subscriber, SyntheticSource, TickOutcome, WorkerSettings,
};

// ----------------------------------------------------------------------------
// Fixtures
// ----------------------------------------------------------------------------

struct AlwaysPerson;

impl DetectorBackend for AlwaysPerson {
    fn name(&self) -> &'static str {
        "always-person"
    }

    fn detect(&mut self, _image: &RgbImage) -> Result<Vec<Detection>> {
        Ok(vec![Detection::person(0.9, BoundingBox::new(10, 10, 30, 40))])
    }
}

/// Source whose reads always succeed.
struct SteadySource {
    camera: CameraId,
    sequence: u64,
}

impl FrameSource for SteadySource {
    fn camera_id(&self) -> CameraId {
        self.camera
    }

    fn describe(&self) -> String {
        format!("steady-{}", self.camera)
    }

    fn open(&mut self) -> Result<(), ConnectError> {
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame, ReadError> {
        self.sequence += 1;
        let image = RgbImage::from_pixel(64, 48, Rgb([90, 110, 130]));
        Ok(Frame::captured_now(image, self.sequence))
    }

    fn close(&mut self) {}

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.sequence,
            source: self.describe(),
        }
    }
}

/// Opens once, serves the probe frame, then fails every read and every
/// later open.
struct DyingSource {
    camera: CameraId,
    opens: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    reads: u64,
}

impl FrameSource for DyingSource {
    fn camera_id(&self) -> CameraId {
        self.camera
    }

    fn describe(&self) -> String {
        "dying".to_string()
    }

    fn open(&mut self) -> Result<(), ConnectError> {
        if self.opens.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(())
        } else {
            Err(ConnectError::Unreachable("camera offline".to_string()))
        }
    }

    fn read_frame(&mut self) -> Result<Frame, ReadError> {
        self.reads += 1;
        if self.reads == 1 {
            let image = RgbImage::from_pixel(32, 24, Rgb([200, 200, 200]));
            return Ok(Frame::captured_now(image, self.reads));
        }
        Err(ReadError::Timeout(Duration::from_millis(10)))
    }

    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: 1,
            source: "dying".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Sent {
    Photo(Subscriber),
    Video(Subscriber),
}

/// Records deliveries; refuses every subscriber listed in `refuse`.
#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<Sent>>,
    refuse: Vec<Subscriber>,
}

impl Recorder {
    fn refusing(refuse: &[&str]) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            refuse: refuse.iter().map(|s| Subscriber::new(*s)).collect(),
        }
    }

    fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    fn check(&self, subscriber: &Subscriber) -> Result<(), DeliveryError> {
        if self.refuse.contains(subscriber) {
            return Err(DeliveryError::Rejected {
                status: 403,
                description: "bot was blocked by the user".to_string(),
            });
        }
        Ok(())
    }
}

impl Notifier for Recorder {
    fn name(&self) -> &'static str {
        "recorder"
    }

    fn send_text(&self, subscriber: &Subscriber, _text: &str) -> Result<(), DeliveryError> {
        self.check(subscriber)
    }

    fn send_photo(
        &self,
        subscriber: &Subscriber,
        jpeg: &[u8],
        _caption: &str,
    ) -> Result<(), DeliveryError> {
        self.check(subscriber)?;
        assert!(jpeg.starts_with(&[0xFF, 0xD8]));
        self.sent.lock().unwrap().push(Sent::Photo(subscriber.clone()));
        Ok(())
    }

    fn send_video(
        &self,
        subscriber: &Subscriber,
        video: &MediaArtifact,
        caption: &str,
    ) -> Result<(), DeliveryError> {
        self.check(subscriber)?;
        assert!(video.path().exists());
        assert!(caption.starts_with("Camera 1: 6 detections"));
        self.sent.lock().unwrap().push(Sent::Video(subscriber.clone()));
        Ok(())
    }
}

struct BrokenAssembler;

impl VideoAssembler for BrokenAssembler {
    fn assemble(
        &self,
        camera: CameraId,
        _frames: &[BufferedFrame],
    ) -> Result<MediaArtifact, sentinela::EncodeError> {
        Err(sentinela::EncodeError::Empty(camera))
    }
}

fn subscribers(ids: &[&str]) -> Arc<Vec<Subscriber>> {
    Arc::new(ids.iter().map(|id| Subscriber::new(*id)).collect())
}

fn request(camera: CameraId, frames: usize, kind: AlertKind, clock: &ManualClock) -> AlertRequest {
    let frames = (0..frames)
        .map(|i| {
            let image = RgbImage::from_pixel(32, 24, Rgb([40, 40, 40]));
            let at = clock.now() + Duration::from_millis(200 * i as u64);
            BufferedFrame::new(Frame::new(image, at, clock.wall(), i as u64), at)
        })
        .collect();
    AlertRequest {
        camera,
        frames,
        kind,
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

// ----------------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------------

#[test]
fn qualifying_ticks_flow_through_to_a_video_alert_for_every_subscriber() -> Result<()> {
    let media = tempfile::tempdir()?;
    let clock = Arc::new(ManualClock::new());
    let (tx, rx) = unbounded();

    let slot = Arc::new(CameraSlot::new(
        CameraId(1),
        "steady-1",
        DetectionBuffer::new(
            30,
            FlushPolicy {
                video_threshold: 6,
                max_wait: Duration::from_secs(10),
            },
        ),
    ));
    let gate = Arc::new(InferenceGate::new(
        Box::new(AlwaysPerson),
        Arc::new(InferenceSettings::new(true, 0.5)),
    ));
    let mut worker = CameraWorker::new(
        slot.clone(),
        Box::new(SteadySource {
            camera: CameraId(1),
            sequence: 0,
        }),
        gate,
        DetectionDebouncer::new(3, Duration::from_secs(2)),
        WorkerSettings {
            decimation: 1,
            working_width: 64,
            working_height: 48,
            ..WorkerSettings::default()
        },
        tx,
        clock.clone(),
        CancellationToken::new(),
    );

    // Three qualifying ticks inside the interval fire exactly one trigger.
    let mut outcomes = Vec::new();
    for _ in 0..3 {
        clock.advance(Duration::from_millis(100));
        outcomes.push(worker.tick());
    }
    let triggers = outcomes
        .iter()
        .filter(|o| matches!(o, TickOutcome::Captured { triggered: true, .. }))
        .count();
    assert_eq!(triggers, 1);
    assert_eq!(worker.debouncer().count(), 0);
    assert_eq!(slot.buffered_len(), 1);

    // Five more triggers fill the buffer to the clip threshold.
    for _ in 0..15 {
        clock.advance(Duration::from_millis(100));
        worker.tick();
    }
    assert_eq!(slot.buffered_len(), 0);
    let request = rx.try_recv()?;
    assert_eq!(request.camera, CameraId(1));
    assert_eq!(request.frames.len(), 6);
    assert_eq!(request.kind, AlertKind::Video);
    assert!(rx.try_recv().is_err());

    let recorder = Arc::new(Recorder::default());
    let dispatcher = AlertDispatcher::new(
        RateBudget::new(19, Duration::from_secs(3)),
        recorder.clone(),
        Arc::new(MjpegAviAssembler::new(media.path(), 10)),
        subscribers(&["S1", "S2"]),
        clock.clone(),
    )
    .with_video_threshold(6);

    let outcome = dispatcher.dispatch(request);
    assert_eq!(
        outcome,
        DispatchOutcome::Delivered {
            delivered: 2,
            failed: 0,
            skipped: 0
        }
    );
    assert_eq!(
        recorder.sent(),
        vec![
            Sent::Video(Subscriber::new("S1")),
            Sent::Video(Subscriber::new("S2"))
        ]
    );
    assert_eq!(dispatcher.sent_in_window(), 2);
    assert!(dir_is_empty(media.path())?);
    Ok(())
}

fn dir_is_empty(path: &Path) -> Result<bool> {
    Ok(std::fs::read_dir(path)?.next().is_none())
}

#[test]
fn failed_clip_falls_back_to_a_photo() {
    let clock = Arc::new(ManualClock::new());
    let recorder = Arc::new(Recorder::default());
    let dispatcher = AlertDispatcher::new(
        RateBudget::new(19, Duration::from_secs(3)),
        recorder.clone(),
        Arc::new(BrokenAssembler),
        subscribers(&["S1"]),
        clock.clone(),
    );

    let outcome = dispatcher.dispatch(request(CameraId(1), 8, AlertKind::Video, &clock));
    assert!(matches!(outcome, DispatchOutcome::Delivered { delivered: 1, .. }));
    assert_eq!(recorder.sent(), vec![Sent::Photo(Subscriber::new("S1"))]);
}

#[test]
fn refused_subscriber_does_not_block_the_rest() {
    let clock = Arc::new(ManualClock::new());
    let recorder = Arc::new(Recorder::refusing(&["blocked"]));
    let dispatcher = AlertDispatcher::new(
        RateBudget::new(19, Duration::from_secs(3)),
        recorder.clone(),
        Arc::new(BrokenAssembler),
        subscribers(&["blocked", "S2"]),
        clock.clone(),
    );

    let outcome = dispatcher.dispatch(request(CameraId(2), 3, AlertKind::Photo, &clock));
    assert_eq!(
        outcome,
        DispatchOutcome::Delivered {
            delivered: 1,
            failed: 1,
            skipped: 0
        }
    );
    assert_eq!(recorder.sent(), vec![Sent::Photo(Subscriber::new("S2"))]);
    assert_eq!(dispatcher.sent_in_window(), 1);
}

#[test]
fn dispatcher_drains_queued_requests_after_cancel() {
    let clock = Arc::new(ManualClock::new());
    let recorder = Arc::new(Recorder::default());
    let dispatcher = AlertDispatcher::new(
        RateBudget::new(19, Duration::from_secs(3)),
        recorder.clone(),
        Arc::new(BrokenAssembler),
        subscribers(&["S1"]),
        clock.clone(),
    );

    let (tx, rx) = unbounded();
    tx.send(request(CameraId(1), 1, AlertKind::Photo, &clock)).unwrap();
    tx.send(request(CameraId(1), 3, AlertKind::Photo, &clock)).unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    dispatcher.run(rx, cancel);

    let stats = dispatcher.stats();
    assert_eq!(stats.requests.load(Ordering::Relaxed), 2);
    assert_eq!(stats.discarded.load(Ordering::Relaxed), 1);
    assert_eq!(recorder.sent().len(), 1);
    // The single-frame request consumed no budget.
    assert_eq!(dispatcher.sent_in_window(), 1);
}

#[test]
fn dispatcher_thread_stops_promptly_during_a_paced_fan_out() {
    let clock: Arc<dyn Clock> = Arc::new(sentinela::SystemClock);
    let recorder = Arc::new(Recorder::default());
    let dispatcher = Arc::new(AlertDispatcher::new(
        RateBudget::new(19, Duration::from_secs(3)),
        recorder.clone(),
        Arc::new(BrokenAssembler),
        subscribers(&["S1", "S2", "S3", "S4"]),
        clock,
    ));

    let manual = ManualClock::new();
    let (tx, rx) = unbounded();
    let cancel = CancellationToken::new();
    let handle = {
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        std::thread::spawn(move || dispatcher.run(rx, cancel))
    };
    tx.send(request(CameraId(1), 2, AlertKind::Photo, &manual)).unwrap();

    std::thread::sleep(Duration::from_millis(300));
    let started = Instant::now();
    cancel.cancel();
    handle.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(2), "join took {:?}", started.elapsed());
    assert_eq!(recorder.sent(), vec![Sent::Photo(Subscriber::new("S1"))]);
}

#[test]
fn dead_camera_keeps_reconnecting_and_shutdown_still_completes() -> Result<()> {
    let opens = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));

    let blank = SyntheticSource::new(
        SourceConfig::new(CameraId(3), "stub://blank?mode=blank"),
        SyntheticMode::Blank,
        32,
        24,
    );
    let sources: Vec<Box<dyn FrameSource>> = vec![
        Box::new(SteadySource {
            camera: CameraId(1),
            sequence: 0,
        }),
        Box::new(DyingSource {
            camera: CameraId(2),
            opens: opens.clone(),
            closes: closes.clone(),
            reads: 0,
        }),
        Box::new(blank),
    ];

    let clock: Arc<dyn Clock> = Arc::new(sentinela::SystemClock);
    let gate = Arc::new(InferenceGate::new(
        Box::new(sentinela::StubBackend::new()),
        Arc::new(InferenceSettings::default()),
    ));
    let dispatcher = Arc::new(AlertDispatcher::new(
        RateBudget::new(19, Duration::from_secs(3)),
        Arc::new(LogNotifier::new()),
        Arc::new(BrokenAssembler),
        subscribers(&[]),
        clock.clone(),
    ));
    let settings = PipelineSettings {
        worker: WorkerSettings {
            working_width: 64,
            working_height: 48,
            reconnect_backoff: Duration::from_millis(20),
            ..WorkerSettings::default()
        },
        ..PipelineSettings::default()
    };

    let orchestrator = Orchestrator::start(sources, gate, dispatcher, settings, clock)?;
    assert_eq!(orchestrator.skipped(), &[CameraId(3)]);
    assert_eq!(orchestrator.registry().len(), 2);

    let registry = orchestrator.registry().clone();
    let dying = registry.get(CameraId(2)).expect("camera 2 registered");
    let steady = registry.get(CameraId(1)).expect("camera 1 registered");
    assert!(wait_until(Duration::from_secs(2), || {
        opens.load(Ordering::SeqCst) >= 3
    }));
    assert_eq!(dying.state(), CameraState::Reconnecting);
    assert_eq!(steady.state(), CameraState::Active);
    assert!(steady.latest().is_some());
    assert_eq!(registry.active_ids(), vec![CameraId(1)]);

    let started = Instant::now();
    orchestrator.shutdown();
    assert!(started.elapsed() < Duration::from_secs(3));
    // Closed once on the failed read and once more at shutdown.
    assert!(closes.load(Ordering::SeqCst) >= 2);
    Ok(())
}
