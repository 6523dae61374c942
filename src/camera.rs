//! Per-camera state record.
//!
//! A `CameraSlot` holds everything about one camera that is read from more
//! than one thread: connection state, the latest frame, and the detection
//! buffer. Each slot has its own locks; no lock spans cameras.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::Deserialize;

use crate::frame::{BufferedFrame, DetectionBuffer, Frame};
use crate::CameraId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CameraState {
    Active,
    Reconnecting,
    Failed,
}

impl fmt::Display for CameraState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CameraState::Active => "active",
            CameraState::Reconnecting => "reconnecting",
            CameraState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// How a flushed buffer should be delivered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Photo,
    #[default]
    Video,
}

/// Drained buffer contents on their way to the dispatcher.
#[derive(Debug)]
pub struct AlertRequest {
    pub camera: CameraId,
    /// Oldest first.
    pub frames: Vec<BufferedFrame>,
    pub kind: AlertKind,
}

impl AlertRequest {
    pub fn latest_frame(&self) -> Option<&Frame> {
        self.frames.last().map(|buffered| &buffered.frame)
    }
}

#[derive(Debug)]
pub struct CameraSlot {
    id: CameraId,
    source: String,
    state: Mutex<CameraState>,
    buffer: Mutex<DetectionBuffer>,
    latest: Mutex<Option<Frame>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl CameraSlot {
    /// New slot. Only cameras that opened successfully get one, so the
    /// initial state is `Active`.
    pub fn new(id: CameraId, source: impl Into<String>, buffer: DetectionBuffer) -> Self {
        Self {
            id,
            source: source.into(),
            state: Mutex::new(CameraState::Active),
            buffer: Mutex::new(buffer),
            latest: Mutex::new(None),
        }
    }

    pub fn id(&self) -> CameraId {
        self.id
    }

    /// Redacted source description, safe to log.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn state(&self) -> CameraState {
        *lock(&self.state)
    }

    /// Returns the previous state.
    pub fn set_state(&self, next: CameraState) -> CameraState {
        let mut state = lock(&self.state);
        let previous = *state;
        if previous != next {
            log::info!("camera {}: {} -> {}", self.id, previous, next);
            *state = next;
        }
        previous
    }

    pub fn publish_latest(&self, frame: Frame) {
        *lock(&self.latest) = Some(frame);
    }

    pub fn latest(&self) -> Option<Frame> {
        lock(&self.latest).clone()
    }

    /// Append an alert frame. If the flush condition now holds, the buffer is
    /// drained into a request while the lock is still held.
    pub fn buffer_alert_frame(
        &self,
        frame: Frame,
        buffered_at: Instant,
        kind: AlertKind,
    ) -> Option<AlertRequest> {
        let mut buffer = lock(&self.buffer);
        let frames = buffer.append(BufferedFrame::new(frame, buffered_at))?;
        log::debug!("camera {}: flushed {} buffered frames", self.id, frames.len());
        Some(AlertRequest {
            camera: self.id,
            frames,
            kind,
        })
    }

    pub fn buffered_len(&self) -> usize {
        lock(&self.buffer).len()
    }
}

/// Slots for every camera that opened, in configuration order.
#[derive(Clone, Debug, Default)]
pub struct CameraRegistry {
    slots: Vec<Arc<CameraSlot>>,
}

impl CameraRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, slot: Arc<CameraSlot>) {
        self.slots.push(slot);
    }

    pub fn get(&self, id: CameraId) -> Option<Arc<CameraSlot>> {
        self.slots.iter().find(|slot| slot.id() == id).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<CameraSlot>> {
        self.slots.iter()
    }

    pub fn active_ids(&self) -> Vec<CameraId> {
        self.slots
            .iter()
            .filter(|slot| slot.state() == CameraState::Active)
            .map(|slot| slot.id())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FlushPolicy;
    use image::{Rgb, RgbImage};
    use std::time::Duration;

    fn frame(seq: u64) -> Frame {
        Frame::captured_now(RgbImage::from_pixel(8, 8, Rgb([50, 50, 50])), seq)
    }

    #[test]
    fn flush_produces_request_and_empties_buffer() {
        let slot = CameraSlot::new(CameraId(1), "stub://a", DetectionBuffer::default());
        let t0 = Instant::now();
        for seq in 0..4 {
            assert!(slot
                .buffer_alert_frame(frame(seq), t0, AlertKind::Video)
                .is_none());
        }
        let request = slot
            .buffer_alert_frame(frame(4), t0, AlertKind::Video)
            .expect("flush at video threshold");
        assert_eq!(request.camera, CameraId(1));
        assert_eq!(request.frames.len(), 5);
        assert_eq!(request.latest_frame().map(|f| f.sequence()), Some(4));
        assert_eq!(slot.buffered_len(), 0);
    }

    #[test]
    fn cameras_have_independent_buffers() {
        let policy = FlushPolicy {
            video_threshold: 2,
            max_wait: Duration::from_secs(10),
        };
        let a = Arc::new(CameraSlot::new(
            CameraId(1),
            "stub://a",
            DetectionBuffer::new(30, policy),
        ));
        let b = Arc::new(CameraSlot::new(
            CameraId(2),
            "stub://b",
            DetectionBuffer::new(30, policy),
        ));
        let now = Instant::now();
        assert!(a.buffer_alert_frame(frame(0), now, AlertKind::Photo).is_none());
        assert!(b.buffer_alert_frame(frame(0), now, AlertKind::Photo).is_none());
        let request = a
            .buffer_alert_frame(frame(1), now, AlertKind::Photo)
            .expect("camera a flush");
        assert_eq!(request.camera, CameraId(1));
        assert_eq!(b.buffered_len(), 1);

        let mut registry = CameraRegistry::new();
        registry.insert(a.clone());
        registry.insert(b.clone());
        b.set_state(CameraState::Reconnecting);
        assert_eq!(registry.active_ids(), vec![CameraId(1)]);
        assert!(registry.get(CameraId(2)).is_some());
        assert!(registry.get(CameraId(3)).is_none());
    }
}
