//! Frames and the per-camera detection buffer.
//!
//! - `Frame`: immutable captured image. Annotation always works on a copy.
//! - `BufferedFrame`: a frame plus the instant it entered a buffer.
//! - `DetectionBuffer`: bounded FIFO of alert frames with a flush condition.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};

use crate::detect::{BoundingBox, Detection};
use crate::error::EncodeError;

pub const DEFAULT_BUFFER_CAPACITY: usize = 30;
pub const DEFAULT_VIDEO_THRESHOLD: usize = 5;
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(10);

/// Luma at or below this counts as near-black.
pub const DARK_LUMA: u8 = 10;
/// Fraction of near-black pixels at which a feed is considered blank.
pub const BLANK_FRACTION: f32 = 0.8;

const JPEG_QUALITY: u8 = 85;
const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_THICKNESS: u32 = 2;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// Captured frame. Cloning shares the pixel data.
#[derive(Clone, Debug)]
pub struct Frame {
    image: Arc<RgbImage>,
    captured_at: Instant,
    captured_wall: DateTime<Local>,
    sequence: u64,
}

impl Frame {
    pub fn new(
        image: RgbImage,
        captured_at: Instant,
        captured_wall: DateTime<Local>,
        sequence: u64,
    ) -> Self {
        Self {
            image: Arc::new(image),
            captured_at,
            captured_wall,
            sequence,
        }
    }

    /// Frame stamped with the current time.
    pub fn captured_now(image: RgbImage, sequence: u64) -> Self {
        Self::new(image, Instant::now(), Local::now(), sequence)
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn captured_wall(&self) -> DateTime<Local> {
        self.captured_wall
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Same capture metadata, different pixels.
    fn with_image(&self, image: RgbImage) -> Frame {
        Frame {
            image: Arc::new(image),
            captured_at: self.captured_at,
            captured_wall: self.captured_wall,
            sequence: self.sequence,
        }
    }

    /// Resize to the working resolution. No-op when already that size.
    pub fn downsampled(&self, width: u32, height: u32) -> Frame {
        if self.width() == width && self.height() == height {
            return self.clone();
        }
        self.with_image(imageops::resize(
            self.image.as_ref(),
            width,
            height,
            FilterType::Triangle,
        ))
    }

    /// Fraction of pixels whose luma is at or below `DARK_LUMA`.
    pub fn dark_fraction(&self) -> f32 {
        let total = self.image.width() as u64 * self.image.height() as u64;
        if total == 0 {
            return 1.0;
        }
        let dark = self
            .image
            .pixels()
            .filter(|p| luma(p) <= DARK_LUMA)
            .count() as u64;
        dark as f32 / total as f32
    }

    pub fn is_blank(&self) -> bool {
        self.dark_fraction() >= BLANK_FRACTION
    }

    /// Copy of this frame with detection boxes drawn.
    pub fn annotated(&self, detections: &[Detection]) -> Frame {
        let mut image = self.image.as_ref().clone();
        for detection in detections {
            draw_box(&mut image, detection.bbox, 0);
        }
        self.with_image(image)
    }

    pub fn to_jpeg(&self) -> Result<Vec<u8>, EncodeError> {
        encode_jpeg(&self.image, JPEG_QUALITY)
    }
}

pub(crate) fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, EncodeError> {
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, quality).encode_image(image)?;
    Ok(bytes)
}

pub(crate) fn luma(p: &Rgb<u8>) -> u8 {
    let [r, g, b] = p.0;
    (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32).round() as u8
}

fn draw_box(image: &mut RgbImage, bbox: BoundingBox, x_offset: u32) {
    let (width, height) = image.dimensions();
    let bbox = bbox.clamp_to(width.saturating_sub(x_offset), height);
    if bbox.is_empty() {
        return;
    }
    let x1 = bbox.x1 + x_offset;
    let x2 = bbox.x2 + x_offset - 1;
    let y2 = bbox.y2 - 1;
    for t in 0..BOX_THICKNESS {
        for x in x1..=x2 {
            for y in [bbox.y1 + t, y2.saturating_sub(t)] {
                if y < height {
                    image.put_pixel(x, y, BOX_COLOR);
                }
            }
        }
        for y in bbox.y1..=y2 {
            for x in [x1 + t, x2.saturating_sub(t)] {
                if x < width {
                    image.put_pixel(x, y, BOX_COLOR);
                }
            }
        }
    }
}

/// Side-by-side alert frame: the full frame on the left, the first detection
/// zoomed and centred on the right.
pub fn compose_alert_frame(frame: &Frame, detections: &[Detection]) -> Frame {
    let (width, height) = (frame.width(), frame.height());
    let mut canvas = RgbImage::new(width * 2, height);
    imageops::replace(&mut canvas, frame.image(), 0, 0);

    if let Some(first) = detections.first() {
        let roi = first.bbox.clamp_to(width, height);
        if !roi.is_empty() {
            let crop =
                imageops::crop_imm(frame.image(), roi.x1, roi.y1, roi.width(), roi.height())
                    .to_image();
            let aspect = roi.width() as f32 / roi.height() as f32;
            let (new_w, new_h) = if height as f32 * aspect <= width as f32 {
                (((height as f32 * aspect) as u32).max(1), height)
            } else {
                (width, ((width as f32 / aspect) as u32).max(1))
            };
            let zoomed = imageops::resize(&crop, new_w, new_h, FilterType::Triangle);
            let x_offset = width + (width - new_w) / 2;
            let y_offset = (height - new_h) / 2;
            imageops::replace(&mut canvas, &zoomed, x_offset as i64, y_offset as i64);
        }
        for detection in detections {
            draw_box(&mut canvas, detection.bbox.clamp_to(width, height), 0);
        }
    }

    frame.with_image(canvas)
}

// ----------------------------------------------------------------------------
// DetectionBuffer
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct BufferedFrame {
    pub frame: Frame,
    pub buffered_at: Instant,
}

impl BufferedFrame {
    pub fn new(frame: Frame, buffered_at: Instant) -> Self {
        Self { frame, buffered_at }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlushPolicy {
    /// Buffer length that is enough for a clip.
    pub video_threshold: usize,
    /// Oldest-to-newest span after which the buffer is flushed regardless.
    pub max_wait: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            video_threshold: DEFAULT_VIDEO_THRESHOLD,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }
}

/// Bounded ring of alert frames for one camera. Oldest evicted first.
///
/// Not synchronized itself; `CameraSlot` owns it behind the camera's lock.
#[derive(Debug)]
pub struct DetectionBuffer {
    frames: VecDeque<BufferedFrame>,
    capacity: usize,
    policy: FlushPolicy,
}

impl DetectionBuffer {
    pub fn new(capacity: usize, policy: FlushPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
            policy,
        }
    }

    /// Push without checking the flush condition.
    pub fn push(&mut self, frame: BufferedFrame) {
        while self.frames.len() >= self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    /// Push, then drain everything if the flush condition holds.
    pub fn append(&mut self, frame: BufferedFrame) -> Option<Vec<BufferedFrame>> {
        self.push(frame);
        if self.should_flush() {
            Some(self.drain())
        } else {
            None
        }
    }

    pub fn should_flush(&self) -> bool {
        !self.frames.is_empty()
            && (self.frames.len() >= self.policy.video_threshold
                || self.span() >= self.policy.max_wait)
    }

    /// Time between the oldest and newest buffered frame.
    pub fn span(&self) -> Duration {
        match (self.frames.front(), self.frames.back()) {
            (Some(oldest), Some(newest)) => newest
                .buffered_at
                .saturating_duration_since(oldest.buffered_at),
            _ => Duration::ZERO,
        }
    }

    pub fn drain(&mut self) -> Vec<BufferedFrame> {
        self.frames.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &BufferedFrame> {
        self.frames.iter()
    }
}

impl Default for DetectionBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY, FlushPolicy::default())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
