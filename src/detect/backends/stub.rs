use anyhow::Result;
use image::RgbImage;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::luma;

const STUB_CONFIDENCE: f32 = 0.85;
/// Per-pixel luma change that counts as motion.
const DIFF_THRESHOLD: u8 = 25;
/// Changed pixels needed for a detection, in thousandths of the frame.
const MIN_CHANGED_PERMILLE: usize = 2;

/// Stub backend for testing and dry runs.
///
/// Frame differencing stands in for a model: any region that changed since
/// the previous frame is reported as one `Person` at a fixed confidence.
#[derive(Default)]
pub struct StubBackend {
    previous: Option<LumaPlane>,
}

struct LumaPlane {
    width: u32,
    height: u32,
    values: Vec<u8>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>> {
        let current = LumaPlane {
            width: image.width(),
            height: image.height(),
            values: image.pixels().map(luma).collect(),
        };

        let changed = match &self.previous {
            Some(previous)
                if previous.width == current.width && previous.height == current.height =>
            {
                changed_region(previous, &current)
            }
            _ => None,
        };

        self.previous = Some(current);

        Ok(changed
            .map(|bbox| vec![Detection::person(STUB_CONFIDENCE, bbox)])
            .unwrap_or_default())
    }
}

fn changed_region(previous: &LumaPlane, current: &LumaPlane) -> Option<BoundingBox> {
    let width = current.width as usize;
    let mut changed = 0usize;
    let (mut x1, mut y1, mut x2, mut y2) = (u32::MAX, u32::MAX, 0u32, 0u32);

    for (i, (a, b)) in previous.values.iter().zip(&current.values).enumerate() {
        if a.abs_diff(*b) < DIFF_THRESHOLD {
            continue;
        }
        changed += 1;
        let x = (i % width) as u32;
        let y = (i / width) as u32;
        x1 = x1.min(x);
        y1 = y1.min(y);
        x2 = x2.max(x + 1);
        y2 = y2.max(y + 1);
    }

    let min_changed = (current.values.len() * MIN_CHANGED_PERMILLE / 1000).max(1);
    if changed < min_changed {
        return None;
    }
    Some(BoundingBox::new(x1, y1, x2, y2))
}
