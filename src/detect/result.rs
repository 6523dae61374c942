/// Object classes the pipeline distinguishes. Only `Person` is tracked.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectClass {
    Person,
    Vehicle,
    Animal,
    Unknown,
}

impl ObjectClass {
    /// Map a COCO class index to a coarse class.
    pub fn from_coco(class_id: usize) -> Self {
        match class_id {
            0 => ObjectClass::Person,
            1..=8 => ObjectClass::Vehicle,
            14..=23 => ObjectClass::Animal,
            _ => ObjectClass::Unknown,
        }
    }
}

/// Axis-aligned box in frame pixel coordinates, `x1 <= x2`, `y1 <= y2`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundingBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BoundingBox {
    pub fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        Self::new(
            self.x1.min(width),
            self.y1.min(height),
            self.x2.min(width),
            self.y2.min(height),
        )
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    /// Intersection over union, 0 when either box is empty.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);
        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }
        let intersection = (x2 - x1) as u64 * (y2 - y1) as u64;
        let union = self.area() + other.area() - intersection;
        if union == 0 {
            0.0
        } else {
            intersection as f32 / union as f32
        }
    }

    pub fn scaled(&self, sx: f32, sy: f32) -> Self {
        let scale = |v: u32, s: f32| (v as f32 * s).round().max(0.0) as u32;
        Self::new(
            scale(self.x1, sx),
            scale(self.y1, sy),
            scale(self.x2, sx),
            scale(self.y2, sy),
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub class: ObjectClass,
    /// 0..=1
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn person(confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            class: ObjectClass::Person,
            confidence,
            bbox,
        }
    }

    /// Tracked class at or above the confidence threshold.
    pub fn qualifies(&self, threshold: f32) -> bool {
        self.class == ObjectClass::Person && self.confidence >= threshold
    }
}

/// Greedy non-maximum suppression. Keeps the most confident box of every
/// overlapping group of the same class; output is sorted by confidence.
pub fn suppress_overlaps(mut detections: Vec<Detection>, max_iou: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let overlaps = kept
            .iter()
            .any(|k| k.class == candidate.class && k.bbox.iou(&candidate.bbox) > max_iou);
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_confident_people_qualify() {
        let bbox = BoundingBox::new(0, 0, 10, 10);
        assert!(Detection::person(0.6, bbox).qualifies(0.5));
        assert!(Detection::person(0.5, bbox).qualifies(0.5));
        assert!(!Detection::person(0.4, bbox).qualifies(0.5));

        let car = Detection {
            class: ObjectClass::from_coco(2),
            confidence: 0.99,
            bbox,
        };
        assert!(!car.qualifies(0.1));
    }

    #[test]
    fn bounding_box_normalizes_and_clamps() {
        let bbox = BoundingBox::new(50, 40, 10, 5);
        assert_eq!(bbox, BoundingBox::new(10, 5, 50, 40));
        assert_eq!(bbox.width(), 40);

        let clamped = BoundingBox::new(600, 400, 900, 700).clamp_to(640, 480);
        assert_eq!(clamped, BoundingBox::new(600, 400, 640, 480));
        assert!(BoundingBox::new(3, 3, 3, 9).is_empty());
    }

    #[test]
    fn overlapping_boxes_are_suppressed() {
        let detections = vec![
            Detection::person(0.6, BoundingBox::new(0, 0, 100, 100)),
            Detection::person(0.9, BoundingBox::new(5, 5, 105, 105)),
            Detection::person(0.7, BoundingBox::new(300, 300, 350, 400)),
        ];
        let kept = suppress_overlaps(detections, 0.45);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].bbox, BoundingBox::new(300, 300, 350, 400));
    }
}
