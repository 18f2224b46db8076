use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

/// Axis-aligned box in source-image pixel coordinates (corner form).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union_area = self.area() + other.area() - inter_area;

        if union_area > 0.0 {
            inter_area / union_area
        } else {
            0.0
        }
    }

    /// Clip to `[0, width] x [0, height]`.
    ///
    /// Returns `None` when nothing of the box remains inside the image, so
    /// every returned box satisfies `0 <= x1 < x2 <= width` and likewise for y.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<BoundingBox> {
        let (w, h) = (width as f32, height as f32);
        let clamped = BoundingBox {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        };
        (clamped.x1 < clamped.x2 && clamped.y1 < clamped.y2).then_some(clamped)
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

/// One detection as emitted by a backend, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    /// Model class index, when the backend is class-aware.
    pub class_id: Option<usize>,
}

/// A normalized detection: one box plus a confidence in [0, 1].
///
/// Serializes as `{"bbox": [x1, y1, x2, y2], "confidence": c}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
}

impl Serialize for Detection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Detection", 2)?;
        state.serialize_field("bbox", &self.bbox.to_array())?;
        state.serialize_field("confidence", &self.confidence)?;
        state.end()
    }
}

/// Which backend variant produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    RealDetector,
    DeterministicMock,
}

impl BackendKind {
    pub fn is_mock(self) -> bool {
        matches!(self, BackendKind::DeterministicMock)
    }
}

/// Width and height of the source image in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Canonical detection result.
///
/// The detection list is private so `count()` can never disagree with it.
#[derive(Debug, Clone)]
pub struct DetectionResult {
    detections: Vec<Detection>,
    pub source_dimensions: Dimensions,
    pub backend_kind: BackendKind,
}

impl DetectionResult {
    pub fn new(
        detections: Vec<Detection>,
        source_dimensions: Dimensions,
        backend_kind: BackendKind,
    ) -> Self {
        Self {
            detections,
            source_dimensions,
            backend_kind,
        }
    }

    /// Detections in backend emission order.
    pub fn detections(&self) -> &[Detection] {
        &self.detections
    }

    pub fn count(&self) -> usize {
        self.detections.len()
    }

    /// Mean detection confidence, or 0.0 when nothing was detected.
    pub fn mean_confidence(&self) -> f32 {
        if self.detections.is_empty() {
            return 0.0;
        }
        self.detections.iter().map(|d| d.confidence).sum::<f32>() / self.detections.len() as f32
    }
}

/// Report-anchored headcount estimate: a count without boxes or pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeadcountEstimate {
    pub count: u32,
    pub confidence: f32,
}
