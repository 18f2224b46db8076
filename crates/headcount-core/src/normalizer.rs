//! Maps raw backend output into the canonical [`DetectionResult`].

use crate::types::{
    BackendKind, BoundingBox, Detection, DetectionResult, Dimensions, RawDetection,
};

/// Build a [`DetectionResult`] from raw backend detections.
///
/// Coordinates stay in source pixels; corners are ordered and clipped to
/// the image. Boxes with non-finite coordinates, zero extent, or nothing
/// left inside the image are dropped. Confidence is clamped into [0, 1]
/// (NaN becomes 0), and emission order is preserved.
pub fn normalize(
    raw: Vec<RawDetection>,
    dimensions: Dimensions,
    backend_kind: BackendKind,
) -> DetectionResult {
    let received = raw.len();
    let detections: Vec<Detection> = raw
        .into_iter()
        .filter_map(|d| {
            let bbox = ordered(d.bbox)?.clamp_to(dimensions.width, dimensions.height)?;
            Some(Detection {
                bbox,
                confidence: clamp_confidence(d.confidence),
            })
        })
        .collect();

    if detections.len() != received {
        tracing::debug!(
            received,
            kept = detections.len(),
            "dropped degenerate detections"
        );
    }

    DetectionResult::new(detections, dimensions, backend_kind)
}

fn ordered(b: BoundingBox) -> Option<BoundingBox> {
    let coords = [b.x1, b.y1, b.x2, b.y2];
    if coords.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let bbox = BoundingBox::new(b.x1.min(b.x2), b.y1.min(b.y2), b.x1.max(b.x2), b.y1.max(b.y2));
    (bbox.x1 < bbox.x2 && bbox.y1 < bbox.y2).then_some(bbox)
}

fn clamp_confidence(c: f32) -> f32 {
    if c.is_nan() {
        0.0
    } else {
        c.clamp(0.0, 1.0)
    }
}
