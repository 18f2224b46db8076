//! Synthetic detection backend.
//!
//! Produces plausible classroom headcounts without looking at pixels, using
//! either the image area or a caller-reported count as the anchor. Output
//! obeys the same structural contract as the real detector.

use crate::detector::{BackendError, DetectionBackend};
use crate::types::{BackendKind, BoundingBox, HeadcountEstimate, RawDetection};
use image::RgbImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Image area (px²) that accounts for roughly one face.
const PIXELS_PER_FACE: u64 = 50_000;
const MIN_BASE_COUNT: u64 = 1;
const MAX_BASE_COUNT: u64 = 50;
const SIZE_JITTER: (i64, i64) = (-2, 3);
const REPORT_JITTER: (i64, i64) = (-3, 3);
const EDGE_MARGIN: u32 = 50;
/// Space reserved right of / below the box origin when choosing a position.
const PLACEMENT_RESERVE: u32 = 100;
const FACE_SIZE_RANGE: (u32, u32) = (60, 120);
const CONFIDENCE_RANGE: (f32, f32) = (0.70, 0.95);
/// Confidence reported for report-anchored estimates.
pub const REPORT_CONFIDENCE: f32 = 0.75;

/// Mock detector. Without a seed every call draws fresh entropy; with a seed
/// each call derives its RNG from the seed and the input, so identical
/// inputs give identical outputs.
#[derive(Debug, Clone, Default)]
pub struct DeterministicMock {
    seed: Option<u64>,
}

impl DeterministicMock {
    pub fn new(seed: Option<u64>) -> Self {
        Self { seed }
    }

    fn rng_for(&self, salt: u64) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ salt.wrapping_mul(0x9E37_79B9_7F4A_7C15)),
            None => StdRng::from_entropy(),
        }
    }

    /// Size-based estimate for an image of `width` x `height`.
    pub fn estimate_count(&self, width: u32, height: u32) -> usize {
        let mut rng = self.rng_for(dims_salt(width, height));
        size_based_count(&mut rng, width, height)
    }

    /// Report-anchored estimate: `max(1, reported + jitter(-3..=3))`.
    pub fn estimate_from_report(&self, reported: i64) -> HeadcountEstimate {
        let mut rng = self.rng_for(reported as u64);
        let jitter = rng.gen_range(REPORT_JITTER.0..=REPORT_JITTER.1);
        HeadcountEstimate {
            count: anchored_count(reported, jitter),
            confidence: REPORT_CONFIDENCE,
        }
    }
}

impl DetectionBackend for DeterministicMock {
    fn kind(&self) -> BackendKind {
        BackendKind::DeterministicMock
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn detect(&self, image: &RgbImage) -> Result<Vec<RawDetection>, BackendError> {
        let (width, height) = image.dimensions();
        let mut rng = self.rng_for(dims_salt(width, height));

        let count = size_based_count(&mut rng, width, height);
        let detections = (0..count)
            .map(|_| RawDetection {
                bbox: place_box(&mut rng, width, height),
                confidence: round2(rng.gen_range(CONFIDENCE_RANGE.0..=CONFIDENCE_RANGE.1)),
                class_id: None,
            })
            .collect::<Vec<_>>();

        tracing::debug!(width, height, count, "mock detections generated");
        Ok(detections)
    }
}

fn dims_salt(width: u32, height: u32) -> u64 {
    ((width as u64) << 32) | height as u64
}

fn size_based_count(rng: &mut StdRng, width: u32, height: u32) -> usize {
    let base = (width as u64 * height as u64 / PIXELS_PER_FACE).clamp(MIN_BASE_COUNT, MAX_BASE_COUNT);
    let jitter = rng.gen_range(SIZE_JITTER.0..=SIZE_JITTER.1);
    (base as i64 + jitter).max(1) as usize
}

fn anchored_count(reported: i64, jitter: i64) -> u32 {
    reported.saturating_add(jitter).clamp(1, u32::MAX as i64) as u32
}

/// Random box inside the image, kept away from the edges where room allows.
/// Always satisfies `0 <= x1 < x2 <= width` and likewise for y.
fn place_box(rng: &mut StdRng, width: u32, height: u32) -> BoundingBox {
    let size = rng.gen_range(FACE_SIZE_RANGE.0..=FACE_SIZE_RANGE.1);
    let (x1, x2) = place_span(rng, width, size);
    let (y1, y2) = place_span(rng, height, size);
    BoundingBox::new(x1 as f32, y1 as f32, x2 as f32, y2 as f32)
}

fn place_span(rng: &mut StdRng, extent: u32, size: u32) -> (u32, u32) {
    let margin = EDGE_MARGIN.min(extent / 4);
    let max_start = extent
        .saturating_sub(margin + PLACEMENT_RESERVE)
        .max(margin);
    let start = rng.gen_range(margin..=max_start).min(extent.saturating_sub(1));
    let end = (start + size).min(extent - margin).max(start + 1);
    (start, end)
}

fn round2(v: f32) -> f32 {
    (v * 100.0).round() / 100.0
}
