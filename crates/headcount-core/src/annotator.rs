//! Annotation overlays: boxes and optional labels burned into a copy of the
//! source image.

use crate::types::DetectionResult;
use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use thiserror::Error;

pub const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
pub const BOX_THICKNESS: u32 = 3;
const LABEL_SCALE: f32 = 16.0;
const LABEL_OFFSET_Y: i32 = 20;

#[derive(Error, Debug)]
pub enum AnnotatorError {
    #[error("failed to read label font {path}: {source}")]
    FontRead {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid label font: {0}")]
    InvalidFont(String),
}

/// An annotated copy of a source image.
#[derive(Debug, Clone)]
pub struct AnnotatedImage {
    image: RgbImage,
}

impl AnnotatedImage {
    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn into_inner(self) -> RgbImage {
        self.image
    }
}

/// Draws detection boxes; labels ("Face 1", "Face 2", ...) are drawn only
/// when a font has been supplied.
pub struct Annotator {
    font: Option<FontVec>,
    color: Rgb<u8>,
    thickness: u32,
}

impl Default for Annotator {
    fn default() -> Self {
        Self {
            font: None,
            color: BOX_COLOR,
            thickness: BOX_THICKNESS,
        }
    }
}

impl Annotator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label_font(mut self, font_data: Vec<u8>) -> Result<Self, AnnotatorError> {
        let font =
            FontVec::try_from_vec(font_data).map_err(|e| AnnotatorError::InvalidFont(e.to_string()))?;
        self.font = Some(font);
        Ok(self)
    }

    /// Load a TTF/OTF file to enable box labels.
    pub fn with_label_font_file(self, path: &str) -> Result<Self, AnnotatorError> {
        let data = std::fs::read(path).map_err(|source| AnnotatorError::FontRead {
            path: path.to_string(),
            source,
        })?;
        self.with_label_font(data)
    }

    pub fn labels_enabled(&self) -> bool {
        self.font.is_some()
    }

    /// Copy `image` and draw every detection onto the copy. Boxes are clamped
    /// to the image; boxes entirely outside it are skipped.
    pub fn annotate(&self, image: &RgbImage, result: &DetectionResult) -> AnnotatedImage {
        let mut canvas = image.clone();
        let (width, height) = canvas.dimensions();

        for (i, detection) in result.detections().iter().enumerate() {
            let Some(bbox) = detection.bbox.clamp_to(width, height) else {
                continue;
            };

            let x1 = bbox.x1.floor() as u32;
            let y1 = bbox.y1.floor() as u32;
            let x2 = (bbox.x2.ceil() as u32).min(width);
            let y2 = (bbox.y2.ceil() as u32).min(height);

            // Stroke inward so the outline never leaves the clamped box.
            for t in 0..self.thickness {
                let w = (x2 - x1).saturating_sub(2 * t);
                let h = (y2 - y1).saturating_sub(2 * t);
                if w == 0 || h == 0 {
                    break;
                }
                let rect = Rect::at((x1 + t) as i32, (y1 + t) as i32).of_size(w, h);
                draw_hollow_rect_mut(&mut canvas, rect, self.color);
            }

            if let Some(font) = &self.font {
                let label_y = (y1 as i32 - LABEL_OFFSET_Y).max(0);
                draw_text_mut(
                    &mut canvas,
                    self.color,
                    x1 as i32,
                    label_y,
                    PxScale::from(LABEL_SCALE),
                    font,
                    &format!("Face {}", i + 1),
                );
            }
        }

        AnnotatedImage { image: canvas }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BackendKind, BoundingBox, Detection, Dimensions};
    use sha2::{Digest, Sha256};

    const GREY: Rgb<u8> = Rgb([128, 128, 128]);

    fn result_with(boxes: &[BoundingBox], w: u32, h: u32) -> DetectionResult {
        let detections = boxes
            .iter()
            .map(|&bbox| Detection { bbox, confidence: 0.9 })
            .collect();
        DetectionResult::new(
            detections,
            Dimensions { width: w, height: h },
            BackendKind::RealDetector,
        )
    }

    fn digest(image: &RgbImage) -> Vec<u8> {
        Sha256::digest(image.as_raw()).to_vec()
    }

    #[test]
    fn test_zero_detections_returns_identical_copy() {
        let image = RgbImage::from_pixel(64, 48, GREY);
        let annotated = Annotator::new().annotate(&image, &result_with(&[], 64, 48));
        assert_eq!(annotated.image().dimensions(), (64, 48));
        assert_eq!(annotated.image().as_raw(), image.as_raw());
    }

    #[test]
    fn test_input_buffer_is_never_mutated() {
        let image = RgbImage::from_pixel(100, 100, GREY);
        let before = digest(&image);
        let result = result_with(
            &[
                BoundingBox::new(10.0, 10.0, 60.0, 60.0),
                BoundingBox::new(-20.0, 50.0, 130.0, 140.0),
            ],
            100,
            100,
        );
        let annotated = Annotator::new().annotate(&image, &result);
        assert_eq!(digest(&image), before);
        assert_ne!(digest(annotated.image()), before);
    }

    #[test]
    fn test_draws_three_pixel_red_outline() {
        let image = RgbImage::from_pixel(100, 100, GREY);
        let result = result_with(&[BoundingBox::new(20.0, 20.0, 80.0, 80.0)], 100, 100);
        let out = Annotator::new().annotate(&image, &result).into_inner();

        for t in 0..BOX_THICKNESS {
            assert_eq!(*out.get_pixel(20 + t, 50), BOX_COLOR, "left edge, inset {t}");
            assert_eq!(*out.get_pixel(50, 20 + t), BOX_COLOR, "top edge, inset {t}");
        }
        // Just inside the stroke and just outside the box stay untouched.
        assert_eq!(*out.get_pixel(20 + BOX_THICKNESS, 50), GREY);
        assert_eq!(*out.get_pixel(19, 50), GREY);
        assert_eq!(*out.get_pixel(50, 50), GREY);
    }

    #[test]
    fn test_out_of_bounds_boxes_are_clamped_or_skipped() {
        let image = RgbImage::from_pixel(50, 40, GREY);
        let result = result_with(
            &[
                BoundingBox::new(-10.0, -10.0, 500.0, 500.0),
                BoundingBox::new(60.0, 60.0, 90.0, 90.0),
            ],
            50,
            40,
        );
        let out = Annotator::new().annotate(&image, &result).into_inner();
        assert_eq!(*out.get_pixel(0, 20), BOX_COLOR);
        assert_eq!(*out.get_pixel(49, 20), BOX_COLOR);
        assert_eq!(*out.get_pixel(25, 39), BOX_COLOR);
        assert_eq!(*out.get_pixel(25, 20), GREY);
    }

    #[test]
    fn test_tiny_box_does_not_panic() {
        let image = RgbImage::from_pixel(10, 10, GREY);
        let result = result_with(&[BoundingBox::new(4.2, 4.2, 4.6, 4.4)], 10, 10);
        let out = Annotator::new().annotate(&image, &result).into_inner();
        assert_eq!(*out.get_pixel(4, 4), BOX_COLOR);
    }

    #[test]
    fn test_invalid_font_rejected() {
        let err = Annotator::new().with_label_font(b"not a font".to_vec()).err().unwrap();
        assert!(matches!(err, AnnotatorError::InvalidFont(_)));
        assert!(!Annotator::new().labels_enabled());
    }
}
