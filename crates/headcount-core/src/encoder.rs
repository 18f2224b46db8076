//! Wire encoding of JSON response bodies with the annotated image embedded
//! as a base64 JPEG data URI.
//!
//! Historical callers read different field names for the same concepts, so
//! every response carries the canonical name alongside its legacy aliases:
//!
//! | concept    | canonical        | aliases                                          |
//! |------------|------------------|--------------------------------------------------|
//! | count      | `studentCount`   | `faceCount`, `face_count`, `count`               |
//! | detections | `detectedFaces`  | `faces`                                          |
//! | image      | `annotatedImage` | `annotated_image_url`, `annotated_image.base64`  |
//! | dimensions | `imageDimensions`| `image_dimensions`                               |

use crate::annotator::AnnotatedImage;
use crate::source::StoredImage;
use crate::types::{BackendKind, Detection, DetectionResult, Dimensions, HeadcountEstimate};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use thiserror::Error;

pub const DEFAULT_JPEG_QUALITY: u8 = 85;
const JPEG_MEDIA_TYPE: &str = "image/jpeg";

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("JPEG quality must be between 1 and 100, got {0}")]
    InvalidQuality(u8),
    #[error("JPEG encoding failed: {0}")]
    Jpeg(#[from] image::ImageError),
}

/// The annotated image, compressed and wrapped for transport.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    jpeg: Vec<u8>,
    data_uri: String,
}

impl EncodedImage {
    pub fn jpeg(&self) -> &[u8] {
        &self.jpeg
    }

    /// `data:image/jpeg;base64,...`
    pub fn data_uri(&self) -> &str {
        &self.data_uri
    }

    pub fn base64(&self) -> &str {
        self.data_uri
            .split_once(',')
            .map(|(_, payload)| payload)
            .unwrap_or_default()
    }
}

/// Serializable success response. Constructed once per request.
#[derive(Debug, Clone)]
pub struct WireResponse {
    count: usize,
    confidence: f32,
    backend_kind: BackendKind,
    detections: Vec<Detection>,
    dimensions: Option<Dimensions>,
    image: Option<EncodedImage>,
    original_stored: Option<StoredImage>,
    annotated_stored: Option<StoredImage>,
    processed_at: DateTime<Utc>,
}

impl WireResponse {
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_mock(&self) -> bool {
        self.backend_kind.is_mock()
    }

    pub fn image(&self) -> Option<&EncodedImage> {
        self.image.as_ref()
    }

    pub fn detections(&self) -> &[Detection] {
        &self.detections
    }

    /// Record where the original upload and its annotated copy were stored.
    pub fn attach_storage(&mut self, original: Option<StoredImage>, annotated: Option<StoredImage>) {
        self.original_stored = original;
        self.annotated_stored = annotated;
    }
}

impl Serialize for WireResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct AnnotatedPayload<'a> {
            url: &'a str,
            base64: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            filename: Option<&'a str>,
        }

        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("success", &true)?;
        map.serialize_entry("processed", &true)?;
        map.serialize_entry("mock", &self.backend_kind.is_mock())?;
        map.serialize_entry(
            "yolo_used",
            &matches!(self.backend_kind, BackendKind::RealDetector),
        )?;
        map.serialize_entry("backend", &self.backend_kind)?;

        for key in ["studentCount", "faceCount", "face_count", "count"] {
            map.serialize_entry(key, &self.count)?;
        }
        map.serialize_entry("confidence", &self.confidence)?;
        map.serialize_entry("message", &format!("Detected {} faces", self.count))?;

        for key in ["detectedFaces", "faces"] {
            map.serialize_entry(key, &self.detections)?;
        }

        if let Some(image) = &self.image {
            map.serialize_entry("annotatedImage", image.data_uri())?;
            map.serialize_entry("annotated_image_url", image.data_uri())?;
            let stored = self.annotated_stored.as_ref();
            map.serialize_entry(
                "annotated_image",
                &AnnotatedPayload {
                    url: stored.map_or(image.data_uri(), |s| s.url.as_str()),
                    base64: image.data_uri(),
                    filename: stored.map(|s| s.filename.as_str()),
                },
            )?;
        }
        if let Some(original) = &self.original_stored {
            map.serialize_entry("original_image", original)?;
        }
        if let Some(dims) = &self.dimensions {
            map.serialize_entry("imageDimensions", dims)?;
            map.serialize_entry("image_dimensions", dims)?;
        }
        map.serialize_entry("processed_at", &self.processed_at.to_rfc3339())?;
        map.end()
    }
}

/// Error body: a short machine-readable `error`, optional `details`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

pub struct ResponseEncoder {
    quality: u8,
}

impl Default for ResponseEncoder {
    fn default() -> Self {
        Self {
            quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl ResponseEncoder {
    pub fn new(quality: u8) -> Result<Self, EncodeError> {
        if !(1..=100).contains(&quality) {
            return Err(EncodeError::InvalidQuality(quality));
        }
        Ok(Self { quality })
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Compress the annotated image and combine it with the detection result.
    pub fn encode(
        &self,
        result: &DetectionResult,
        annotated: &AnnotatedImage,
    ) -> Result<WireResponse, EncodeError> {
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, self.quality).encode_image(annotated.image())?;
        let data_uri = format!("data:{JPEG_MEDIA_TYPE};base64,{}", B64.encode(&jpeg));

        tracing::debug!(
            jpeg_bytes = jpeg.len(),
            quality = self.quality,
            "annotated image encoded"
        );

        Ok(WireResponse {
            count: result.count(),
            confidence: result.mean_confidence(),
            backend_kind: result.backend_kind,
            detections: result.detections().to_vec(),
            dimensions: Some(result.source_dimensions),
            image: Some(EncodedImage { jpeg, data_uri }),
            original_stored: None,
            annotated_stored: None,
            processed_at: Utc::now(),
        })
    }

    /// Response for a report-anchored estimate: counts only, no image.
    pub fn encode_estimate(&self, estimate: &HeadcountEstimate) -> WireResponse {
        WireResponse {
            count: estimate.count as usize,
            confidence: estimate.confidence,
            backend_kind: BackendKind::DeterministicMock,
            detections: Vec::new(),
            dimensions: None,
            image: None,
            original_stored: None,
            annotated_stored: None,
            processed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotator::Annotator;
    use crate::types::BoundingBox;
    use image::{Rgb, RgbImage};

    fn sample() -> (DetectionResult, AnnotatedImage) {
        let image = RgbImage::from_pixel(120, 80, Rgb([30, 60, 90]));
        let result = DetectionResult::new(
            vec![
                Detection { bbox: BoundingBox::new(10.0, 10.0, 40.0, 40.0), confidence: 0.8 },
                Detection { bbox: BoundingBox::new(60.0, 20.0, 90.0, 50.0), confidence: 0.6 },
            ],
            Dimensions { width: 120, height: 80 },
            BackendKind::DeterministicMock,
        );
        let annotated = Annotator::new().annotate(&image, &result);
        (result, annotated)
    }

    #[test]
    fn test_rejects_bad_quality() {
        assert!(matches!(ResponseEncoder::new(0), Err(EncodeError::InvalidQuality(0))));
        assert!(matches!(ResponseEncoder::new(101), Err(EncodeError::InvalidQuality(101))));
        assert_eq!(ResponseEncoder::new(60).unwrap().quality(), 60);
    }

    #[test]
    fn test_emits_canonical_and_legacy_fields() {
        let (result, annotated) = sample();
        let response = ResponseEncoder::default().encode(&result, &annotated).unwrap();
        let v = serde_json::to_value(&response).unwrap();

        assert_eq!(v["success"], true);
        assert_eq!(v["processed"], true);
        assert_eq!(v["mock"], true);
        assert_eq!(v["yolo_used"], false);
        for key in ["studentCount", "faceCount", "face_count", "count"] {
            assert_eq!(v[key], 2, "{key}");
        }
        assert_eq!(v["detectedFaces"], v["faces"]);
        assert_eq!(v["detectedFaces"][1]["bbox"], serde_json::json!([60.0, 20.0, 90.0, 50.0]));
        assert!((v["confidence"].as_f64().unwrap() - 0.7).abs() < 1e-6);

        let uri = v["annotatedImage"].as_str().unwrap();
        assert!(uri.starts_with("data:image/jpeg;base64,"));
        assert_eq!(v["annotated_image_url"], uri);
        assert_eq!(v["annotated_image"]["url"], uri);
        assert_eq!(v["annotated_image"]["base64"], uri);
        assert_eq!(v["imageDimensions"], serde_json::json!({"width": 120, "height": 80}));
        assert_eq!(v["image_dimensions"], v["imageDimensions"]);
        assert_eq!(v["message"], "Detected 2 faces");
        assert!(v.get("original_image").is_none());
    }

    #[test]
    fn test_payload_decodes_to_source_dimensions() {
        let (result, annotated) = sample();
        let response = ResponseEncoder::default().encode(&result, &annotated).unwrap();
        let encoded = response.image().unwrap();
        let bytes = B64.decode(encoded.base64()).unwrap();
        assert_eq!(bytes, encoded.jpeg());
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (120, 80));
    }

    #[test]
    fn test_storage_urls_override_nested_url() {
        let (result, annotated) = sample();
        let mut response = ResponseEncoder::default().encode(&result, &annotated).unwrap();
        response.attach_storage(
            Some(StoredImage { filename: "a.png".into(), url: "/uploads/a.png".into() }),
            Some(StoredImage { filename: "annotated_a.jpg".into(), url: "/uploads/annotated_a.jpg".into() }),
        );
        let v = serde_json::to_value(&response).unwrap();
        assert_eq!(v["original_image"]["url"], "/uploads/a.png");
        assert_eq!(v["annotated_image"]["url"], "/uploads/annotated_a.jpg");
        assert_eq!(v["annotated_image"]["filename"], "annotated_a.jpg");
        assert!(v["annotated_image"]["base64"].as_str().unwrap().starts_with("data:image/jpeg"));
    }

    #[test]
    fn test_estimate_response_has_no_image() {
        let estimate = HeadcountEstimate { count: 9, confidence: 0.75 };
        let response = ResponseEncoder::default().encode_estimate(&estimate);
        let v = serde_json::to_value(&response).unwrap();
        assert_eq!(v["studentCount"], 9);
        assert_eq!(v["face_count"], 9);
        assert_eq!(v["mock"], true);
        assert_eq!(v["detectedFaces"], serde_json::json!([]));
        assert!(v.get("annotatedImage").is_none());
        assert!(v.get("imageDimensions").is_none());
    }

    #[test]
    fn test_error_response_shape() {
        let body = ErrorResponse { error: "No image URL provided".into(), details: None };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({"error": "No image URL provided"})
        );
    }
}
