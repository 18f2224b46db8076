//! Detection backends.
//!
//! [`DetectionBackend`] is the capability the pipeline consumes: pixels in,
//! raw boxes and scores out. [`YoloDetector`] wraps a YOLOv8-style ONNX model
//! via ONNX Runtime; see [`crate::mock`] for the synthetic variant.

use crate::types::{BackendKind, BoundingBox, RawDetection};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

// --- YOLOv8 output layout and thresholds ---
const YOLO_INPUT_SIZE: usize = 640;
const YOLO_PAD_VALUE: f32 = 114.0 / 255.0;
const YOLO_BOX_CHANNELS: usize = 4;
const YOLO_MODEL_THRESHOLD: f32 = 0.25;
const YOLO_NMS_THRESHOLD: f32 = 0.7;
/// Class-aware detections must score strictly above this to count.
pub const DEFAULT_CONFIDENCE_FLOOR: f32 = 0.5;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("model file not found: {0} (export a YOLOv8 face model to ONNX and place it there)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Turns decoded pixels into raw detections.
///
/// Implementations are shared across concurrent requests and must not carry
/// per-request state; any exclusive resource is serialized internally.
pub trait DetectionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Short identifier for health reporting (e.g. the model file stem).
    fn name(&self) -> &str;

    fn detect(&self, image: &RgbImage) -> Result<Vec<RawDetection>, BackendError>;
}

/// Metadata for coordinate de-mapping after letterbox resize.
#[derive(Debug, Clone, Copy)]
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// YOLOv8 ONNX detector.
///
/// With more than one configured class name the model is treated as
/// class-aware and its output is restricted to faces/persons above the
/// confidence floor. A single-class (or unnamed) model is assumed to be a
/// dedicated face model and everything it emits is kept.
pub struct YoloDetector {
    session: Mutex<Session>,
    name: String,
    class_names: Vec<String>,
    confidence_floor: f32,
}

impl YoloDetector {
    /// Load the ONNX model from the given path.
    pub fn load(model_path: &str, class_names: Vec<String>) -> Result<Self, BackendError> {
        if !Path::new(model_path).exists() {
            return Err(BackendError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            classes = class_names.len(),
            "loaded YOLO model"
        );

        let name = Path::new(model_path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("yolo")
            .to_string();

        Ok(Self {
            session: Mutex::new(session),
            name,
            class_names,
            confidence_floor: DEFAULT_CONFIDENCE_FLOOR,
        })
    }

    pub fn with_confidence_floor(mut self, floor: f32) -> Self {
        self.confidence_floor = floor;
        self
    }

    fn is_class_aware(&self) -> bool {
        self.class_names.len() > 1
    }
}

impl DetectionBackend for YoloDetector {
    fn kind(&self) -> BackendKind {
        BackendKind::RealDetector
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&self, image: &RgbImage) -> Result<Vec<RawDetection>, BackendError> {
        let (input, letterbox) = preprocess(image, YOLO_INPUT_SIZE);
        let num_classes = if self.is_class_aware() {
            self.class_names.len()
        } else {
            1
        };

        let decoded = {
            let mut session = self
                .session
                .lock()
                .map_err(|_| BackendError::InferenceFailed("session lock poisoned".into()))?;
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
            let (shape, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| BackendError::InferenceFailed(format!("output tensor: {e}")))?;

            if shape.len() != 3 {
                return Err(BackendError::InferenceFailed(format!(
                    "expected 3D output [1, channels, anchors], got {}D",
                    shape.len()
                )));
            }
            let channels = shape[1] as usize;
            let anchors = shape[2] as usize;
            if channels < YOLO_BOX_CHANNELS + num_classes {
                return Err(BackendError::InferenceFailed(format!(
                    "output has {channels} channels, need at least {} for {num_classes} classes",
                    YOLO_BOX_CHANNELS + num_classes
                )));
            }

            decode_output(
                data,
                channels,
                anchors,
                num_classes,
                &letterbox,
                YOLO_MODEL_THRESHOLD,
            )
        };

        let kept = nms(decoded, YOLO_NMS_THRESHOLD);
        let total = kept.len();
        let result = if self.is_class_aware() {
            retain_faces(kept, &self.class_names, self.confidence_floor)
        } else {
            kept
        };

        tracing::debug!(raw = total, kept = result.len(), "YOLO inference complete");
        Ok(result)
    }
}

/// Letterbox an RGB image into a normalized NCHW tensor of `size` x `size`.
fn preprocess(image: &RgbImage, size: usize) -> (Array4<f32>, LetterboxInfo) {
    let (width, height) = image.dimensions();
    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);

    let new_w = ((width as f32 * scale).round() as u32).clamp(1, size as u32);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, size as u32);
    let pad_x = (size as u32 - new_w) as f32 / 2.0;
    let pad_y = (size as u32 - new_h) as f32 / 2.0;

    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let mut tensor = Array4::<f32>::from_elem((1, 3, size, size), YOLO_PAD_VALUE);
    let x0 = pad_x.floor() as usize;
    let y0 = pad_y.floor() as usize;
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = (x0 + x as usize, y0 + y as usize);
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = pixel[c] as f32 / 255.0;
        }
    }

    (tensor, LetterboxInfo { scale, pad_x, pad_y })
}

/// Decode a channel-major `[channels, anchors]` YOLOv8 output.
///
/// Rows 0..4 are `cx, cy, w, h` in letterboxed pixels, followed by one score
/// row per class. Extra trailing rows (e.g. keypoints) are ignored.
fn decode_output(
    data: &[f32],
    channels: usize,
    anchors: usize,
    num_classes: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<RawDetection> {
    let at = |row: usize, i: usize| data.get(row * anchors + i).copied().unwrap_or(0.0);
    let class_aware = num_classes > 1;
    let mut detections = Vec::new();

    for i in 0..anchors {
        let (class_id, score) = (0..num_classes.min(channels - YOLO_BOX_CHANNELS))
            .map(|c| (c, at(YOLO_BOX_CHANNELS + c, i)))
            .fold((0, f32::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best });
        if score <= threshold {
            continue;
        }

        let (cx, cy, w, h) = (at(0, i), at(1, i), at(2, i), at(3, i));
        let unmap_x = |v: f32| (v - letterbox.pad_x) / letterbox.scale;
        let unmap_y = |v: f32| (v - letterbox.pad_y) / letterbox.scale;

        detections.push(RawDetection {
            bbox: BoundingBox::new(
                unmap_x(cx - w / 2.0),
                unmap_y(cy - h / 2.0),
                unmap_x(cx + w / 2.0),
                unmap_y(cy + h / 2.0),
            ),
            confidence: score,
            class_id: class_aware.then_some(class_id),
        });
    }

    detections
}

/// Keep detections whose class is person (id 0) or whose name mentions
/// "face", scoring strictly above `floor`. Detections without a class id
/// pass through unfiltered.
pub fn retain_faces(
    detections: Vec<RawDetection>,
    class_names: &[String],
    floor: f32,
) -> Vec<RawDetection> {
    detections
        .into_iter()
        .filter(|d| match d.class_id {
            None => true,
            Some(id) => {
                let is_face = id == 0
                    || class_names
                        .get(id)
                        .is_some_and(|name| name.to_lowercase().contains("face"));
                is_face && d.confidence > floor
            }
        })
        .collect()
}

/// Non-Maximum Suppression: remove overlapping detections, highest score first.
fn nms(mut detections: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i].clone());

        for j in (i + 1)..detections.len() {
            if suppressed[j] {
                continue;
            }
            if detections[i].bbox.iou(&detections[j].bbox) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}
