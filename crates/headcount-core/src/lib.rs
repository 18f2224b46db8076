//! headcount-core: face detection pipeline for classroom headcounts.
//!
//! Accepts an uploaded or remote image, runs it through a detection backend
//! (a YOLO model via ONNX Runtime, or a synthetic mock), and produces a JSON
//! response with boxes, confidences and an annotated JPEG.

pub mod annotator;
pub mod detector;
pub mod encoder;
pub mod mock;
pub mod normalizer;
pub mod pipeline;
pub mod source;
pub mod types;

pub use annotator::{AnnotatedImage, Annotator};
pub use detector::{BackendError, DetectionBackend, YoloDetector};
pub use encoder::{ErrorResponse, ResponseEncoder, WireResponse};
pub use mock::DeterministicMock;
pub use pipeline::{DetectionRequest, Pipeline, PipelineError, PipelineFailure, Stage};
pub use source::{ImageRequest, ImageSource, StoredImage, UploadSink, UploadedFile};
pub use types::{BackendKind, BoundingBox, Detection, DetectionResult, Dimensions, RawDetection};
