//! Detection request pipeline.
//!
//! ```text
//! Received → Validated → Decoded → Detected → Normalized → Annotated → Encoded → Responded
//! ```
//!
//! Each arrow is one component call. A failure at any step stops the run and
//! yields a [`PipelineFailure`] naming the step; a run either returns a
//! complete [`WireResponse`] or an error, never anything in between.
//! Report-anchored requests skip the image steps:
//! `Received → Validated → Detected → Encoded → Responded`.

use crate::annotator::Annotator;
use crate::detector::{BackendError, DetectionBackend};
use crate::encoder::{EncodeError, ErrorResponse, ResponseEncoder, WireResponse};
use crate::mock::DeterministicMock;
use crate::normalizer::normalize;
use crate::source::{decode_image, ImageRequest, ImageSource, SourceError, UploadedFile};
use crate::types::Dimensions;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// One incoming detection request.
#[derive(Debug, Clone)]
pub enum DetectionRequest {
    Image(ImageRequest),
    /// Report-anchored estimate from a caller-supplied count.
    Reported(i64),
}

impl DetectionRequest {
    pub fn upload(file: Option<UploadedFile>) -> Self {
        Self::Image(ImageRequest::Upload(file))
    }

    pub fn url(url: Option<String>) -> Self {
        Self::Image(ImageRequest::Url(url))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Validated,
    Decoded,
    Detected,
    Normalized,
    Annotated,
    Encoded,
    Responded,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "received",
            Stage::Validated => "validated",
            Stage::Decoded => "decoded",
            Stage::Detected => "detected",
            Stage::Normalized => "normalized",
            Stage::Annotated => "annotated",
            Stage::Encoded => "encoded",
            Stage::Responded => "responded",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("detection failed: {0}")]
    Backend(#[from] BackendError),
    #[error("encoding failed: {0}")]
    Encoding(#[from] EncodeError),
}

impl PipelineError {
    /// HTTP status: caller mistakes are 400, everything else 500.
    pub fn status(&self) -> u16 {
        match self {
            PipelineError::Source(_) => 400,
            PipelineError::Backend(_) | PipelineError::Encoding(_) => 500,
        }
    }

    /// Wire body for this error.
    pub fn error_response(&self) -> ErrorResponse {
        let (error, details) = match self {
            PipelineError::Source(SourceError::MissingInput(msg)) => (msg.to_string(), None),
            PipelineError::Source(SourceError::InvalidInput { reason, details }) => {
                (reason.to_string(), details.clone())
            }
            PipelineError::Source(SourceError::Fetch(cause)) => {
                ("Failed to download image".to_string(), Some(cause.clone()))
            }
            PipelineError::Source(SourceError::Decode(cause)) => {
                ("Invalid image format".to_string(), Some(cause.clone()))
            }
            PipelineError::Backend(err) => ("Failed to process image".to_string(), Some(err.to_string())),
            PipelineError::Encoding(err) => ("Failed to encode response".to_string(), Some(err.to_string())),
        };
        ErrorResponse { error, details }
    }
}

/// The `Errored` state: which step failed and why.
#[derive(Error, Debug)]
#[error("pipeline failed at {stage}: {error}")]
pub struct PipelineFailure {
    pub stage: Stage,
    #[source]
    pub error: PipelineError,
}

impl PipelineFailure {
    pub fn status(&self) -> u16 {
        self.error.status()
    }

    pub fn error_response(&self) -> ErrorResponse {
        self.error.error_response()
    }
}

fn failed_at<E: Into<PipelineError>>(stage: Stage) -> impl FnOnce(E) -> PipelineFailure {
    move |err| PipelineFailure {
        stage,
        error: err.into(),
    }
}

fn reached(stage: Stage) {
    tracing::debug!(%stage, "pipeline stage reached");
}

/// Sequences intake, detection, normalization, annotation and encoding.
///
/// Holds no per-request state; a single instance is shared by all workers.
pub struct Pipeline {
    source: ImageSource,
    backend: Arc<dyn DetectionBackend>,
    estimator: DeterministicMock,
    annotator: Annotator,
    encoder: ResponseEncoder,
}

impl Pipeline {
    pub fn new(backend: Arc<dyn DetectionBackend>) -> Self {
        Self {
            source: ImageSource::default(),
            backend,
            estimator: DeterministicMock::default(),
            annotator: Annotator::default(),
            encoder: ResponseEncoder::default(),
        }
    }

    pub fn with_source(mut self, source: ImageSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_estimator(mut self, estimator: DeterministicMock) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_annotator(mut self, annotator: Annotator) -> Self {
        self.annotator = annotator;
        self
    }

    pub fn with_encoder(mut self, encoder: ResponseEncoder) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn backend(&self) -> &dyn DetectionBackend {
        self.backend.as_ref()
    }

    /// Run one request to completion. Blocking: may fetch over the network
    /// and run inference.
    pub fn run(&self, request: DetectionRequest) -> Result<WireResponse, PipelineFailure> {
        reached(Stage::Received);
        let outcome = match request {
            DetectionRequest::Image(image_request) => self.run_detection(image_request),
            DetectionRequest::Reported(reported) => Ok(self.run_estimate(reported)),
        };

        match &outcome {
            Ok(response) => {
                reached(Stage::Responded);
                tracing::info!(
                    count = response.count(),
                    mock = response.is_mock(),
                    "request processed"
                );
            }
            Err(failure) => {
                tracing::debug!(stage = %failure.stage, error = %failure.error, "pipeline errored");
            }
        }
        outcome
    }

    fn run_detection(&self, request: ImageRequest) -> Result<WireResponse, PipelineFailure> {
        let acquired = self.source.acquire(request).map_err(failed_at(Stage::Validated))?;
        reached(Stage::Validated);

        let image = decode_image(&acquired.bytes).map_err(failed_at(Stage::Decoded))?;
        let dimensions = Dimensions {
            width: image.width(),
            height: image.height(),
        };
        reached(Stage::Decoded);

        let raw = self.backend.detect(&image).map_err(failed_at(Stage::Detected))?;
        reached(Stage::Detected);

        let result = normalize(raw, dimensions, self.backend.kind());
        reached(Stage::Normalized);

        let annotated = self.annotator.annotate(&image, &result);
        reached(Stage::Annotated);

        let mut response = self
            .encoder
            .encode(&result, &annotated)
            .map_err(failed_at(Stage::Encoded))?;
        reached(Stage::Encoded);

        if let Some(original) = acquired.stored {
            let annotated_stored = match (self.source.sink(), response.image()) {
                (Some(sink), Some(encoded)) => match sink.store_annotated(&original, encoded.jpeg()) {
                    Ok(stored) => Some(stored),
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to store annotated image; continuing");
                        None
                    }
                },
                _ => None,
            };
            response.attach_storage(Some(original), annotated_stored);
        }

        tracing::debug!(
            width = dimensions.width,
            height = dimensions.height,
            backend = self.backend.name(),
            count = result.count(),
            "detection complete"
        );
        Ok(response)
    }

    fn run_estimate(&self, reported: i64) -> WireResponse {
        reached(Stage::Validated);
        let estimate = self.estimator.estimate_from_report(reported);
        reached(Stage::Detected);
        let response = self.encoder.encode_estimate(&estimate);
        reached(Stage::Encoded);
        tracing::debug!(reported, count = estimate.count, "report-anchored estimate");
        response
    }
}
