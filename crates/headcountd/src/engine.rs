use crate::config::{BackendChoice, Config};
use crate::storage::{StorageError, UploadStore};
use headcount_core::annotator::AnnotatorError;
use headcount_core::encoder::EncodeError;
use headcount_core::{
    Annotator, BackendError, DetectionBackend, DetectionRequest, DeterministicMock, ImageSource,
    Pipeline, PipelineFailure, ResponseEncoder, WireResponse, YoloDetector,
};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("annotator error: {0}")]
    Annotator(#[from] AnnotatorError),
    #[error("encoder error: {0}")]
    Encoder(#[from] EncodeError),
    #[error("upload storage error: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Pipeline(#[from] PipelineFailure),
    #[error("pipeline worker exited: {0}")]
    WorkerLost(String),
}

/// Clone-safe handle to the shared pipeline.
#[derive(Clone)]
pub struct EngineHandle {
    pipeline: Arc<Pipeline>,
    store: Option<Arc<UploadStore>>,
}

impl EngineHandle {
    pub fn new(pipeline: Pipeline, store: Option<Arc<UploadStore>>) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            store,
        }
    }

    pub fn backend(&self) -> &dyn DetectionBackend {
        self.pipeline.backend()
    }

    pub fn store(&self) -> Option<&Arc<UploadStore>> {
        self.store.as_ref()
    }

    /// Run one request on the blocking pool. The caller's span is carried
    /// onto the worker thread.
    pub async fn run(&self, request: DetectionRequest) -> Result<WireResponse, EngineError> {
        let pipeline = Arc::clone(&self.pipeline);
        let span = tracing::Span::current();
        let outcome = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            pipeline.run(request)
        })
        .await
        .map_err(|e| EngineError::WorkerLost(e.to_string()))?;
        Ok(outcome?)
    }
}

/// Build the pipeline from configuration.
///
/// Loads the model, label font and upload directory synchronously and fails
/// fast if any of them is unavailable. Blocking; call from a blocking
/// context.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let backend: Arc<dyn DetectionBackend> = match config.backend {
        BackendChoice::Yolo => {
            let model_path = config.model_path.to_string_lossy();
            let detector = YoloDetector::load(&model_path, config.class_names.clone())?
                .with_confidence_floor(config.confidence_floor);
            tracing::info!(
                path = %model_path,
                classes = config.class_names.len(),
                "YOLO detector loaded"
            );
            Arc::new(detector)
        }
        BackendChoice::Mock => {
            tracing::warn!(seed = ?config.mock_seed, "serving synthetic detections from the mock backend");
            Arc::new(DeterministicMock::new(config.mock_seed))
        }
    };

    let annotator = match &config.label_font {
        Some(path) => {
            let annotator = Annotator::new().with_label_font_file(&path.to_string_lossy())?;
            tracing::info!(font = %path.display(), "face labels enabled");
            annotator
        }
        None => Annotator::new(),
    };

    let store = if config.persist_uploads {
        let store = Arc::new(UploadStore::open(&config.upload_dir)?);
        tracing::info!(dir = %store.dir().display(), "upload storage ready");
        Some(store)
    } else {
        None
    };

    let mut source = ImageSource::new(config.max_upload_bytes, config.fetch_timeout());
    if let Some(store) = &store {
        source = source.with_sink(store.clone());
    }

    let pipeline = Pipeline::new(backend)
        .with_source(source)
        .with_estimator(DeterministicMock::new(config.mock_seed))
        .with_annotator(annotator)
        .with_encoder(ResponseEncoder::new(config.jpeg_quality)?);

    Ok(EngineHandle::new(pipeline, store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use headcount_core::BackendKind;

    fn mock_config(dir: &std::path::Path) -> Config {
        Config {
            backend: BackendChoice::Mock,
            mock_seed: Some(5),
            upload_dir: dir.join("uploads"),
            ..Config::default()
        }
    }

    #[test]
    fn test_missing_model_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            backend: BackendChoice::Yolo,
            model_path: dir.path().join("absent.onnx"),
            ..mock_config(dir.path())
        };
        assert!(matches!(spawn_engine(&config), Err(EngineError::Backend(_))));
    }

    #[test]
    fn test_bad_quality_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            jpeg_quality: 0,
            ..mock_config(dir.path())
        };
        assert!(matches!(spawn_engine(&config), Err(EngineError::Encoder(_))));
    }

    #[test]
    fn test_missing_font_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            label_font: Some(dir.path().join("nope.ttf")),
            ..mock_config(dir.path())
        };
        assert!(matches!(spawn_engine(&config), Err(EngineError::Annotator(_))));
    }

    #[test]
    fn test_mock_engine_creates_upload_dir() {
        let dir = tempfile::tempdir().unwrap();
        let engine = spawn_engine(&mock_config(dir.path())).unwrap();
        assert_eq!(engine.backend().kind(), BackendKind::DeterministicMock);
        assert!(dir.path().join("uploads").is_dir());

        let config = Config {
            persist_uploads: false,
            ..mock_config(dir.path())
        };
        assert!(spawn_engine(&config).unwrap().store().is_none());
    }

    #[tokio::test]
    async fn test_run_reports_pipeline_failure() {
        let dir = tempfile::tempdir().unwrap();
        let engine = spawn_engine(&mock_config(dir.path())).unwrap();
        let err = engine.run(DetectionRequest::url(None)).await.unwrap_err();
        match err {
            EngineError::Pipeline(failure) => assert_eq!(failure.status(), 400),
            other => panic!("unexpected error: {other}"),
        }

        let ok = engine.run(DetectionRequest::Reported(20)).await.unwrap();
        assert!((14..=26).contains(&ok.count()));
    }
}
