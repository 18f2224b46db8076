//! HTTP surface.
//!
//! `/detect`, `/count-students` and `/upload-and-process` share one handler:
//! a multipart body with an `image` file part, or a JSON body carrying
//! `imageUrl` or `reportedMeals`.

use crate::engine::{EngineError, EngineHandle};
use crate::storage::StorageError;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Path, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use headcount_core::{DetectionRequest, ErrorResponse, UploadedFile, WireResponse};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

const IMAGE_FIELD: &str = "image";
const DEFAULT_REPORTED_MEALS: i64 = 10;
const ENDPOINTS: [&str; 8] = [
    "POST /detect",
    "POST /count-students",
    "POST /upload-and-process",
    "POST /mock-count",
    "GET /health",
    "GET /test",
    "GET /uploads/{filename}",
    "GET /list-uploads",
];

pub struct AppState {
    pub engine: EngineHandle,
    pub body_limit: usize,
}

/// JSON request body. Unknown fields are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetectBody {
    image_url: Option<String>,
    reported_meals: Option<i64>,
}

/// Error reply: status plus `{error, details?}` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn new(status: StatusCode, error: impl Into<String>, details: Option<String>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                error: error.into(),
                details,
            },
        }
    }

    fn bad_request(error: impl Into<String>, details: Option<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error, details)
    }

    /// Body extraction failures. Any client-side rejection, including an
    /// over-limit body, is reported as 400.
    fn unreadable_body(status: StatusCode, error: &str, details: String) -> Self {
        let status = if status.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            status
        };
        Self::new(status, error, Some(details))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Pipeline(failure) => {
                let status = StatusCode::from_u16(failure.status())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                if status.is_server_error() {
                    tracing::error!(stage = %failure.stage, error = %failure.error, "request failed");
                } else {
                    tracing::info!(stage = %failure.stage, error = %failure.error, "request rejected");
                }
                Self {
                    status,
                    body: failure.error_response(),
                }
            }
            other => {
                tracing::error!(error = %other, "request failed");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to process image",
                    Some(other.to_string()),
                )
            }
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidName => Self::bad_request("Invalid filename", None),
            StorageError::NotFound => Self::new(StatusCode::NOT_FOUND, "File not found", None),
            StorageError::Io(e) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to read uploads",
                Some(e.to_string()),
            ),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let body_limit = state.body_limit;
    Router::new()
        .route("/health", get(health))
        .route("/test", get(test_endpoint))
        .route("/detect", post(detect))
        .route("/count-students", post(detect))
        .route("/upload-and-process", post(detect))
        .route("/mock-count", post(mock_count))
        .route("/uploads/:filename", get(uploaded_file))
        .route("/list-uploads", get(list_uploads))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

fn request_span(route: &'static str) -> tracing::Span {
    tracing::info_span!("request", request_id = %Uuid::new_v4(), route)
}

async fn run(state: &AppState, request: DetectionRequest) -> Result<Json<WireResponse>, ApiError> {
    Ok(Json(state.engine.run(request).await?))
}

async fn detect(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Json<WireResponse>, ApiError> {
    let span = request_span("detect");
    async move {
        let detection = parse_detect_request(&state, request).await?;
        run(&state, detection).await
    }
    .instrument(span)
    .await
}

async fn mock_count(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<WireResponse>, ApiError> {
    let span = request_span("mock-count");
    async move {
        let body = parse_json_body(&body)?;
        let reported = body.reported_meals.unwrap_or(DEFAULT_REPORTED_MEALS);
        run(&state, DetectionRequest::Reported(reported)).await
    }
    .instrument(span)
    .await
}

async fn parse_detect_request(
    state: &Arc<AppState>,
    request: Request,
) -> Result<DetectionRequest, ApiError> {
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"));

    if is_multipart {
        let multipart = Multipart::from_request(request, state)
            .await
            .map_err(|e| ApiError::bad_request("Invalid multipart body", Some(e.body_text())))?;
        return Ok(DetectionRequest::upload(read_image_field(multipart).await?));
    }

    let body = Bytes::from_request(request, state)
        .await
        .map_err(|e| ApiError::unreadable_body(e.status(), "Failed to read request body", e.body_text()))?;
    let body = parse_json_body(&body)?;
    Ok(match (body.image_url, body.reported_meals) {
        (None, Some(reported)) => DetectionRequest::Reported(reported),
        (url, _) => DetectionRequest::url(url),
    })
}

/// First `image` part of the form, or `None` if the form has none.
async fn read_image_field(mut multipart: Multipart) -> Result<Option<UploadedFile>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::unreadable_body(e.status(), "Failed to read upload", e.body_text()))?
    {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::unreadable_body(e.status(), "Failed to read upload", e.body_text()))?;
        return Ok(Some(UploadedFile {
            filename,
            bytes: bytes.to_vec(),
        }));
    }
    Ok(None)
}

/// An empty body reads as `{}`.
fn parse_json_body(body: &[u8]) -> Result<DetectBody, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(DetectBody::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError::bad_request("Invalid JSON body", Some(e.to_string())))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let backend = state.engine.backend();
    let kind = backend.kind();
    Json(json!({
        "status": "healthy",
        "service": "headcountd",
        "version": env!("CARGO_PKG_VERSION"),
        "backend": backend.name(),
        "backend_kind": kind,
        "mock": kind.is_mock(),
        "model_loaded": !kind.is_mock(),
        "yolo_available": !kind.is_mock(),
        "upload_folder": state.engine.store().map(|s| s.dir().display().to_string()),
        "timestamp": chrono::Local::now().to_rfc3339(),
    }))
}

async fn test_endpoint() -> Json<serde_json::Value> {
    Json(json!({
        "message": "headcountd is running",
        "endpoints": ENDPOINTS,
        "status": "ready",
    }))
}

async fn uploaded_file(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    let store = state
        .engine
        .store()
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Upload storage disabled", None))?;
    let (bytes, content_type) = store.read(&filename)?;
    Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
}

async fn list_uploads(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, ApiError> {
    let files = match state.engine.store() {
        Some(store) => store.list()?,
        None => Vec::new(),
    };
    Ok(Json(json!({
        "success": true,
        "count": files.len(),
        "files": files,
    })))
}
