//! HTTP gateway over the face cache.
//!
//! Read routes serialize while the cache lock is held so a response never
//! mixes two cache states. `POST /face` classifies an uploaded JPEG on the
//! blocking pool with the same classifier the pipeline uses.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use facewatch_core::embedding::normalize_in_place;
use facewatch_core::{jpeg, CacheError, ClassifierError, FaceCache, FaceClassifier};
use facewatch_core::types::JPEG_MIME_TYPE;
use facewatch_core::FaceRecord;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Upload limit for `POST /face`.
pub const MAX_UPLOAD_BYTES: usize = 8 * 1024 * 1024;

const JSON_CONTENT_TYPE: &str = "application/json";

/// Classifier shared between the pipeline thread and the gateway.
pub type SharedClassifier = Arc<Mutex<dyn FaceClassifier>>;

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<FaceCache>,
    pub classifier: SharedClassifier,
    pub normalize_embeddings: bool,
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("invalid face index {0:?}")]
    BadIndex(String),
    #[error("{0}")]
    Cache(#[from] CacheError),
    #[error("unknown face field {0:?}")]
    UnknownField(String),
    #[error("invalid image: {0}")]
    BadImage(#[source] image::ImageError),
    #[error("classification failed: {0}")]
    Classify(#[from] ClassifierError),
    #[error("json encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl GatewayError {
    fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadIndex(_) | GatewayError::BadImage(_) => StatusCode::BAD_REQUEST,
            GatewayError::Cache(CacheError::NotFound { .. }) | GatewayError::UnknownField(_) => {
                StatusCode::NOT_FOUND
            }
            GatewayError::Cache(CacheError::NoFrame) => StatusCode::BAD_REQUEST,
            GatewayError::Cache(CacheError::Encode(_))
            | GatewayError::Classify(_)
            | GatewayError::Json(_)
            | GatewayError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self, "request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "request rejected");
        }
        (status, self.to_string()).into_response()
    }
}

/// Build the gateway router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(list_faces))
        .route("/frame", get(current_frame))
        .route("/peaks", get(peaks))
        .route("/face", post(add_face))
        .route("/:index", get(face))
        .route("/:index/:field", get(face_field))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the gateway until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "face gateway listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

fn json(body: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, JSON_CONTENT_TYPE)], body).into_response()
}

fn jpeg_response(body: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, JPEG_MIME_TYPE)], body).into_response()
}

/// Indexes are 32-bit; anything wider is a malformed request, not a miss.
fn parse_index(raw: &str) -> Result<i64, GatewayError> {
    raw.parse::<i32>()
        .map(i64::from)
        .map_err(|_| GatewayError::BadIndex(raw.to_string()))
}

async fn list_faces(State(state): State<AppState>) -> Result<Response, GatewayError> {
    let body = state.cache.with_faces(|faces| serde_json::to_vec(faces))?;
    Ok(json(body))
}

async fn face(
    State(state): State<AppState>,
    Path(index): Path<String>,
) -> Result<Response, GatewayError> {
    let index = parse_index(&index)?;
    let body = state.cache.with_face(index, |face| serde_json::to_vec(face))??;
    Ok(json(body))
}

async fn face_field(
    State(state): State<AppState>,
    Path((index, field)): Path<(String, String)>,
) -> Result<Response, GatewayError> {
    let index = parse_index(&index)?;
    state
        .cache
        .with_face(index, |face| field_response(face, &field))?
}

fn field_response(face: &FaceRecord, field: &str) -> Result<Response, GatewayError> {
    let body = match field {
        "image" => return Ok(jpeg_response(face.image.to_vec())),
        "mimeType" => serde_json::to_vec(&face.mime_type)?,
        "time" => serde_json::to_vec(&face.captured_at)?,
        "width" => serde_json::to_vec(&face.width)?,
        "height" => serde_json::to_vec(&face.height)?,
        "embedding" => serde_json::to_vec(&face.embedding)?,
        other => return Err(GatewayError::UnknownField(other.to_string())),
    };
    Ok(json(body))
}

async fn current_frame(State(state): State<AppState>) -> Result<Response, GatewayError> {
    let body = state.cache.current_frame_jpeg()?;
    Ok(jpeg_response(body))
}

async fn peaks(State(state): State<AppState>) -> Result<Response, GatewayError> {
    let body = serde_json::to_vec(&state.cache.cluster_peaks())?;
    Ok(json(body))
}

async fn add_face(State(state): State<AppState>, body: Bytes) -> Result<Response, GatewayError> {
    let embedding = tokio::task::spawn_blocking(move || classify_and_cache(&state, &body)).await??;
    Ok(json(serde_json::to_vec(&embedding)?))
}

fn classify_and_cache(state: &AppState, body: &[u8]) -> Result<Vec<f32>, GatewayError> {
    let face = jpeg::decode(body).map_err(GatewayError::BadImage)?;
    let mut embedding = state
        .classifier
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .classify(&face)?;
    if state.normalize_embeddings && !normalize_in_place(&mut embedding) {
        tracing::debug!("zero embedding left unnormalized");
    }
    state.cache.add_face(&face, embedding.clone())?;
    tracing::info!(
        width = face.width(),
        height = face.height(),
        cached = state.cache.len(),
        "face added over http"
    );
    Ok(embedding)
}
