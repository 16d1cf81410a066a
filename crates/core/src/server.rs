//! HTTP surface: the upload → initiate → fetch-result handshake plus status
//! polling and file serving.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::imaging;
use crate::jobs::{Job, JobStatus, JobStore};
use crate::remover::BackgroundRemover;

const ORIGINALS_DIR: &str = "originals";
const PROCESSED_DIR: &str = "processed";
const JOBS_DIR: &str = "jobs";

const STEP_UPLOAD: &str = "upload";
const STEP_INITIATE: &str = "initiate_process";
const STEP_PROCESS: &str = "background_removed";
const STEP_STATUS: &str = "check_status";
const STEP_FILE: &str = "file";
const STEP_DOWNLOAD: &str = "download";

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    store: JobStore,
    remover: Arc<dyn BackgroundRemover>,
    config: AppConfig,
    uploads_dir: PathBuf,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        uploads_dir: PathBuf,
        remover: Arc<dyn BackgroundRemover>,
    ) -> Result<Self> {
        for subdir in [ORIGINALS_DIR, PROCESSED_DIR] {
            let dir = uploads_dir.join(subdir);
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create uploads directory: {}", dir.display()))?;
        }

        let store = JobStore::new(uploads_dir.join(JOBS_DIR))?;

        Ok(Self {
            inner: Arc::new(AppStateInner {
                store,
                remover,
                config,
                uploads_dir,
            }),
        })
    }

    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn uploads_dir(&self) -> &std::path::Path {
        &self.inner.uploads_dir
    }

    /// Reclaim storage for jobs past the configured retention period.
    pub fn sweep_expired_jobs(&self) -> Vec<String> {
        let retention = chrono::Duration::hours(self.inner.config.cleanup.retention_hours as i64);
        self.inner.store.sweep_expired(retention, Utc::now())
    }
}

// ─── Request / response bodies ───────────────────────────────────────────────

#[derive(Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub job_id: Option<String>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize)]
pub struct UploadResponse {
    pub success: bool,
    pub job_id: String,
    pub original_url: String,
    pub filename: String,
    pub step: &'static str,
    pub message: &'static str,
    pub next_step: &'static str,
}

#[derive(Serialize)]
pub struct InitiateResponse {
    pub success: bool,
    pub job_id: String,
    pub status: &'static str,
    pub step: &'static str,
    pub message: &'static str,
    pub next_step: &'static str,
}

#[derive(Serialize)]
pub struct ResultData {
    pub filename: String,
    pub original_url: String,
    pub processed_url: String,
    pub original_data: String,
    pub processed_data: String,
    pub user_filename: String,
}

#[derive(Serialize)]
pub struct ProcessResponse {
    pub success: bool,
    pub job_id: String,
    pub status: &'static str,
    pub step: &'static str,
    pub message: &'static str,
    pub data: ResultData,
}

#[derive(Serialize)]
pub struct StatusData {
    pub filename: String,
    pub original_url: String,
    pub processed_url: String,
    pub user_filename: String,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub success: bool,
    pub job_id: String,
    pub status: &'static str,
    pub step: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<StatusData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    step: &'static str,
}

// ─── Errors ──────────────────────────────────────────────────────────────────

pub enum AppError {
    BadRequest(&'static str, String),
    NotFound(&'static str, String),
    PayloadTooLarge(&'static str, String),
    Internal(&'static str, String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, step, message) = match self {
            AppError::BadRequest(step, msg) => (StatusCode::BAD_REQUEST, step, msg),
            AppError::NotFound(step, msg) => (StatusCode::NOT_FOUND, step, msg),
            AppError::PayloadTooLarge(step, msg) => (StatusCode::PAYLOAD_TOO_LARGE, step, msg),
            AppError::Internal(step, msg) => (StatusCode::INTERNAL_SERVER_ERROR, step, msg),
        };

        let body = Json(ErrorBody {
            success: false,
            error: message,
            step,
        });
        (status, body).into_response()
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn app_router(state: AppState) -> Router {
    let max_upload_bytes = state.inner.config.limits.max_upload_bytes;

    Router::new()
        .route("/upload", post(upload_image))
        .route("/initiate-process", post(initiate_process))
        .route("/background-removed", post(background_removed))
        .route("/check-status/{job_id}", get(check_status))
        .route("/file/{*path}", get(serve_file))
        .route("/download/{filename}", get(download_file))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
    })
}

// ─── Step 1: upload ──────────────────────────────────────────────────────────

async fn upload_image(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let max_upload_bytes = state.inner.config.limits.max_upload_bytes;
    let mut upload: Option<(String, Vec<u8>)> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => return Err(multipart_error(err, max_upload_bytes)),
        };

        if field.name() != Some("image") {
            continue;
        }

        let user_filename = field.file_name().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|err| multipart_error(err, max_upload_bytes))?;
        upload = Some((user_filename, bytes.to_vec()));
        break;
    }

    let Some((user_filename, bytes)) = upload else {
        return Err(AppError::BadRequest(STEP_UPLOAD, "No file part".to_string()));
    };

    if user_filename.is_empty() || bytes.is_empty() {
        return Err(AppError::BadRequest(
            STEP_UPLOAD,
            "No file selected".to_string(),
        ));
    }

    let allowed = &state.inner.config.limits.allowed_extensions;
    if !imaging::extension_allowed(&user_filename, allowed) {
        return Err(AppError::BadRequest(
            STEP_UPLOAD,
            format!("File type not allowed: {user_filename}"),
        ));
    }

    imaging::validate_image_bytes(&bytes, allowed)
        .map_err(|err| AppError::BadRequest(STEP_UPLOAD, format!("{err:#}")))?;

    let job_id = Uuid::new_v4().to_string();
    let original_filename = imaging::sanitize_filename(&user_filename);

    let originals_dir = state.inner.uploads_dir.join(ORIGINALS_DIR).join(&job_id);
    tokio::fs::create_dir_all(&originals_dir)
        .await
        .map_err(|err| {
            AppError::Internal(STEP_UPLOAD, format!("failed to create job directory: {err}"))
        })?;

    let original_path = originals_dir.join(&original_filename);
    tokio::fs::write(&original_path, &bytes).await.map_err(|err| {
        AppError::Internal(STEP_UPLOAD, format!("failed to store uploaded image: {err}"))
    })?;

    let job = Job {
        job_id: job_id.clone(),
        status: JobStatus::Uploaded,
        user_filename: user_filename.clone(),
        original_filename,
        original_path,
        processed_filename: None,
        processed_path: None,
        upload_time: Utc::now(),
        process_start_time: None,
        process_end_time: None,
        error: None,
    };

    state.inner.store.create(&job).map_err(|err| {
        AppError::Internal(
            STEP_UPLOAD,
            format!("Failed to save job information: {err:#}"),
        )
    })?;

    info!(job_id = %job_id, filename = %user_filename, size = bytes.len(), "Image uploaded");

    Ok(Json(UploadResponse {
        success: true,
        original_url: original_url(&job),
        job_id,
        filename: user_filename,
        step: "upload_complete",
        message: "Image uploaded successfully",
        next_step: "/initiate-process",
    }))
}

// ─── Step 2: initiate processing ─────────────────────────────────────────────

async fn initiate_process(
    State(state): State<AppState>,
    Json(payload): Json<JobRequest>,
) -> Result<Json<InitiateResponse>, AppError> {
    let job_id = require_job_id(payload.job_id, STEP_INITIATE)?;

    let _guard = state.inner.store.transition_guard(&job_id).await;

    let mut job = state.inner.store.load(&job_id).ok_or_else(|| {
        AppError::NotFound(
            STEP_INITIATE,
            "Job not found. Please upload an image first.".to_string(),
        )
    })?;

    if !job.original_path.exists() {
        return Err(AppError::NotFound(
            STEP_INITIATE,
            "Original file not found. Please upload again.".to_string(),
        ));
    }

    match job.status {
        JobStatus::Uploaded | JobStatus::Processing => {}
        JobStatus::Completed | JobStatus::Failed => {
            return Err(AppError::BadRequest(
                STEP_INITIATE,
                format!(
                    "Job cannot be re-initiated. Current status: {}",
                    job.status.as_str()
                ),
            ));
        }
    }

    // A repeated initiate keeps the status but reassigns the output name.
    let tag = Uuid::new_v4().simple().to_string();
    let processed_filename = format!("bg_removed_{}_{}", &tag[..8], job.original_filename);
    let processed_path = state
        .inner
        .uploads_dir
        .join(PROCESSED_DIR)
        .join(&processed_filename);

    job.status = JobStatus::Processing;
    job.process_start_time = Some(Utc::now());
    job.processed_filename = Some(processed_filename);
    job.processed_path = Some(processed_path);

    state.inner.store.save(&job).map_err(|err| {
        AppError::Internal(
            STEP_INITIATE,
            format!("Failed to save job information: {err:#}"),
        )
    })?;

    info!(job_id = %job_id, "Processing initiated");

    Ok(Json(InitiateResponse {
        success: true,
        job_id,
        status: "processing_initiated",
        step: "processing_initiated",
        message: "Background removal processing initiated successfully",
        next_step: "/background-removed",
    }))
}

// ─── Step 3: perform / collect the removal ───────────────────────────────────

async fn background_removed(
    State(state): State<AppState>,
    Json(payload): Json<JobRequest>,
) -> Result<Json<ProcessResponse>, AppError> {
    let job_id = require_job_id(payload.job_id, STEP_PROCESS)?;

    let _guard = state.inner.store.transition_guard(&job_id).await;

    let mut job = state
        .inner
        .store
        .load(&job_id)
        .ok_or_else(|| AppError::NotFound(STEP_PROCESS, "Job not found".to_string()))?;

    match job.status {
        JobStatus::Completed => {
            // A concurrent request already finished the work; replay it.
            info!(job_id = %job_id, "Job already completed, returning existing result");
            return completed_result(&job).await.map(Json);
        }
        JobStatus::Processing => {}
        JobStatus::Uploaded | JobStatus::Failed => {
            return Err(AppError::BadRequest(
                STEP_PROCESS,
                format!(
                    "Job cannot be processed. Current status: {}",
                    job.status.as_str()
                ),
            ));
        }
    }

    let processed_path = job.processed_path.clone().ok_or_else(|| {
        AppError::Internal(
            STEP_PROCESS,
            "job record has no processed path assigned".to_string(),
        )
    })?;

    let input_bytes = tokio::fs::read(&job.original_path).await.map_err(|err| {
        AppError::Internal(STEP_PROCESS, format!("failed to read original image: {err}"))
    })?;

    info!(job_id = %job_id, "Starting background removal");

    let remover = Arc::clone(&state.inner.remover);
    let max_dimension = state.inner.config.limits.max_dimension;
    let removal = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let input = match imaging::downscale_for_processing(&input_bytes, max_dimension)? {
            Some(downscaled) => downscaled,
            None => input_bytes,
        };
        remover.remove(&input)
    })
    .await
    .map_err(|err| {
        AppError::Internal(STEP_PROCESS, format!("processing task panicked: {err}"))
    })?;

    let outcome = match removal {
        Ok(png_bytes) => write_processed(&processed_path, &png_bytes).await,
        Err(err) => Err(err),
    };

    match outcome {
        Ok(()) => {
            job.status = JobStatus::Completed;
            job.process_end_time = Some(Utc::now());
            state.inner.store.save(&job).map_err(|err| {
                AppError::Internal(
                    STEP_PROCESS,
                    format!("Failed to save job information: {err:#}"),
                )
            })?;

            info!(job_id = %job_id, "Background removal completed");
            completed_result(&job).await.map(Json)
        }
        Err(err) => {
            job.status = JobStatus::Failed;
            job.process_end_time = Some(Utc::now());
            job.error = Some(format!("{err:#}"));

            // Partial output would otherwise be servable as a valid result.
            if processed_path.exists() {
                if let Err(cleanup_err) = tokio::fs::remove_file(&processed_path).await {
                    warn!(job_id = %job_id, error = %cleanup_err, "Failed to remove partial output");
                }
            }

            if let Err(save_err) = state.inner.store.save(&job) {
                error!(job_id = %job_id, error = ?save_err, "Failed to persist failed transition");
            }

            error!(job_id = %job_id, error = %err, "Background removal failed");
            Err(AppError::Internal(
                STEP_PROCESS,
                format!("Processing failed: {err:#}"),
            ))
        }
    }
}

// ─── Status polling ──────────────────────────────────────────────────────────

async fn check_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<StatusResponse>, AppError> {
    let job = state
        .inner
        .store
        .load(&job_id)
        .ok_or_else(|| AppError::NotFound(STEP_STATUS, "Job not found".to_string()))?;

    let mut response = StatusResponse {
        success: true,
        job_id: job.job_id.clone(),
        status: job.status.as_str(),
        step: status_step(job.status),
        message: format!("Job status: {}", job.status.as_str()),
        data: None,
        error: None,
    };

    match job.status {
        JobStatus::Completed => {
            response.data = Some(StatusData {
                filename: job.processed_filename.clone().unwrap_or_default(),
                original_url: original_url(&job),
                processed_url: processed_url(&job).unwrap_or_default(),
                user_filename: job.user_filename.clone(),
            });
        }
        JobStatus::Failed => {
            response.error = Some(
                job.error
                    .clone()
                    .unwrap_or_else(|| "Processing failed".to_string()),
            );
        }
        JobStatus::Uploaded | JobStatus::Processing => {}
    }

    Ok(Json(response))
}

// ─── File serving ────────────────────────────────────────────────────────────

async fn serve_file(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Response, AppError> {
    let segments: Vec<&str> = path.split('/').collect();

    let file_path = match segments.as_slice() {
        [ORIGINALS_DIR, job_id, filename]
            if segment_is_safe(job_id) && segment_is_safe(filename) =>
        {
            state
                .inner
                .uploads_dir
                .join(ORIGINALS_DIR)
                .join(job_id)
                .join(filename)
        }
        [PROCESSED_DIR, filename] if segment_is_safe(filename) => state
            .inner
            .uploads_dir
            .join(PROCESSED_DIR)
            .join(filename),
        _ => {
            return Err(AppError::NotFound(
                STEP_FILE,
                "Resource not found".to_string(),
            ))
        }
    };

    if !file_path.is_file() {
        return Err(AppError::NotFound(
            STEP_FILE,
            "Resource not found".to_string(),
        ));
    }

    let bytes = tokio::fs::read(&file_path)
        .await
        .map_err(|err| AppError::Internal(STEP_FILE, format!("failed to read file: {err}")))?;

    let mime = mime_guess::from_path(&file_path).first_or_octet_stream();
    Ok((StatusCode::OK, [("content-type", mime.as_ref())], bytes).into_response())
}

async fn download_file(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, AppError> {
    if !segment_is_safe(&filename) {
        return Err(AppError::NotFound(
            STEP_DOWNLOAD,
            "Resource not found".to_string(),
        ));
    }

    let file_path = state
        .inner
        .uploads_dir
        .join(PROCESSED_DIR)
        .join(&filename);
    if !file_path.is_file() {
        return Err(AppError::NotFound(
            STEP_DOWNLOAD,
            "Resource not found".to_string(),
        ));
    }

    let bytes = tokio::fs::read(&file_path)
        .await
        .map_err(|err| AppError::Internal(STEP_DOWNLOAD, format!("failed to read file: {err}")))?;

    let mime = mime_guess::from_path(&file_path).first_or_octet_stream();
    let headers = [
        ("content-type", mime.to_string()),
        (
            "content-disposition",
            format!("attachment; filename=\"{filename}\""),
        ),
        (
            "cache-control",
            "no-cache, no-store, must-revalidate".to_string(),
        ),
        ("pragma", "no-cache".to_string()),
        ("expires", "0".to_string()),
    ];

    Ok((StatusCode::OK, headers, bytes).into_response())
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn require_job_id(job_id: Option<String>, step: &'static str) -> Result<String, AppError> {
    job_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(ToOwned::to_owned)
        .ok_or_else(|| AppError::BadRequest(step, "No job ID provided".to_string()))
}

fn multipart_error(
    err: axum::extract::multipart::MultipartError,
    max_upload_bytes: usize,
) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge(
            STEP_UPLOAD,
            format!(
                "File too large. Maximum size is {} MiB",
                max_upload_bytes / (1024 * 1024)
            ),
        )
    } else {
        AppError::BadRequest(STEP_UPLOAD, format!("invalid multipart body: {err}"))
    }
}

fn segment_is_safe(segment: &str) -> bool {
    !segment.is_empty()
        && segment != ".."
        && !segment.starts_with('.')
        && !segment.contains('/')
        && !segment.contains('\\')
}

fn original_url(job: &Job) -> String {
    format!(
        "/file/{ORIGINALS_DIR}/{}/{}",
        job.job_id, job.original_filename
    )
}

fn processed_url(job: &Job) -> Option<String> {
    job.processed_filename
        .as_deref()
        .map(|filename| format!("/file/{PROCESSED_DIR}/{filename}"))
}

fn status_step(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Uploaded => "upload_complete",
        JobStatus::Processing => "processing_initiated",
        JobStatus::Completed => "background_removed",
        JobStatus::Failed => "processing_failed",
    }
}

async fn write_processed(processed_path: &std::path::Path, png_bytes: &[u8]) -> Result<()> {
    if let Some(parent) = processed_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create processed directory: {}", parent.display()))?;
    }
    tokio::fs::write(processed_path, png_bytes)
        .await
        .with_context(|| format!("failed to write processed image: {}", processed_path.display()))
}

/// Build the completed-job payload with both image versions inlined as
/// base64 data URLs.
async fn completed_result(job: &Job) -> Result<ProcessResponse, AppError> {
    let processed_path = job.processed_path.as_deref().ok_or_else(|| {
        AppError::Internal(
            STEP_PROCESS,
            "completed job record has no processed path".to_string(),
        )
    })?;

    let original_mime = mime_guess::from_path(&job.original_filename).first_or_octet_stream();
    let original_data = data_url(&job.original_path, original_mime.as_ref())
        .await
        .map_err(|err| {
            AppError::Internal(
                STEP_PROCESS,
                format!("Failed to generate download data: {err:#}"),
            )
        })?;
    let processed_data = data_url(processed_path, "image/png").await.map_err(|err| {
        AppError::Internal(
            STEP_PROCESS,
            format!("Failed to generate download data: {err:#}"),
        )
    })?;

    Ok(ProcessResponse {
        success: true,
        job_id: job.job_id.clone(),
        status: "completed",
        step: STEP_PROCESS,
        message: "Background removal completed successfully",
        data: ResultData {
            filename: job.processed_filename.clone().unwrap_or_default(),
            original_url: original_url(job),
            processed_url: processed_url(job).unwrap_or_default(),
            original_data,
            processed_data,
            user_filename: job.user_filename.clone(),
        },
    })
}

async fn data_url(path: &std::path::Path, mime: &str) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    Ok(format!("data:{mime};base64,{encoded}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use axum::body::Body;
    use axum::http::Request;
    use image::RgbaImage;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::{Service, ServiceExt};

    const TEST_BOUNDARY: &str = "cutout-test-boundary";

    enum MockOutcome {
        Succeed,
        Fail,
    }

    struct MockRemover {
        outcome: MockOutcome,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl MockRemover {
        fn succeeding() -> Arc<Self> {
            Arc::new(Self {
                outcome: MockOutcome::Succeed,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                outcome: MockOutcome::Fail,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                outcome: MockOutcome::Succeed,
                delay,
                calls: AtomicUsize::new(0),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl BackgroundRemover for MockRemover {
        fn remove(&self, _image_bytes: &[u8]) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            match self.outcome {
                MockOutcome::Succeed => Ok(tiny_png()),
                MockOutcome::Fail => bail!("matting model rejected the input"),
            }
        }
    }

    fn tiny_png() -> Vec<u8> {
        let img = RgbaImage::from_pixel(2, 2, image::Rgba([200, 100, 50, 255]));
        let mut out = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
            .expect("encode test png");
        out
    }

    fn unique_uploads_dir() -> PathBuf {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "cutout-server-test-{}-{timestamp}",
            std::process::id()
        ))
    }

    fn test_state_with(remover: Arc<dyn BackgroundRemover>, config: AppConfig) -> AppState {
        AppState::new(config, unique_uploads_dir(), remover).expect("build test state")
    }

    fn test_state() -> (AppState, Arc<MockRemover>) {
        let remover = MockRemover::succeeding();
        let state = test_state_with(remover.clone(), AppConfig::default());
        (state, remover)
    }

    async fn send_request(router: &mut Router, request: Request<Body>) -> Response {
        router
            .as_service()
            .ready()
            .await
            .unwrap()
            .call(request)
            .await
            .unwrap()
    }

    fn multipart_request(field_name: &str, filename: &str, bytes: &[u8]) -> Request<Body> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{TEST_BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{field_name}\"; filename=\"{filename}\"\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{TEST_BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={TEST_BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn json_request(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn response_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    async fn upload_test_image(router: &mut Router) -> String {
        let resp = send_request(router, multipart_request("image", "cat.png", &tiny_png())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = response_json(resp).await;
        assert_eq!(json["success"], true);
        json["job_id"].as_str().expect("job_id").to_string()
    }

    async fn initiate(router: &mut Router, job_id: &str) {
        let resp = send_request(
            router,
            json_request("/initiate-process", serde_json::json!({"job_id": job_id})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    async fn process(router: &mut Router, job_id: &str) -> Response {
        send_request(
            router,
            json_request("/background-removed", serde_json::json!({"job_id": job_id})),
        )
        .await
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (state, _) = test_state();
        let mut app = app_router(state);

        let resp = send_request(&mut app, get_request("/health")).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let json = response_json(resp).await;
        assert_eq!(json["status"], "healthy");
    }

    #[tokio::test]
    async fn test_upload_then_status_reports_uploaded() {
        let (state, _) = test_state();
        let mut app = app_router(state);

        let job_id = upload_test_image(&mut app).await;

        let resp = send_request(&mut app, get_request(&format!("/check-status/{job_id}"))).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let json = response_json(resp).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["status"], "uploaded");
        assert!(json.get("data").is_none());
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn test_upload_response_includes_original_url() {
        let (state, _) = test_state();
        let mut app = app_router(state);

        let resp = send_request(&mut app, multipart_request("image", "cat.png", &tiny_png())).await;
        let json = response_json(resp).await;

        let job_id = json["job_id"].as_str().unwrap();
        assert_eq!(
            json["original_url"],
            format!("/file/originals/{job_id}/cat.png")
        );
        assert_eq!(json["next_step"], "/initiate-process");
    }

    #[tokio::test]
    async fn test_upload_rejects_missing_image_field() {
        let (state, _) = test_state();
        let mut app = app_router(state);

        let resp = send_request(&mut app, multipart_request("other", "cat.png", &tiny_png())).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let json = response_json(resp).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["step"], "upload");
        assert_eq!(json["error"], "No file part");
    }

    #[tokio::test]
    async fn test_upload_rejects_disallowed_extension_before_creating_job() {
        let (state, _) = test_state();
        let mut app = app_router(state.clone());

        let resp = send_request(
            &mut app,
            multipart_request("image", "notes.txt", b"plain text"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let json = response_json(resp).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["step"], "upload");

        let jobs_dir = state.uploads_dir().join(JOBS_DIR);
        let records = std::fs::read_dir(jobs_dir)
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(records, 0);
    }

    #[tokio::test]
    async fn test_upload_rejects_bytes_that_do_not_decode() {
        let (state, _) = test_state();
        let mut app = app_router(state);

        let resp = send_request(
            &mut app,
            multipart_request("image", "fake.png", b"not actually a png"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let json = response_json(resp).await;
        assert_eq!(json["success"], false);
    }

    #[tokio::test]
    async fn test_upload_rejects_oversized_payload_with_413() {
        let mut config = AppConfig::default();
        config.limits.max_upload_bytes = 1024;
        let state = test_state_with(MockRemover::succeeding(), config);
        let mut app = app_router(state);

        let oversized = vec![0_u8; 4096];
        let resp = send_request(&mut app, multipart_request("image", "big.png", &oversized)).await;
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let json = response_json(resp).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["step"], "upload");
        assert!(json["error"].as_str().unwrap().contains("File too large"));
    }

    #[tokio::test]
    async fn test_initiate_unknown_job_returns_404_without_creating_record() {
        let (state, _) = test_state();
        let mut app = app_router(state.clone());

        let unknown = Uuid::new_v4().to_string();
        let resp = send_request(
            &mut app,
            json_request("/initiate-process", serde_json::json!({"job_id": unknown})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let json = response_json(resp).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["step"], "initiate_process");
        assert!(state.store().load(&unknown).is_none());
    }

    #[tokio::test]
    async fn test_initiate_requires_job_id() {
        let (state, _) = test_state();
        let mut app = app_router(state);

        let resp = send_request(
            &mut app,
            json_request("/initiate-process", serde_json::json!({})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let json = response_json(resp).await;
        assert_eq!(json["error"], "No job ID provided");
    }

    #[tokio::test]
    async fn test_initiate_transitions_job_to_processing() {
        let (state, _) = test_state();
        let mut app = app_router(state.clone());

        let job_id = upload_test_image(&mut app).await;

        let resp = send_request(
            &mut app,
            json_request("/initiate-process", serde_json::json!({"job_id": job_id})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let json = response_json(resp).await;
        assert_eq!(json["status"], "processing_initiated");
        assert_eq!(json["next_step"], "/background-removed");

        let job = state.store().load(&job_id).expect("job record");
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.process_start_time.is_some());
        assert!(job.processed_filename.is_some());
    }

    #[tokio::test]
    async fn test_initiate_twice_keeps_status_but_overwrites_processed_name() {
        let (state, _) = test_state();
        let mut app = app_router(state.clone());

        let job_id = upload_test_image(&mut app).await;

        initiate(&mut app, &job_id).await;
        let first = state
            .store()
            .load(&job_id)
            .and_then(|job| job.processed_filename)
            .expect("first processed name");

        initiate(&mut app, &job_id).await;
        let job = state.store().load(&job_id).expect("job record");
        let second = job.processed_filename.expect("second processed name");

        assert_eq!(job.status, JobStatus::Processing);
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_process_completes_job_and_returns_data_urls() {
        let (state, remover) = test_state();
        let mut app = app_router(state.clone());

        let job_id = upload_test_image(&mut app).await;
        initiate(&mut app, &job_id).await;

        let resp = process(&mut app, &job_id).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let json = response_json(resp).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["status"], "completed");
        assert!(json["data"]["original_data"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));
        assert!(json["data"]["processed_data"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));
        assert_eq!(remover.call_count(), 1);

        let job = state.store().load(&job_id).expect("job record");
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.processed_path.as_deref().unwrap().is_file());
    }

    #[tokio::test]
    async fn test_status_after_completion_reports_urls() {
        let (state, _) = test_state();
        let mut app = app_router(state);

        let job_id = upload_test_image(&mut app).await;
        initiate(&mut app, &job_id).await;
        let resp = process(&mut app, &job_id).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = send_request(&mut app, get_request(&format!("/check-status/{job_id}"))).await;
        let json = response_json(resp).await;

        assert_eq!(json["status"], "completed");
        let original_url = json["data"]["original_url"].as_str().unwrap();
        let processed_url = json["data"]["processed_url"].as_str().unwrap();
        assert!(!original_url.is_empty());
        assert!(processed_url.starts_with("/file/processed/"));
    }

    #[tokio::test]
    async fn test_process_failure_marks_job_failed_and_removes_partial_output() {
        let state = test_state_with(MockRemover::failing(), AppConfig::default());
        let mut app = app_router(state.clone());

        let job_id = upload_test_image(&mut app).await;
        initiate(&mut app, &job_id).await;

        let resp = process(&mut app, &job_id).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let json = response_json(resp).await;
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().unwrap().contains("Processing failed"));

        let resp = send_request(&mut app, get_request(&format!("/check-status/{job_id}"))).await;
        let json = response_json(resp).await;
        assert_eq!(json["status"], "failed");
        assert!(!json["error"].as_str().unwrap().is_empty());

        let job = state.store().load(&job_id).expect("job record");
        assert_eq!(job.status, JobStatus::Failed);
        assert!(!job.processed_path.as_deref().unwrap().exists());
    }

    #[tokio::test]
    async fn test_process_before_initiate_is_rejected() {
        let (state, _) = test_state();
        let mut app = app_router(state);

        let job_id = upload_test_image(&mut app).await;

        let resp = process(&mut app, &job_id).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let json = response_json(resp).await;
        assert!(json["error"]
            .as_str()
            .unwrap()
            .contains("Current status: uploaded"));
    }

    #[tokio::test]
    async fn test_failed_job_cannot_be_reinitiated() {
        let state = test_state_with(MockRemover::failing(), AppConfig::default());
        let mut app = app_router(state);

        let job_id = upload_test_image(&mut app).await;
        initiate(&mut app, &job_id).await;
        let resp = process(&mut app, &job_id).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let resp = send_request(
            &mut app,
            json_request("/initiate-process", serde_json::json!({"job_id": job_id})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let json = response_json(resp).await;
        assert!(json["error"]
            .as_str()
            .unwrap()
            .contains("Current status: failed"));
    }

    #[tokio::test]
    async fn test_process_on_completed_job_replays_without_rerunning_model() {
        let (state, remover) = test_state();
        let mut app = app_router(state);

        let job_id = upload_test_image(&mut app).await;
        initiate(&mut app, &job_id).await;
        assert_eq!(process(&mut app, &job_id).await.status(), StatusCode::OK);

        let resp = process(&mut app, &job_id).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let json = response_json(resp).await;
        assert_eq!(json["status"], "completed");
        assert_eq!(remover.call_count(), 1);
    }

    #[tokio::test]
    async fn test_check_status_unknown_job_returns_404() {
        let (state, _) = test_state();
        let mut app = app_router(state);

        let resp = send_request(
            &mut app,
            get_request(&format!("/check-status/{}", Uuid::new_v4())),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let json = response_json(resp).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["step"], "check_status");
    }

    #[tokio::test]
    async fn test_serve_original_roundtrip() {
        let (state, _) = test_state();
        let mut app = app_router(state);

        let resp = send_request(&mut app, multipart_request("image", "cat.png", &tiny_png())).await;
        let json = response_json(resp).await;
        let original_url = json["original_url"].as_str().unwrap().to_string();

        let resp = send_request(&mut app, get_request(&original_url)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "image/png"
        );

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body.as_ref(), tiny_png().as_slice());
    }

    #[tokio::test]
    async fn test_serve_file_unknown_returns_404() {
        let (state, _) = test_state();
        let mut app = app_router(state);

        let resp = send_request(
            &mut app,
            get_request(&format!("/file/originals/{}/missing.png", Uuid::new_v4())),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_serve_file_blocks_path_traversal() {
        let (state, _) = test_state();
        let mut app = app_router(state);

        for uri in [
            "/file/originals/../../etc/passwd",
            "/file/processed/..",
            "/file/originals/job/.hidden",
            "/file/etc/passwd",
        ] {
            let resp = send_request(&mut app, get_request(uri)).await;
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "uri: {uri}");
        }
    }

    #[tokio::test]
    async fn test_download_sets_attachment_and_cache_headers() {
        let (state, _) = test_state();
        let mut app = app_router(state.clone());

        let job_id = upload_test_image(&mut app).await;
        initiate(&mut app, &job_id).await;
        assert_eq!(process(&mut app, &job_id).await.status(), StatusCode::OK);

        let filename = state
            .store()
            .load(&job_id)
            .and_then(|job| job.processed_filename)
            .expect("processed filename");

        let resp = send_request(&mut app, get_request(&format!("/download/{filename}"))).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let headers = resp.headers();
        assert!(headers
            .get("content-disposition")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("attachment"));
        assert_eq!(
            headers.get("cache-control").unwrap(),
            "no-cache, no-store, must-revalidate"
        );
        assert_eq!(headers.get("pragma").unwrap(), "no-cache");
    }

    #[tokio::test]
    async fn test_download_unknown_file_returns_404() {
        let (state, _) = test_state();
        let mut app = app_router(state);

        let resp = send_request(&mut app, get_request("/download/missing.png")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let json = response_json(resp).await;
        assert_eq!(json["step"], "download");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_process_requests_collapse_to_one_removal() {
        let remover = MockRemover::slow(Duration::from_millis(100));
        let state = test_state_with(remover.clone(), AppConfig::default());
        let mut app = app_router(state);

        let job_id = upload_test_image(&mut app).await;
        initiate(&mut app, &job_id).await;

        let request_body = serde_json::json!({"job_id": job_id});
        let first = app
            .clone()
            .oneshot(json_request("/background-removed", request_body.clone()));
        let second = app
            .clone()
            .oneshot(json_request("/background-removed", request_body));

        let (first, second) = tokio::join!(first, second);
        let first = first.unwrap();
        let second = second.unwrap();

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(remover.call_count(), 1);
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_job_via_state() {
        let (state, _) = test_state();
        let mut app = app_router(state.clone());

        let job_id = upload_test_image(&mut app).await;
        initiate(&mut app, &job_id).await;
        assert_eq!(process(&mut app, &job_id).await.status(), StatusCode::OK);

        // Age the record past retention, then sweep.
        let mut job = state.store().load(&job_id).expect("job record");
        job.upload_time = Utc::now() - chrono::Duration::hours(48);
        job.process_end_time = Some(Utc::now() - chrono::Duration::hours(47));
        state.store().save(&job).expect("age job");

        let removed = state.sweep_expired_jobs();
        assert_eq!(removed, vec![job_id.clone()]);

        let resp = send_request(&mut app, get_request(&format!("/check-status/{job_id}"))).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(!job.original_path.exists());
        assert!(!job.processed_path.as_deref().unwrap().exists());
    }
}
