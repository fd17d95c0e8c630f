//! Route handlers. Each one is a thin adapter over the `Dispatcher`.

use axum::body::Bytes;
use axum::extract::multipart::MultipartRejection;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use safexec_core::{DispatchError, ExecutionResult, HistoryEntry};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, ServerError};
use crate::AppState;

pub const BANNER: &str = "Safe Code Executor API is running!";
pub const DEFAULT_LANGUAGE: &str = "python";
const UPLOAD_FIELD: &str = "file";
const NO_UPLOAD: &str = "No ZIP file uploaded";

/// Health check response.
#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
    pub provider: String,
}

#[derive(Debug, PartialEq)]
pub struct RunRequest {
    pub code: String,
    pub language: String,
}

impl RunRequest {
    /// Parses a `/run` body. An empty or non-object body is treated the same
    /// as one without `code`.
    pub fn parse(body: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
        let code = match value.get("code") {
            Some(Value::String(code)) => code.clone(),
            Some(Value::Null) | None => return Err(ServerError::missing_field("code")),
            Some(_) => return Err(ServerError::invalid_request("'code' must be a string")),
        };
        let language = match value.get("language") {
            Some(Value::String(language)) => language.clone(),
            Some(Value::Null) | None => DEFAULT_LANGUAGE.to_string(),
            Some(_) => return Err(ServerError::invalid_request("'language' must be a string")),
        };
        Ok(Self { code, language })
    }
}

fn result_response(result: ExecutionResult) -> Response {
    let status = if result.is_success() {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(result)).into_response()
}

pub async fn root_handler() -> &'static str {
    BANNER
}

pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        provider: state.dispatcher.launcher().provider().name().to_string(),
    })
}

pub async fn run_handler(State(state): State<AppState>, body: Bytes) -> Result<Response> {
    let request = RunRequest::parse(&body)?;
    log::debug!(
        "Run request: language={}, {} chars",
        request.language,
        request.code.chars().count()
    );

    let result = state
        .dispatcher
        .run_snippet(&request.language, &request.code)
        .await;
    Ok(result_response(result))
}

pub async fn run_zip_handler(
    State(state): State<AppState>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Response {
    let (filename, bytes) = match read_upload(multipart).await {
        Ok(upload) => upload,
        Err(e) => {
            log::debug!("Rejected upload: {}", e);
            return result_response(e.into());
        }
    };
    log::debug!("Project upload {} ({} bytes)", filename, bytes.len());

    let result = state.dispatcher.run_archive(bytes.to_vec()).await;
    result_response(result)
}

/// Pulls the `file` field out of a multipart body. Rejections use the same
/// failure shape as archive validation errors.
async fn read_upload(
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> std::result::Result<(String, Bytes), DispatchError> {
    let mut multipart = multipart.map_err(|e| {
        log::debug!("Upload is not multipart: {}", e);
        DispatchError::invalid_archive(NO_UPLOAD)
    })?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| DispatchError::invalid_archive(format!("Malformed upload: {}", e)))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        if !filename.ends_with(".zip") {
            return Err(DispatchError::invalid_archive("File must be a ZIP"));
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|e| DispatchError::invalid_archive(format!("Malformed upload: {}", e)))?;
        return Ok((filename, bytes));
    }
    Err(DispatchError::invalid_archive(NO_UPLOAD))
}

pub async fn history_handler(State(state): State<AppState>) -> Result<Json<Vec<HistoryEntry>>> {
    Ok(Json(state.dispatcher.recent().await?))
}
