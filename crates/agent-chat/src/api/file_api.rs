//! Uploads and their converted page images.

use axum::{
    body::Body,
    extract::{Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::ApiError;
use crate::auth::AuthUser;
use crate::chat_db::{FileRecord, ProcessingStatus};
use crate::conversion::DocumentKind;
use crate::shared_state::AppState;
use crate::thread_pool::ConversionJob;

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub file_id: i64,
    pub filename: String,
    pub file_type: String,
    pub processing_status: ProcessingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_count: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct FileSummary {
    pub id: i64,
    pub filename: String,
    pub file_type: String,
    pub file_size: i64,
    pub processing_status: ProcessingStatus,
    pub created_at: DateTime<Utc>,
}

impl From<FileRecord> for FileSummary {
    fn from(file: FileRecord) -> Self {
        Self {
            id: file.id,
            filename: file.filename,
            file_type: file.file_type,
            file_size: file.file_size,
            processing_status: file.processing_status,
            created_at: file.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FileListResponse {
    pub files: Vec<FileSummary>,
}

#[derive(Debug, Serialize)]
pub struct FileStatusResponse {
    pub file_id: i64,
    pub processing_status: ProcessingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PageImageResponse {
    pub page: i64,
    pub image_id: i64,
    pub width: u32,
    pub height: u32,
    pub image_data_base64: String,
}

#[derive(Debug, Serialize)]
pub struct FileImagesResponse {
    pub file_id: i64,
    pub images: Vec<PageImageResponse>,
}

struct Upload {
    filename: String,
    content_type: Option<String>,
    data: Vec<u8>,
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> ApiError {
    let status = err.status();
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::payload_too_large("File too large")
    } else {
        ApiError::new(status, format!("Invalid multipart body: {}", err.body_text()))
    }
}

fn owned_file(state: &AppState, user_id: i64, file_id: i64) -> Result<FileRecord, ApiError> {
    state
        .database
        .files
        .get_file(user_id, file_id)?
        .ok_or_else(|| ApiError::not_found("File not found"))
}

/// POST /api/files/upload
///
/// Multipart field `file` carries the document; optional repeated `images`
/// fields carry pages the browser already rendered from a PDF.
pub async fn upload_file(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), ApiError> {
    let max_size = state.config.conversion.max_file_size;
    let mut upload: Option<Upload> = None;
    let mut client_pages: Vec<Vec<u8>> = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        match field.name() {
            Some("file") => {
                let filename = field.file_name().unwrap_or("upload").to_string();
                let content_type = field.content_type().map(str::to_string);
                let data = field.bytes().await.map_err(multipart_error)?;
                upload = Some(Upload {
                    filename,
                    content_type,
                    data: data.to_vec(),
                });
            }
            Some("images") => {
                let data = field.bytes().await.map_err(multipart_error)?;
                if !data.is_empty() {
                    client_pages.push(data.to_vec());
                }
            }
            _ => {}
        }
    }

    let upload = upload.ok_or_else(|| ApiError::bad_request("No file provided"))?;
    if upload.data.len() > max_size {
        warn!(size = upload.data.len(), max_size, "Upload rejected: too large");
        return Err(ApiError::payload_too_large(format!(
            "File too large; the maximum size is {} bytes",
            max_size
        )));
    }
    let mime = upload
        .content_type
        .clone()
        .ok_or_else(|| ApiError::bad_request("Missing content type"))?;
    let kind = DocumentKind::from_mime(&mime)
        .ok_or_else(|| ApiError::bad_request(format!("Unsupported file type: {}", mime)))?;
    if kind != DocumentKind::Pdf {
        client_pages.clear();
    }

    let file_id = state
        .database
        .files
        .create_file(user.id, &upload.filename, kind.as_str(), &mime, &upload.data)?;
    state.counters.inc_uploaded_files();
    let image_count = (!client_pages.is_empty()).then_some(client_pages.len());

    let queued = state.conversion.submit(ConversionJob {
        file_id,
        kind,
        data: upload.data,
        client_pages,
    })?;
    let processing_status = if queued {
        ProcessingStatus::Pending
    } else {
        ProcessingStatus::Failed
    };
    info!(file_id, user_id = user.id, kind = %kind, queued, "File uploaded");

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            file_id,
            filename: upload.filename,
            file_type: kind.as_str().to_string(),
            processing_status,
            image_count,
        }),
    ))
}

/// GET /api/files
pub async fn list_files(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<FileListResponse>, ApiError> {
    let files = state.database.files.list_files(user.id)?;
    Ok(Json(FileListResponse {
        files: files.into_iter().map(Into::into).collect(),
    }))
}

/// GET /api/files/:id/status
pub async fn file_status(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(file_id): Path<i64>,
) -> Result<Json<FileStatusResponse>, ApiError> {
    let file = owned_file(&state, user.id, file_id)?;
    let image_count = match file.processing_status {
        ProcessingStatus::Completed => Some(state.database.files.count_images(file_id)?),
        _ => None,
    };
    Ok(Json(FileStatusResponse {
        file_id,
        processing_status: file.processing_status,
        image_count,
        error_message: file.error_message,
    }))
}

/// GET /api/files/:id/images
pub async fn file_images(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(file_id): Path<i64>,
) -> Result<Json<FileImagesResponse>, ApiError> {
    owned_file(&state, user.id, file_id)?;
    let images = state
        .database
        .files
        .list_images(file_id)?
        .into_iter()
        .map(|image| PageImageResponse {
            page: image.page_number,
            image_id: image.id,
            width: image.width,
            height: image.height,
            image_data_base64: STANDARD.encode(&image.image_data),
        })
        .collect();
    Ok(Json(FileImagesResponse { file_id, images }))
}

/// GET /api/files/:id/images/:page
pub async fn file_image_page(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((file_id, page)): Path<(i64, i64)>,
) -> Result<Response, ApiError> {
    owned_file(&state, user.id, file_id)?;
    let image = state
        .database
        .files
        .get_image(file_id, page)?
        .ok_or_else(|| ApiError::not_found("Page not found"))?;
    Ok(([(header::CONTENT_TYPE, image.mime_type)], image.image_data).into_response())
}

/// GET /api/files/:id
pub async fn download_file(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(file_id): Path<i64>,
) -> Result<Response, ApiError> {
    let file = owned_file(&state, user.id, file_id)?;
    let data = state
        .database
        .files
        .get_file_data(user.id, file_id)?
        .ok_or_else(|| ApiError::not_found("File not found"))?;
    let disposition = format!(
        "attachment; filename=\"{}\"",
        file.filename.replace(['"', '\\', '\r', '\n'], "_")
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, file.mime_type)
        .header(header::CONTENT_DISPOSITION, disposition)
        .body(Body::from(data))
        .map_err(|e| ApiError::internal(format!("Failed to build response: {}", e)))
}

/// DELETE /api/files/:id
pub async fn delete_file(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(file_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if !state.database.files.delete_file(user.id, file_id)? {
        return Err(ApiError::not_found("File not found"));
    }
    info!(file_id, user_id = user.id, "File deleted");
    Ok(StatusCode::NO_CONTENT)
}
