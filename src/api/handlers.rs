//! API handlers

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::media::params::{guess_type, DEFAULT_CONTENT_TYPE};
use crate::media::{Content, MediaWriter};
use crate::storage::PresignParams;
use crate::Error;

type ApiError = (StatusCode, String);

fn error_response(err: Error) -> ApiError {
    let status = match &err {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        e if e.is_input_error() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(error = %err, "Media request failed");
    }
    (status, err.to_string())
}

/// Health check
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        location: state.storage.config().location.clone(),
    })
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub location: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct SaveQuery {
    /// Upper bound on the stored name, in characters
    pub max_length: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SaveResponse {
    pub name: String,
    pub size: u64,
}

/// Save the request body in one transfer
pub async fn save_media(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<SaveQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let storage = &state.storage;
    let name = storage
        .get_available_name(&name, query.max_length)
        .await
        .map_err(error_response)?;

    let size = body.len() as u64;
    let mut content = Content::from_bytes(body);
    if let Some(content_type) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    {
        content = content.with_content_type(content_type);
    }

    let name = storage
        .save(&name, &mut content)
        .await
        .map_err(error_response)?;

    Ok((StatusCode::CREATED, Json(SaveResponse { name, size })).into_response())
}

#[derive(Debug, Serialize)]
pub struct StreamResponse {
    pub name: String,
    pub size: u64,
    pub parts: usize,
}

/// Stream the request body into a multipart upload
pub async fn stream_media(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<SaveQuery>,
    body: Body,
) -> Result<Response, ApiError> {
    let storage = &state.storage;
    let name = storage
        .get_available_name(&name, query.max_length)
        .await
        .map_err(error_response)?;

    let mut writer = storage.open_write(&name).map_err(error_response)?;
    if let Err(err) = copy_body(&mut writer, body).await {
        let key = writer.key().to_string();
        if let Err(e) = writer.abort().await {
            tracing::warn!(%key, error = %e, "Failed to abort streamed upload");
        }
        return Err(err);
    }

    let size = writer.bytes_written();
    let name = writer.name().to_string();
    // the last segment is uploaded by close
    let parts = writer.parts_uploaded() + usize::from(writer.buffered() > 0);
    writer.close().await.map_err(error_response)?;

    Ok((StatusCode::CREATED, Json(StreamResponse { name, size, parts })).into_response())
}

async fn copy_body(writer: &mut MediaWriter, body: Body) -> Result<(), ApiError> {
    let mut chunks = body.into_data_stream();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
        writer.write(&chunk).await.map_err(error_response)?;
    }
    Ok(())
}

/// Read a stored object
pub async fn read_media(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let mut reader = state
        .storage
        .open_read(&name)
        .await
        .map_err(error_response)?;
    let data = reader.read(None).await.map_err(error_response)?;

    let content_type = match reader.content_type() {
        Some(stored) => stored.to_string(),
        None => guess_type(reader.name())
            .0
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
    };
    reader.close().await.map_err(error_response)?;

    Ok(([(header::CONTENT_TYPE, content_type)], data).into_response())
}

pub async fn delete_media(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.storage.delete(&name).await.map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
pub struct ExistsResponse {
    pub name: String,
    pub exists: bool,
}

pub async fn exists(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ExistsResponse>, ApiError> {
    let exists = state.storage.exists(&name).await.map_err(error_response)?;
    Ok(Json(ExistsResponse { name, exists }))
}

#[derive(Debug, Serialize)]
pub struct SizeResponse {
    pub name: String,
    pub size: u64,
}

pub async fn size(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<SizeResponse>, ApiError> {
    let size = state.storage.size(&name).await.map_err(error_response)?;
    Ok(Json(SizeResponse { name, size }))
}

/// Response overrides for presigned URLs
#[derive(Debug, Default, Deserialize)]
pub struct UrlQuery {
    pub response_content_type: Option<String>,
    pub response_content_disposition: Option<String>,
    pub response_cache_control: Option<String>,
    pub version_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UrlResponse {
    pub url: String,
}

pub async fn url(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<UrlQuery>,
) -> Result<Json<UrlResponse>, ApiError> {
    let params = PresignParams {
        response_content_type: query.response_content_type,
        response_content_disposition: query.response_content_disposition,
        response_cache_control: query.response_cache_control,
        version_id: query.version_id,
    };
    let url = state
        .storage
        .url(&name, Some(&params))
        .await
        .map_err(error_response)?;
    Ok(Json(UrlResponse { url }))
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub directories: Vec<String>,
    pub files: Vec<String>,
}

pub async fn list_root(State(state): State<AppState>) -> Result<Json<ListResponse>, ApiError> {
    list_dir(&state, "").await
}

pub async fn list(
    State(state): State<AppState>,
    Path(prefix): Path<String>,
) -> Result<Json<ListResponse>, ApiError> {
    list_dir(&state, &prefix).await
}

async fn list_dir(state: &AppState, prefix: &str) -> Result<Json<ListResponse>, ApiError> {
    let (directories, files) = state
        .storage
        .listdir(prefix)
        .await
        .map_err(error_response)?;
    Ok(Json(ListResponse { directories, files }))
}
