//! HTTP handlers for photo indexing and the three upload modes.
//! Parsing and payload shaping only; all photo semantics live in
//! `PhotoService`.

use crate::{
    errors::AppError,
    services::photo_service::{PhotoIndexRequest, PhotoService},
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Query, State},
    http::{StatusCode, request::Parts},
    response::IntoResponse,
};
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::io;

/// Authenticated numeric user identity, injected by the external auth layer
/// as the `x-user-id` header. Nothing else about authentication enters this
/// service.
pub struct UserId(pub i64);

impl<S> axum::extract::FromRequestParts<S> for UserId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-user-id")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<i64>().ok())
            .map(UserId)
            .ok_or_else(|| {
                AppError::new(StatusCode::UNAUTHORIZED, "missing or invalid user identity")
            })
    }
}

/// Body of `POST /photos/index`.
#[derive(Debug, Deserialize)]
pub struct IndexRequest {
    pub date: String,
    pub photos: Vec<PhotoIndexRequest>,
}

/// Query params for `POST /photos/upload/stream`.
#[derive(Debug, Deserialize)]
pub struct StreamUploadQuery {
    pub local_id: String,
    pub format: String,
}

/// `POST /photos/index` — reconcile a batch of photos for one date.
pub async fn index_photos(
    State(service): State<PhotoService>,
    user: UserId,
    Json(req): Json<IndexRequest>,
) -> Result<impl IntoResponse, AppError> {
    tracing::info!(
        user_id = user.0,
        date = %req.date,
        photo_count = req.photos.len(),
        "indexing photos"
    );
    let assigned = service.index_photos(user.0, &req.date, req.photos).await?;

    Ok(Json(json!({
        "status": "success",
        "date": req.date,
        "assigned": assigned,
    })))
}

/// `POST /photos/upload` — buffered upload via multipart form
/// (`local_id`, `format`, `file`).
pub async fn upload_photo(
    State(service): State<PhotoService>,
    user: UserId,
    multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let mut fields = collect_fields(multipart).await?;
    let local_id = fields.take_text("local_id")?;
    let format = fields.take_text("format")?;
    let data = fields.take_bytes("file")?;

    tracing::info!(
        user_id = user.0,
        %local_id,
        %format,
        size = data.len(),
        "uploading photo"
    );
    let outcome = service.upload(user.0, &local_id, &format, &data).await?;

    Ok(Json(json!({
        "status": "success",
        "message": "File uploaded",
        "local_id": outcome.local_id,
        "filename": outcome.filename,
        "file_path": outcome.file_path,
    })))
}

/// `POST /photos/upload/stream` — raw request body copied straight to disk.
pub async fn upload_photo_stream(
    State(service): State<PhotoService>,
    user: UserId,
    Query(query): Query<StreamUploadQuery>,
    body: Body,
) -> Result<impl IntoResponse, AppError> {
    tracing::info!(
        user_id = user.0,
        local_id = %query.local_id,
        format = %query.format,
        "streaming photo upload"
    );

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));
    let outcome = service
        .upload_stream(user.0, &query.local_id, &query.format, stream)
        .await?;

    Ok(Json(json!({
        "status": "success",
        "message": "File uploaded (streamed)",
        "local_id": outcome.local_id,
        "filename": outcome.filename,
        "file_path": outcome.file_path,
    })))
}

/// `POST /photos/upload/chunk` — one chunk of a resumable upload via
/// multipart form (`local_id`, `format`, `chunk_number`, `total_chunks`,
/// `chunk_data`).
pub async fn upload_photo_chunk(
    State(service): State<PhotoService>,
    user: UserId,
    multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let mut fields = collect_fields(multipart).await?;
    let local_id = fields.take_text("local_id")?;
    let format = fields.take_text("format")?;
    let chunk_number = parse_number(&fields.take_text("chunk_number")?, "chunk_number")?;
    let total_chunks = parse_number(&fields.take_text("total_chunks")?, "total_chunks")?;
    let data = fields.take_bytes("chunk_data")?;

    tracing::info!(
        user_id = user.0,
        %local_id,
        %format,
        chunk_number,
        total_chunks,
        chunk_size = data.len(),
        "uploading photo chunk"
    );
    let result = service
        .upload_chunk(user.0, &local_id, &format, chunk_number, total_chunks, &data)
        .await?;

    let body = match result.completed {
        Some(outcome) => json!({
            "status": "success",
            "message": "File uploaded (chunked)",
            "local_id": outcome.local_id,
            "filename": outcome.filename,
            "file_path": outcome.file_path,
            "chunk_number": result.chunk_number,
            "total_chunks": result.total_chunks,
            "is_complete": true,
        }),
        None => json!({
            "status": "success",
            "message": "Chunk uploaded",
            "local_id": local_id,
            "chunk_number": result.chunk_number,
            "total_chunks": result.total_chunks,
            "is_complete": false,
        }),
    };
    Ok(Json(body))
}

/// Multipart form fields, drained up front so required-field errors read
/// the same regardless of field order on the wire.
struct FormFields {
    text: Vec<(String, String)>,
    bytes: Vec<(String, Bytes)>,
}

impl FormFields {
    fn take_text(&mut self, name: &str) -> Result<String, AppError> {
        self.text
            .iter()
            .position(|(field, _)| field == name)
            .map(|idx| self.text.swap_remove(idx).1)
            .ok_or_else(|| AppError::bad_request(format!("{} is required", name)))
    }

    fn take_bytes(&mut self, name: &str) -> Result<Bytes, AppError> {
        self.bytes
            .iter()
            .position(|(field, _)| field == name)
            .map(|idx| self.bytes.swap_remove(idx).1)
            .ok_or_else(|| AppError::bad_request(format!("{} is required", name)))
    }
}

async fn collect_fields(mut multipart: Multipart) -> Result<FormFields, AppError> {
    let mut fields = FormFields {
        text: Vec::new(),
        bytes: Vec::new(),
    };
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(format!("failed to parse multipart form: {}", err)))?
    {
        let Some(name) = field.name().map(str::to_owned) else {
            continue;
        };
        if matches!(name.as_str(), "file" | "chunk_data") {
            let data = field.bytes().await.map_err(|err| {
                AppError::bad_request(format!("failed to read field {}: {}", name, err))
            })?;
            fields.bytes.push((name, data));
        } else {
            let value = field.text().await.map_err(|err| {
                AppError::bad_request(format!("failed to read field {}: {}", name, err))
            })?;
            fields.text.push((name, value));
        }
    }
    Ok(fields)
}

fn parse_number(value: &str, name: &str) -> Result<u32, AppError> {
    value
        .trim()
        .parse()
        .map_err(|_| AppError::bad_request(format!("invalid {} format", name)))
}
