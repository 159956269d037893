//! Service layer: naming, index persistence, file storage, and the upload
//! coordinator that ties them together.

pub mod file_store;
pub mod index_store;
pub mod naming;
pub mod photo_service;

use std::io;
use thiserror::Error;

/// Failure taxonomy for the photo subsystem.
///
/// Nothing here is retried internally; uploads and index reconciliation are
/// idempotent, so clients retry safely on `Storage`/`Persistence` failures.
#[derive(Debug, Error)]
pub enum PhotoError {
    /// Malformed date, missing field, or a chunk index out of range.
    #[error("invalid request: {0}")]
    Validation(String),
    /// Upload referenced a `local_id` with no prior index record.
    #[error("photo `{0}` not found")]
    NotFound(String),
    /// Index create collided with an existing `local_id`.
    #[error("photo `{0}` already indexed")]
    Conflict(String),
    /// Disk I/O failure.
    #[error(transparent)]
    Storage(#[from] io::Error),
    /// Index store failure.
    #[error(transparent)]
    Persistence(#[from] sqlx::Error),
}

pub type PhotoResult<T> = Result<T, PhotoError>;
