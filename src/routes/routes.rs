//! Defines routes for the photo backup API.
//!
//! ## Structure
//! - **Photo endpoints** (all require the external auth layer's
//!   `x-user-id` identity header)
//!   - `POST /photos/index`          — reconcile a batch of photos for one date
//!   - `POST /photos/upload`         — buffered upload (multipart form)
//!   - `POST /photos/upload/stream`  — streamed upload (raw request body)
//!   - `POST /photos/upload/chunk`   — resumable chunked upload (multipart form)
//!
//! - **Probes** (mounted at root)
//!   - `GET /healthz` — liveness
//!   - `GET /readyz`  — readiness (index store + disk)

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        photo_handlers::{index_photos, upload_photo, upload_photo_chunk, upload_photo_stream},
    },
    services::photo_service::PhotoService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Body limit for buffered uploads and single chunks; clients split bigger
/// files across chunks or use the streaming endpoint.
const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

/// Build and return the router for all photo backup routes.
///
/// The router carries shared state (`PhotoService`) to all handlers.
pub fn routes() -> Router<PhotoService> {
    Router::new()
        // buffered endpoints, capped per request
        .route("/photos/index", post(index_photos))
        .route("/photos/upload", post(upload_photo))
        .route("/photos/upload/chunk", post(upload_photo_chunk))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        // streaming endpoint copies to disk without buffering, so no cap
        .route(
            "/photos/upload/stream",
            post(upload_photo_stream).layer(DefaultBodyLimit::disable()),
        )
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}
