//! Represents one logical photo in the per-user index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeSet;
use std::path::PathBuf;

/// A single indexed photo, scoped to one user.
///
/// One record exists per `local_id`; the record tracks the storage location
/// assigned at index time and which format variants have been uploaded so
/// far. The record stores metadata only, never the photo bytes.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Photo {
    /// Owning user (from the external auth layer).
    pub user_id: i64,

    /// Client-assigned identifier, unique within the user's scope.
    pub local_id: String,

    /// Capture timestamp supplied by the client. Also applied to stored
    /// files as their modification time.
    pub creation_time: DateTime<Utc>,

    /// Directory the photo's files live in, computed once at index time.
    pub directory_path: String,

    /// Sequential basename (e.g. `IMG_0001`), assigned once, no extension.
    pub base_name: String,

    /// Format string supplied at index time (informational).
    pub primary_format: String,

    /// JSON-encoded array of format strings successfully stored to disk.
    pub uploaded_formats: String,

    /// Count of stored format variants.
    pub file_count: i64,

    /// Row bookkeeping.
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Photo {
    /// Decode `uploaded_formats` into a set. Malformed stored JSON is
    /// treated as an empty set rather than an error.
    pub fn formats(&self) -> BTreeSet<String> {
        serde_json::from_str(&self.uploaded_formats).unwrap_or_default()
    }

    /// Full destination path for one format variant:
    /// `directory_path/base_name.format`.
    pub fn target_path(&self, format: &str) -> PathBuf {
        PathBuf::from(&self.directory_path).join(format!("{}.{}", self.base_name, format))
    }

    /// Filename (with extension) for one format variant.
    pub fn filename(&self, format: &str) -> String {
        format!("{}.{}", self.base_name, format)
    }
}
