//! Durable per-user photo index backed by SQLite.
//!
//! One `photos` table keyed by `(user_id, local_id)` holds every user's
//! records; isolation comes from scoping every query by `user_id`. Sequence
//! numbers are handed out by a `date_sequences` counter row updated in a
//! single atomic upsert, so two concurrent index batches for the same
//! (user, date) can never allocate the same number.

use crate::models::photo::Photo;
use crate::services::{PhotoError, PhotoResult};
use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Clone)]
pub struct IndexStore {
    db: Arc<SqlitePool>,
}

impl IndexStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Look up one photo record by its client-assigned identifier.
    pub async fn find_by_local_id(
        &self,
        user_id: i64,
        local_id: &str,
    ) -> PhotoResult<Option<Photo>> {
        let photo = sqlx::query_as::<_, Photo>(
            "SELECT user_id, local_id, creation_time, directory_path, base_name,
                    primary_format, uploaded_formats, file_count, created_at, updated_at
             FROM photos WHERE user_id = ? AND local_id = ?",
        )
        .bind(user_id)
        .bind(local_id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(photo)
    }

    /// Number of records whose directory corresponds to one calendar date.
    pub async fn count_by_date(&self, user_id: i64, directory_path: &str) -> PhotoResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM photos WHERE user_id = ? AND directory_path = ?",
        )
        .bind(user_id)
        .bind(directory_path)
        .fetch_one(&*self.db)
        .await?;
        Ok(count)
    }

    /// Atomically allocate the next sequence number for (user, date).
    ///
    /// The first call for a date inserts the counter row at `seed` (the
    /// caller derives it from `count_by_date`); every later call increments
    /// the row inside the same upsert statement. If two batches race on the
    /// initial insert, the loser takes the increment path, so numbers are
    /// never handed out twice.
    pub async fn allocate_sequence(&self, user_id: i64, date: &str, seed: i64) -> PhotoResult<i64> {
        let sequence = sqlx::query_scalar::<_, i64>(
            "INSERT INTO date_sequences (user_id, date, last_seq)
             VALUES (?, ?, ?)
             ON CONFLICT(user_id, date) DO UPDATE SET last_seq = last_seq + 1
             RETURNING last_seq",
        )
        .bind(user_id)
        .bind(date)
        .bind(seed)
        .fetch_one(&*self.db)
        .await?;
        Ok(sequence)
    }

    /// Insert a new photo record. Returns `Conflict` if the `local_id` is
    /// already indexed for this user.
    pub async fn create(&self, photo: &Photo) -> PhotoResult<()> {
        let result = sqlx::query(
            "INSERT INTO photos (
                user_id, local_id, creation_time, directory_path, base_name,
                primary_format, uploaded_formats, file_count, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(photo.user_id)
        .bind(&photo.local_id)
        .bind(photo.creation_time)
        .bind(&photo.directory_path)
        .bind(&photo.base_name)
        .bind(&photo.primary_format)
        .bind(&photo.uploaded_formats)
        .bind(photo.file_count)
        .bind(photo.created_at)
        .bind(photo.updated_at)
        .execute(&*self.db)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                Err(PhotoError::Conflict(photo.local_id.clone()))
            }
            Err(err) => Err(PhotoError::Persistence(err)),
        }
    }

    /// Add `format` to a photo's uploaded set if absent and return the
    /// resulting set. Re-adding a present format leaves the row untouched.
    ///
    /// The union is optimistic: the update only lands if the stored set is
    /// still the one that was read, so two concurrent unions can never
    /// erase each other's format. A lost race re-reads and retries. The
    /// variant count is written in the same statement, keeping it in step
    /// with the set.
    pub async fn update_uploaded_formats(
        &self,
        user_id: i64,
        local_id: &str,
        format: &str,
    ) -> PhotoResult<BTreeSet<String>> {
        loop {
            let photo = self
                .find_by_local_id(user_id, local_id)
                .await?
                .ok_or_else(|| PhotoError::NotFound(local_id.to_string()))?;

            let mut formats = photo.formats();
            if !formats.insert(format.to_string()) {
                return Ok(formats);
            }

            let encoded = serde_json::to_string(&formats)
                .map_err(|err| PhotoError::Validation(format!("encoding format set: {}", err)))?;
            let result = sqlx::query(
                "UPDATE photos SET uploaded_formats = ?, file_count = ?, updated_at = ?
                 WHERE user_id = ? AND local_id = ? AND uploaded_formats = ?",
            )
            .bind(&encoded)
            .bind(formats.len() as i64)
            .bind(Utc::now())
            .bind(user_id)
            .bind(local_id)
            .bind(&photo.uploaded_formats)
            .execute(&*self.db)
            .await?;

            if result.rows_affected() == 1 {
                return Ok(formats);
            }
            // Another upload changed the set between the read and the
            // update. Start over from the fresh row.
        }
    }

    /// Full scan of one user's records. Used by maintenance tooling only.
    pub async fn list_all(&self, user_id: i64) -> PhotoResult<Vec<Photo>> {
        let photos = sqlx::query_as::<_, Photo>(
            "SELECT user_id, local_id, creation_time, directory_path, base_name,
                    primary_format, uploaded_formats, file_count, created_at, updated_at
             FROM photos WHERE user_id = ? ORDER BY directory_path, base_name",
        )
        .bind(user_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(photos)
    }

    /// Readiness probe hook: cheapest possible round-trip to SQLite.
    pub async fn ping(&self) -> PhotoResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

#[cfg(test)]
pub(crate) async fn test_store() -> IndexStore {
    use sqlx::sqlite::SqlitePoolOptions;

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("open in-memory sqlite");
    for stmt in include_str!("../../migrations/0001_init.sql")
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        sqlx::query(stmt).execute(&pool).await.expect("migrate");
    }
    IndexStore::new(Arc::new(pool))
}
