//! Upload coordinator.
//!
//! Orchestrates the three ingestion modes (buffered, streamed, chunked)
//! against the index store and the file store, and owns index
//! reconciliation: deciding which photos in a batch are new, assigning
//! sequence numbers, and answering re-submitted index requests without
//! allocating anything twice.

use crate::models::photo::Photo;
use crate::services::{
    PhotoError, PhotoResult, file_store,
    index_store::IndexStore,
    naming,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeSet, HashMap},
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex as StdMutex},
    time::{Duration, Instant},
};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

/// One photo in an index request batch.
#[derive(Debug, Clone, Deserialize)]
pub struct PhotoIndexRequest {
    pub local_id: String,
    pub creation_time: DateTime<Utc>,
    pub format: String,
}

/// One photo in an index response. `uploaded_formats` is empty for photos
/// created by this batch and reflects prior uploads for re-indexed ones.
#[derive(Debug, Clone, Serialize)]
pub struct IndexedPhoto {
    pub local_id: String,
    pub uploaded_formats: Vec<String>,
}

/// Result of a completed upload, in any mode.
#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub local_id: String,
    pub filename: String,
    pub file_path: String,
}

/// Result of one chunk submission. `completed` is set once the final chunk
/// triggered the merge.
#[derive(Debug)]
pub struct ChunkUpload {
    pub chunk_number: u32,
    pub total_chunks: u32,
    pub completed: Option<UploadOutcome>,
}

/// Sessions idle past this window are dropped from the registry. Their
/// staged chunks stay on disk, so a later resume rehydrates where the
/// client left off.
const IDLE_SESSION_TTL: Duration = Duration::from_secs(60 * 60);

/// Transient reassembly state for one chunked-upload target.
///
/// The staged-index set is hydrated from the on-disk staging directory the
/// first time the session is locked, so an interrupted upload resumes after
/// a restart. `merged` latches the collecting-to-complete transition so the
/// merge runs at most once even under concurrent chunk arrivals.
/// `abandoned` marks a session destroyed for a protocol violation; any
/// submission still holding it is turned away.
struct ChunkSession {
    total_chunks: u32,
    received: BTreeSet<u32>,
    hydrated: bool,
    merged: bool,
    abandoned: bool,
    touched: Instant,
}

/// Registry of live chunk sessions, keyed by destination path. Each session
/// carries its own async mutex; a handler holds it across stage, completion
/// check, and merge, making the session single-owner for that window.
#[derive(Default)]
struct ChunkSessions {
    inner: StdMutex<HashMap<PathBuf, Arc<AsyncMutex<ChunkSession>>>>,
}

impl ChunkSessions {
    fn entry(&self, target: &Path, total_chunks: u32) -> Arc<AsyncMutex<ChunkSession>> {
        self.sweep_idle(IDLE_SESSION_TTL);
        let mut map = self.inner.lock().expect("chunk session registry poisoned");
        map.entry(target.to_path_buf())
            .or_insert_with(|| {
                Arc::new(AsyncMutex::new(ChunkSession {
                    total_chunks,
                    received: BTreeSet::new(),
                    hydrated: false,
                    merged: false,
                    abandoned: false,
                    touched: Instant::now(),
                }))
            })
            .clone()
    }

    fn remove(&self, target: &Path) {
        let mut map = self.inner.lock().expect("chunk session registry poisoned");
        map.remove(target);
    }

    /// Drop sessions nobody has touched within `ttl`. A session whose mutex
    /// is currently held is in use and always kept.
    fn sweep_idle(&self, ttl: Duration) {
        let mut map = self.inner.lock().expect("chunk session registry poisoned");
        map.retain(|_, session| match session.try_lock() {
            Ok(state) => state.touched.elapsed() < ttl,
            Err(_) => true,
        });
    }
}

/// Coordinates photo indexing and the three upload modes.
#[derive(Clone)]
pub struct PhotoService {
    pub index: IndexStore,
    pub storage_dir: PathBuf,
    chunk_sessions: Arc<ChunkSessions>,
}

impl PhotoService {
    pub fn new(index: IndexStore, storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            index,
            storage_dir: storage_dir.into(),
            chunk_sessions: Arc::new(ChunkSessions::default()),
        }
    }

    /// Reconcile a batch of photos for one date.
    ///
    /// Photos are processed (and answered) in ascending `creation_time`
    /// order, ties keeping submission order, so sequence numbers follow
    /// capture chronology. Already-indexed photos are answered from their
    /// existing record; only new photos consume sequence numbers. Every
    /// tuple is vetted before any record is created, so a malformed tuple
    /// rejects the whole batch without applying anything; only a storage
    /// fault mid-batch can leave earlier records applied.
    pub async fn index_photos(
        &self,
        user_id: i64,
        date: &str,
        photos: Vec<PhotoIndexRequest>,
    ) -> PhotoResult<Vec<IndexedPhoto>> {
        let parsed = naming::parse_date(date)?;
        let directory = naming::directory_for(&self.storage_dir, user_id, parsed);
        let directory = directory.to_string_lossy().into_owned();

        let existing_count = self.index.count_by_date(user_id, &directory).await?;
        let seed = naming::next_sequence(existing_count);

        let mut batch = photos;
        batch.sort_by_key(|photo| photo.creation_time);

        // Vet the whole batch up front; one bad tuple must not leave the
        // earlier tuples applied.
        let mut vetted = Vec::with_capacity(batch.len());
        for request in batch {
            if request.local_id.is_empty() {
                return Err(PhotoError::Validation("local_id is required".into()));
            }
            let format = normalize_format(&request.format)?;
            vetted.push((request, format));
        }

        let mut assigned = Vec::with_capacity(vetted.len());
        for (request, format) in vetted {
            if let Some(existing) = self
                .index
                .find_by_local_id(user_id, &request.local_id)
                .await?
            {
                // Idempotent re-index: no new allocation, no mutation.
                let uploaded_formats = existing.formats().into_iter().collect();
                assigned.push(IndexedPhoto {
                    local_id: existing.local_id,
                    uploaded_formats,
                });
                continue;
            }

            let sequence = self.index.allocate_sequence(user_id, date, seed).await?;
            let now = Utc::now();
            let record = Photo {
                user_id,
                local_id: request.local_id.clone(),
                creation_time: request.creation_time,
                directory_path: directory.clone(),
                base_name: naming::base_name_for(sequence),
                primary_format: format,
                uploaded_formats: "[]".to_string(),
                file_count: 0,
                created_at: now,
                updated_at: now,
            };

            match self.index.create(&record).await {
                Ok(()) => {
                    debug!(
                        local_id = %record.local_id,
                        base_name = %record.base_name,
                        "indexed new photo"
                    );
                    assigned.push(IndexedPhoto {
                        local_id: record.local_id,
                        uploaded_formats: Vec::new(),
                    });
                }
                Err(PhotoError::Conflict(local_id)) => {
                    // Lost a create race: answer from the winner's record.
                    let existing = self
                        .index
                        .find_by_local_id(user_id, &local_id)
                        .await?
                        .ok_or(PhotoError::Conflict(local_id))?;
                    let uploaded_formats = existing.formats().into_iter().collect();
                    assigned.push(IndexedPhoto {
                        local_id: existing.local_id,
                        uploaded_formats,
                    });
                }
                Err(err) => return Err(err),
            }
        }

        info!(user_id, date, count = assigned.len(), "indexed photo batch");
        Ok(assigned)
    }

    /// Buffered upload: the whole payload is already in memory.
    ///
    /// When a file of exactly the same size is already at the destination
    /// the write is skipped as a redundant re-upload; the post-write steps
    /// still run so index state converges.
    pub async fn upload(
        &self,
        user_id: i64,
        local_id: &str,
        format: &str,
        data: &[u8],
    ) -> PhotoResult<UploadOutcome> {
        let format = normalize_format(format)?;
        let photo = self.resolve(user_id, local_id).await?;
        let target = photo.target_path(&format);

        if file_store::file_size(&target).await? == Some(data.len() as u64) {
            debug!(local_id, %format, "same-size file already stored, skipping write");
        } else {
            file_store::save(&target, data).await?;
        }

        self.finish_upload(&photo, &format, &target).await
    }

    /// Streamed upload: bytes are copied from the transport to disk without
    /// buffering the whole payload. Preferred for large files.
    pub async fn upload_stream<S>(
        &self,
        user_id: i64,
        local_id: &str,
        format: &str,
        stream: S,
    ) -> PhotoResult<UploadOutcome>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let format = normalize_format(format)?;
        let photo = self.resolve(user_id, local_id).await?;
        let target = photo.target_path(&format);

        let written = file_store::save_stream(&target, stream).await?;
        debug!(local_id, %format, written, "streamed upload stored");

        self.finish_upload(&photo, &format, &target).await
    }

    /// Chunked upload: stage one chunk and merge once all chunks are in.
    ///
    /// Chunks may arrive in any order and each chunk number may be
    /// re-submitted (overwriting its staged bytes). The session's mutex is
    /// held across stage, completion check, and merge, and the `merged`
    /// latch guarantees the merge fires exactly once per session.
    pub async fn upload_chunk(
        &self,
        user_id: i64,
        local_id: &str,
        format: &str,
        chunk_number: u32,
        total_chunks: u32,
        data: &[u8],
    ) -> PhotoResult<ChunkUpload> {
        if total_chunks == 0 {
            return Err(PhotoError::Validation("total_chunks must be positive".into()));
        }
        if chunk_number >= total_chunks {
            return Err(PhotoError::Validation(format!(
                "chunk_number {} out of range 0..{}",
                chunk_number, total_chunks
            )));
        }

        let format = normalize_format(format)?;
        let photo = self.resolve(user_id, local_id).await?;
        let target = photo.target_path(&format);

        let session = self.chunk_sessions.entry(&target, total_chunks);
        let mut state = session.lock().await;
        state.touched = Instant::now();

        if state.abandoned {
            return Err(PhotoError::Validation(
                "upload session was abandoned, resubmit all chunks".into(),
            ));
        }
        if state.merged {
            // A concurrent submission completed the file after this chunk
            // was accepted for staging. Clean up and answer as complete.
            file_store::remove_staging(&target).await?;
            let outcome = self.outcome(&photo, &format, &target);
            return Ok(ChunkUpload {
                chunk_number,
                total_chunks,
                completed: Some(outcome),
            });
        }
        if state.total_chunks != total_chunks {
            // Protocol violation: destroy the session and its staged
            // chunks instead of letting them accumulate.
            let open_total = state.total_chunks;
            state.abandoned = true;
            drop(state);
            self.chunk_sessions.remove(&target);
            file_store::remove_staging(&target).await?;
            return Err(PhotoError::Validation(format!(
                "total_chunks {} does not match open session ({})",
                total_chunks, open_total
            )));
        }
        if !state.hydrated {
            // Pick up chunks staged by a previous process run.
            state.received = file_store::list_chunks(&target).await?;
            state.hydrated = true;
        }

        file_store::write_chunk(&target, chunk_number, data).await?;
        state.received.insert(chunk_number);
        debug!(
            local_id,
            chunk_number,
            total_chunks,
            staged = state.received.len(),
            "staged chunk"
        );

        // Complete when every distinct index has arrived, not merely when
        // the highest index shows up.
        if state.received.len() as u32 != total_chunks {
            return Ok(ChunkUpload {
                chunk_number,
                total_chunks,
                completed: None,
            });
        }

        file_store::merge_chunks(&target, total_chunks).await?;
        let outcome = self.finish_upload(&photo, &format, &target).await?;
        file_store::remove_staging(&target).await?;
        state.merged = true;
        drop(state);
        self.chunk_sessions.remove(&target);

        info!(local_id, total_chunks, "chunked upload merged");
        Ok(ChunkUpload {
            chunk_number,
            total_chunks,
            completed: Some(outcome),
        })
    }

    /// Re-apply `creation_time` to every stored format variant of one
    /// user's photos. Maintenance path for files written before timestamp
    /// fix-up existed. Returns (files fixed, files missing on disk).
    pub async fn fix_photo_times(&self, user_id: i64, dry_run: bool) -> PhotoResult<(u64, u64)> {
        let photos = self.index.list_all(user_id).await?;
        let mut fixed = 0;
        let mut missing = 0;
        for photo in &photos {
            for format in photo.formats() {
                let path = photo.target_path(&format);
                if !file_store::exists(&path).await? {
                    missing += 1;
                    continue;
                }
                if !dry_run {
                    file_store::set_file_times(&path, photo.creation_time).await?;
                }
                fixed += 1;
            }
        }
        info!(user_id, fixed, missing, dry_run, "fixed photo file times");
        Ok((fixed, missing))
    }

    async fn resolve(&self, user_id: i64, local_id: &str) -> PhotoResult<Photo> {
        self.index
            .find_by_local_id(user_id, local_id)
            .await?
            .ok_or_else(|| PhotoError::NotFound(local_id.to_string()))
    }

    /// Post-write steps shared by every upload mode: stamp the file with
    /// the capture time, then fold the format into the uploaded set (which
    /// also refreshes the variant count).
    async fn finish_upload(
        &self,
        photo: &Photo,
        format: &str,
        target: &Path,
    ) -> PhotoResult<UploadOutcome> {
        file_store::set_file_times(target, photo.creation_time).await?;
        self.index
            .update_uploaded_formats(photo.user_id, &photo.local_id, format)
            .await?;
        Ok(self.outcome(photo, format, target))
    }

    fn outcome(&self, photo: &Photo, format: &str, target: &Path) -> UploadOutcome {
        UploadOutcome {
            local_id: photo.local_id.clone(),
            filename: photo.filename(format),
            file_path: target.to_string_lossy().into_owned(),
        }
    }
}

/// Normalize and vet a format string before it becomes part of a path.
fn normalize_format(format: &str) -> PhotoResult<String> {
    let format = format.trim().to_ascii_lowercase();
    if format.is_empty() {
        return Err(PhotoError::Validation("format is required".into()));
    }
    if format.contains(['/', '\\', '.']) || format.bytes().any(|b| b.is_ascii_control()) {
        return Err(PhotoError::Validation(format!("invalid format `{}`", format)));
    }
    Ok(format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::index_store::test_store;
    use chrono::TimeZone;
    use std::time::SystemTime;
    use uuid::Uuid;

    async fn test_service() -> (PhotoService, PathBuf) {
        let dir = std::env::temp_dir().join(format!("photo-backup-test-{}", Uuid::new_v4()));
        (PhotoService::new(test_store().await, &dir), dir)
    }

    fn request(local_id: &str, hour: u32, format: &str) -> PhotoIndexRequest {
        PhotoIndexRequest {
            local_id: local_id.to_string(),
            creation_time: Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap(),
            format: format.to_string(),
        }
    }

    async fn cleanup(dir: &Path) {
        let _ = tokio::fs::remove_dir_all(dir).await;
    }

    #[tokio::test]
    async fn assigns_sequences_in_capture_order() {
        let (service, dir) = test_service().await;

        // `a` was submitted first but captured later; `b` gets the lower
        // sequence number.
        let assigned = service
            .index_photos(1, "2024-05-01", vec![request("a", 10, "jpg"), request("b", 9, "heic")])
            .await
            .unwrap();

        assert_eq!(assigned.len(), 2);
        assert_eq!(assigned[0].local_id, "b");
        assert_eq!(assigned[1].local_id, "a");

        let b = service.index.find_by_local_id(1, "b").await.unwrap().unwrap();
        let a = service.index.find_by_local_id(1, "a").await.unwrap().unwrap();
        assert_eq!(b.base_name, "IMG_0001");
        assert_eq!(a.base_name, "IMG_0002");
        assert!(a.directory_path.ends_with("photo/1/2024/05/01"));
        cleanup(&dir).await;
    }

    #[tokio::test]
    async fn response_order_is_stable_across_repeated_calls() {
        let (service, dir) = test_service().await;
        let batch = vec![request("a", 10, "jpg"), request("b", 9, "jpg")];

        let first = service.index_photos(1, "2024-05-01", batch.clone()).await.unwrap();
        let second = service.index_photos(1, "2024-05-01", batch).await.unwrap();

        let order = |assigned: &[IndexedPhoto]| {
            assigned.iter().map(|p| p.local_id.clone()).collect::<Vec<_>>()
        };
        assert_eq!(order(&first), vec!["b", "a"]);
        assert_eq!(order(&first), order(&second));
        cleanup(&dir).await;
    }

    #[tokio::test]
    async fn re_index_keeps_base_name_and_allocates_nothing() {
        let (service, dir) = test_service().await;

        service
            .index_photos(1, "2024-05-01", vec![request("a", 10, "jpg")])
            .await
            .unwrap();
        let before = service.index.find_by_local_id(1, "a").await.unwrap().unwrap();

        // Same photo again plus one genuinely new photo.
        service
            .index_photos(1, "2024-05-01", vec![request("a", 10, "jpg"), request("c", 11, "jpg")])
            .await
            .unwrap();

        let after = service.index.find_by_local_id(1, "a").await.unwrap().unwrap();
        assert_eq!(after.base_name, before.base_name);
        let c = service.index.find_by_local_id(1, "c").await.unwrap().unwrap();
        assert_eq!(c.base_name, "IMG_0002");
        cleanup(&dir).await;
    }

    #[tokio::test]
    async fn re_index_reports_uploaded_formats() {
        let (service, dir) = test_service().await;
        service
            .index_photos(1, "2024-05-01", vec![request("a", 10, "jpg")])
            .await
            .unwrap();
        service.upload(1, "a", "jpg", b"bytes").await.unwrap();

        let assigned = service
            .index_photos(1, "2024-05-01", vec![request("a", 10, "jpg")])
            .await
            .unwrap();
        assert_eq!(assigned[0].uploaded_formats, vec!["jpg"]);
        cleanup(&dir).await;
    }

    #[tokio::test]
    async fn rejects_malformed_dates() {
        let (service, dir) = test_service().await;
        let err = service
            .index_photos(1, "05/01/2024", vec![request("a", 10, "jpg")])
            .await
            .unwrap_err();
        assert!(matches!(err, PhotoError::Validation(_)));
        cleanup(&dir).await;
    }

    #[tokio::test]
    async fn upload_requires_prior_index_record() {
        let (service, dir) = test_service().await;
        let err = service.upload(1, "ghost", "jpg", b"bytes").await.unwrap_err();
        assert!(matches!(err, PhotoError::NotFound(id) if id == "ghost"));
        cleanup(&dir).await;
    }

    #[tokio::test]
    async fn upload_tracks_format_set_and_file_count() {
        let (service, dir) = test_service().await;
        service
            .index_photos(1, "2024-05-01", vec![request("a", 10, "jpg")])
            .await
            .unwrap();

        let outcome = service.upload(1, "a", "jpg", b"jpeg bytes").await.unwrap();
        assert_eq!(outcome.filename, "IMG_0001.jpg");
        service.upload(1, "a", "heic", b"heic bytes!").await.unwrap();
        // Re-uploading an already-stored format leaves the set unchanged.
        service.upload(1, "a", "jpg", b"jpeg again").await.unwrap();

        let photo = service.index.find_by_local_id(1, "a").await.unwrap().unwrap();
        assert_eq!(photo.formats().len(), 2);
        assert_eq!(photo.file_count, 2);
        cleanup(&dir).await;
    }

    #[tokio::test]
    async fn upload_stamps_file_with_creation_time() {
        let (service, dir) = test_service().await;
        service
            .index_photos(1, "2024-05-01", vec![request("a", 10, "jpg")])
            .await
            .unwrap();
        let outcome = service.upload(1, "a", "jpg", b"bytes").await.unwrap();

        let mtime = tokio::fs::metadata(&outcome.file_path)
            .await
            .unwrap()
            .modified()
            .unwrap();
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        assert_eq!(mtime, SystemTime::from(expected));
        cleanup(&dir).await;
    }

    #[tokio::test]
    async fn same_size_upload_is_skipped_as_redundant() {
        let (service, dir) = test_service().await;
        service
            .index_photos(1, "2024-05-01", vec![request("a", 10, "jpg")])
            .await
            .unwrap();

        let outcome = service.upload(1, "a", "jpg", b"aaaa").await.unwrap();
        // Same size is treated as a redundant retry and not rewritten.
        service.upload(1, "a", "jpg", b"bbbb").await.unwrap();
        assert_eq!(tokio::fs::read(&outcome.file_path).await.unwrap(), b"aaaa");

        // A different size always overwrites (last write wins).
        service.upload(1, "a", "jpg", b"cccccc").await.unwrap();
        assert_eq!(tokio::fs::read(&outcome.file_path).await.unwrap(), b"cccccc");
        cleanup(&dir).await;
    }

    #[tokio::test]
    async fn streamed_upload_matches_buffered_contract() {
        let (service, dir) = test_service().await;
        service
            .index_photos(1, "2024-05-01", vec![request("a", 10, "jpg")])
            .await
            .unwrap();

        let chunks: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"streamed ")),
            Ok(Bytes::from_static(b"payload")),
        ];
        let outcome = service
            .upload_stream(1, "a", "jpg", futures::stream::iter(chunks))
            .await
            .unwrap();

        assert_eq!(
            tokio::fs::read(&outcome.file_path).await.unwrap(),
            b"streamed payload"
        );
        let photo = service.index.find_by_local_id(1, "a").await.unwrap().unwrap();
        assert_eq!(photo.formats().into_iter().collect::<Vec<_>>(), vec!["jpg"]);
        cleanup(&dir).await;
    }

    #[tokio::test]
    async fn chunks_merge_out_of_order() {
        let (service, dir) = test_service().await;
        service
            .index_photos(1, "2024-05-01", vec![request("a", 10, "jpg")])
            .await
            .unwrap();

        let first = service.upload_chunk(1, "a", "jpg", 2, 3, b"!").await.unwrap();
        assert!(first.completed.is_none());
        let second = service.upload_chunk(1, "a", "jpg", 0, 3, b"hello ").await.unwrap();
        assert!(second.completed.is_none());
        let third = service.upload_chunk(1, "a", "jpg", 1, 3, b"world").await.unwrap();
        let outcome = third.completed.expect("final chunk completes the upload");

        assert_eq!(
            tokio::fs::read(&outcome.file_path).await.unwrap(),
            b"hello world!"
        );
        let photo = service.index.find_by_local_id(1, "a").await.unwrap().unwrap();
        assert_eq!(photo.formats().into_iter().collect::<Vec<_>>(), vec!["jpg"]);
        assert!(
            file_store::list_chunks(Path::new(&outcome.file_path))
                .await
                .unwrap()
                .is_empty()
        );
        cleanup(&dir).await;
    }

    #[tokio::test]
    async fn single_chunk_upload_completes_immediately() {
        let (service, dir) = test_service().await;
        service
            .index_photos(1, "2024-05-01", vec![request("a", 10, "jpg")])
            .await
            .unwrap();
        let result = service.upload_chunk(1, "a", "jpg", 0, 1, b"whole").await.unwrap();
        let outcome = result.completed.unwrap();
        assert_eq!(tokio::fs::read(&outcome.file_path).await.unwrap(), b"whole");
        cleanup(&dir).await;
    }

    #[tokio::test]
    async fn chunk_number_out_of_range_is_rejected() {
        let (service, dir) = test_service().await;
        service
            .index_photos(1, "2024-05-01", vec![request("a", 10, "jpg")])
            .await
            .unwrap();
        let err = service.upload_chunk(1, "a", "jpg", 3, 3, b"x").await.unwrap_err();
        assert!(matches!(err, PhotoError::Validation(_)));
        let err = service.upload_chunk(1, "a", "jpg", 0, 0, b"x").await.unwrap_err();
        assert!(matches!(err, PhotoError::Validation(_)));
        cleanup(&dir).await;
    }

    #[tokio::test]
    async fn total_chunks_mismatch_abandons_session() {
        let (service, dir) = test_service().await;
        service
            .index_photos(1, "2024-05-01", vec![request("a", 10, "jpg")])
            .await
            .unwrap();
        service.upload_chunk(1, "a", "jpg", 0, 3, b"x").await.unwrap();
        let err = service.upload_chunk(1, "a", "jpg", 1, 4, b"y").await.unwrap_err();
        assert!(matches!(err, PhotoError::Validation(_)));

        // The session and its staged chunks are destroyed, not left to
        // accumulate; a restart with a consistent total begins clean.
        assert!(service.chunk_sessions.inner.lock().unwrap().is_empty());
        let first = service.upload_chunk(1, "a", "jpg", 0, 2, b"he").await.unwrap();
        assert!(first.completed.is_none());
        let done = service.upload_chunk(1, "a", "jpg", 1, 2, b"y!").await.unwrap();
        let outcome = done.completed.expect("restarted upload completes");
        assert_eq!(tokio::fs::read(&outcome.file_path).await.unwrap(), b"hey!");
        cleanup(&dir).await;
    }

    #[tokio::test]
    async fn idle_sessions_are_evicted_and_resume_from_disk() {
        let (service, dir) = test_service().await;
        service
            .index_photos(1, "2024-05-01", vec![request("a", 10, "jpg")])
            .await
            .unwrap();
        let partial = service.upload_chunk(1, "a", "jpg", 0, 2, b"hel").await.unwrap();
        assert!(partial.completed.is_none());
        assert_eq!(service.chunk_sessions.inner.lock().unwrap().len(), 1);

        // A zero TTL makes every unlocked session idle.
        service.chunk_sessions.sweep_idle(Duration::ZERO);
        assert!(service.chunk_sessions.inner.lock().unwrap().is_empty());

        // Staged bytes survive eviction; the next chunk rehydrates from
        // disk and merges.
        let done = service.upload_chunk(1, "a", "jpg", 1, 2, b"lo").await.unwrap();
        let outcome = done.completed.expect("resumed upload completes");
        assert_eq!(tokio::fs::read(&outcome.file_path).await.unwrap(), b"hello");
        cleanup(&dir).await;
    }

    #[tokio::test]
    async fn concurrent_final_chunks_merge_exactly_once() {
        let (service, dir) = test_service().await;
        service
            .index_photos(1, "2024-05-01", vec![request("a", 10, "jpg")])
            .await
            .unwrap();
        service.upload_chunk(1, "a", "jpg", 0, 2, b"hello ").await.unwrap();

        // Duplicate submissions of the last chunk race for the merge. Both
        // must succeed; the loser either observes the finished file or is
        // told to keep going, never a failed double merge.
        let (left, right) = tokio::join!(
            service.upload_chunk(1, "a", "jpg", 1, 2, b"world"),
            service.upload_chunk(1, "a", "jpg", 1, 2, b"world"),
        );
        let left = left.unwrap();
        let right = right.unwrap();
        let completions = [&left, &right]
            .iter()
            .filter(|result| result.completed.is_some())
            .count();
        assert!(completions >= 1, "one submission must observe completion");

        let outcome = left.completed.or(right.completed).unwrap();
        assert_eq!(
            tokio::fs::read(&outcome.file_path).await.unwrap(),
            b"hello world"
        );
        let photo = service.index.find_by_local_id(1, "a").await.unwrap().unwrap();
        assert_eq!(photo.formats().into_iter().collect::<Vec<_>>(), vec!["jpg"]);
        assert_eq!(photo.file_count, 1);
        cleanup(&dir).await;
    }

    #[tokio::test]
    async fn bad_tuple_rejects_batch_before_any_create() {
        let (service, dir) = test_service().await;

        // The empty local_id sorts after `a`; vetting up front means `a`
        // is still not created.
        let err = service
            .index_photos(1, "2024-05-01", vec![request("a", 10, "jpg"), request("", 11, "jpg")])
            .await
            .unwrap_err();
        assert!(matches!(err, PhotoError::Validation(_)));
        assert!(service.index.find_by_local_id(1, "a").await.unwrap().is_none());

        // Same for a malformed format later in the batch.
        let err = service
            .index_photos(1, "2024-05-01", vec![request("b", 10, "jpg"), request("c", 11, "a/b")])
            .await
            .unwrap_err();
        assert!(matches!(err, PhotoError::Validation(_)));
        assert!(service.index.find_by_local_id(1, "b").await.unwrap().is_none());
        cleanup(&dir).await;
    }

    #[tokio::test]
    async fn fix_photo_times_restamps_stored_variants() {
        let (service, dir) = test_service().await;
        service
            .index_photos(1, "2024-05-01", vec![request("a", 10, "jpg")])
            .await
            .unwrap();
        let outcome = service.upload(1, "a", "jpg", b"bytes").await.unwrap();

        // Disturb the timestamp, then repair it.
        file_store::set_file_times(Path::new(&outcome.file_path), Utc::now())
            .await
            .unwrap();
        let (fixed, missing) = service.fix_photo_times(1, false).await.unwrap();
        assert_eq!((fixed, missing), (1, 0));

        let mtime = tokio::fs::metadata(&outcome.file_path)
            .await
            .unwrap()
            .modified()
            .unwrap();
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        assert_eq!(mtime, SystemTime::from(expected));
        cleanup(&dir).await;
    }

    #[tokio::test]
    async fn normalize_format_rejects_path_fragments() {
        assert!(normalize_format("JPG").is_ok_and(|f| f == "jpg"));
        assert!(normalize_format("").is_err());
        assert!(normalize_format("../etc").is_err());
        assert!(normalize_format("a/b").is_err());
    }
}
