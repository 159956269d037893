//! Filesystem-facing primitives.
//!
//! Byte-level operations only: write, read, stat, delete, timestamps, and
//! chunk staging/merge. No photo-domain knowledge lives here; callers pass
//! fully-resolved paths. Directory creation is idempotent throughout.

use crate::services::PhotoResult;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, pin_mut};
use std::{
    collections::BTreeSet,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::SystemTime,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use uuid::Uuid;

/// Write a complete payload to `path`, overwriting any existing file.
/// Parent directories are created as needed.
pub async fn save(path: &Path, data: &[u8]) -> PhotoResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, data).await?;
    Ok(())
}

/// Stream a payload to `path` without buffering it in memory.
///
/// Bytes are written to a temporary file first, fsynced, then renamed into
/// place, so a cancelled or failed transfer never leaves a partial file at
/// the destination. Returns the number of bytes written.
pub async fn save_stream<S>(path: &Path, stream: S) -> PhotoResult<u64>
where
    S: Stream<Item = io::Result<Bytes>> + Send,
{
    let parent = path
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| io::Error::other("destination path missing parent directory"))?;
    fs::create_dir_all(&parent).await?;
    let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
    let mut file = File::create(&tmp_path).await?;

    let mut written: u64 = 0;
    pin_mut!(stream);
    while let Some(chunk_res) = stream.next().await {
        let chunk = match chunk_res {
            Ok(chunk) => chunk,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err.into());
            }
        };
        written += chunk.len() as u64;
        if let Err(err) = file.write_all(&chunk).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
    }
    if let Err(err) = finalize(file).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(err.into());
    }

    rename_over(&tmp_path, path).await?;
    Ok(written)
}

/// Read a whole file into memory.
pub async fn read(path: &Path) -> PhotoResult<Vec<u8>> {
    Ok(fs::read(path).await?)
}

/// Check whether a file exists.
pub async fn exists(path: &Path) -> PhotoResult<bool> {
    match fs::metadata(path).await {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// File size in bytes, or `None` if the file does not exist.
pub async fn file_size(path: &Path) -> PhotoResult<Option<u64>> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta.len())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Delete a file. Missing files are not an error.
pub async fn delete(path: &Path) -> PhotoResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Set both access and modification times of a file to `when`.
pub async fn set_file_times(path: &Path, when: DateTime<Utc>) -> PhotoResult<()> {
    let path = path.to_path_buf();
    let when: SystemTime = when.into();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::options().write(true).open(&path)?;
        file.set_times(
            std::fs::FileTimes::new()
                .set_accessed(when)
                .set_modified(when),
        )
    })
    .await
    .map_err(io::Error::other)??;
    Ok(())
}

/// Staging directory for one chunked-upload target, a hidden sibling of the
/// destination file (`.IMG_0001.jpg.chunks/`).
pub fn staging_dir(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.chunks", name))
}

/// Stage one chunk's bytes, keyed by chunk number. Re-staging the same
/// number overwrites the prior bytes.
pub async fn write_chunk(target: &Path, chunk_number: u32, data: &[u8]) -> PhotoResult<()> {
    let dir = staging_dir(target);
    fs::create_dir_all(&dir).await?;
    fs::write(dir.join(chunk_file_name(chunk_number)), data).await?;
    Ok(())
}

/// Distinct chunk numbers currently staged for `target`. A missing staging
/// directory yields the empty set.
pub async fn list_chunks(target: &Path) -> PhotoResult<BTreeSet<u32>> {
    let dir = staging_dir(target);
    let mut entries = match fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(err) => return Err(err.into()),
    };

    let mut chunks = BTreeSet::new();
    while let Some(entry) = entries.next_entry().await? {
        if let Some(number) = parse_chunk_file_name(&entry.file_name().to_string_lossy()) {
            chunks.insert(number);
        }
    }
    Ok(chunks)
}

/// Concatenate staged chunks `0..total_chunks` into `target`, in ascending
/// chunk order. Fails if any chunk is missing; the destination is only
/// replaced once the merged file is complete and fsynced.
pub async fn merge_chunks(target: &Path, total_chunks: u32) -> PhotoResult<u64> {
    let dir = staging_dir(target);
    let parent = target
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| io::Error::other("destination path missing parent directory"))?;
    fs::create_dir_all(&parent).await?;
    let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
    let mut out = File::create(&tmp_path).await?;

    let mut written: u64 = 0;
    for number in 0..total_chunks {
        let chunk_path = dir.join(chunk_file_name(number));
        let mut chunk = match File::open(&chunk_path).await {
            Ok(chunk) => chunk,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err.into());
            }
        };
        match tokio::io::copy(&mut chunk, &mut out).await {
            Ok(n) => written += n,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err.into());
            }
        }
    }
    if let Err(err) = finalize(out).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(err.into());
    }

    rename_over(&tmp_path, target).await?;
    Ok(written)
}

/// Remove a target's staging directory and everything in it.
pub async fn remove_staging(target: &Path) -> PhotoResult<()> {
    match fs::remove_dir_all(staging_dir(target)).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn finalize(mut file: File) -> io::Result<()> {
    file.flush().await?;
    file.sync_all().await
}

async fn rename_over(tmp_path: &Path, path: &Path) -> io::Result<()> {
    if let Err(err) = fs::rename(tmp_path, path).await {
        if err.kind() == ErrorKind::AlreadyExists {
            fs::remove_file(path).await?;
            fs::rename(tmp_path, path).await?;
        } else {
            let _ = fs::remove_file(tmp_path).await;
            return Err(err);
        }
    }
    Ok(())
}

fn chunk_file_name(chunk_number: u32) -> String {
    format!("chunk_{:06}", chunk_number)
}

fn parse_chunk_file_name(name: &str) -> Option<u32> {
    name.strip_prefix("chunk_")?.parse().ok()
}
