//! Blob store for uploaded audio
//!
//! One flat directory, one file per job named `{job_id}_{sanitized_basename}`.
//! Writes go to a `.part` sibling and are renamed into place on completion,
//! so readers never observe a partial blob. This is the only component that
//! touches the filesystem; everything else addresses blobs by job id.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::jobs::JobId;
use crate::{Error, Result};

static UNSAFE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9._-]").unwrap());

const PART_SUFFIX: &str = ".part";
const MAX_NAME_LEN: usize = 128;

/// Reduce a client-supplied filename to a safe basename
pub fn sanitize_filename(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();

    let mut safe = UNSAFE_CHARS.replace_all(base, "_").into_owned();
    safe.truncate(MAX_NAME_LEN);

    // Refuse names that collapse to nothing or dot-files
    if safe.trim_matches(['.', '_']).is_empty() {
        return "upload".to_string();
    }
    safe
}

/// A stored blob as seen by the sweep
#[derive(Debug, Clone)]
pub struct BlobEntry {
    /// Owning job
    pub job_id: JobId,

    /// Absolute file path
    pub path: PathBuf,

    /// Last-modified time
    pub modified: SystemTime,
}

/// Filesystem-backed blob store
#[derive(Clone)]
pub struct BlobStore {
    root: PathBuf,
    max_bytes: u64,
}

impl BlobStore {
    /// Open (and create) the store rooted at `root`
    pub fn new(root: impl Into<PathBuf>, max_bytes: u64) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| Error::Internal(format!("failed to create upload directory: {}", e)))?;
        Ok(Self { root, max_bytes })
    }

    /// Build from the storage configuration section
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        Self::new(config.upload_dir.clone(), config.max_file_size_bytes())
    }

    /// Size cap in bytes
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Begin an atomic streaming write for a job
    pub async fn writer(&self, job_id: JobId, original_name: &str) -> Result<BlobWriter> {
        let file_name = format!("{}_{}", job_id, sanitize_filename(original_name));
        let dst = self.root.join(&file_name);
        let tmp = self.root.join(format!("{}{}", file_name, PART_SUFFIX));

        let file = fs::File::create(&tmp).await?;
        Ok(BlobWriter {
            file,
            tmp,
            dst,
            written: 0,
            cap: self.max_bytes,
        })
    }

    /// Store a full buffer in one call
    pub async fn put(&self, job_id: JobId, original_name: &str, bytes: &[u8]) -> Result<u64> {
        let mut writer = self.writer(job_id, original_name).await?;
        if let Err(e) = writer.write(bytes).await {
            writer.abort().await;
            return Err(e);
        }
        writer.finish().await
    }

    /// Locate the blob for a job, skipping in-flight `.part` files
    async fn find(&self, job_id: JobId) -> Result<Option<PathBuf>> {
        let prefix = format!("{}_", job_id);
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(&prefix) && !name.ends_with(PART_SUFFIX) {
                return Ok(Some(entry.path()));
            }
        }
        Ok(None)
    }

    /// Open the blob for reading
    pub async fn open(&self, job_id: JobId) -> Result<fs::File> {
        match self.find(job_id).await? {
            Some(path) => Ok(fs::File::open(path).await?),
            None => Err(Error::BlobMissing(format!("no blob stored for job {}", job_id))),
        }
    }

    /// Read the whole blob into memory
    pub async fn read(&self, job_id: JobId) -> Result<Vec<u8>> {
        match self.find(job_id).await? {
            Some(path) => Ok(fs::read(path).await?),
            None => Err(Error::BlobMissing(format!("no blob stored for job {}", job_id))),
        }
    }

    /// Delete everything stored for a job, partial writes included
    pub async fn delete(&self, job_id: JobId) -> Result<bool> {
        let prefix = format!("{}_", job_id);
        let mut removed = false;
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(&prefix) {
                fs::remove_file(entry.path()).await?;
                removed = true;
            }
        }
        if removed {
            debug!(%job_id, "blob deleted");
        }
        Ok(removed)
    }

    /// Enumerate stored blobs (including orphaned `.part` files)
    pub async fn list(&self) -> Result<Vec<BlobEntry>> {
        let mut blobs = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(job_id) = parse_job_id(name) else {
                continue;
            };
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(e) => {
                    warn!(file = name, error = %e, "skipping unreadable blob entry");
                    continue;
                }
            };
            blobs.push(BlobEntry {
                job_id,
                path: entry.path(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        Ok(blobs)
    }

    /// Delete every blob older than the given age; returns the count removed
    pub async fn sweep(&self, older_than: Duration) -> Result<usize> {
        let cutoff = SystemTime::now() - older_than;
        let mut removed = 0;
        for entry in self.list().await? {
            if entry.modified < cutoff {
                if fs::remove_file(&entry.path).await.is_ok() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

/// Parse the `{job_id}_` prefix of a stored file name
fn parse_job_id(file_name: &str) -> Option<JobId> {
    let id_part = file_name.get(..36)?;
    if file_name.get(36..37) != Some("_") {
        return None;
    }
    Uuid::parse_str(id_part).ok()
}

/// In-flight atomic blob write
///
/// Call [`finish`](Self::finish) to publish or [`abort`](Self::abort) to
/// discard; an abandoned `.part` file is eventually removed by the sweep.
pub struct BlobWriter {
    file: fs::File,
    tmp: PathBuf,
    dst: PathBuf,
    written: u64,
    cap: u64,
}

impl BlobWriter {
    /// Append a chunk, enforcing the size cap
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let next = self.written + chunk.len() as u64;
        if next > self.cap {
            return Err(Error::PayloadTooLarge { limit_bytes: self.cap });
        }
        self.file.write_all(chunk).await?;
        self.written = next;
        Ok(())
    }

    /// Bytes written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush and atomically publish the blob; returns its size
    pub async fn finish(mut self) -> Result<u64> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        fs::rename(&self.tmp, &self.dst).await?;
        Ok(self.written)
    }

    /// Discard the partial write
    pub async fn abort(self) {
        drop(self.file);
        if let Err(e) = fs::remove_file(&self.tmp).await {
            warn!(path = %self.tmp.display(), error = %e, "failed to remove partial blob");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path(), 1024).unwrap();
        (dir, store)
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("talk.wav"), "talk.wav");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("my file (1).mp3"), "my_file__1_.mp3");
        assert_eq!(sanitize_filename(""), "upload");
        assert_eq!(sanitize_filename("...."), "upload");
        assert!(sanitize_filename(&"x".repeat(500)).len() <= MAX_NAME_LEN);
    }

    #[tokio::test]
    async fn test_put_read_delete() {
        let (_dir, store) = store();
        let job_id = Uuid::new_v4();

        let size = store.put(job_id, "talk.wav", b"audio-bytes").await.unwrap();
        assert_eq!(size, 11);
        assert_eq!(store.read(job_id).await.unwrap(), b"audio-bytes");

        assert!(store.delete(job_id).await.unwrap());
        assert!(!store.delete(job_id).await.unwrap());
        assert!(matches!(store.read(job_id).await, Err(Error::BlobMissing(_))));
    }

    #[tokio::test]
    async fn test_size_cap_boundary() {
        let (_dir, store) = store();

        // Exactly at the cap succeeds
        let at_cap = vec![0u8; 1024];
        store.put(Uuid::new_v4(), "a.wav", &at_cap).await.unwrap();

        // One byte over fails with PayloadTooLarge
        let over = vec![0u8; 1025];
        let err = store.put(Uuid::new_v4(), "b.wav", &over).await.unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { limit_bytes: 1024 }));
    }

    #[tokio::test]
    async fn test_aborted_write_leaves_no_blob() {
        let (dir, store) = store();
        let job_id = Uuid::new_v4();

        let mut writer = store.writer(job_id, "talk.wav").await.unwrap();
        writer.write(b"partial").await.unwrap();
        writer.abort().await;

        assert!(matches!(store.read(job_id).await, Err(Error::BlobMissing(_))));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_unfinished_write_invisible_to_readers() {
        let (_dir, store) = store();
        let job_id = Uuid::new_v4();

        let mut writer = store.writer(job_id, "talk.wav").await.unwrap();
        writer.write(b"half").await.unwrap();

        // Not renamed into place yet
        assert!(matches!(store.open(job_id).await, Err(Error::BlobMissing(_))));
        writer.finish().await.unwrap();
        assert!(store.open(job_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_sweep_removes_only_old_blobs() {
        let (_dir, store) = store();
        let job_id = Uuid::new_v4();
        store.put(job_id, "talk.wav", b"bytes").await.unwrap();

        // Everything is fresh, nothing to remove
        assert_eq!(store.sweep(Duration::from_secs(3600)).await.unwrap(), 0);

        // Zero-age cutoff removes the blob
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.sweep(Duration::ZERO).await.unwrap(), 1);
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_parses_job_ids() {
        let (_dir, store) = store();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.put(a, "a.wav", b"a").await.unwrap();
        store.put(b, "b.mp3", b"b").await.unwrap();

        let mut ids: Vec<JobId> = store.list().await.unwrap().iter().map(|e| e.job_id).collect();
        ids.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(ids, expected);
    }
}
