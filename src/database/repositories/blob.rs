use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::database::models::{BlobRecord, BlobRow, SegmentId};
use crate::database::repositories::with_retries;
use crate::error::StorageError;
use crate::ports::FilePort;

/// Object store for segment audio. Bytes live on the file system behind the
/// [`FilePort`] under `recordings/{segment_id}`; the `audio_blobs` collection
/// carries the metadata record. A blob counts as saved only once both are
/// durable; a failed metadata commit removes the bytes again.
#[derive(Clone)]
pub struct BlobStore {
    pool: SqlitePool,
    files: Arc<dyn FilePort>,
    base_dir: PathBuf,
}

pub const RECORDINGS_DIR: &str = "recordings";

impl BlobStore {
    pub fn new(pool: SqlitePool, files: Arc<dyn FilePort>, base_dir: PathBuf) -> Self {
        Self {
            pool,
            files,
            base_dir,
        }
    }

    /// Create the storage layout (explicit mkdir, not a marker write).
    pub fn ensure_layout(&self) -> Result<(), StorageError> {
        self.files
            .create_dir(&self.base_dir.join(RECORDINGS_DIR))
            .map_err(|e| StorageError::BlobWriteFailed(e.to_string()))
    }

    /// Storage-relative path. The id is machine-generated hex, so the path
    /// can never carry user content.
    pub fn relative_path(id: SegmentId) -> String {
        format!("{RECORDINGS_DIR}/{id}")
    }

    fn absolute_path(&self, id: SegmentId) -> PathBuf {
        self.base_dir.join(RECORDINGS_DIR).join(id.as_hex())
    }

    /// Append chunk bytes to the in-progress blob file. No metadata row is
    /// written; the blob becomes visible on [`BlobStore::save`].
    pub async fn append(&self, id: SegmentId, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.absolute_path(id);
        with_retries("blob append", || async {
            self.files
                .append(&path, bytes)
                .map_err(|e| StorageError::BlobWriteFailed(e.to_string()))
        })
        .await
    }

    /// Atomically persist the complete blob: rewrite the bytes, then commit
    /// the metadata record. Retries with backoff on either step.
    pub async fn save(&self, id: SegmentId, bytes: &[u8]) -> Result<BlobRecord, StorageError> {
        let path = self.absolute_path(id);

        with_retries("blob write", || async {
            self.files
                .write(&path, bytes)
                .map_err(|e| StorageError::BlobWriteFailed(e.to_string()))
        })
        .await?;

        let record = BlobRecord {
            id,
            path: Self::relative_path(id),
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
        };

        let row_result = with_retries("blob metadata commit", || async {
            sqlx::query(
                "INSERT INTO audio_blobs (id, path, size_bytes, created_at) VALUES (?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET size_bytes = excluded.size_bytes",
            )
            .bind(id.as_hex())
            .bind(&record.path)
            .bind(record.size_bytes as i64)
            .bind(record.created_at.timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(StorageError::SessionStoreFailed)
        })
        .await;

        if let Err(e) = row_result {
            // No partial writes observable: take the bytes back out.
            if let Err(cleanup) = self.files.delete(&path) {
                warn!("Failed to remove blob bytes after metadata failure: {}", cleanup);
            }
            return Err(e);
        }

        Ok(record)
    }

    pub async fn load(&self, id: SegmentId) -> Result<Vec<u8>, StorageError> {
        let known: Option<(String,)> =
            sqlx::query_as("SELECT id FROM audio_blobs WHERE id = ?")
                .bind(id.as_hex())
                .fetch_optional(&self.pool)
                .await
                .map_err(StorageError::SessionStoreFailed)?;
        if known.is_none() {
            return Err(StorageError::BlobNotFound);
        }

        self.files.read(&self.absolute_path(id)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::BlobNotFound
            } else {
                StorageError::BlobWriteFailed(e.to_string())
            }
        })
    }

    /// Remove bytes and metadata together. Missing pieces are tolerated so
    /// delete stays idempotent.
    pub async fn delete(&self, id: SegmentId) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM audio_blobs WHERE id = ?")
            .bind(id.as_hex())
            .execute(&self.pool)
            .await
            .map_err(StorageError::SessionStoreFailed)?;

        match self.files.delete(&self.absolute_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::BlobWriteFailed(e.to_string())),
        }
    }

    /// Register a metadata record for bytes already on disk (a partial blob
    /// appended before a crash, adopted during recovery).
    pub async fn adopt_existing(&self, id: SegmentId) -> Result<BlobRecord, StorageError> {
        let path = self.absolute_path(id);
        let size = self
            .files
            .file_size(&path)
            .map_err(|e| StorageError::BlobWriteFailed(e.to_string()))?;

        let record = BlobRecord {
            id,
            path: Self::relative_path(id),
            size_bytes: size,
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO audio_blobs (id, path, size_bytes, created_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET size_bytes = excluded.size_bytes",
        )
        .bind(id.as_hex())
        .bind(&record.path)
        .bind(record.size_bytes as i64)
        .bind(record.created_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(StorageError::SessionStoreFailed)?;
        Ok(record)
    }

    pub async fn record(&self, id: SegmentId) -> Result<Option<BlobRecord>, StorageError> {
        let row: Option<BlobRow> = sqlx::query_as("SELECT * FROM audio_blobs WHERE id = ?")
            .bind(id.as_hex())
            .fetch_optional(&self.pool)
            .await
            .map_err(StorageError::SessionStoreFailed)?;
        Ok(row.and_then(|r| r.to_record()))
    }

    /// Size of the in-progress blob file, if any bytes reached disk.
    pub fn file_size(&self, id: SegmentId) -> Option<u64> {
        self.files.file_size(&self.absolute_path(id)).ok()
    }

    /// Blobs (files or metadata rows) not referenced by any session segment
    /// and not in `protected`. `protected` shields the live checkpoint's
    /// in-progress segment from the startup sweep.
    pub async fn list_orphans(
        &self,
        referenced: &HashSet<String>,
        protected: &HashSet<String>,
    ) -> Result<Vec<SegmentId>, StorageError> {
        let mut orphans = HashSet::new();

        let rows: Vec<(String,)> = sqlx::query_as("SELECT id FROM audio_blobs")
            .fetch_all(&self.pool)
            .await
            .map_err(StorageError::SessionStoreFailed)?;
        for (hex,) in rows {
            if !referenced.contains(&hex) && !protected.contains(&hex) {
                orphans.insert(hex);
            }
        }

        let recordings = self.base_dir.join(RECORDINGS_DIR);
        if let Ok(entries) = self.files.list_dir(&recordings) {
            for path in entries {
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if SegmentId::parse(name).is_some()
                    && !referenced.contains(name)
                    && !protected.contains(name)
                {
                    orphans.insert(name.to_string());
                }
            }
        }

        Ok(orphans.iter().filter_map(|hex| SegmentId::parse(hex)).collect())
    }

    /// Startup sweep: delete every orphaned blob.
    pub async fn purge_orphans(
        &self,
        referenced: &HashSet<String>,
        protected: &HashSet<String>,
    ) -> Result<usize, StorageError> {
        let orphans = self.list_orphans(referenced, protected).await?;
        let count = orphans.len();
        for id in orphans {
            self.delete(id).await?;
        }
        if count > 0 {
            info!("Purged {} orphaned audio blob(s)", count);
        }
        Ok(count)
    }
}
