//! src/services/offset_store.rs
//!
//! OffsetStore: durable progress of resumable uploads. Metadata (offset,
//! completion, declared size) lives in SQLite; payload bytes live on disk
//! sharded beneath `base_path/{shard}/{shard}/{id}`.
//!
//! The store does no locking of its own. Callers serialize mutations per
//! upload through `SessionRegistry`; the compare-and-swap updates below only
//! guarantee that a stale writer can never move an offset backwards.

use crate::models::upload::UploadSession;
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, pin_mut};
use sqlx::SqlitePool;
use std::{
    io::{self, ErrorKind, SeekFrom},
    path::PathBuf,
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncSeekExt, AsyncWriteExt},
};
use tracing::{debug, warn};

/// Bytes written between two durable checkpoints of a long body.
pub const CHECKPOINT_BYTES: u64 = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload `{0}` not found")]
    NotFound(String),
    #[error("upload `{0}` already exists")]
    Duplicate(String),
    #[error("upload offset mismatch: server has {current}, request starts at {requested}")]
    OffsetMismatch { current: u64, requested: u64 },
    #[error("upload `{0}` is already complete")]
    AlreadyComplete(String),
    #[error("upload would exceed its declared size of {limit} bytes")]
    SizeExceeded { limit: u64 },
    #[error("upload holds {offset} bytes but declared {total}")]
    LengthMismatch { offset: u64, total: u64 },
    #[error("could not allocate a unique upload id")]
    IdExhausted,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;

/// Outcome of streaming one request body into an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    /// Durable offset after the write.
    pub offset: u64,
    /// Bytes of this request that were durably accepted.
    pub written: u64,
    /// The body stream failed before it ended; only `written` bytes count.
    pub interrupted: bool,
}

#[derive(Clone)]
pub struct OffsetStore {
    /// Shared SQLite connection pool used for upload metadata.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where upload payloads are stored.
    pub base_path: PathBuf,
}

impl OffsetStore {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    /// Two-level shard directories derived from MD5(id), as lowercase hex.
    fn payload_shards(id: &str) -> (String, String) {
        let digest = md5::compute(id.as_bytes());
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Location of the payload file for `id`. Parent directories may not exist yet.
    pub fn payload_path(&self, id: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::payload_shards(id);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(id);
        path
    }

    /// Persist a freshly created session and an empty payload file.
    ///
    /// Returns `Duplicate` when the id is already taken, so the caller can
    /// retry with a new token.
    pub async fn insert(&self, session: &UploadSession) -> UploadResult<()> {
        let path = self.payload_path(&session.id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let inserted = sqlx::query(
            "INSERT INTO uploads (id, upload_offset, complete, total_size, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(session.offset)
        .bind(session.complete)
        .bind(session.total_size)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&*self.db)
        .await;

        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(UploadError::Duplicate(session.id.clone()));
            }
            Err(err) => return Err(UploadError::Sqlx(err)),
        }

        if let Err(err) = File::create(&path).await {
            if let Err(cleanup) = sqlx::query("DELETE FROM uploads WHERE id = ?")
                .bind(&session.id)
                .execute(&*self.db)
                .await
            {
                warn!(
                    "failed to remove metadata of upload {} after payload create failed: {}",
                    session.id, cleanup
                );
            }
            return Err(UploadError::Io(err));
        }

        Ok(())
    }

    /// Fetch the full metadata row.
    pub async fn fetch(&self, id: &str) -> UploadResult<UploadSession> {
        sqlx::query_as::<_, UploadSession>(
            "SELECT id, upload_offset, complete, total_size, created_at, updated_at
             FROM uploads WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| UploadError::NotFound(id.to_string()))
    }

    /// Current `(offset, complete)` of an upload.
    pub async fn read(&self, id: &str) -> UploadResult<(u64, bool)> {
        let session = self.fetch(id).await?;
        Ok((session.offset as u64, session.complete))
    }

    /// Stream `body` into the upload starting at `start`.
    ///
    /// - Rejects terminal uploads and offset mismatches before touching disk.
    /// - Discards any payload bytes past `start` that were never recorded.
    /// - Checkpoints (fsync + offset update) every `CHECKPOINT_BYTES`.
    /// - A failing body stream keeps the bytes already written: they are
    ///   synced, the offset is advanced over them and `interrupted` is set.
    /// - A local write failure or a declared-size overflow rolls the file
    ///   back to the last durable offset and returns the error.
    pub async fn append_and_advance<S>(
        &self,
        id: &str,
        start: u64,
        body: S,
    ) -> UploadResult<Appended>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        let session = self.fetch(id).await?;
        if session.complete {
            return Err(UploadError::AlreadyComplete(id.to_string()));
        }
        let current = session.offset as u64;
        if current != start {
            return Err(UploadError::OffsetMismatch {
                current,
                requested: start,
            });
        }
        let total = session.total_size.map(|t| t as u64);

        let path = self.payload_path(id);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;
        file.set_len(start).await?;
        file.seek(SeekFrom::Start(start)).await?;

        let mut durable = start;
        let mut position = start;
        pin_mut!(body);
        while let Some(chunk_res) = body.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    debug!("body for upload {} ended early at {}: {}", id, position, err);
                    durable = self.persist(&mut file, id, durable, position).await?;
                    return Ok(Appended {
                        offset: durable,
                        written: durable - start,
                        interrupted: true,
                    });
                }
            };

            let next = position + chunk.len() as u64;
            if let Some(limit) = total {
                if next > limit {
                    rollback(&file, &path, durable).await;
                    return Err(UploadError::SizeExceeded { limit });
                }
            }
            if let Err(err) = file.write_all(&chunk).await {
                rollback(&file, &path, durable).await;
                return Err(UploadError::Io(err));
            }
            position = next;

            if position - durable >= CHECKPOINT_BYTES {
                durable = self.persist(&mut file, id, durable, position).await?;
                debug!("checkpointed upload {} at {}", id, durable);
            }
        }

        durable = self.persist(&mut file, id, durable, position).await?;
        Ok(Appended {
            offset: durable,
            written: durable - start,
            interrupted: false,
        })
    }

    /// Mark the upload complete. Its offset is frozen from here on.
    pub async fn mark_complete(&self, id: &str) -> UploadResult<UploadSession> {
        let session = self.fetch(id).await?;
        if session.complete {
            return Err(UploadError::AlreadyComplete(id.to_string()));
        }
        match session.total_size {
            Some(total) if total != session.offset => {
                return Err(UploadError::LengthMismatch {
                    offset: session.offset as u64,
                    total: total as u64,
                });
            }
            _ => {}
        }

        let result = sqlx::query(
            "UPDATE uploads SET complete = 1, total_size = upload_offset, updated_at = ?
             WHERE id = ? AND complete = 0 AND upload_offset = ?",
        )
        .bind(Utc::now())
        .bind(id)
        .bind(session.offset)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.conflict(id, session.offset as u64).await);
        }

        self.fetch(id).await
    }

    /// Open a complete upload's payload for reading.
    pub async fn open_payload(&self, id: &str) -> UploadResult<(UploadSession, File)> {
        let session = self.fetch(id).await?;
        let file = File::open(self.payload_path(id)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                UploadError::NotFound(id.to_string())
            } else {
                UploadError::Io(err)
            }
        })?;
        Ok((session, file))
    }

    /// Sync written bytes and move the recorded offset from `durable` to `position`.
    async fn persist(
        &self,
        file: &mut File,
        id: &str,
        durable: u64,
        position: u64,
    ) -> UploadResult<u64> {
        if position == durable {
            return Ok(durable);
        }
        if let Err(err) = sync(file).await {
            if let Err(truncate) = file.set_len(durable).await {
                warn!(
                    "failed to truncate upload {} back to {} after sync failed: {}",
                    id, durable, truncate
                );
            }
            return Err(UploadError::Io(err));
        }

        let result = sqlx::query(
            "UPDATE uploads SET upload_offset = ?, updated_at = ?
             WHERE id = ? AND upload_offset = ? AND complete = 0",
        )
        .bind(position as i64)
        .bind(Utc::now())
        .bind(id)
        .bind(durable as i64)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.conflict(id, durable).await);
        }
        Ok(position)
    }

    /// Explain why a compare-and-swap on `id` starting at `requested` found nothing.
    async fn conflict(&self, id: &str, requested: u64) -> UploadError {
        match self.fetch(id).await {
            Ok(session) if session.complete => UploadError::AlreadyComplete(id.to_string()),
            Ok(session) => UploadError::OffsetMismatch {
                current: session.offset as u64,
                requested,
            },
            Err(err) => err,
        }
    }
}

async fn sync(file: &mut File) -> io::Result<()> {
    file.flush().await?;
    file.sync_data().await
}

async fn rollback(file: &File, path: &std::path::Path, durable: u64) {
    if let Err(err) = file.set_len(durable).await {
        warn!(
            "failed to truncate {} back to {}: {}",
            path.display(),
            durable,
            err
        );
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
