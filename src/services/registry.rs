//! Session registry: id allocation, lookup and per-upload mutual exclusion.
//!
//! Each upload id maps to its own async mutex. The map itself sits behind a
//! short-lived std mutex that is never held across an await point, so
//! requests against unrelated uploads never wait on each other.

use crate::{
    models::upload::UploadSession,
    services::offset_store::{Appended, OffsetStore, UploadError, UploadResult},
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use futures::Stream;
use std::{
    collections::HashMap,
    future::Future,
    io,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

/// Attempts at drawing a fresh id before giving up.
const MAX_ID_ATTEMPTS: usize = 4;
const MAX_ID_LEN: usize = 64;

type LockMap = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

#[derive(Clone)]
pub struct SessionRegistry {
    store: OffsetStore,
    locks: LockMap,
}

impl SessionRegistry {
    pub fn new(store: OffsetStore) -> Self {
        Self {
            store,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &OffsetStore {
        &self.store
    }

    /// Create a new upload at offset zero with an unguessable id.
    pub async fn create(&self, total_size: Option<i64>) -> UploadResult<UploadSession> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let session = UploadSession::new(generate_id(), total_size);
            match self.store.insert(&session).await {
                Ok(()) => {
                    tracing::info!(upload_id = %session.id, total_size = ?total_size, "Created upload");
                    return Ok(session);
                }
                Err(UploadError::Duplicate(id)) => {
                    tracing::warn!(upload_id = %id, "Upload id collision, drawing another");
                }
                Err(err) => return Err(err),
            }
        }
        Err(UploadError::IdExhausted)
    }

    /// Look up an upload without taking its lock.
    pub async fn get(&self, id: &str) -> UploadResult<UploadSession> {
        ensure_id_valid(id)?;
        self.store.fetch(id).await
    }

    /// Open the stored bytes of upload `id` for reading.
    pub async fn open_payload(&self, id: &str) -> UploadResult<(UploadSession, tokio::fs::File)> {
        ensure_id_valid(id)?;
        self.store.open_payload(id).await
    }

    /// Wait for exclusive access to the upload `id`.
    ///
    /// The upload must exist. Mutations made through the returned guard are
    /// serialized with every other guard for the same id.
    pub async fn lock(&self, id: &str) -> UploadResult<SessionGuard> {
        ensure_id_valid(id)?;
        let entry = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let permit = entry.lock_owned().await;

        let guard = SessionGuard {
            id: id.to_string(),
            store: self.store.clone(),
            locks: self.locks.clone(),
            permit: Some(permit),
        };
        // Surface NotFound while holding the lock so the guard is only
        // handed out for uploads that exist.
        guard.store.fetch(id).await?;
        Ok(guard)
    }

    /// Run `f` with exclusive access to the upload `id`.
    pub async fn with_lock<F, Fut, T>(&self, id: &str, f: F) -> UploadResult<T>
    where
        F: FnOnce(SessionGuard) -> Fut,
        Fut: Future<Output = UploadResult<T>>,
    {
        let guard = self.lock(id).await?;
        f(guard).await
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Exclusive handle on one upload. Dropping it releases the lock.
pub struct SessionGuard {
    id: String,
    store: OffsetStore,
    locks: LockMap,
    permit: Option<OwnedMutexGuard<()>>,
}

impl SessionGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn session(&self) -> UploadResult<UploadSession> {
        self.store.fetch(&self.id).await
    }

    pub async fn read(&self) -> UploadResult<(u64, bool)> {
        self.store.read(&self.id).await
    }

    pub async fn append_and_advance<S>(&self, start: u64, body: S) -> UploadResult<Appended>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        self.store.append_and_advance(&self.id, start, body).await
    }

    pub async fn mark_complete(&self) -> UploadResult<UploadSession> {
        self.store.mark_complete(&self.id).await
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        drop(self.permit.take());
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map still references the mutex: no holder, no waiter.
        if locks
            .get(&self.id)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(&self.id);
        }
    }
}

/// 128 bits from the OS CSPRNG (UUIDv4), base64url without padding.
fn generate_id() -> String {
    URL_SAFE_NO_PAD.encode(Uuid::new_v4().as_bytes())
}

/// Ids are opaque to clients but must stay filesystem- and URL-safe.
fn ensure_id_valid(id: &str) -> UploadResult<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(UploadError::NotFound(id.to_string()))
    }
}
