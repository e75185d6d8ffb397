//! Represents one resumable upload and its durable progress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A resumable upload session.
///
/// The row records how many bytes of the payload are durably on disk and
/// whether the client has declared the upload finished. The payload bytes
/// themselves live in a file next to the metadata, never in this struct.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct UploadSession {
    /// Opaque, URL-safe token handed to the client inside `Location`.
    pub id: String,

    /// Number of bytes durably accepted so far.
    #[sqlx(rename = "upload_offset")]
    pub offset: i64,

    /// Terminal flag. Once set, the offset never changes again.
    pub complete: bool,

    /// Final size, when the client declared it up front.
    pub total_size: Option<i64>,

    /// When the session was created.
    pub created_at: DateTime<Utc>,

    /// When the offset or completion state last changed.
    pub updated_at: DateTime<Utc>,
}

impl UploadSession {
    /// A brand-new session at offset zero.
    pub fn new(id: String, total_size: Option<i64>) -> Self {
        let now = Utc::now();
        Self {
            id,
            offset: 0,
            complete: false,
            total_size,
            created_at: now,
            updated_at: now,
        }
    }

    /// Bytes still expected before `total_size` is reached, if it is known.
    pub fn remaining(&self) -> Option<i64> {
        self.total_size.map(|total| (total - self.offset).max(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_counts_down_to_declared_size() {
        let mut session = UploadSession::new("abc".into(), Some(10));
        session.offset = 4;
        assert_eq!(session.remaining(), Some(6));

        session.total_size = None;
        assert_eq!(session.remaining(), None);
    }
}
