//! Session persistence.
//!
//! One durable continuity record per account: session id, last sequence
//! number, and the last-known-good capability level. The record is what
//! lets a restarted process resume the gateway session instead of paying
//! for a full identify. Writes use atomic operations (temp file + rename)
//! to prevent corruption.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

mod file;
mod memory;

pub use file::FileSessionStore;
pub use memory::MemorySessionStore;

// ============================================================================
// SessionRecord
// ============================================================================

/// The continuity record for one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub account_id: String,
    pub session_id: String,
    /// Last sequence number applied; `None` until the first dispatch.
    pub last_seq: Option<u64>,
    pub last_connected_at: DateTime<Utc>,
    /// Index into the capability table that last completed a handshake.
    pub capability_index: usize,
    pub saved_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Whether this record can seed a resume handshake.
    ///
    /// Resume needs both a session id and a sequence number, and the record
    /// must belong to the account currently negotiating — a record saved
    /// under another account is never reused.
    pub fn resumable_for(&self, account_id: &str) -> bool {
        self.account_id == account_id && !self.session_id.is_empty() && self.last_seq.is_some()
    }
}

// ============================================================================
// SessionStore
// ============================================================================

/// Durable load/save/clear of [`SessionRecord`]s, keyed by account id.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, account_id: &str) -> Result<Option<SessionRecord>, StorageError>;
    async fn save(&self, record: &SessionRecord) -> Result<(), StorageError>;
    async fn clear(&self, account_id: &str) -> Result<(), StorageError>;
}

// ============================================================================
// StorageError
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt session record at {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    pub(super) fn file_io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Write data to a temp file, fsync it, then atomically rename to the final path.
///
/// The temp file name is generated internally using a ULID to avoid collisions
/// from concurrent writers targeting the same final path.
pub(crate) async fn atomic_write_file(final_path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let file_name = final_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    let temp_path = final_path.with_file_name(format!("{}.{}.tmp", file_name, ulid::Ulid::new()));

    let mut file = fs::File::create(&temp_path)
        .await
        .map_err(|e| StorageError::file_io(&temp_path, e))?;
    file.write_all(data)
        .await
        .map_err(|e| StorageError::file_io(&temp_path, e))?;
    file.sync_all()
        .await
        .map_err(|e| StorageError::file_io(&temp_path, e))?;
    fs::rename(&temp_path, final_path)
        .await
        .map_err(|e| StorageError::file_io(final_path, e))?;
    Ok(())
}
