//! File-backed session store: one JSON document per account.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tracing::warn;

use super::{SessionRecord, SessionStore, StorageError, atomic_write_file};

pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    /// Create a store rooted at `dir`. The directory is created lazily on
    /// the first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_path(&self, account_id: &str) -> PathBuf {
        // Account ids are numeric strings from the platform, but sanitize
        // anyway so a hostile id cannot escape the store directory.
        let safe: String = account_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self, account_id: &str) -> Result<Option<SessionRecord>, StorageError> {
        let path = self.record_path(account_id);
        let contents = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::file_io(&path, e)),
        };

        match serde_json::from_str::<SessionRecord>(&contents) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                // A corrupt record is not worth failing startup over; the
                // supervisor just pays for a fresh identify.
                warn!(path = %path.display(), error = %e, "Discarding corrupt session record");
                Ok(None)
            }
        }
    }

    async fn save(&self, record: &SessionRecord) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StorageError::file_io(&self.dir, e))?;

        let path = self.record_path(&record.account_id);
        let data = serde_json::to_vec_pretty(record).map_err(|e| StorageError::Corrupt {
            path: path.display().to_string(),
            source: e,
        })?;
        atomic_write_file(&path, &data).await
    }

    async fn clear(&self, account_id: &str) -> Result<(), StorageError> {
        let path = self.record_path(account_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::file_io(&path, e)),
        }
    }
}
