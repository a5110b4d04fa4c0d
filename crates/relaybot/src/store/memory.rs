//! In-memory session store for tests and ephemeral runs.

use async_trait::async_trait;
use dashmap::DashMap;

use super::{SessionRecord, SessionStore, StorageError};

#[derive(Default)]
pub struct MemorySessionStore {
    records: DashMap<String, SessionRecord>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, account_id: &str) -> Result<Option<SessionRecord>, StorageError> {
        Ok(self.records.get(account_id).map(|r| r.clone()))
    }

    async fn save(&self, record: &SessionRecord) -> Result<(), StorageError> {
        self.records
            .insert(record.account_id.clone(), record.clone());
        Ok(())
    }

    async fn clear(&self, account_id: &str) -> Result<(), StorageError> {
        self.records.remove(account_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn round_trip_and_clear() {
        let store = MemorySessionStore::new();
        let record = SessionRecord {
            account_id: "a1".to_string(),
            session_id: "s1".to_string(),
            last_seq: Some(3),
            last_connected_at: Utc::now(),
            capability_index: 0,
            saved_at: Utc::now(),
        };

        store.save(&record).await.unwrap();
        assert_eq!(store.load("a1").await.unwrap(), Some(record));

        store.clear("a1").await.unwrap();
        assert_eq!(store.load("a1").await.unwrap(), None);
    }
}
