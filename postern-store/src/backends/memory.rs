use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use chrono::Utc;

use crate::{
    MailId, MailRecord, StoredMail,
    store::{MailStore, check_version, commit, prepare},
};

/// In-memory mail store
///
/// Records are kept as the same JSON documents the file store writes, so
/// every save and load goes through the full serialization path. Useful for
/// tests and for running without a spool directory; nothing survives a
/// restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryMailStore {
    documents: Arc<RwLock<HashMap<MailId, String>>>,
}

impl MemoryMailStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    ///
    /// Recovers gracefully if the lock is poisoned by accessing the underlying data.
    #[must_use]
    pub fn len(&self) -> usize {
        self.documents
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MailStore for MemoryMailStore {
    async fn save(&self, record: &mut MailRecord) -> crate::Result<MailId> {
        let (id, written) = prepare(record, Utc::now());
        let document = written.to_stored()?.to_json()?;

        {
            let mut documents = self.documents.write()?;
            let stored = documents
                .get(&id)
                .map(|existing| StoredMail::from_json(existing).map(|stored| stored.version))
                .transpose()?;
            check_version(&id, record, stored)?;
            documents.insert(id.clone(), document);
        }

        commit(record, &written);
        Ok(id)
    }

    async fn load(&self, id: &MailId) -> crate::Result<Option<MailRecord>> {
        let document = self.documents.read()?.get(id).cloned();

        let Some(document) = document else {
            return Ok(None);
        };

        let stored = StoredMail::from_json(&document)?;
        Ok(Some(MailRecord::from_stored(stored)?))
    }

    async fn list(&self) -> crate::Result<Vec<MailId>> {
        let mut ids: Vec<_> = self.documents.read()?.keys().cloned().collect();

        // ULIDs are lexicographically sortable by creation time
        ids.sort();

        Ok(ids)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{MailStatus, StoreError};

    #[tokio::test]
    async fn test_save_assigns_id_and_version() {
        let store = MemoryMailStore::new();
        let mut record = MailRecord::new();
        record.set_subject("hello");

        let id = store.save(&mut record).await.expect("Failed to save");

        assert_eq!(record.id(), Some(&id));
        assert_eq!(record.version(), 1);
        assert!(record.date_created().is_some());
        assert_eq!(record.date_created(), record.date_modified());

        let loaded = store
            .load(&id)
            .await
            .expect("Failed to load")
            .expect("record exists");
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn test_resave_keeps_id_and_creation_date() {
        let store = MemoryMailStore::new();
        let mut record = MailRecord::new();
        let id = store.save(&mut record).await.expect("Failed to save");
        let created = record.date_created();

        record.mark_sent();
        let again = store.save(&mut record).await.expect("Failed to save");

        assert_eq!(again, id);
        assert_eq!(record.version(), 2);
        assert_eq!(record.date_created(), created);
        assert_eq!(store.len(), 1);

        let loaded = store
            .load(&id)
            .await
            .expect("Failed to load")
            .expect("record exists");
        assert_eq!(loaded.status(), MailStatus::Sent);
    }

    #[tokio::test]
    async fn test_stale_save_is_rejected() {
        let store = MemoryMailStore::new();
        let mut record = MailRecord::new();
        let id = store.save(&mut record).await.expect("Failed to save");

        let mut first = store
            .load(&id)
            .await
            .expect("Failed to load")
            .expect("record exists");
        let mut second = first.clone();

        first.mark_sent();
        store.save(&mut first).await.expect("Failed to save");

        second.mark_failed("too late");
        let err = store
            .save(&mut second)
            .await
            .expect_err("stale version must conflict");
        assert!(err.is_conflict());
        assert_eq!(second.version(), 1, "failed save changes nothing");

        let stored = store
            .load(&id)
            .await
            .expect("Failed to load")
            .expect("record exists");
        assert_eq!(stored.status(), MailStatus::Sent);
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let store = MemoryMailStore::new();
        let missing = store
            .load(&MailId::generate())
            .await
            .expect("Failed to load");
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_saving_removed_record_is_not_found() {
        let store = MemoryMailStore::new();
        let mut record = MailRecord::new();
        let id = store.save(&mut record).await.expect("Failed to save");

        let other = MemoryMailStore::new();
        let err = other
            .save(&mut record)
            .await
            .expect_err("record unknown to this store");
        assert!(matches!(err, StoreError::NotFound(missing) if missing == id));
    }

    #[tokio::test]
    async fn test_list_is_sorted() {
        let store = MemoryMailStore::new();

        let mut generated = Vec::new();
        for i in 0..10 {
            let mut record = MailRecord::new();
            record.set_subject(format!("message {i}"));
            generated.push(store.save(&mut record).await.expect("Failed to save"));
        }

        generated.sort();
        assert_eq!(store.list().await.expect("Failed to list"), generated);
    }
}
