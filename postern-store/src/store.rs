use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};

use crate::{MailId, MailRecord, StoreError};

/// Persistence for mail records
///
/// Implementations must be safe to share between tasks. Saves are guarded by
/// an optimistic lock: every record carries the `version` it was loaded at,
/// and a save whose version does not match what is stored fails with
/// [`StoreError::Conflict`] instead of overwriting a concurrent update.
#[async_trait]
pub trait MailStore: Send + Sync + std::fmt::Debug {
    /// Persist `record`, returning its id
    ///
    /// The first save assigns the id and `date_created`. Every save bumps
    /// `version` and sets `date_modified` on the passed record.
    ///
    /// # Errors
    /// If the record cannot be written, or it was saved by someone else since
    /// it was loaded
    async fn save(&self, record: &mut MailRecord) -> crate::Result<MailId>;

    /// Load a record, `None` if it does not exist
    ///
    /// # Errors
    /// If the record exists but cannot be read
    async fn load(&self, id: &MailId) -> crate::Result<Option<MailRecord>>;

    /// All stored ids, oldest first
    ///
    /// # Errors
    /// If the store cannot be enumerated
    async fn list(&self) -> crate::Result<Vec<MailId>>;
}

/// Check the version of the record being saved against the stored one.
///
/// `stored` is `None` when nothing is stored under the id yet, which is only
/// acceptable for a record that has never been saved.
pub(crate) fn check_version(
    id: &MailId,
    record: &MailRecord,
    stored: Option<u64>,
) -> Result<(), StoreError> {
    match stored {
        None if record.version == 0 => Ok(()),
        None => Err(StoreError::NotFound(id.clone())),
        Some(found) if found == record.version => Ok(()),
        Some(found) => Err(StoreError::Conflict {
            id: id.clone(),
            expected: record.version,
            found,
        }),
    }
}

/// Assign an id on first save and stamp the bookkeeping fields.
///
/// Returns the id and a copy of the record as it should be stored. The
/// caller's record is only updated through [`commit`] once the write has
/// succeeded.
pub(crate) fn prepare(record: &MailRecord, now: DateTime<Utc>) -> (MailId, MailRecord) {
    let now = now.trunc_subsecs(0);
    let mut next = record.clone();
    let id = next.id.get_or_insert_with(MailId::generate).clone();
    next.date_created.get_or_insert(now);
    next.date_modified = Some(now);
    next.version += 1;
    (id, next)
}

/// Copy the bookkeeping fields of a written record back to the caller
pub(crate) fn commit(record: &mut MailRecord, written: &MailRecord) {
    record.id.clone_from(&written.id);
    record.date_created = written.date_created;
    record.date_modified = written.date_modified;
    record.version = written.version;
}
