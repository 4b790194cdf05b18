use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::Utc;
use postern_common::internal;
use serde::Deserialize;
use tokio::{fs, sync::Mutex};

use crate::{
    MailId, MailRecord, StoreError, StoredMail, ValidationError,
    store::{MailStore, check_version, commit, prepare},
};

const TEMP_PREFIX: &str = ".tmp_";

/// File-based mail store
///
/// Every record is one pretty-printed JSON document named after its id,
/// `{ulid}.json`, in a single directory. Since ids are ULIDs, a directory
/// listing sorted by name is a listing in creation order.
///
/// # Atomicity
/// Documents are written to `.tmp_{ulid}.json` and renamed into place, so a
/// crash mid-write never leaves a truncated record behind. Leftover temporary
/// files are removed by [`FileMailStore::init`].
///
/// Saves from one process are serialized so the version check and the write
/// happen as one step.
#[derive(Debug, Clone)]
pub struct FileMailStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl Default for FileMailStore {
    fn default() -> Self {
        Self::unchecked(PathBuf::from("/var/spool/postern"))
    }
}

// Custom Deserialize implementation with path validation
impl<'de> Deserialize<'de> for FileMailStore {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct FileMailStoreHelper {
            path: PathBuf,
        }

        let helper = FileMailStoreHelper::deserialize(deserializer)?;
        Self::new(helper.path).map_err(serde::de::Error::custom)
    }
}

impl FileMailStore {
    /// Create a store rooted at `path`
    ///
    /// # Errors
    /// If the path is relative, contains `..`, or points into a system directory
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, ValidationError> {
        let path = path.into();
        Self::validate_path(&path)?;
        Ok(Self::unchecked(path))
    }

    fn unchecked(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn validate_path(path: &Path) -> Result<(), ValidationError> {
        if path
            .components()
            .any(|component| component == Component::ParentDir)
        {
            return Err(ValidationError::ParentDirectory(path.display().to_string()));
        }

        if !path.is_absolute() {
            return Err(ValidationError::NotAbsolute(path.display().to_string()));
        }

        let sensitive_prefixes = [
            "/etc", "/bin", "/sbin", "/usr/bin", "/usr/sbin", "/boot", "/sys", "/proc", "/dev",
        ];

        if let Some(prefix) = sensitive_prefixes
            .iter()
            .find(|prefix| path.starts_with(prefix))
        {
            return Err(ValidationError::SystemDirectory {
                prefix: (*prefix).to_string(),
                path: path.display().to_string(),
            });
        }

        Ok(())
    }

    /// Prepare the store directory
    ///
    /// Creates the directory if it is missing and removes temporary files
    /// left behind by an interrupted write.
    ///
    /// # Errors
    /// - If the directory cannot be created or read
    /// - If the path exists but is not a directory
    pub fn init(&self) -> crate::Result<()> {
        internal!("Initialising mail store at {} ...", self.path.display());

        if !self.path.try_exists()? {
            internal!("{} does not exist, creating...", self.path.display());
            std::fs::create_dir_all(&self.path)?;
        } else if !self.path.is_dir() {
            let path = self.path.display().to_string();
            return Err(ValidationError::NotDirectory(path).into());
        }

        let mut cleaned = 0;
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(TEMP_PREFIX) {
                std::fs::remove_file(entry.path())?;
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            internal!(
                level = INFO,
                "Cleaned up {cleaned} interrupted writes from mail store"
            );
        }

        Ok(())
    }

    fn document_path(&self, id: &MailId) -> PathBuf {
        self.path.join(id.filename())
    }

    async fn read_document(&self, id: &MailId) -> crate::Result<Option<StoredMail>> {
        match fs::read_to_string(self.document_path(id)).await {
            Ok(document) => Ok(Some(StoredMail::from_json(&document)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::Io(err)),
        }
    }
}

#[async_trait]
impl MailStore for FileMailStore {
    async fn save(&self, record: &mut MailRecord) -> crate::Result<MailId> {
        let (id, written) = prepare(record, Utc::now());
        let document = written.to_stored()?.to_json()?;

        let _guard = self.write_lock.lock().await;

        let stored = self.read_document(&id).await?.map(|stored| stored.version);
        check_version(&id, record, stored)?;

        let target = self.document_path(&id);
        let temp = self.path.join(format!("{TEMP_PREFIX}{}", id.filename()));
        fs::write(&temp, document).await?;
        fs::rename(&temp, &target).await?;

        internal!(
            level = DEBUG,
            mail_id = %id,
            version = written.version(),
            "Saved mail to {}",
            target.display()
        );

        commit(record, &written);
        Ok(id)
    }

    async fn load(&self, id: &MailId) -> crate::Result<Option<MailRecord>> {
        self.read_document(id)
            .await?
            .map(MailRecord::from_stored)
            .transpose()
            .map_err(StoreError::from)
    }

    async fn list(&self) -> crate::Result<Vec<MailId>> {
        let mut entries = fs::read_dir(&self.path).await?;
        let mut ids = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let filename = entry.file_name();
            let filename = filename.to_string_lossy();

            if !filename.starts_with(TEMP_PREFIX)
                && let Some(id) = MailId::from_filename(&filename)
            {
                ids.push(id);
            }
        }

        ids.sort();

        internal!(level = DEBUG, "Found {} records in mail store", ids.len());

        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_relative_path() {
        assert!(matches!(
            FileMailStore::new("spool/postern"),
            Err(ValidationError::NotAbsolute(_))
        ));
    }

    #[test]
    fn test_rejects_parent_components() {
        assert!(matches!(
            FileMailStore::new("/var/spool/../../etc"),
            Err(ValidationError::ParentDirectory(_))
        ));
    }

    #[test]
    fn test_rejects_system_directories() {
        for path in ["/etc/postern", "/proc/self", "/usr/bin/mail"] {
            assert!(
                matches!(
                    FileMailStore::new(path),
                    Err(ValidationError::SystemDirectory { .. })
                ),
                "{path} should be rejected"
            );
        }
    }

    #[test]
    fn test_accepts_spool_directory() {
        let store = FileMailStore::new("/var/spool/postern");
        assert!(store.is_ok());
    }
}
