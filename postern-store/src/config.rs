use std::sync::Arc;

use serde::Deserialize;

use crate::{FileMailStore, MemoryMailStore, store::MailStore};

/// Selects the mail store backend
///
/// File-backed store in RON config:
/// ```ron
/// Postern (
///     store: (
///         type: "File",
///         path: "/var/spool/postern",
///     ),
/// )
/// ```
///
/// Memory-backed store, for development:
/// ```ron
/// Postern (
///     store: (type: "Memory"),
/// )
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum StoreConfig {
    /// One JSON document per record in a directory
    File(FileMailStore),
    /// Records vanish when the process exits
    Memory,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::File(FileMailStore::default())
    }
}

impl StoreConfig {
    /// The store directory for file-backed stores
    #[must_use]
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            Self::File(store) => Some(store.path()),
            Self::Memory => None,
        }
    }

    /// Initialise the configured backend and hand it out as a trait object
    ///
    /// # Errors
    /// If a file store directory cannot be prepared
    pub fn into_store(self) -> crate::Result<Arc<dyn MailStore>> {
        match self {
            Self::File(store) => {
                store.init()?;
                Ok(Arc::new(store))
            }
            Self::Memory => Ok(Arc::new(MemoryMailStore::new())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_file_store_from_ron() {
        let source = r#"(type: "File", path: "/var/spool/postern")"#;
        let config: StoreConfig = ron::from_str(source).expect("valid config");
        assert_eq!(
            config.path(),
            Some(std::path::Path::new("/var/spool/postern"))
        );
    }

    #[test]
    fn test_memory_store_from_ron() {
        let config: StoreConfig = ron::from_str(r#"(type: "Memory")"#).expect("valid config");
        assert!(matches!(config, StoreConfig::Memory));
        assert_eq!(config.path(), None);
    }

    #[test]
    fn test_invalid_path_is_rejected_at_load() {
        let result: Result<StoreConfig, _> =
            ron::from_str(r#"(type: "File", path: "/etc/postern")"#);
        assert!(result.is_err());
    }
}
