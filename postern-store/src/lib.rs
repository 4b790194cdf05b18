pub mod backends;
pub mod config;
pub mod error;
pub mod record;
pub mod store;
pub mod types;

pub use backends::{FileMailStore, MemoryMailStore};
pub use config::StoreConfig;
pub use error::{Result, SerializationError, StoreError, ValidationError};
pub use record::{Attachment, Headers, MailParameters, MailRecord, MailStatus, StoredMail};
pub use store::MailStore;
pub use types::MailId;
