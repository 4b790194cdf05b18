pub mod error;
pub mod logging;
pub mod recipient;

pub use error::ResolveError;
pub use recipient::{DirectoryEntry, Recipient, RecipientId, RecipientResolver, StaticDirectory};
pub use tracing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
