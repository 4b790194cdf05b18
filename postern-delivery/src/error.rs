//! Typed error handling for delivery attempts.
//!
//! A failed attempt is classified as either:
//! - Protocol: the message cannot be assembled at all; the record fails
//!   permanently and is never retried
//! - Transient: the message was assembled but did not go out; the record is
//!   retried with backoff
//!
//! Neither kind is ever raised out of a delivery attempt. Both are written to
//! the record and reported through [`crate::DeliveryOutcome`]. Only
//! [`AttemptError`] (a precondition or a storage failure) reaches the caller
//! as an `Err`.

use chrono::{DateTime, Utc};
use postern_common::RecipientId;
use postern_store::{MailStatus, StoreError};
use thiserror::Error;

/// Why a delivery attempt did not succeed.
///
/// Displays as the inner error alone, since that text is what gets stored on
/// the record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The message cannot be assembled; retrying will not help.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The message did not leave, but a later attempt may succeed.
    #[error(transparent)]
    Transient(#[from] TransientError),
}

impl DeliveryError {
    /// Returns `true` if this error is temporary and should be retried.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Returns `true` if this error is permanent and should not be retried.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }
}

/// Errors found while assembling a message for the transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("No 'To' specified!")]
    NoRecipients,

    #[error("All 'To' objects are undeliverable (e.g., disabled users).")]
    NoDeliverableRecipients,

    /// The `from` id could not be found in the directory.
    #[error("Unable to resolve sender '{0}'")]
    UnresolvedSender(RecipientId),

    /// The recipient directory could not be queried.
    #[error("Recipient lookup failed: {0}")]
    Resolver(String),

    /// No transport could be built for the configured kind.
    #[error("No mail transport available: {0}")]
    TransportUnavailable(String),
}

/// Errors from handing the assembled message to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransientError {
    /// A configured number of attempts is made to fail on purpose.
    #[error("Simulated failure.")]
    Simulated,

    /// The transport refused or failed to send; the text includes the error's
    /// whole source chain.
    #[error("{0}")]
    Transport(String),
}

/// Errors a transport reports back for a single send.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The remote side accepted the connection but refused the message.
    #[error("Message rejected: {0}")]
    Rejected(String),

    /// The remote side could not be reached.
    #[error("Connection failed")]
    Connection(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// A delivery attempt that was refused before it started.
///
/// The record is left exactly as it was and is not saved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreconditionError {
    #[error("Trying to send an already-sent mail! (status: {0})")]
    AlreadySent(MailStatus),

    #[error("Trying to send an email before next retry! (next retry at {next_retry})")]
    RetryNotDue { next_retry: DateTime<Utc> },
}

/// Errors raised out of a delivery attempt.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    /// The outcome of the attempt could not be persisted.
    ///
    /// The message may still have gone out. The stored record keeps its
    /// earlier state, so a record lost to a concurrent update
    /// ([`StoreError::Conflict`]) can be sent a second time.
    #[error("Failed to persist delivery outcome: {0}")]
    Store(#[from] StoreError),
}

/// Render an error followed by one `caused by:` line per source.
pub(crate) fn error_chain(error: &dyn std::error::Error) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        text.push_str("\ncaused by: ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
