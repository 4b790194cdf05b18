//! Error types shared by the postern crates.

use thiserror::Error;

/// Errors raised by a [`crate::RecipientResolver`] batch lookup.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The directory backing the resolver could not be reached.
    #[error("Recipient directory unavailable: {0}")]
    Unavailable(String),

    /// The lookup itself failed.
    #[error("Recipient lookup failed: {0}")]
    LookupFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_error_display() {
        let err = ResolveError::Unavailable("connection refused".to_string());
        assert_eq!(
            err.to_string(),
            "Recipient directory unavailable: connection refused"
        );

        let err = ResolveError::LookupFailed("timeout".to_string());
        assert_eq!(err.to_string(), "Recipient lookup failed: timeout");
    }
}
