use serde::{Deserialize, Serialize};

use crate::{policy::RetryPolicy, transport::TransportKind};

const fn default_bulk_precedence() -> bool {
    true
}

fn default_sender() -> String {
    "noreply@example.com".to_string()
}

/// How mail is delivered
///
/// Every field has a default, so an empty `()` is a valid configuration.
///
/// ```ron
/// Postern (
///     delivery: (
///         immediate_send: true,
///         default_transport: Log,
///         default_sender: "phabricator@example.com",
///         allow_send_as_user: false,
///         bulk_precedence: true,
///         retry: (max_retries: 250, retry_delay_secs: 5),
///     ),
/// )
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Attempt delivery as soon as a record is saved, instead of leaving it
    /// for the dispatcher
    #[serde(default)]
    pub immediate_send: bool,

    /// Transport used when the caller does not supply one
    #[serde(default)]
    pub default_transport: TransportKind,

    /// Address mail is sent from when it is not sent as a user
    #[serde(default = "default_sender")]
    pub default_sender: String,

    /// Send mail from the user's own address rather than on their behalf
    ///
    /// Only enable this if the relay is allowed to send for every user's
    /// domain, or the mail will be rejected or marked as spoofed.
    #[serde(default)]
    pub allow_send_as_user: bool,

    /// Add `Precedence: bulk` to mail flagged as bulk, which suppresses
    /// vacation auto-replies
    #[serde(default = "default_bulk_precedence")]
    pub bulk_precedence: bool,

    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            immediate_send: false,
            default_transport: TransportKind::default(),
            default_sender: default_sender(),
            allow_send_as_user: false,
            bulk_precedence: default_bulk_precedence(),
            retry: RetryPolicy::default(),
        }
    }
}
