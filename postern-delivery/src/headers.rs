//! Threading headers.
//!
//! Mail clients disagree on how to group a conversation. Most follow
//! `Message-ID`, `In-Reply-To` and `References`; Outlook uses its own
//! `Thread-Index`. Every message in a thread gets the full set.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::Utc;

/// Length of the digest prefix shared by every index in a thread
const THREAD_INDEX_PREFIX: usize = 27;

/// Outlook `Thread-Index` for a message in the thread seeded by `seed`
///
/// Replies are stamped with the current time.
#[must_use]
pub fn thread_index(seed: &str, is_first_message: bool) -> String {
    thread_index_at(seed, is_first_message, Utc::now().timestamp())
}

/// Outlook `Thread-Index` for a message sent at `timestamp` (Unix seconds).
///
/// The index is the first 27 hex characters of the MD5 digest of the seed.
/// Replies append a space and the timestamp as 4 big-endian bytes, giving 32
/// bytes, before base64 encoding. Every reply is therefore a direct child of
/// the root rather than of the message it answers; Outlook only needs the
/// shared prefix to group them.
#[must_use]
pub fn thread_index_at(seed: &str, is_first_message: bool, timestamp: i64) -> String {
    let digest = hex::encode(md5::compute(seed.as_bytes()).as_ref());

    let mut index = Vec::with_capacity(32);
    index.extend_from_slice(&digest.as_bytes()[..THREAD_INDEX_PREFIX]);

    if !is_first_message {
        index.push(b' ');
        // Low 32 bits, as an unsigned big-endian word
        index.extend_from_slice(&timestamp.to_be_bytes()[4..]);
    }

    STANDARD.encode(index)
}

/// The RFC 5322 threading headers of one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadHeaders {
    /// The first message of a thread names itself
    Root { message_id: String },
    /// Everything else points back at the thread (and its parent, if known)
    Reply {
        in_reply_to: String,
        references: String,
    },
}

impl ThreadHeaders {
    /// Work out the headers for a message in `thread_id`.
    ///
    /// Only the first message claims the thread id as its own `Message-ID`,
    /// and only when the transport lets us set one. Otherwise the message
    /// replies to the parent when there is one, and to the thread root when
    /// not. `References` always starts at the root.
    #[must_use]
    pub fn build(
        thread_id: &str,
        parent_message_id: Option<&str>,
        is_first_message: bool,
        supports_message_id: bool,
    ) -> Self {
        if is_first_message && supports_message_id {
            return Self::Root {
                message_id: thread_id.to_string(),
            };
        }

        match parent_message_id {
            Some(parent) => Self::Reply {
                in_reply_to: parent.to_string(),
                references: format!("{thread_id} {parent}"),
            },
            None => Self::Reply {
                in_reply_to: thread_id.to_string(),
                references: thread_id.to_string(),
            },
        }
    }

    /// Header name and value pairs, in the order they should be added
    #[must_use]
    pub fn headers(&self) -> Vec<(&'static str, &str)> {
        match self {
            Self::Root { message_id } => vec![("Message-ID", message_id.as_str())],
            Self::Reply {
                in_reply_to,
                references,
            } => vec![
                ("In-Reply-To", in_reply_to.as_str()),
                ("References", references.as_str()),
            ],
        }
    }
}
