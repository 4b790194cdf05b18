//! The persisted unit of outbound mail.
//!
//! A [`MailRecord`] carries the message itself as a set of typed
//! [`MailParameters`] together with its delivery state. On disk the
//! parameters are kept as an opaque JSON blob inside a [`StoredMail`]
//! document, so the schema of the parameters can grow without touching the
//! shape of the store.

use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use postern_common::RecipientId;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de::MapAccess, ser::SerializeMap};

use crate::{MailId, error::SerializationError};

/// Delivery state of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MailStatus {
    #[serde(rename = "queued")]
    Queued,
    #[serde(rename = "sent")]
    Sent,
    #[serde(rename = "fail")]
    Failed,
}

impl MailStatus {
    /// Human readable label, as shown to operators
    #[must_use]
    pub const fn readable(self) -> &'static str {
        match self {
            Self::Queued => "Queued for Delivery",
            Self::Sent => "Sent",
            Self::Failed => "Delivery Failed",
        }
    }
}

impl fmt::Display for MailStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.readable())
    }
}

/// Extra headers, kept in insertion order
///
/// Inserting a name that is already present replaces its value in place.
/// Serialized as a JSON object whose keys appear in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(entry) = self.0.iter_mut().find(|(existing, _)| *existing == name) {
            entry.1 = value;
        } else {
            self.0.push((name, value));
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for Headers {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Headers {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct HeadersVisitor;

        impl<'de> serde::de::Visitor<'de> for HeadersVisitor {
            type Value = Headers;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of header names to values")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut headers = Headers::new();
                while let Some((name, value)) = access.next_entry::<String, String>()? {
                    headers.insert(name, value);
                }
                Ok(headers)
            }
        }

        deserializer.deserialize_map(HeadersVisitor)
    }
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// A file attached to a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Attachment {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub filename: String,
    pub mime_type: String,
}

impl Attachment {
    #[must_use]
    pub fn new(
        data: impl Into<Vec<u8>>,
        filename: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> Self {
        Self {
            data: data.into(),
            filename: filename.into(),
            mime_type: mime_type.into(),
        }
    }
}

/// Everything the caller said about the message
///
/// Field names serialize as `from`, `to`, `cc`, `reply-to`, `reply-to-name`,
/// `subject`, `body`, `is-html`, `is-bulk`, `headers`, `attachments`,
/// `thread-id`, `is-first-message`, `parent-message-id` and
/// `simulated-failures`. Unset fields are left out of the blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MailParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<RecipientId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<RecipientId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<RecipientId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_html: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_bulk: bool,
    #[serde(default, skip_serializing_if = "Headers::is_empty")]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_first_message: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
    #[serde(
        default,
        rename = "simulated-failures",
        skip_serializing_if = "Option::is_none"
    )]
    pub simulated_failures: Option<u32>,
}

impl MailParameters {
    /// Encode the parameters as the blob stored alongside the record
    ///
    /// # Errors
    /// If serialization fails
    pub fn to_json(&self) -> Result<String, SerializationError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a blob produced by [`Self::to_json`]
    ///
    /// # Errors
    /// If the blob is not a valid parameter document
    pub fn from_json(blob: &str) -> Result<Self, SerializationError> {
        Ok(serde_json::from_str(blob)?)
    }
}

/// Keep the first occurrence of every id, in order
fn unique(ids: impl IntoIterator<Item = RecipientId>) -> Vec<RecipientId> {
    let mut seen = Vec::new();
    for id in ids {
        if !seen.contains(&id) {
            seen.push(id);
        }
    }
    seen
}

/// A unit of outbound mail and its delivery state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailRecord {
    pub(crate) id: Option<MailId>,
    parameters: MailParameters,
    status: MailStatus,
    message: Option<String>,
    retry_count: u32,
    next_retry: DateTime<Utc>,
    related_phid: Option<String>,
    pub(crate) date_created: Option<DateTime<Utc>>,
    pub(crate) date_modified: Option<DateTime<Utc>>,
    pub(crate) version: u64,
}

impl Default for MailRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl MailRecord {
    /// A new, unsaved record that is immediately eligible for delivery
    #[must_use]
    pub fn new() -> Self {
        Self::new_at(Utc::now().trunc_subsecs(0))
    }

    /// A new record created at `now`
    #[must_use]
    pub const fn new_at(now: DateTime<Utc>) -> Self {
        Self {
            id: None,
            parameters: MailParameters {
                from: None,
                to: Vec::new(),
                cc: Vec::new(),
                reply_to: None,
                reply_to_name: None,
                subject: None,
                body: None,
                is_html: false,
                is_bulk: false,
                headers: Headers::new(),
                attachments: Vec::new(),
                thread_id: None,
                is_first_message: false,
                parent_message_id: None,
                simulated_failures: None,
            },
            status: MailStatus::Queued,
            message: None,
            retry_count: 0,
            next_retry: now,
            related_phid: None,
            date_created: None,
            date_modified: None,
            version: 0,
        }
    }

    pub fn set_from(&mut self, from: impl Into<RecipientId>) -> &mut Self {
        self.parameters.from = Some(from.into());
        self
    }

    /// Replace the `to` set, dropping duplicate ids
    pub fn add_tos<I, R>(&mut self, ids: I) -> &mut Self
    where
        I: IntoIterator<Item = R>,
        R: Into<RecipientId>,
    {
        self.parameters.to = unique(ids.into_iter().map(Into::into));
        self
    }

    /// Replace the `cc` set, dropping duplicate ids
    pub fn add_ccs<I, R>(&mut self, ids: I) -> &mut Self
    where
        I: IntoIterator<Item = R>,
        R: Into<RecipientId>,
    {
        self.parameters.cc = unique(ids.into_iter().map(Into::into));
        self
    }

    pub fn set_reply_to(&mut self, address: impl Into<String>) -> &mut Self {
        self.parameters.reply_to = Some(address.into());
        self
    }

    pub fn set_reply_to_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.parameters.reply_to_name = Some(name.into());
        self
    }

    pub fn set_subject(&mut self, subject: impl Into<String>) -> &mut Self {
        self.parameters.subject = Some(subject.into());
        self
    }

    pub fn set_body(&mut self, body: impl Into<String>) -> &mut Self {
        self.parameters.body = Some(body.into());
        self
    }

    pub const fn set_is_html(&mut self, is_html: bool) -> &mut Self {
        self.parameters.is_html = is_html;
        self
    }

    /// Flag automated bulk mail, which may get a `Precedence: bulk` header
    pub const fn set_is_bulk(&mut self, is_bulk: bool) -> &mut Self {
        self.parameters.is_bulk = is_bulk;
        self
    }

    /// Set the id used to thread this message with the others in its conversation.
    ///
    /// The id must be usable verbatim in `Message-ID`, `In-Reply-To` and
    /// `References` headers.
    pub fn set_thread_id(
        &mut self,
        thread_id: impl Into<String>,
        is_first_message: bool,
    ) -> &mut Self {
        self.parameters.thread_id = Some(thread_id.into());
        self.parameters.is_first_message = is_first_message;
        self
    }

    /// Set the `Message-ID` of the mail this one answers.
    ///
    /// Gmail breaks a conversation when a reply does not reference the
    /// Message-ID of the message it answers, even if it references an earlier
    /// one in the thread, so this takes precedence over the thread id in
    /// `In-Reply-To` and is listed last in `References`.
    pub fn set_parent_message_id(&mut self, id: impl Into<String>) -> &mut Self {
        self.parameters.parent_message_id = Some(id.into());
        self
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.parameters.headers.insert(name, value);
        self
    }

    pub fn add_attachment(&mut self, attachment: Attachment) -> &mut Self {
        self.parameters.attachments.push(attachment);
        self
    }

    pub fn set_attachments(&mut self, attachments: Vec<Attachment>) -> &mut Self {
        self.parameters.attachments = attachments;
        self
    }

    /// Make the first `count` delivery attempts fail without touching a transport
    pub const fn set_simulated_failure_count(&mut self, count: u32) -> &mut Self {
        self.parameters.simulated_failures = Some(count);
        self
    }

    pub fn set_related_phid(&mut self, phid: impl Into<String>) -> &mut Self {
        self.related_phid = Some(phid.into());
        self
    }

    #[must_use]
    pub const fn id(&self) -> Option<&MailId> {
        self.id.as_ref()
    }

    #[must_use]
    pub const fn parameters(&self) -> &MailParameters {
        &self.parameters
    }

    pub const fn parameters_mut(&mut self) -> &mut MailParameters {
        &mut self.parameters
    }

    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.parameters.subject.as_deref()
    }

    #[must_use]
    pub fn body(&self) -> Option<&str> {
        self.parameters.body.as_deref()
    }

    #[must_use]
    pub fn attachments(&self) -> &[Attachment] {
        &self.parameters.attachments
    }

    #[must_use]
    pub fn parent_message_id(&self) -> Option<&str> {
        self.parameters.parent_message_id.as_deref()
    }

    #[must_use]
    pub fn simulated_failure_count(&self) -> u32 {
        self.parameters.simulated_failures.unwrap_or(0)
    }

    #[must_use]
    pub const fn status(&self) -> MailStatus {
        self.status
    }

    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    #[must_use]
    pub const fn retry_count(&self) -> u32 {
        self.retry_count
    }

    #[must_use]
    pub const fn next_retry(&self) -> DateTime<Utc> {
        self.next_retry
    }

    #[must_use]
    pub fn related_phid(&self) -> Option<&str> {
        self.related_phid.as_deref()
    }

    #[must_use]
    pub const fn date_created(&self) -> Option<DateTime<Utc>> {
        self.date_created
    }

    #[must_use]
    pub const fn date_modified(&self) -> Option<DateTime<Utc>> {
        self.date_modified
    }

    /// Optimistic-lock counter, bumped by every save
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Record a successful delivery
    pub fn mark_sent(&mut self) {
        self.status = MailStatus::Sent;
        self.message = None;
    }

    /// Give up on this record for good
    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.status = MailStatus::Failed;
        self.message = Some(message.into());
    }

    /// Record a failed attempt that should be retried at `next_retry`.
    ///
    /// Only a queued record accumulates retries; for a record that already
    /// reached a final state (a forced re-delivery) only the message changes.
    /// Returns the retry count afterwards.
    pub fn defer(&mut self, message: impl Into<String>, next_retry: DateTime<Utc>) -> u32 {
        self.message = Some(message.into());
        if self.status == MailStatus::Queued {
            self.retry_count += 1;
            self.next_retry = next_retry;
        }
        self.retry_count
    }

    /// Record a failed attempt without scheduling another one
    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = Some(message.into());
    }

    /// Convert into the persisted document
    ///
    /// # Errors
    /// If the record has not been assigned an id, or its parameters cannot be
    /// serialized
    pub fn to_stored(&self) -> Result<StoredMail, SerializationError> {
        let id = self.id.clone().ok_or_else(|| {
            SerializationError::InvalidFormat("record has not been assigned an id".to_string())
        })?;
        let date_created = self.date_created.unwrap_or(self.next_retry);

        Ok(StoredMail {
            id,
            parameters: self.parameters.to_json()?,
            status: self.status,
            message: self.message.clone(),
            retry_count: self.retry_count,
            next_retry: self.next_retry,
            related_phid: self.related_phid.clone(),
            date_created,
            date_modified: self.date_modified.unwrap_or(date_created),
            version: self.version,
        })
    }

    /// Rebuild a record from its persisted document
    ///
    /// # Errors
    /// If the parameter blob cannot be decoded
    pub fn from_stored(stored: StoredMail) -> Result<Self, SerializationError> {
        Ok(Self {
            id: Some(stored.id),
            parameters: MailParameters::from_json(&stored.parameters)?,
            status: stored.status,
            message: stored.message,
            retry_count: stored.retry_count,
            next_retry: stored.next_retry,
            related_phid: stored.related_phid,
            date_created: Some(stored.date_created),
            date_modified: Some(stored.date_modified),
            version: stored.version,
        })
    }
}

/// A record as written to the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMail {
    pub id: MailId,
    /// [`MailParameters`] as a JSON blob
    pub parameters: String,
    pub status: MailStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub retry_count: u32,
    pub next_retry: DateTime<Utc>,
    #[serde(
        default,
        rename = "relatedPHID",
        skip_serializing_if = "Option::is_none"
    )]
    pub related_phid: Option<String>,
    pub date_created: DateTime<Utc>,
    pub date_modified: DateTime<Utc>,
    pub version: u64,
}

impl StoredMail {
    /// # Errors
    /// If the document cannot be serialized
    pub fn to_json(&self) -> Result<String, SerializationError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// # Errors
    /// If the document is not valid JSON for a stored record
    pub fn from_json(document: &str) -> Result<Self, SerializationError> {
        Ok(serde_json::from_str(document)?)
    }
}
