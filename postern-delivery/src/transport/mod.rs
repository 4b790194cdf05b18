//! Wire transports and the message handed to them.
//!
//! The engine fills in an [`OutgoingMessage`] and passes it to a
//! [`Transport`], which either sends the whole message or fails. Transports
//! are chosen by [`TransportKind`] in configuration.

mod log;
mod memory;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use postern_store::Attachment;
use serde::{Deserialize, Serialize};

pub use self::{log::LogTransport, memory::MemoryTransport};
use crate::error::{ProtocolError, TransportError};

/// Sends one fully assembled message
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Whether the transport lets the caller choose the `Message-ID` header.
    ///
    /// Some services assign their own; for those, the first message of a
    /// thread is threaded as if it were a reply.
    fn supports_message_id_header(&self) -> bool {
        true
    }

    /// Send `message`
    ///
    /// # Errors
    /// If the message could not be sent. Nothing is considered delivered
    /// when this fails.
    async fn send(&self, message: &OutgoingMessage) -> Result<(), TransportError>;
}

/// A mailbox, optionally with a display name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Address {
    pub email: String,
    /// Empty when there is no display name
    pub name: String,
}

impl Address {
    #[must_use]
    pub fn new(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            f.write_str(&self.email)
        } else {
            write!(f, "\"{}\" <{}>", self.name.replace('"', ""), self.email)
        }
    }
}

/// A message as handed to a transport
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    from: Option<Address>,
    reply_to: Vec<Address>,
    to: Vec<String>,
    cc: Vec<String>,
    headers: Vec<(String, String)>,
    attachments: Vec<Attachment>,
    body: Option<String>,
    subject: Option<String>,
    is_html: bool,
}

impl OutgoingMessage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_from(&mut self, email: impl Into<String>, name: impl Into<String>) -> &mut Self {
        self.from = Some(Address::new(email, name));
        self
    }

    pub fn add_reply_to(&mut self, email: impl Into<String>, name: impl Into<String>) -> &mut Self {
        self.reply_to.push(Address::new(email, name));
        self
    }

    pub fn add_tos(&mut self, emails: impl IntoIterator<Item = String>) -> &mut Self {
        self.to.extend(emails);
        self
    }

    pub fn add_ccs(&mut self, emails: impl IntoIterator<Item = String>) -> &mut Self {
        self.cc.extend(emails);
        self
    }

    /// Append a header; existing headers of the same name are kept
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn add_attachment(&mut self, attachment: Attachment) -> &mut Self {
        self.attachments.push(attachment);
        self
    }

    pub fn set_body(&mut self, body: impl Into<String>) -> &mut Self {
        self.body = Some(body.into());
        self
    }

    pub fn set_subject(&mut self, subject: impl Into<String>) -> &mut Self {
        self.subject = Some(subject.into());
        self
    }

    pub const fn set_is_html(&mut self, is_html: bool) -> &mut Self {
        self.is_html = is_html;
        self
    }

    #[must_use]
    pub const fn from(&self) -> Option<&Address> {
        self.from.as_ref()
    }

    #[must_use]
    pub fn reply_to(&self) -> &[Address] {
        &self.reply_to
    }

    #[must_use]
    pub fn to(&self) -> &[String] {
        &self.to
    }

    #[must_use]
    pub fn cc(&self) -> &[String] {
        &self.cc
    }

    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// The first value of header `name`, compared case-insensitively
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    #[must_use]
    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    #[must_use]
    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    #[must_use]
    pub const fn is_html(&self) -> bool {
        self.is_html
    }
}

/// Transport selection in configuration
///
/// ```ron
/// Postern (
///     delivery: (
///         default_transport: Log,
///     ),
/// )
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    /// Write every message to the log and report success
    #[default]
    Log,
    /// Keep every message in memory; nothing is delivered.
    ///
    /// A mailer builds its transport once, so all of its mail lands in one
    /// outbox. Meant for development and tests.
    Memory,
    /// Refuse to build a transport; every delivery fails permanently
    Disabled,
}

impl TransportKind {
    /// Build a transport of this kind
    ///
    /// # Errors
    /// If outbound mail is disabled
    pub fn build(self) -> Result<Arc<dyn Transport>, ProtocolError> {
        match self {
            Self::Log => Ok(Arc::new(LogTransport)),
            Self::Memory => Ok(Arc::new(MemoryTransport::new())),
            Self::Disabled => Err(ProtocolError::TransportUnavailable(
                "outbound mail is disabled".to_string(),
            )),
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_address_display() {
        assert_eq!(
            Address::new("noreply@example.com", "").to_string(),
            "noreply@example.com"
        );
        assert_eq!(
            Address::new("noreply@example.com", "Alice \"Al\" Smith").to_string(),
            "\"Alice Al Smith\" <noreply@example.com>"
        );
    }

    #[test]
    fn test_headers_are_appended() {
        let mut message = OutgoingMessage::new();
        message.add_header("X-Test", "one").add_header("x-test", "two");

        assert_eq!(message.headers().len(), 2);
        assert_eq!(message.header("X-TEST"), Some("one"));
        assert_eq!(message.header("Missing"), None);
    }

    #[test]
    fn test_registry_builds_transports() {
        let log = TransportKind::Log.build().expect("log builds");
        assert_eq!(log.name(), "log");

        let memory = TransportKind::Memory.build().expect("memory builds");
        assert_eq!(memory.name(), "memory");

        let disabled = TransportKind::Disabled.build().map(|_| ());
        let reason = "outbound mail is disabled".to_string();
        assert_eq!(disabled, Err(ProtocolError::TransportUnavailable(reason)));
    }

    #[test]
    fn test_transport_kind_from_ron() {
        let kind: TransportKind = ron::from_str("Memory").expect("valid kind");
        assert_eq!(kind, TransportKind::Memory);
    }
}
