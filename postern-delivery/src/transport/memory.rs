use std::{io, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use postern_common::outgoing;

use super::{OutgoingMessage, Transport};
use crate::error::TransportError;

#[derive(Debug, Default)]
struct Outbox {
    messages: Vec<OutgoingMessage>,
    pending_failures: u32,
}

/// Captures sent messages in memory
///
/// Clones share the same outbox, so a test can keep one handle while the
/// engine sends through another.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    outbox: Arc<Mutex<Outbox>>,
    supports_message_id: bool,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self {
            outbox: Arc::new(Mutex::new(Outbox::default())),
            supports_message_id: true,
        }
    }

    /// Act like a service that assigns its own `Message-ID`
    #[must_use]
    pub const fn without_message_id_support(mut self) -> Self {
        self.supports_message_id = false;
        self
    }

    /// Refuse the next `count` sends with a connection error
    pub fn fail_next(&self, count: u32) {
        self.outbox.lock().pending_failures = count;
    }

    /// Every message sent so far, oldest first
    #[must_use]
    pub fn sent(&self) -> Vec<OutgoingMessage> {
        self.outbox.lock().messages.clone()
    }

    #[must_use]
    pub fn sent_count(&self) -> usize {
        self.outbox.lock().messages.len()
    }

    #[must_use]
    pub fn last(&self) -> Option<OutgoingMessage> {
        self.outbox.lock().messages.last().cloned()
    }

    pub fn clear(&self) {
        self.outbox.lock().messages.clear();
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    fn supports_message_id_header(&self) -> bool {
        self.supports_message_id
    }

    async fn send(&self, message: &OutgoingMessage) -> Result<(), TransportError> {
        let mut outbox = self.outbox.lock();

        if outbox.pending_failures > 0 {
            outbox.pending_failures -= 1;
            return Err(TransportError::Connection(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "memory transport refused the connection",
            )));
        }

        outbox.messages.push(message.clone());
        outgoing!(
            level = DEBUG,
            outbox = outbox.messages.len(),
            "Captured outgoing mail"
        );

        Ok(())
    }
}
