use async_trait::async_trait;
use postern_common::outgoing;

use super::{OutgoingMessage, Transport};
use crate::error::TransportError;

/// Writes each message to the log instead of sending it
///
/// Useful while setting up, and as a default that can never lose mail to a
/// misconfigured relay: the message stays visible in the logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, message: &OutgoingMessage) -> Result<(), TransportError> {
        let from = message.from().map(ToString::to_string).unwrap_or_default();

        outgoing!(
            level = INFO,
            from = %from,
            to = ?message.to(),
            cc = ?message.cc(),
            subject = message.subject().unwrap_or_default(),
            attachments = message.attachments().len(),
            "Logged outgoing mail"
        );

        for (name, value) in message.headers() {
            outgoing!(level = DEBUG, "{name}: {value}");
        }

        if let Some(body) = message.body() {
            outgoing!("{body}");
        }

        Ok(())
    }
}
