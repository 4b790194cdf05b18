//! The delivery engine.
//!
//! [`Mailer`] is the only component that talks to a transport. One call to
//! [`Mailer::attempt_delivery`] resolves the recipients of a record, assembles
//! the message, hands it to the transport and writes the outcome back to the
//! record:
//!
//! - success marks the record sent
//! - an assembly problem marks it failed for good
//! - a send failure schedules a retry with linear backoff, until the retry
//!   budget runs out and the record is marked failed

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, SubsecRound, Utc};
use postern_common::{Recipient, RecipientId, RecipientResolver, internal, outgoing};
use postern_store::{MailRecord, MailStatus, MailStore};

use crate::{
    config::DeliveryConfig,
    error::{
        AttemptError, DeliveryError, PreconditionError, ProtocolError, TransientError, error_chain,
    },
    headers::{ThreadHeaders, thread_index_at},
    recipients::deliverable_emails,
    transport::{OutgoingMessage, Transport},
};

/// Value of the `X-Mail-Transport-Agent` header on every message
pub const TRANSPORT_AGENT: &str = "Postern";

/// What a delivery attempt did to a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The transport accepted the message
    Sent,
    /// The send failed and the record is queued for another attempt
    Deferred {
        error: DeliveryError,
        retry_count: u32,
        next_retry: DateTime<Utc>,
    },
    /// No further attempts will be made on their own.
    ///
    /// Protocol errors and exhausted retries land here, as does a failed
    /// forced attempt on a record that was not queued.
    Failed(DeliveryError),
}

impl DeliveryOutcome {
    #[must_use]
    pub const fn is_sent(&self) -> bool {
        matches!(self, Self::Sent)
    }

    /// The error behind a deferred or failed attempt
    #[must_use]
    pub const fn error(&self) -> Option<&DeliveryError> {
        match self {
            Self::Sent => None,
            Self::Deferred { error, .. } | Self::Failed(error) => Some(error),
        }
    }
}

/// Delivers mail records
#[derive(Debug)]
pub struct Mailer {
    config: DeliveryConfig,
    resolver: Arc<dyn RecipientResolver>,
    store: Arc<dyn MailStore>,
    transport: Option<Arc<dyn Transport>>,
}

impl Mailer {
    #[must_use]
    pub fn new(
        config: DeliveryConfig,
        resolver: Arc<dyn RecipientResolver>,
        store: Arc<dyn MailStore>,
    ) -> Self {
        // Built once so that every attempt shares the same transport. A kind
        // that cannot be built is retried, and reported, per attempt.
        let transport = config.default_transport.build().ok();

        Self {
            config,
            resolver,
            store,
            transport,
        }
    }

    /// Use `transport` instead of the configured default
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub const fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    #[must_use]
    pub const fn store(&self) -> &Arc<dyn MailStore> {
        &self.store
    }

    /// The transport used when an attempt does not supply one
    #[must_use]
    pub const fn transport(&self) -> Option<&Arc<dyn Transport>> {
        self.transport.as_ref()
    }

    /// Persist `record`, then deliver it straight away if immediate sending
    /// is enabled.
    ///
    /// Returns the outcome of the delivery attempt, or `None` if the record
    /// was only queued.
    ///
    /// # Errors
    /// If the record cannot be saved, or it is not eligible for delivery
    pub async fn save_and_send(
        &self,
        record: &mut MailRecord,
    ) -> Result<Option<DeliveryOutcome>, AttemptError> {
        let id = self.store.save(record).await?;

        if !self.config.immediate_send {
            internal!(level = DEBUG, mail_id = %id, "Queued mail for deferred delivery");
            return Ok(None);
        }

        self.attempt_delivery(record, false, None).await.map(Some)
    }

    /// Attempt to deliver `record` now
    ///
    /// # Errors
    /// See [`Self::attempt_delivery_at`]
    pub async fn attempt_delivery(
        &self,
        record: &mut MailRecord,
        force_send: bool,
        transport: Option<Arc<dyn Transport>>,
    ) -> Result<DeliveryOutcome, AttemptError> {
        self.attempt_delivery_at(record, force_send, transport, Utc::now())
            .await
    }

    /// Attempt to deliver `record` as of `now`, and save the result.
    ///
    /// Unless `force_send` is set the record must be queued and due. The
    /// supplied transport is used if there is one, otherwise the mailer's own.
    ///
    /// Failures of the attempt itself are recorded on the record and reported
    /// in the returned outcome. On return `record` matches what was saved.
    ///
    /// # Errors
    /// - If a precondition does not hold; the record is left untouched
    /// - If the outcome cannot be saved; the record is left untouched, even
    ///   though the transport may already have accepted the message
    pub async fn attempt_delivery_at(
        &self,
        record: &mut MailRecord,
        force_send: bool,
        transport: Option<Arc<dyn Transport>>,
        now: DateTime<Utc>,
    ) -> Result<DeliveryOutcome, AttemptError> {
        if !force_send {
            check_preconditions(record, now)?;
        }

        let now = now.trunc_subsecs(0);

        // The caller's record only changes once the outcome is stored
        let mut updated = record.clone();

        let outcome = match self.assemble(&updated, transport, now).await {
            Err(error) => {
                updated.mark_failed(error.to_string());
                DeliveryOutcome::Failed(error.into())
            }
            Ok((transport, message)) => match self.send(&updated, &*transport, &message).await {
                Ok(()) => {
                    updated.mark_sent();
                    DeliveryOutcome::Sent
                }
                Err(error) => self.defer(&mut updated, error, now),
            },
        };

        let id = self.store.save(&mut updated).await?;
        *record = updated;

        match &outcome {
            DeliveryOutcome::Sent => {
                outgoing!(level = INFO, mail_id = %id, "Mail sent");
            }
            DeliveryOutcome::Deferred {
                error,
                retry_count,
                next_retry,
            } => {
                outgoing!(
                    level = WARN,
                    mail_id = %id,
                    retry_count,
                    next_retry = %next_retry,
                    error = %error,
                    "Mail delivery failed, will retry"
                );
            }
            DeliveryOutcome::Failed(error) => {
                outgoing!(
                    level = ERROR,
                    mail_id = %id,
                    retry_count = record.retry_count(),
                    error = %error,
                    "Mail delivery failed permanently"
                );
            }
        }

        Ok(outcome)
    }

    /// Turn a record into a message for `transport`
    async fn assemble(
        &self,
        record: &MailRecord,
        transport: Option<Arc<dyn Transport>>,
        now: DateTime<Utc>,
    ) -> Result<(Arc<dyn Transport>, OutgoingMessage), ProtocolError> {
        let transport = match transport.or_else(|| self.transport.clone()) {
            Some(transport) => transport,
            None => self.config.default_transport.build()?,
        };

        let parameters = record.parameters();
        let resolved = self.resolve(record).await?;

        let mut message = OutgoingMessage::new();

        let mut reply_to = parameters.reply_to.clone();
        let mut reply_to_name = parameters.reply_to_name.clone();

        match &parameters.from {
            None => {
                message.set_from(&self.config.default_sender, "");
            }
            Some(from) => {
                let sender = resolved
                    .get(from)
                    .ok_or_else(|| ProtocolError::UnresolvedSender(from.clone()))?;

                if self.config.allow_send_as_user {
                    message.set_from(&sender.email, "");
                } else {
                    message.set_from(&self.config.default_sender, &sender.display_name);
                    if reply_to.is_none() {
                        reply_to = Some(sender.email.clone());
                        reply_to_name = Some(sender.display_name.clone());
                    }
                }
            }
        }

        if let Some(reply_to) = reply_to {
            message.add_reply_to(reply_to, reply_to_name.unwrap_or_default());
        }

        if parameters.to.is_empty() {
            return Err(ProtocolError::NoRecipients);
        }
        let to = deliverable_emails(&parameters.to, &resolved);
        if to.is_empty() {
            return Err(ProtocolError::NoDeliverableRecipients);
        }
        message.add_tos(to);

        let cc = deliverable_emails(&parameters.cc, &resolved);
        if !cc.is_empty() {
            message.add_ccs(cc);
        }

        for (name, value) in parameters.headers.iter() {
            message.add_header(name, value);
        }

        for attachment in &parameters.attachments {
            message.add_attachment(attachment.clone());
        }

        if let Some(body) = &parameters.body {
            message.set_body(body);
        }

        if let Some(subject) = &parameters.subject {
            message.set_subject(subject);
        }

        if parameters.is_html {
            message.set_is_html(true);
        }

        if parameters.is_bulk && self.config.bulk_precedence {
            message.add_header("Precedence", "bulk");
        }

        if let Some(thread_id) = &parameters.thread_id {
            let threading = ThreadHeaders::build(
                thread_id,
                parameters.parent_message_id.as_deref(),
                parameters.is_first_message,
                transport.supports_message_id_header(),
            );
            for (name, value) in threading.headers() {
                message.add_header(name, value);
            }
            message.add_header(
                "Thread-Index",
                thread_index_at(thread_id, parameters.is_first_message, now.timestamp()),
            );
        }

        message.add_header("X-Mail-Transport-Agent", TRANSPORT_AGENT);

        Ok((transport, message))
    }

    /// Look up every recipient of `record` in one batch
    async fn resolve(
        &self,
        record: &MailRecord,
    ) -> Result<HashMap<RecipientId, Recipient>, ProtocolError> {
        let parameters = record.parameters();

        let mut ids: Vec<RecipientId> = Vec::new();
        for id in parameters
            .from
            .iter()
            .chain(&parameters.to)
            .chain(&parameters.cc)
        {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }

        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        self.resolver
            .resolve(&ids)
            .await
            .map_err(|error| ProtocolError::Resolver(error.to_string()))
    }

    async fn send(
        &self,
        record: &MailRecord,
        transport: &dyn Transport,
        message: &OutgoingMessage,
    ) -> Result<(), TransientError> {
        if record.retry_count() < record.simulated_failure_count() {
            return Err(TransientError::Simulated);
        }

        outgoing!(
            level = DEBUG,
            transport = transport.name(),
            to = ?message.to(),
            "Handing mail to transport"
        );

        transport
            .send(message)
            .await
            .map_err(|error| TransientError::Transport(error_chain(&error)))
    }

    /// Record a failed send and decide whether to try again
    fn defer(
        &self,
        record: &mut MailRecord,
        error: TransientError,
        now: DateTime<Utc>,
    ) -> DeliveryOutcome {
        let policy = &self.config.retry;
        let text = error.to_string();

        if record.status() != MailStatus::Queued {
            record.set_message(text);
            return DeliveryOutcome::Failed(error.into());
        }

        if policy.is_exhausted(record.retry_count()) {
            record.mark_failed(text);
            return DeliveryOutcome::Failed(error.into());
        }

        let next_retry = policy.next_retry(now, record.retry_count() + 1);
        let retry_count = record.defer(text, next_retry);

        DeliveryOutcome::Deferred {
            error: error.into(),
            retry_count,
            next_retry,
        }
    }
}

fn check_preconditions(record: &MailRecord, now: DateTime<Utc>) -> Result<(), PreconditionError> {
    if record.status() != MailStatus::Queued {
        return Err(PreconditionError::AlreadySent(record.status()));
    }

    if now < record.next_retry() {
        return Err(PreconditionError::RetryNotDue {
            next_retry: record.next_retry(),
        });
    }

    Ok(())
}
