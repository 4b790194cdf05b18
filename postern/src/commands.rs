//! Operator commands run against a configured store

use std::fmt;

use chrono::{DateTime, Utc};
use postern_common::{RecipientId, internal};
use postern_delivery::{DeliveryOutcome, Mailer};
use postern_store::{MailId, MailRecord, MailStatus, MailStore};

/// A message to queue from the command line
#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    pub from: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub reply_to: Option<String>,
    pub subject: String,
    pub body: String,
    pub html: bool,
    pub bulk: bool,
    pub thread_id: Option<String>,
    pub first_message: bool,
    pub parent_message_id: Option<String>,
    pub headers: Vec<(String, String)>,
    pub simulated_failures: Option<u32>,
}

impl SendRequest {
    /// Build the record this request describes
    #[must_use]
    pub fn into_record(self) -> MailRecord {
        let mut record = MailRecord::new();

        record
            .add_tos(self.to)
            .add_ccs(self.cc)
            .set_subject(self.subject)
            .set_body(self.body)
            .set_is_html(self.html)
            .set_is_bulk(self.bulk);

        if let Some(from) = self.from {
            record.set_from(from);
        }
        if let Some(reply_to) = self.reply_to {
            record.set_reply_to(reply_to);
        }
        if let Some(thread_id) = self.thread_id {
            record.set_thread_id(thread_id, self.first_message);
        }
        if let Some(parent) = self.parent_message_id {
            record.set_parent_message_id(parent);
        }
        for (name, value) in self.headers {
            record.add_header(name, value);
        }
        if let Some(count) = self.simulated_failures {
            record.set_simulated_failure_count(count);
        }

        record
    }
}

/// What an operator sees of a stored record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailSummary {
    pub id: MailId,
    pub status: MailStatus,
    pub subject: Option<String>,
    pub to: Vec<RecipientId>,
    pub retry_count: u32,
    pub next_retry: DateTime<Utc>,
    pub message: Option<String>,
    pub date_created: Option<DateTime<Utc>>,
}

impl MailSummary {
    fn new(id: MailId, record: &MailRecord) -> Self {
        Self {
            id,
            status: record.status(),
            subject: record.subject().map(ToString::to_string),
            to: record.parameters().to.clone(),
            retry_count: record.retry_count(),
            next_retry: record.next_retry(),
            message: record.message().map(ToString::to_string),
            date_created: record.date_created(),
        }
    }
}

impl fmt::Display for MailSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Mail {}", self.id)?;
        writeln!(f, "  Status:      {}", self.status)?;
        let subject = self.subject.as_deref().unwrap_or("(none)");
        writeln!(f, "  Subject:     {subject}")?;

        let to = self
            .to
            .iter()
            .map(RecipientId::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        writeln!(f, "  To:          {to}")?;

        if let Some(created) = self.date_created {
            writeln!(f, "  Created:     {created}")?;
        }
        writeln!(f, "  Retries:     {}", self.retry_count)?;
        if self.status == MailStatus::Queued {
            writeln!(f, "  Next retry:  {}", self.next_retry)?;
        }
        if let Some(message) = &self.message {
            write!(f, "  Message:     {message}")?;
        }

        Ok(())
    }
}

fn parse_id(id: &str) -> anyhow::Result<MailId> {
    id.parse()
        .map_err(|e| anyhow::anyhow!("Invalid mail id {id}: {e}"))
}

async fn load(store: &dyn MailStore, id: &MailId) -> anyhow::Result<MailRecord> {
    store
        .load(id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("No mail with id {id}"))
}

/// Save a new record and deliver it if the mailer sends immediately
///
/// # Errors
/// If the record cannot be saved
pub async fn send(
    mailer: &Mailer,
    request: SendRequest,
) -> anyhow::Result<(MailId, Option<DeliveryOutcome>)> {
    let mut record = request.into_record();
    let outcome = mailer.save_and_send(&mut record).await?;

    let id = record
        .id()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("Store did not assign an id"))?;

    internal!(level = INFO, mail_id = %id, "Mail accepted");

    Ok((id, outcome))
}

/// Describe a single stored record
///
/// # Errors
/// If the id is malformed, or no such record exists
pub async fn show(store: &dyn MailStore, id: &str) -> anyhow::Result<MailSummary> {
    let id = parse_id(id)?;
    let record = load(store, &id).await?;

    Ok(MailSummary::new(id, &record))
}

/// Describe every stored record, oldest first, optionally only those with
/// the given status
///
/// Records that cannot be read are logged and left out.
///
/// # Errors
/// If the store cannot be listed
pub async fn list(
    store: &dyn MailStore,
    status: Option<MailStatus>,
) -> anyhow::Result<Vec<MailSummary>> {
    let mut summaries = Vec::new();

    for id in store.list().await? {
        match store.load(&id).await {
            Ok(Some(record)) if status.is_none_or(|wanted| record.status() == wanted) => {
                summaries.push(MailSummary::new(id, &record));
            }
            Ok(_) => {}
            Err(e) => {
                internal!(level = WARN, mail_id = %id, error = %e, "Skipping unreadable mail");
            }
        }
    }

    Ok(summaries)
}

/// Attempt delivery of a stored record now
///
/// Without `force` the record must be queued and due for a retry.
///
/// # Errors
/// If the id is malformed, no such record exists, the record is not eligible
/// for delivery, or the outcome cannot be saved
pub async fn retry(mailer: &Mailer, id: &str, force: bool) -> anyhow::Result<DeliveryOutcome> {
    let id = parse_id(id)?;
    let mut record = load(mailer.store().as_ref(), &id).await?;

    Ok(mailer.attempt_delivery(&mut record, force, None).await?)
}
