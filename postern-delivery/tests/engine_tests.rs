//! Delivery engine behaviour against the memory store and transport

#![allow(clippy::expect_used)]

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use postern_common::{
    DirectoryEntry, Recipient, RecipientId, RecipientResolver, ResolveError, StaticDirectory,
};
use postern_delivery::{
    AttemptError, DeliveryConfig, DeliveryError, DeliveryOutcome, Mailer, MemoryTransport,
    PreconditionError, ProtocolError, TransientError, Transport, TransportKind,
};
use postern_store::{MailRecord, MailStatus, MailStore, MemoryMailStore};
use pretty_assertions::assert_eq;

struct Harness {
    mailer: Mailer,
    store: Arc<MemoryMailStore>,
    transport: MemoryTransport,
}

fn directory() -> StaticDirectory {
    let entry = |id: &str, email: &str, name: &str, disabled: bool| DirectoryEntry {
        id: id.into(),
        email: email.to_string(),
        name: name.to_string(),
        disabled,
    };

    [
        entry("alice", "alice@example.com", "Alice", false),
        entry("bob", "bob@example.com", "Bob", false),
        entry("carol", "carol@example.com", "Carol", true),
        entry("dave", "", "Dave", false),
    ]
    .into_iter()
    .collect()
}

fn harness_with(config: DeliveryConfig, transport: MemoryTransport) -> Harness {
    let store = Arc::new(MemoryMailStore::new());
    let mailer = Mailer::new(config, Arc::new(directory()), store.clone())
        .with_transport(Arc::new(transport.clone()));

    Harness {
        mailer,
        store,
        transport,
    }
}

fn harness(config: DeliveryConfig) -> Harness {
    harness_with(config, MemoryTransport::new())
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0)
        .single()
        .expect("valid date")
}

fn record_to(to: &[&str]) -> MailRecord {
    let mut record = MailRecord::new_at(start());
    record
        .add_tos(to.iter().copied())
        .set_subject("[Maniphest] T42: Printer on fire")
        .set_body("The printer is on fire.");
    record
}

#[tokio::test]
async fn test_simulated_failures_then_sent() {
    let h = harness(DeliveryConfig::default());
    let mut record = record_to(&["alice"]);
    record.set_simulated_failure_count(2);

    let now = start();
    let outcome = h
        .mailer
        .attempt_delivery_at(&mut record, false, None, now)
        .await
        .expect("attempt runs");
    assert_eq!(
        outcome,
        DeliveryOutcome::Deferred {
            error: DeliveryError::Transient(TransientError::Simulated),
            retry_count: 1,
            next_retry: now + Duration::seconds(5),
        }
    );
    assert_eq!(record.status(), MailStatus::Queued);
    assert_eq!(record.retry_count(), 1);
    assert_eq!(record.message(), Some("Simulated failure."));

    let now = record.next_retry();
    let outcome = h
        .mailer
        .attempt_delivery_at(&mut record, false, None, now)
        .await
        .expect("attempt runs");
    assert!(matches!(
        outcome,
        DeliveryOutcome::Deferred { retry_count: 2, .. }
    ));
    assert_eq!(record.status(), MailStatus::Queued);
    assert_eq!(record.next_retry(), now + Duration::seconds(10));

    let now = record.next_retry();
    let outcome = h
        .mailer
        .attempt_delivery_at(&mut record, false, None, now)
        .await
        .expect("attempt runs");
    assert_eq!(outcome, DeliveryOutcome::Sent);
    assert_eq!(record.status(), MailStatus::Sent);
    assert_eq!(record.retry_count(), 2);
    assert_eq!(record.message(), None);
    assert_eq!(h.transport.sent_count(), 1);

    let stored = h
        .store
        .load(record.id().expect("saved"))
        .await
        .expect("load")
        .expect("exists");
    assert_eq!(stored, record);
}

#[tokio::test]
async fn test_no_recipients_fails_without_retry() {
    let h = harness(DeliveryConfig::default());
    let mut record = record_to(&[]);

    let outcome = h
        .mailer
        .attempt_delivery_at(&mut record, false, None, start())
        .await
        .expect("attempt runs");

    assert_eq!(
        outcome,
        DeliveryOutcome::Failed(ProtocolError::NoRecipients.into())
    );
    assert_eq!(record.status(), MailStatus::Failed);
    assert_eq!(record.message(), Some("No 'To' specified!"));
    assert_eq!(record.retry_count(), 0);
    assert_eq!(h.transport.sent_count(), 0);

    let err = h
        .mailer
        .attempt_delivery_at(&mut record, false, None, start() + Duration::hours(1))
        .await
        .expect_err("failed mail is not retried");
    assert!(matches!(
        err,
        AttemptError::Precondition(PreconditionError::AlreadySent(MailStatus::Failed))
    ));
}

#[tokio::test]
async fn test_all_recipients_undeliverable() {
    let h = harness(DeliveryConfig::default());
    let mut record = record_to(&["carol", "dave", "nobody"]);

    let outcome = h
        .mailer
        .attempt_delivery_at(&mut record, false, None, start())
        .await
        .expect("attempt runs");

    assert!(outcome.error().is_some_and(DeliveryError::is_permanent));
    assert_eq!(record.status(), MailStatus::Failed);
    assert_eq!(
        record.message(),
        Some("All 'To' objects are undeliverable (e.g., disabled users).")
    );
}

#[tokio::test]
async fn test_undeliverable_recipients_are_dropped() {
    let h = harness(DeliveryConfig::default());
    let mut record = record_to(&["carol", "alice", "nobody"]);
    record.add_ccs(["dave", "bob", "carol"]);

    h.mailer
        .attempt_delivery_at(&mut record, false, None, start())
        .await
        .expect("attempt runs");

    let sent = h.transport.last().expect("message sent");
    assert_eq!(sent.to(), ["alice@example.com".to_string()]);
    assert_eq!(sent.cc(), ["bob@example.com".to_string()]);
}

#[tokio::test]
async fn test_default_sender_without_from() {
    let h = harness(DeliveryConfig::default());
    let mut record = record_to(&["alice"]);

    h.mailer
        .attempt_delivery_at(&mut record, false, None, start())
        .await
        .expect("attempt runs");

    let sent = h.transport.last().expect("message sent");
    let from = sent.from().expect("from is set");
    assert_eq!(from.email, "noreply@example.com");
    assert_eq!(from.name, "");
    assert!(sent.reply_to().is_empty());
    assert_eq!(sent.header("X-Mail-Transport-Agent"), Some("Postern"));
    assert_eq!(sent.subject(), Some("[Maniphest] T42: Printer on fire"));
    assert_eq!(sent.body(), Some("The printer is on fire."));
    assert!(!sent.is_html());
}

#[tokio::test]
async fn test_sending_on_behalf_of_user() {
    let h = harness(DeliveryConfig::default());
    let mut record = record_to(&["bob"]);
    record.set_from("alice");

    h.mailer
        .attempt_delivery_at(&mut record, false, None, start())
        .await
        .expect("attempt runs");

    let sent = h.transport.last().expect("message sent");
    let from = sent.from().expect("from is set");
    assert_eq!(from.email, "noreply@example.com");
    assert_eq!(from.name, "Alice");
    assert_eq!(sent.reply_to().len(), 1);
    assert_eq!(sent.reply_to()[0].email, "alice@example.com");
    assert_eq!(sent.reply_to()[0].name, "Alice");
}

#[tokio::test]
async fn test_explicit_reply_to_is_kept() {
    let h = harness(DeliveryConfig::default());
    let mut record = record_to(&["bob"]);
    record.set_from("alice").set_reply_to("T42@example.com");

    h.mailer
        .attempt_delivery_at(&mut record, false, None, start())
        .await
        .expect("attempt runs");

    let sent = h.transport.last().expect("message sent");
    assert_eq!(sent.reply_to().len(), 1);
    assert_eq!(sent.reply_to()[0].email, "T42@example.com");
    assert_eq!(sent.reply_to()[0].name, "");
}

#[tokio::test]
async fn test_sending_as_user() {
    let h = harness(DeliveryConfig {
        allow_send_as_user: true,
        ..DeliveryConfig::default()
    });
    let mut record = record_to(&["bob"]);
    record.set_from("alice");

    h.mailer
        .attempt_delivery_at(&mut record, false, None, start())
        .await
        .expect("attempt runs");

    let sent = h.transport.last().expect("message sent");
    assert_eq!(
        sent.from().map(|from| from.email.as_str()),
        Some("alice@example.com")
    );
    assert!(sent.reply_to().is_empty());
}

#[tokio::test]
async fn test_unresolved_sender_fails() {
    let h = harness(DeliveryConfig::default());
    let mut record = record_to(&["bob"]);
    record.set_from("mallory");

    let outcome = h
        .mailer
        .attempt_delivery_at(&mut record, false, None, start())
        .await
        .expect("attempt runs");

    let unresolved = ProtocolError::UnresolvedSender(RecipientId::new("mallory"));
    assert_eq!(outcome, DeliveryOutcome::Failed(unresolved.into()));
    assert_eq!(record.status(), MailStatus::Failed);
}

#[tokio::test]
async fn test_first_message_claims_thread_id() {
    let h = harness(DeliveryConfig::default());
    let mut record = record_to(&["alice"]);
    record.set_thread_id("T1", true);

    h.mailer
        .attempt_delivery_at(&mut record, false, None, start())
        .await
        .expect("attempt runs");

    let sent = h.transport.last().expect("message sent");
    assert_eq!(sent.header("Message-ID"), Some("T1"));
    assert_eq!(sent.header("In-Reply-To"), None);
    assert_eq!(sent.header("References"), None);
    assert_eq!(
        sent.header("Thread-Index").map(ToString::to_string),
        Some(postern_delivery::thread_index_at("T1", true, 0))
    );
}

#[tokio::test]
async fn test_reply_threads_to_parent() {
    let h = harness(DeliveryConfig::default());
    let mut record = record_to(&["alice"]);
    record
        .set_thread_id("<T1@example.com>", false)
        .set_parent_message_id("<P9@example.com>");

    h.mailer
        .attempt_delivery_at(&mut record, false, None, start())
        .await
        .expect("attempt runs");

    let sent = h.transport.last().expect("message sent");
    assert_eq!(sent.header("Message-ID"), None);
    assert_eq!(sent.header("In-Reply-To"), Some("<P9@example.com>"));
    assert_eq!(
        sent.header("References"),
        Some("<T1@example.com> <P9@example.com>")
    );
    assert_eq!(
        sent.header("Thread-Index").map(ToString::to_string),
        Some(postern_delivery::thread_index_at(
            "<T1@example.com>",
            false,
            start().timestamp()
        ))
    );
}

#[tokio::test]
async fn test_first_message_without_message_id_support() {
    let h = harness_with(
        DeliveryConfig::default(),
        MemoryTransport::new().without_message_id_support(),
    );
    let mut record = record_to(&["alice"]);
    record.set_thread_id("T1", true);

    h.mailer
        .attempt_delivery_at(&mut record, false, None, start())
        .await
        .expect("attempt runs");

    let sent = h.transport.last().expect("message sent");
    assert_eq!(sent.header("Message-ID"), None);
    assert_eq!(sent.header("In-Reply-To"), Some("T1"));
    assert_eq!(sent.header("References"), Some("T1"));
    assert!(sent.header("Thread-Index").is_some());
}

#[tokio::test]
async fn test_bulk_precedence() {
    let h = harness(DeliveryConfig::default());
    let mut record = record_to(&["alice"]);
    record.set_is_bulk(true);
    h.mailer
        .attempt_delivery_at(&mut record, false, None, start())
        .await
        .expect("attempt runs");
    let sent = h.transport.last().expect("message sent");
    assert_eq!(sent.header("Precedence"), Some("bulk"));

    let h = harness(DeliveryConfig {
        bulk_precedence: false,
        ..DeliveryConfig::default()
    });
    let mut record = record_to(&["alice"]);
    record.set_is_bulk(true);
    h.mailer
        .attempt_delivery_at(&mut record, false, None, start())
        .await
        .expect("attempt runs");
    let sent = h.transport.last().expect("message sent");
    assert_eq!(sent.header("Precedence"), None);
}

#[tokio::test]
async fn test_headers_and_attachments_pass_through() {
    let h = harness(DeliveryConfig::default());
    let mut record = record_to(&["alice"]);
    record
        .set_is_html(true)
        .add_header("X-Phabricator-Sent-This-Message", "Yes")
        .add_header("X-Herald-Rules", "<12>")
        .add_attachment(postern_store::Attachment::new(
            b"crash log".to_vec(),
            "crash.log",
            "text/plain",
        ));

    h.mailer
        .attempt_delivery_at(&mut record, false, None, start())
        .await
        .expect("attempt runs");

    let sent = h.transport.last().expect("message sent");
    let names: Vec<_> = sent
        .headers()
        .iter()
        .map(|(name, _)| name.as_str())
        .collect();
    assert_eq!(
        names,
        vec![
            "X-Phabricator-Sent-This-Message",
            "X-Herald-Rules",
            "X-Mail-Transport-Agent",
        ]
    );
    assert!(sent.is_html());
    assert_eq!(sent.attachments().len(), 1);
    assert_eq!(sent.attachments()[0].filename, "crash.log");
}

#[tokio::test]
async fn test_transport_error_includes_cause() {
    let transport = MemoryTransport::new();
    transport.fail_next(1);
    let h = harness_with(DeliveryConfig::default(), transport);
    let mut record = record_to(&["alice"]);

    let outcome = h
        .mailer
        .attempt_delivery_at(&mut record, false, None, start())
        .await
        .expect("attempt runs");

    assert!(outcome.error().is_some_and(DeliveryError::is_temporary));
    assert_eq!(
        record.message(),
        Some("Connection failed\ncaused by: memory transport refused the connection")
    );
    assert_eq!(record.retry_count(), 1);
}

#[tokio::test]
async fn test_retries_run_out() {
    let transport = MemoryTransport::new();
    transport.fail_next(u32::MAX);
    let h = harness_with(DeliveryConfig::default(), transport);
    let mut record = record_to(&["alice"]);

    let now = start();
    for n in 0..=250_u32 {
        let outcome = h
            .mailer
            .attempt_delivery_at(&mut record, true, None, now)
            .await
            .expect("attempt runs");

        assert_eq!(record.retry_count(), n + 1);
        assert_eq!(
            record.next_retry(),
            now + Duration::seconds(i64::from(n + 1) * 5)
        );
        assert!(matches!(outcome, DeliveryOutcome::Deferred { .. }));
    }

    let outcome = h
        .mailer
        .attempt_delivery_at(&mut record, true, None, now)
        .await
        .expect("attempt runs");

    assert!(matches!(
        outcome,
        DeliveryOutcome::Failed(DeliveryError::Transient(_))
    ));
    assert_eq!(record.status(), MailStatus::Failed);
    assert_eq!(record.retry_count(), 251);
}

#[tokio::test]
async fn test_preconditions_leave_record_untouched() {
    let h = harness(DeliveryConfig::default());
    let mut record = record_to(&["alice"]);
    record.set_simulated_failure_count(1);

    h.mailer
        .attempt_delivery_at(&mut record, false, None, start())
        .await
        .expect("attempt runs");
    let before = record.clone();

    let err = h
        .mailer
        .attempt_delivery_at(&mut record, false, None, start() + Duration::seconds(4))
        .await
        .expect_err("retry is not due yet");

    assert!(matches!(
        err,
        AttemptError::Precondition(PreconditionError::RetryNotDue { next_retry })
            if next_retry == start() + Duration::seconds(5)
    ));
    assert_eq!(record, before);

    let stored = h
        .store
        .load(record.id().expect("saved"))
        .await
        .expect("load")
        .expect("exists");
    assert_eq!(stored.version(), before.version());
}

#[tokio::test]
async fn test_transport_agent_header_comes_last() {
    let h = harness(DeliveryConfig::default());
    let mut record = record_to(&["alice"]);
    record
        .set_is_bulk(true)
        .set_thread_id("T1", true)
        .add_header("X-Herald-Rules", "<12>");

    h.mailer
        .attempt_delivery_at(&mut record, false, None, start())
        .await
        .expect("attempt runs");

    let sent = h.transport.last().expect("message sent");
    let names: Vec<_> = sent
        .headers()
        .iter()
        .map(|(name, _)| name.as_str())
        .collect();
    assert_eq!(
        names,
        vec![
            "X-Herald-Rules",
            "Precedence",
            "Message-ID",
            "Thread-Index",
            "X-Mail-Transport-Agent",
        ]
    );
}

#[tokio::test]
async fn test_stale_record_is_left_untouched_when_save_conflicts() {
    let h = harness(DeliveryConfig::default());
    let mut record = record_to(&["alice"]);
    let id = h.store.save(&mut record).await.expect("saved");

    let mut newer = h.store.load(&id).await.expect("load").expect("exists");
    newer.set_subject("edited elsewhere");
    h.store.save(&mut newer).await.expect("saved");

    let before = record.clone();
    let err = h
        .mailer
        .attempt_delivery_at(&mut record, false, None, start())
        .await
        .expect_err("stale record cannot be saved");

    assert!(matches!(err, AttemptError::Store(ref e) if e.is_conflict()));
    assert_eq!(record, before);
    assert_eq!(record.status(), MailStatus::Queued);

    // The transport already took the message; the store still says queued
    assert_eq!(h.transport.sent_count(), 1);
    let stored = h.store.load(&id).await.expect("load").expect("exists");
    assert_eq!(stored.status(), MailStatus::Queued);
    assert_eq!(stored.subject(), Some("edited elsewhere"));
}

#[tokio::test]
async fn test_force_send_bypasses_preconditions() {
    let h = harness(DeliveryConfig::default());
    let mut record = record_to(&["alice"]);

    h.mailer
        .attempt_delivery_at(&mut record, false, None, start())
        .await
        .expect("attempt runs");
    assert_eq!(record.status(), MailStatus::Sent);

    let outcome = h
        .mailer
        .attempt_delivery_at(&mut record, true, None, start())
        .await
        .expect("forced attempt runs");
    assert_eq!(outcome, DeliveryOutcome::Sent);
    assert_eq!(h.transport.sent_count(), 2);
}

#[tokio::test]
async fn test_failed_forced_resend_keeps_retry_state() {
    let transport = MemoryTransport::new();
    let h = harness_with(DeliveryConfig::default(), transport.clone());
    let mut record = record_to(&["alice"]);

    h.mailer
        .attempt_delivery_at(&mut record, false, None, start())
        .await
        .expect("attempt runs");

    transport.fail_next(1);
    let outcome = h
        .mailer
        .attempt_delivery_at(&mut record, true, None, start() + Duration::minutes(1))
        .await
        .expect("forced attempt runs");

    assert!(matches!(
        outcome,
        DeliveryOutcome::Failed(DeliveryError::Transient(_))
    ));
    assert_eq!(record.status(), MailStatus::Sent);
    assert_eq!(record.retry_count(), 0);
    assert_eq!(record.next_retry(), start());
    assert!(record.message().is_some());
}

#[tokio::test]
async fn test_supplied_transport_wins() {
    let h = harness(DeliveryConfig::default());
    let other = MemoryTransport::new();
    let supplied: Arc<dyn Transport> = Arc::new(other.clone());
    let mut record = record_to(&["alice"]);

    h.mailer
        .attempt_delivery_at(&mut record, false, Some(supplied), start())
        .await
        .expect("attempt runs");

    assert_eq!(other.sent_count(), 1);
    assert_eq!(h.transport.sent_count(), 0);
}

#[tokio::test]
async fn test_disabled_transport_fails_permanently() {
    let store = Arc::new(MemoryMailStore::new());
    let mailer = Mailer::new(
        DeliveryConfig {
            default_transport: TransportKind::Disabled,
            ..DeliveryConfig::default()
        },
        Arc::new(directory()),
        store,
    );
    let mut record = record_to(&["alice"]);

    let outcome = mailer
        .attempt_delivery_at(&mut record, false, None, start())
        .await
        .expect("attempt runs");

    let unavailable = ProtocolError::TransportUnavailable("outbound mail is disabled".to_string());
    assert_eq!(outcome, DeliveryOutcome::Failed(unavailable.into()));
    assert_eq!(record.status(), MailStatus::Failed);
}

#[tokio::test]
async fn test_configured_transport_is_built_once() {
    let store = Arc::new(MemoryMailStore::new());
    let mailer = Mailer::new(
        DeliveryConfig {
            default_transport: TransportKind::Memory,
            ..DeliveryConfig::default()
        },
        Arc::new(directory()),
        store,
    );
    let transport = Arc::clone(mailer.transport().expect("memory transport builds"));
    assert_eq!(transport.name(), "memory");

    for _ in 0..2 {
        let mut record = record_to(&["alice"]);
        let outcome = mailer
            .attempt_delivery_at(&mut record, false, None, start())
            .await
            .expect("attempt runs");
        assert_eq!(outcome, DeliveryOutcome::Sent);
    }

    let current = mailer.transport().expect("still configured");
    assert!(Arc::ptr_eq(&transport, current));

    let disabled = Mailer::new(
        DeliveryConfig {
            default_transport: TransportKind::Disabled,
            ..DeliveryConfig::default()
        },
        Arc::new(directory()),
        Arc::new(MemoryMailStore::new()),
    );
    assert!(disabled.transport().is_none());
}

#[derive(Debug)]
struct BrokenDirectory;

#[async_trait]
impl RecipientResolver for BrokenDirectory {
    async fn resolve(
        &self,
        _ids: &[RecipientId],
    ) -> Result<HashMap<RecipientId, Recipient>, ResolveError> {
        Err(ResolveError::Unavailable("directory is down".to_string()))
    }
}

#[tokio::test]
async fn test_resolver_failure_is_terminal() {
    let transport = MemoryTransport::new();
    let mailer = Mailer::new(
        DeliveryConfig::default(),
        Arc::new(BrokenDirectory),
        Arc::new(MemoryMailStore::new()),
    )
    .with_transport(Arc::new(transport.clone()));
    let mut record = record_to(&["alice"]);

    let outcome = mailer
        .attempt_delivery_at(&mut record, false, None, start())
        .await
        .expect("attempt runs");

    assert!(matches!(
        outcome,
        DeliveryOutcome::Failed(DeliveryError::Protocol(ProtocolError::Resolver(_)))
    ));
    assert_eq!(transport.sent_count(), 0);
}

#[tokio::test]
async fn test_save_and_send_queues_by_default() {
    let h = harness(DeliveryConfig::default());
    let mut record = record_to(&["alice"]);

    let outcome = h.mailer.save_and_send(&mut record).await.expect("saved");

    assert_eq!(outcome, None);
    assert!(record.id().is_some());
    assert_eq!(record.status(), MailStatus::Queued);
    assert_eq!(h.transport.sent_count(), 0);
}

#[tokio::test]
async fn test_save_and_send_immediately() {
    let h = harness(DeliveryConfig {
        immediate_send: true,
        ..DeliveryConfig::default()
    });
    let mut record = MailRecord::new();
    record.add_tos(["alice"]).set_subject("now");

    let outcome = h.mailer.save_and_send(&mut record).await.expect("saved");

    assert_eq!(outcome, Some(DeliveryOutcome::Sent));
    assert_eq!(record.status(), MailStatus::Sent);
    assert_eq!(record.version(), 2);
    assert_eq!(h.transport.sent_count(), 1);
}
