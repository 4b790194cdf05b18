//! Deferred delivery loop.
//!
//! The dispatcher periodically walks the store and runs the engine on every
//! queued record whose retry time has come. A record is claimed before it is
//! loaded and released when its attempt finishes, so no two attempts on the
//! same record overlap within a process; the store's version check covers
//! the rest.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use postern_common::{Signal, internal};
use postern_store::{MailId, MailRecord, MailStatus, StoreError};
use serde::Deserialize;
use tokio::{task::JoinSet, time::MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::{
    engine::{DeliveryOutcome, Mailer},
    error::AttemptError,
};

const fn default_process_interval() -> u64 {
    10
}

fn default_max_concurrent_deliveries() -> usize {
    num_cpus::get()
}

/// Dispatcher settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DispatcherConfig {
    /// How often to look for due mail (in seconds)
    #[serde(default = "default_process_interval")]
    pub process_interval_secs: u64,

    /// Maximum number of deliveries in flight at once
    ///
    /// Default: number of CPUs
    #[serde(default = "default_max_concurrent_deliveries")]
    pub max_concurrent_deliveries: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            process_interval_secs: default_process_interval(),
            max_concurrent_deliveries: default_max_concurrent_deliveries(),
        }
    }
}

/// What one pass over the store did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub sent: usize,
    pub deferred: usize,
    pub failed: usize,
    /// Queued records left alone this pass: not yet due, already claimed,
    /// unreadable, or lost to a concurrent update
    pub skipped: usize,
}

impl DispatchSummary {
    /// Number of delivery attempts made
    #[must_use]
    pub const fn attempted(&self) -> usize {
        self.sent + self.deferred + self.failed
    }

    fn record(&mut self, outcome: &DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Sent => self.sent += 1,
            DeliveryOutcome::Deferred { .. } => self.deferred += 1,
            DeliveryOutcome::Failed(_) => self.failed += 1,
        }
    }
}

/// Marker that a record is being attempted; released on drop
#[derive(Debug)]
pub struct Claim {
    claims: Arc<DashMap<MailId, DateTime<Utc>>>,
    id: MailId,
}

impl Claim {
    #[must_use]
    pub const fn id(&self) -> &MailId {
        &self.id
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.claims.remove(&self.id);
    }
}

/// Runs deferred deliveries
#[derive(Debug, Clone)]
pub struct Dispatcher {
    mailer: Arc<Mailer>,
    config: DispatcherConfig,
    claims: Arc<DashMap<MailId, DateTime<Utc>>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(mailer: Arc<Mailer>, config: DispatcherConfig) -> Self {
        Self {
            mailer,
            config,
            claims: Arc::new(DashMap::new()),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Claim `id` for an attempt, or `None` if it is already claimed
    pub fn try_claim(&self, id: &MailId) -> Option<Claim> {
        match self.claims.entry(id.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => {
                entry.insert(Utc::now());
                Some(Claim {
                    claims: Arc::clone(&self.claims),
                    id: id.clone(),
                })
            }
        }
    }

    #[must_use]
    pub fn is_claimed(&self, id: &MailId) -> bool {
        self.claims.contains_key(id)
    }

    /// Attempt every queued record that is due at `now`.
    ///
    /// Up to `max_concurrent_deliveries` attempts run at once. The failure of
    /// one record never stops the others.
    ///
    /// # Errors
    /// If the store cannot be listed
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<DispatchSummary, StoreError> {
        let mut summary = DispatchSummary::default();
        let mut due = Vec::new();

        for id in self.mailer.store().list().await? {
            let Some(claim) = self.try_claim(&id) else {
                debug!(mail_id = %id, "Skipping mail, already being delivered");
                summary.skipped += 1;
                continue;
            };

            let record = match self.mailer.store().load(&id).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    error!(mail_id = %id, error = %e, "Failed to load mail");
                    summary.skipped += 1;
                    continue;
                }
            };

            if record.status() != MailStatus::Queued {
                continue;
            }

            if now < record.next_retry() {
                debug!(
                    mail_id = %id,
                    wait_secs = (record.next_retry() - now).num_seconds(),
                    "Skipping mail, not yet time to retry"
                );
                summary.skipped += 1;
                continue;
            }

            due.push((claim, record));
        }

        if due.is_empty() {
            return Ok(summary);
        }

        info!(
            due_count = due.len(),
            max_concurrent = self.config.max_concurrent_deliveries,
            "Delivering queued mail"
        );

        let mut join_set = JoinSet::new();
        let mut due = due.into_iter();

        for _ in 0..self.config.max_concurrent_deliveries.max(1) {
            let Some((claim, record)) = due.next() else {
                break;
            };
            join_set.spawn(deliver(Arc::clone(&self.mailer), claim, record, now));
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(outcome)) => summary.record(&outcome),
                Ok(Err(AttemptError::Store(e))) if e.is_conflict() => {
                    debug!(error = %e, "Mail was updated concurrently, skipping");
                    summary.skipped += 1;
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Delivery attempt was not made");
                    summary.skipped += 1;
                }
                Err(e) => {
                    error!(error = %e, "Delivery task failed");
                    summary.skipped += 1;
                }
            }

            if let Some((claim, record)) = due.next() {
                join_set.spawn(deliver(Arc::clone(&self.mailer), claim, record, now));
            }
        }

        Ok(summary)
    }

    /// Run [`Self::run_once`] every `process_interval_secs` until shutdown.
    ///
    /// A pass that is in progress when the shutdown signal arrives is allowed
    /// to finish.
    pub async fn serve(&self, mut shutdown: tokio::sync::broadcast::Receiver<Signal>) {
        internal!(
            level = INFO,
            interval_secs = self.config.process_interval_secs,
            "Dispatcher starting"
        );

        let interval = Duration::from_secs(self.config.process_interval_secs.max(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_once(Utc::now()).await {
                        Ok(summary) if summary.attempted() > 0 => {
                            info!(
                                sent = summary.sent,
                                deferred = summary.deferred,
                                failed = summary.failed,
                                skipped = summary.skipped,
                                "Dispatched queued mail"
                            );
                        }
                        Ok(_) => debug!("No mail due"),
                        Err(e) => error!(error = %e, "Error listing mail store"),
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!(level = INFO, "Dispatcher received shutdown signal");
                        }
                        Err(e) => {
                            error!("Dispatcher shutdown channel error: {e}");
                        }
                    }
                    break;
                }
            }
        }

        internal!(level = INFO, "Dispatcher shutdown complete");
    }
}

async fn deliver(
    mailer: Arc<Mailer>,
    claim: Claim,
    mut record: MailRecord,
    now: DateTime<Utc>,
) -> Result<DeliveryOutcome, AttemptError> {
    let outcome = mailer
        .attempt_delivery_at(&mut record, false, None, now)
        .await;
    drop(claim);
    outcome
}
