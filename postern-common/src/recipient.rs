//! Recipient identities and the directory that resolves them.
//!
//! Callers address mail to opaque [`RecipientId`]s (user handles, mailing
//! list handles, ...). Before a message can leave, every id is resolved in a
//! single batch through a [`RecipientResolver`] into a [`Recipient`], which
//! carries the address, the display name, and whether the identity can
//! receive mail at all.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::ResolveError;

/// Opaque identifier of something that can receive mail
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecipientId(String);

impl RecipientId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecipientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecipientId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for RecipientId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A resolved recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub email: String,
    pub display_name: String,
    /// The account behind this recipient has been disabled
    pub disabled: bool,
    /// The identity resolved fully (it has a usable address)
    pub complete: bool,
}

impl Recipient {
    /// A complete, enabled recipient
    #[must_use]
    pub fn new(email: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            display_name: display_name.into(),
            disabled: false,
            complete: true,
        }
    }

    /// Whether mail may be delivered to this recipient
    #[must_use]
    pub const fn is_deliverable(&self) -> bool {
        !self.disabled && self.complete
    }
}

/// Batch lookup of recipient ids.
///
/// Ids the resolver knows nothing about are left out of the returned map
/// rather than reported as an error; callers treat them as undeliverable.
#[async_trait]
pub trait RecipientResolver: Send + Sync + fmt::Debug {
    /// Resolve every id in `ids`
    ///
    /// # Errors
    /// If the directory cannot be queried
    async fn resolve(
        &self,
        ids: &[RecipientId],
    ) -> Result<HashMap<RecipientId, Recipient>, ResolveError>;
}

/// A directory entry as it appears in configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryEntry {
    pub id: RecipientId,
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub disabled: bool,
}

/// In-memory directory
///
/// Backed by a `DashMap` so that any number of concurrent deliveries can read
/// it while an operator updates individual entries.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    entries: Arc<DashMap<RecipientId, Recipient>>,
}

impl StaticDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a recipient
    pub fn insert(&self, id: impl Into<RecipientId>, recipient: Recipient) {
        self.entries.insert(id.into(), recipient);
    }

    /// Mark a recipient as disabled, returning `false` if it is unknown
    pub fn disable(&self, id: &RecipientId) -> bool {
        self.entries
            .get_mut(id)
            .map(|mut entry| entry.value_mut().disabled = true)
            .is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<DirectoryEntry> for StaticDirectory {
    fn from_iter<T: IntoIterator<Item = DirectoryEntry>>(iter: T) -> Self {
        let directory = Self::new();
        for entry in iter {
            let complete = !entry.email.trim().is_empty();
            directory.insert(
                entry.id,
                Recipient {
                    email: entry.email,
                    display_name: entry.name,
                    disabled: entry.disabled,
                    complete,
                },
            );
        }
        directory
    }
}

#[async_trait]
impl RecipientResolver for StaticDirectory {
    async fn resolve(
        &self,
        ids: &[RecipientId],
    ) -> Result<HashMap<RecipientId, Recipient>, ResolveError> {
        Ok(ids
            .iter()
            .filter_map(|id| {
                self.entries
                    .get(id)
                    .map(|entry| (id.clone(), entry.value().clone()))
            })
            .collect())
    }
}
