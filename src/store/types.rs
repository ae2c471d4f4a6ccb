// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the entity store.

use std::time::SystemTime;
use thiserror::Error;

use crate::query::QueryDescriptor;
use crate::record::{Fields, Record};
use crate::remote::RemoteError;

/// Freshness of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Last fetch succeeded and is within the TTL
    Fresh,
    /// Never fetched, invalidated, or past the TTL
    Stale,
    /// A fetch is in flight; previous records still served
    Fetching,
    /// Last fetch failed; previous records still served
    Error,
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fresh => write!(f, "Fresh"),
            Self::Stale => write!(f, "Stale"),
            Self::Fetching => write!(f, "Fetching"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Snapshot of one cached collection view.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub descriptor: QueryDescriptor,
    /// Records in the descriptor's sort order
    pub records: Vec<Record>,
    /// When the last successful fetch completed; `None` = no data yet
    pub fetched_at: Option<SystemTime>,
    pub state: EntryState,
    /// Message of the last failed fetch, cleared on success
    pub last_error: Option<String>,
}

impl CacheEntry {
    pub(crate) fn empty(descriptor: QueryDescriptor) -> Self {
        Self {
            descriptor,
            records: Vec::new(),
            fetched_at: None,
            state: EntryState::Stale,
            last_error: None,
        }
    }

    /// True once any fetch has succeeded.
    #[must_use]
    pub fn has_data(&self) -> bool {
        self.fetched_at.is_some()
    }

    /// Data is available but the latest refresh failed.
    #[must_use]
    pub fn is_stale_copy(&self) -> bool {
        self.state == EntryState::Error && self.has_data()
    }

    #[must_use]
    pub fn position(&self, id: &str) -> Option<usize> {
        self.records.iter().position(|r| r.id == id)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.iter().find(|r| r.id == id)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl MutationKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Applying,
    Committed,
    RolledBack,
}

/// An optimistic change applied locally and awaiting the server.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
    pub local_id: String,
    pub kind: MutationKind,
    pub table: String,
    /// Entity id; a TempId for creates
    pub target_id: String,
    pub payload: Fields,
    /// Record as it was before the change (`None` for creates)
    pub snapshot_before_change: Option<Record>,
    pub status: MutationStatus,
}

/// A mutation that was rolled back, kept so the caller can offer a retry.
#[derive(Debug, Clone)]
pub struct FailedMutation {
    pub mutation: PendingMutation,
    pub error: StoreError,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("rollback of mutation {local_id} failed: {reason}")]
    RollbackFailed { local_id: String, reason: String },

    #[error("mutation on '{id}' waited {waited_ms}ms for a previous mutation")]
    MutationQueueTimeout { id: String, waited_ms: u64 },

    #[error("mutation task aborted: {0}")]
    Aborted(String),

    #[error("no failed mutation with local id '{0}'")]
    UnknownMutation(String),
}

impl StoreError {
    /// Short label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Remote(e) => e.kind(),
            Self::RollbackFailed { .. } => "rollback_failed",
            Self::MutationQueueTimeout { .. } => "queue_timeout",
            Self::Aborted(_) => "aborted",
            Self::UnknownMutation(_) => "unknown_mutation",
        }
    }
}
