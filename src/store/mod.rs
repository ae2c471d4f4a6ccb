// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Optimistic entity store.
//!
//! Caches query results per [`QueryDescriptor`] and applies writes locally
//! before the server confirms them.
//!
//! # Mutation lifecycle
//!
//! ```text
//! create/update/delete
//!        │ (synchronous: queue position taken, applied if nothing is ahead)
//!        ▼
//!   wait for earlier mutations on the same id, then apply
//!        │
//!        ▼
//!   remote call ──┬─► Ok:  commit server record
//!                 └─► Err: roll back, record failure
//! ```
//!
//! All cache changes happen under one [`parking_lot::RwLock`] that is never
//! held across an await. Mutation work runs on spawned tasks; the returned
//! [`MutationHandle`] resolves with the outcome.

mod cache;
mod queue;
pub mod types;

pub use types::{
    CacheEntry, EntryState, FailedMutation, MutationKind, MutationStatus, PendingMutation,
    StoreError,
};

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::RecordSyncConfig;
use crate::query::QueryDescriptor;
use crate::record::{Fields, Record, TempId};
use crate::remote::{RemoteError, RemoteTable};
use cache::{CacheState, FetchOutcome};
use queue::{MutationQueue, QueueTicket};

struct StoreInner {
    remote: Arc<dyn RemoteTable>,
    cache: RwLock<CacheState>,
    queue: MutationQueue,
    cache_ttl: Duration,
    queue_timeout: Duration,
    next_local_id: AtomicU64,
}

/// Shared cache plus optimistic mutation pipeline over a [`RemoteTable`].
///
/// Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct EntityStore {
    inner: Arc<StoreInner>,
}

impl EntityStore {
    pub fn new(remote: Arc<dyn RemoteTable>, config: &RecordSyncConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                remote,
                cache: RwLock::new(CacheState::new()),
                queue: MutationQueue::new(),
                cache_ttl: config.cache_ttl(),
                queue_timeout: config.mutation_queue_timeout(),
                next_local_id: AtomicU64::new(1),
            }),
        }
    }

    /// Store with default configuration.
    pub fn with_remote(remote: Arc<dyn RemoteTable>) -> Self {
        Self::new(remote, &RecordSyncConfig::default())
    }

    pub fn cache_ttl(&self) -> Duration {
        self.inner.cache_ttl
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Reads
    // ═══════════════════════════════════════════════════════════════════════

    /// Load `descriptor` into the cache.
    ///
    /// Without `force`, a Fresh entry inside the TTL is returned as-is. On a
    /// remote error the entry keeps its records, moves to `Error`, and the
    /// error is returned.
    #[instrument(skip(self), fields(table = %descriptor.table))]
    pub async fn fetch(&self, descriptor: &QueryDescriptor, force: bool) -> Result<CacheEntry, StoreError> {
        let seq = {
            let mut cache = self.inner.cache.write();
            if !force {
                if let Some(entry) = cache.fresh_entry(descriptor, self.inner.cache_ttl) {
                    crate::metrics::record_fetch("hit");
                    return Ok(entry);
                }
            }
            let seq = cache.begin_fetch(descriptor);
            crate::metrics::set_cache_entries(cache.entry_count());
            seq
        };

        let mut guard = FetchGuard {
            inner: &self.inner,
            descriptor,
            seq,
            armed: true,
        };
        let _timer = crate::metrics::LatencyTimer::new("fetch");
        let result = self
            .inner
            .remote
            .list(&descriptor.table, &descriptor.list_params())
            .await;
        guard.armed = false;

        let (entry, outcome) =
            self.inner
                .cache
                .write()
                .complete_fetch(descriptor, seq, result, self.inner.cache_ttl);

        match outcome {
            FetchOutcome::Applied => {
                crate::metrics::record_fetch("success");
                debug!(records = entry.records.len(), "Fetched");
                Ok(entry)
            }
            FetchOutcome::Discarded => {
                crate::metrics::record_fetch("discarded");
                debug!(seq, "Discarded fetch result older than cached data");
                Ok(entry)
            }
            FetchOutcome::Failed(e) => {
                crate::metrics::record_fetch("error");
                warn!(error = %e, cached = entry.records.len(), "Fetch failed, serving cached records");
                Err(e.into())
            }
        }
    }

    /// Current entry for `descriptor`, if cached.
    #[must_use]
    pub fn entry(&self, descriptor: &QueryDescriptor) -> Option<CacheEntry> {
        self.inner.cache.read().entry(descriptor, self.inner.cache_ttl)
    }

    /// Cached records for `descriptor`; empty when not cached.
    #[must_use]
    pub fn records(&self, descriptor: &QueryDescriptor) -> Vec<Record> {
        self.entry(descriptor).map(|e| e.records).unwrap_or_default()
    }

    /// Keep `descriptor` cached for as long as the returned guard lives.
    pub fn subscribe(&self, descriptor: &QueryDescriptor) -> Subscription {
        let mut cache = self.inner.cache.write();
        cache.subscribe(descriptor);
        crate::metrics::set_cache_entries(cache.entry_count());
        Subscription {
            inner: self.inner.clone(),
            descriptor: descriptor.clone(),
        }
    }

    #[must_use]
    pub fn subscriber_count(&self, descriptor: &QueryDescriptor) -> usize {
        self.inner.cache.read().subscribers(descriptor)
    }

    /// Drop `descriptor` from the cache regardless of subscribers.
    pub fn evict(&self, descriptor: &QueryDescriptor) -> bool {
        let mut cache = self.inner.cache.write();
        let evicted = cache.evict(descriptor);
        crate::metrics::set_cache_entries(cache.entry_count());
        evicted
    }

    /// Drop every cached entry. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut cache = self.inner.cache.write();
        let cleared = cache.clear_entries();
        crate::metrics::set_cache_entries(0);
        cleared
    }

    /// Mark every Fresh entry of `table` Stale so the next fetch reloads it.
    pub fn invalidate(&self, table: &str) -> usize {
        let changed = self.inner.cache.write().invalidate(table);
        debug!(table, changed, "Invalidated cache entries");
        changed
    }

    #[must_use]
    pub fn cached_entries(&self) -> usize {
        self.inner.cache.read().entry_count()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Optimistic writes
    // ═══════════════════════════════════════════════════════════════════════

    /// Insert a provisional record into every view of `table`, then create it
    /// remotely. The provisional record is replaced by the server's on
    /// success and removed on failure.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn create(&self, table: &str, fields: Fields) -> MutationHandle<Record> {
        let temp_id = TempId::generate();
        let local_id = self.inner.next_local_id(MutationKind::Create);
        let ticket = self.inner.queue.enqueue(temp_id.as_str());
        let provisional = Record::provisional(&temp_id, fields);

        {
            let mut cache = self.inner.cache.write();
            cache.apply_create(&local_id, table, &provisional);
            crate::metrics::set_pending_mutations(cache.pending_count());
        }
        debug!(table, %temp_id, local_id, "Applied optimistic create");

        let inner = self.inner.clone();
        let task_local_id = local_id.clone();
        let task_table = table.to_string();
        let task_fields = provisional.fields.clone();
        let task = tokio::spawn(async move {
            let _ticket = ticket;
            inner.run_create(task_local_id, task_table, task_fields).await
        });

        MutationHandle {
            local_id,
            target_id: temp_id.into(),
            provisional: Some(provisional),
            task,
        }
    }

    /// Merge `fields` into record `id` locally, then remotely. Runs after
    /// every earlier mutation on the same id. `id` may be a TempId from a
    /// create that is still in flight.
    ///
    /// With nothing queued ahead and the record cached, the change is
    /// visible when this returns; otherwise it lands once the queue drains.
    pub fn update(&self, id: &str, table: &str, fields: Fields) -> MutationHandle<Record> {
        let local_id = self.inner.next_local_id(MutationKind::Update);
        let ticket = self.inner.queue.enqueue(id);

        let applied = ticket.is_ready() && !TempId::is_temp(id) && {
            let mut cache = self.inner.cache.write();
            let cached = cache.find_record(table, id).is_some();
            if cached {
                cache.apply_update(&local_id, table, id, &fields, None);
                crate::metrics::set_pending_mutations(cache.pending_count());
            }
            cached
        };
        if applied {
            debug!(table, id, local_id, "Applied optimistic update");
        }

        let inner = self.inner.clone();
        let task = tokio::spawn(inner.run_update(
            ticket,
            Target::new(&local_id, table, id, applied),
            fields,
        ));

        MutationHandle {
            local_id,
            target_id: id.to_string(),
            provisional: None,
            task,
        }
    }

    /// Remove record `id` from every cached view, then delete it remotely.
    pub fn delete(&self, id: &str, table: &str) -> MutationHandle<()> {
        let local_id = self.inner.next_local_id(MutationKind::Delete);
        let ticket = self.inner.queue.enqueue(id);

        let applied = ticket.is_ready() && !TempId::is_temp(id);
        if applied {
            let mut cache = self.inner.cache.write();
            cache.apply_delete(&local_id, table, id);
            crate::metrics::set_pending_mutations(cache.pending_count());
            drop(cache);
            debug!(table, id, local_id, "Applied optimistic delete");
        }

        let inner = self.inner.clone();
        let task = tokio::spawn(inner.run_delete(ticket, Target::new(&local_id, table, id, applied)));

        MutationHandle {
            local_id,
            target_id: id.to_string(),
            provisional: None,
            task,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Mutation bookkeeping
    // ═══════════════════════════════════════════════════════════════════════

    /// Mutations applied locally and awaiting the server, oldest first.
    #[must_use]
    pub fn pending(&self) -> Vec<PendingMutation> {
        self.inner.cache.read().pending()
    }

    /// True while a mutation targeting `id` is awaiting the server.
    #[must_use]
    pub fn is_pending(&self, id: &str) -> bool {
        self.inner.cache.read().is_pending(id)
    }

    /// Rolled-back mutations, oldest first.
    #[must_use]
    pub fn failed(&self) -> Vec<FailedMutation> {
        self.inner.cache.read().failed()
    }

    /// Resubmit a rolled-back mutation with its original payload.
    pub fn retry_failed(&self, local_id: &str) -> Result<RetriedMutation, StoreError> {
        let failed = self
            .inner
            .cache
            .write()
            .take_failed(local_id)
            .ok_or_else(|| StoreError::UnknownMutation(local_id.to_string()))?;

        let m = failed.mutation;
        info!(local_id, kind = m.kind.as_str(), target = %m.target_id, "Retrying failed mutation");
        Ok(match m.kind {
            MutationKind::Create => RetriedMutation::Created(self.create(&m.table, m.payload)),
            MutationKind::Update => RetriedMutation::Updated(self.update(&m.target_id, &m.table, m.payload)),
            MutationKind::Delete => RetriedMutation::Deleted(self.delete(&m.target_id, &m.table)),
        })
    }

    /// Forget all failed mutations. Returns how many were dropped.
    pub fn clear_failed(&self) -> usize {
        self.inner.cache.write().clear_failed()
    }
}

impl StoreInner {
    fn next_local_id(&self, kind: MutationKind) -> String {
        format!(
            "{}-{}",
            kind.as_str(),
            self.next_local_id.fetch_add(1, Ordering::Relaxed)
        )
    }

    async fn run_create(self: Arc<Self>, local_id: String, table: String, fields: Fields) -> Result<Record, StoreError> {
        let mut rollback = RollbackGuard::new(&self, &local_id);
        let result = self.remote.create(&table, &fields).await;
        rollback.disarm();

        match result {
            Ok(record) => {
                self.commit(&local_id, MutationKind::Create, |cache| cache.commit_create(&local_id, &record))?;
                info!(table, local_id, id = %record.id, "Create committed");
                Ok(record)
            }
            Err(e) => Err(self.roll_back(&local_id, MutationKind::Create, e)),
        }
    }

    async fn run_update(
        self: Arc<Self>,
        mut ticket: QueueTicket,
        target: Target,
        fields: Fields,
    ) -> Result<Record, StoreError> {
        let Target { local_id, table, id, applied } = target;
        // Armed before the first await so a dropped task still undoes an
        // update applied at submission.
        let mut rollback = RollbackGuard::new(&self, &local_id);
        let mut _resolved_ticket = None;

        let id = if applied {
            id
        } else {
            rollback.disarm();
            ticket.wait(self.queue_timeout).await?;
            let (id, resolved) = self.resolve_target(id).await?;
            _resolved_ticket = resolved;

            let cached = self.cache.read().find_record(&table, &id);
            let fallback = match cached {
                Some(_) => None,
                None => Some(self.remote.get(&table, &id).await?),
            };

            {
                let mut cache = self.cache.write();
                cache.apply_update(&local_id, &table, &id, &fields, fallback);
                crate::metrics::set_pending_mutations(cache.pending_count());
            }
            debug!(table, id, local_id, "Applied optimistic update");
            rollback.arm();
            id
        };

        let result = self.remote.update(&table, &id, &fields).await;
        rollback.disarm();

        match result {
            Ok(record) => {
                self.commit(&local_id, MutationKind::Update, |cache| cache.commit_update(&local_id, &record))?;
                info!(table, local_id, id = %record.id, "Update committed");
                Ok(record)
            }
            Err(e) => Err(self.roll_back(&local_id, MutationKind::Update, e)),
        }
    }

    async fn run_delete(self: Arc<Self>, mut ticket: QueueTicket, target: Target) -> Result<(), StoreError> {
        let Target { local_id, table, id, applied } = target;
        let mut rollback = RollbackGuard::new(&self, &local_id);
        let mut _resolved_ticket = None;

        let id = if applied {
            id
        } else {
            rollback.disarm();
            ticket.wait(self.queue_timeout).await?;
            let (id, resolved) = self.resolve_target(id).await?;
            _resolved_ticket = resolved;

            {
                let mut cache = self.cache.write();
                cache.apply_delete(&local_id, &table, &id);
                crate::metrics::set_pending_mutations(cache.pending_count());
            }
            debug!(table, id, local_id, "Applied optimistic delete");
            rollback.arm();
            id
        };

        let result = self.remote.delete(&table, &id).await;
        rollback.disarm();

        match result {
            Ok(()) => {
                self.commit(&local_id, MutationKind::Delete, |cache| cache.commit_delete(&local_id))?;
                info!(table, local_id, id, "Delete committed");
                Ok(())
            }
            Err(e) => Err(self.roll_back(&local_id, MutationKind::Delete, e)),
        }
    }

    /// Map a TempId to the server id its create committed with, joining the
    /// real id's queue as well. Plain ids pass through.
    async fn resolve_target(&self, id: String) -> Result<(String, Option<QueueTicket>), StoreError> {
        if !TempId::is_temp(&id) {
            return Ok((id, None));
        }

        let resolved = self.cache.read().resolved_id(&id);
        let Some(real_id) = resolved else {
            debug!(id, "Create behind this temp id did not commit");
            return Err(RemoteError::NotFound.into());
        };
        let mut ticket = self.queue.enqueue(&real_id);
        ticket.wait(self.queue_timeout).await?;
        Ok((real_id, Some(ticket)))
    }

    fn commit<F>(&self, local_id: &str, kind: MutationKind, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut CacheState) -> Result<PendingMutation, StoreError>,
    {
        let mut cache = self.cache.write();
        let result = apply(&mut cache);
        crate::metrics::set_pending_mutations(cache.pending_count());
        drop(cache);

        match result {
            Ok(_) => {
                crate::metrics::record_mutation(kind.as_str(), "committed");
                Ok(())
            }
            Err(e) => {
                error!(local_id, error = %e, "Committed mutation missing from journal");
                crate::metrics::record_rollback_failure();
                Err(e)
            }
        }
    }

    /// Undo `local_id` and return the error to report to the caller.
    fn roll_back(&self, local_id: &str, kind: MutationKind, cause: RemoteError) -> StoreError {
        let mut cache = self.cache.write();
        let result = cache.rollback(local_id, StoreError::Remote(cause.clone()));
        crate::metrics::set_pending_mutations(cache.pending_count());
        drop(cache);

        match result {
            Ok(mutation) => {
                crate::metrics::record_mutation(kind.as_str(), "rolled_back");
                warn!(
                    local_id,
                    kind = kind.as_str(),
                    target = %mutation.target_id,
                    error = %cause,
                    "Mutation rejected, rolled back"
                );
                StoreError::Remote(cause)
            }
            Err(e) => {
                crate::metrics::record_rollback_failure();
                error!(local_id, error = %e, cause = %cause, "Rollback failed");
                e
            }
        }
    }
}

/// Rolls back an applied mutation whose task is dropped mid-flight.
struct RollbackGuard<'a> {
    inner: &'a StoreInner,
    local_id: &'a str,
    armed: bool,
}

impl<'a> RollbackGuard<'a> {
    fn new(inner: &'a StoreInner, local_id: &'a str) -> Self {
        Self {
            inner,
            local_id,
            armed: true,
        }
    }

    fn arm(&mut self) {
        self.armed = true;
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

/// What an update or delete task operates on.
struct Target {
    local_id: String,
    table: String,
    id: String,
    /// Optimistic change already applied at submission
    applied: bool,
}

impl Target {
    fn new(local_id: &str, table: &str, id: &str, applied: bool) -> Self {
        Self {
            local_id: local_id.to_string(),
            table: table.to_string(),
            id: id.to_string(),
            applied,
        }
    }
}

impl Drop for RollbackGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut cache = self.inner.cache.write();
            let aborted = StoreError::Aborted("mutation task dropped".to_string());
            if cache.rollback(self.local_id, aborted).is_err() {
                crate::metrics::record_rollback_failure();
            }
        }
    }
}

/// Marks an in-flight fetch as abandoned if its future is dropped.
struct FetchGuard<'a> {
    inner: &'a StoreInner,
    descriptor: &'a QueryDescriptor,
    seq: u64,
    armed: bool,
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.cache.write().abort_fetch(self.descriptor, self.seq);
        }
    }
}

/// Keeps a cache entry alive; the entry is evicted when the last
/// subscription for its descriptor is dropped.
pub struct Subscription {
    inner: Arc<StoreInner>,
    descriptor: QueryDescriptor,
}

impl Subscription {
    #[must_use]
    pub fn descriptor(&self) -> &QueryDescriptor {
        &self.descriptor
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut cache = self.inner.cache.write();
        if cache.unsubscribe(&self.descriptor) {
            debug!(table = %self.descriptor.table, "Evicted unsubscribed cache entry");
        }
        crate::metrics::set_cache_entries(cache.entry_count());
    }
}

/// Outcome of a submitted mutation.
///
/// The optimistic change is already visible when the handle is returned.
pub struct MutationHandle<T> {
    local_id: String,
    target_id: String,
    provisional: Option<Record>,
    task: JoinHandle<Result<T, StoreError>>,
}

impl<T> MutationHandle<T> {
    #[must_use]
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Entity id the mutation targets; the TempId for creates.
    #[must_use]
    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    /// The provisional record inserted by a create.
    #[must_use]
    pub fn provisional(&self) -> Option<&Record> {
        self.provisional.as_ref()
    }

    /// Wait for the server's answer.
    pub async fn wait(self) -> Result<T, StoreError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(StoreError::Aborted(e.to_string())),
        }
    }
}

/// Handle for a resubmitted failed mutation.
pub enum RetriedMutation {
    Created(MutationHandle<Record>),
    Updated(MutationHandle<Record>),
    Deleted(MutationHandle<()>),
}

impl RetriedMutation {
    #[must_use]
    pub fn local_id(&self) -> &str {
        match self {
            Self::Created(h) | Self::Updated(h) => h.local_id(),
            Self::Deleted(h) => h.local_id(),
        }
    }

    /// Wait for the server; discards the returned record.
    pub async fn wait(self) -> Result<(), StoreError> {
        match self {
            Self::Created(h) | Self::Updated(h) => h.wait().await.map(|_| ()),
            Self::Deleted(h) => h.wait().await,
        }
    }
}
