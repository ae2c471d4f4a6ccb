// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache state guarded by the store's single lock.
//!
//! Every method here runs inside one critical section and never awaits, so
//! readers only ever observe states between whole operations.
//!
//! # Fetch reconciliation
//!
//! ```text
//! seq:   1 ───────── 2 ────────── 3 ─────────── 4
//!        fetch A     commit X     fetch B        A completes
//!        begins                   begins
//! ```
//!
//! When fetch A lands, its records predate commit X, so X is replayed from
//! the commit log, then every still-pending optimistic delta is re-applied.
//! If B had landed first, A's older result would be discarded.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

use super::types::{
    CacheEntry, EntryState, FailedMutation, MutationKind, MutationStatus, PendingMutation,
    StoreError,
};
use crate::query::QueryDescriptor;
use crate::record::{Fields, Record};
use crate::remote::RemoteError;

/// Temp ids remembered after their create committed.
const RESOLVED_ID_CAPACITY: usize = 1024;

struct Slot {
    entry: CacheEntry,
    /// Start sequence of the fetch whose records are held
    applied_seq: u64,
    fetched_instant: Option<Instant>,
    subscribers: usize,
    fetches_in_flight: usize,
}

impl Slot {
    fn new(descriptor: QueryDescriptor) -> Self {
        Self {
            entry: CacheEntry::empty(descriptor),
            applied_seq: 0,
            fetched_instant: None,
            subscribers: 0,
            fetches_in_flight: 0,
        }
    }

    fn snapshot(&self, ttl: Duration) -> CacheEntry {
        let mut entry = self.entry.clone();
        if entry.state == EntryState::Fresh && self.expired(ttl) {
            entry.state = EntryState::Stale;
        }
        entry
    }

    fn expired(&self, ttl: Duration) -> bool {
        self.fetched_instant.map_or(true, |at| at.elapsed() >= ttl)
    }
}

/// Server-confirmed change, kept while older fetches are in flight.
enum Committed {
    Upsert { replaces: Option<String>, record: Record },
    Remove { id: String },
}

struct Commit {
    seq: u64,
    table: String,
    change: Committed,
}

struct JournalEntry {
    mutation: PendingMutation,
    /// Where a deleted record sat, per view, for reinsertion on rollback
    memberships: Vec<(QueryDescriptor, usize)>,
}

pub(crate) enum FetchOutcome {
    Applied,
    /// A newer fetch already landed; the result was dropped
    Discarded,
    Failed(RemoteError),
}

#[derive(Default)]
pub(crate) struct CacheState {
    slots: HashMap<QueryDescriptor, Slot>,
    journal: Vec<JournalEntry>,
    commits: Vec<Commit>,
    in_flight: BTreeSet<u64>,
    seq: u64,
    resolved: HashMap<String, String>,
    resolved_order: VecDeque<String>,
    failed: Vec<FailedMutation>,
}

impl CacheState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn slot_mut(&mut self, descriptor: &QueryDescriptor) -> &mut Slot {
        self.slots
            .entry(descriptor.clone())
            .or_insert_with(|| Slot::new(descriptor.clone()))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Entries
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn entry(&self, descriptor: &QueryDescriptor, ttl: Duration) -> Option<CacheEntry> {
        self.slots.get(descriptor).map(|slot| slot.snapshot(ttl))
    }

    /// Entry usable without a fetch: Fresh and within the TTL.
    pub(crate) fn fresh_entry(&self, descriptor: &QueryDescriptor, ttl: Duration) -> Option<CacheEntry> {
        self.slots
            .get(descriptor)
            .filter(|slot| slot.entry.state == EntryState::Fresh && !slot.expired(ttl))
            .map(|slot| slot.entry.clone())
    }

    pub(crate) fn entry_count(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn subscribe(&mut self, descriptor: &QueryDescriptor) -> usize {
        let slot = self.slot_mut(descriptor);
        slot.subscribers += 1;
        slot.subscribers
    }

    /// Drop one subscriber; evicts the entry at zero. Returns true if evicted.
    pub(crate) fn unsubscribe(&mut self, descriptor: &QueryDescriptor) -> bool {
        let Some(slot) = self.slots.get_mut(descriptor) else {
            return false;
        };
        slot.subscribers = slot.subscribers.saturating_sub(1);
        if slot.subscribers == 0 {
            self.slots.remove(descriptor);
            return true;
        }
        false
    }

    pub(crate) fn subscribers(&self, descriptor: &QueryDescriptor) -> usize {
        self.slots.get(descriptor).map_or(0, |slot| slot.subscribers)
    }

    pub(crate) fn evict(&mut self, descriptor: &QueryDescriptor) -> bool {
        self.slots.remove(descriptor).is_some()
    }

    /// Drop every entry. Pending mutations and failures are kept.
    pub(crate) fn clear_entries(&mut self) -> usize {
        let count = self.slots.len();
        self.slots.clear();
        count
    }

    /// Mark every Fresh entry of `table` Stale. Returns how many changed.
    pub(crate) fn invalidate(&mut self, table: &str) -> usize {
        let mut changed = 0;
        for slot in self.slots.values_mut().filter(|s| s.entry.descriptor.table == table) {
            if slot.entry.state == EntryState::Fresh {
                slot.entry.state = EntryState::Stale;
                changed += 1;
            }
        }
        changed
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Fetch
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn begin_fetch(&mut self, descriptor: &QueryDescriptor) -> u64 {
        let seq = self.next_seq();
        self.in_flight.insert(seq);
        let slot = self.slot_mut(descriptor);
        slot.entry.state = EntryState::Fetching;
        slot.fetches_in_flight += 1;
        seq
    }

    /// Fetch future dropped before completion.
    pub(crate) fn abort_fetch(&mut self, descriptor: &QueryDescriptor, seq: u64) {
        self.finish_in_flight(seq);
        if let Some(slot) = self.slots.get_mut(descriptor) {
            slot.fetches_in_flight = slot.fetches_in_flight.saturating_sub(1);
            if slot.entry.state == EntryState::Fetching && slot.fetches_in_flight == 0 {
                slot.entry.state = EntryState::Stale;
            }
        }
    }

    /// Land a fetch result. A superseded success is dropped, a failure is
    /// always reported, and an entry evicted mid-fetch is not recreated.
    pub(crate) fn complete_fetch(
        &mut self,
        descriptor: &QueryDescriptor,
        seq: u64,
        result: Result<Vec<Record>, RemoteError>,
        ttl: Duration,
    ) -> (CacheEntry, FetchOutcome) {
        let superseded = self.slots.get(descriptor).is_some_and(|s| seq < s.applied_seq);
        let result = match result {
            Ok(mut records) if !superseded => {
                for commit in self.commits.iter().filter(|c| c.seq > seq && c.table == descriptor.table) {
                    match &commit.change {
                        Committed::Upsert { replaces, record } => {
                            upsert(&mut records, descriptor, replaces.as_deref(), record)
                        }
                        Committed::Remove { id } => records.retain(|r| &r.id != id),
                    }
                }
                for journaled in self.journal.iter_mut().filter(|j| j.mutation.table == descriptor.table) {
                    overlay(&mut records, descriptor, journaled);
                }
                Ok(Some(records))
            }
            Ok(_) => Ok(None),
            Err(error) => Err(error),
        };
        self.finish_in_flight(seq);

        let mut detached = None;
        let slot = match self.slots.get_mut(descriptor) {
            Some(slot) => slot,
            // evicted while the fetch was in flight
            None => detached.insert(Slot::new(descriptor.clone())),
        };
        slot.fetches_in_flight = slot.fetches_in_flight.saturating_sub(1);

        let outcome = match result {
            Ok(Some(records)) => {
                slot.entry.records = records;
                slot.entry.state = EntryState::Fresh;
                slot.entry.fetched_at = Some(SystemTime::now());
                slot.entry.last_error = None;
                slot.applied_seq = seq;
                slot.fetched_instant = Some(Instant::now());
                FetchOutcome::Applied
            }
            Ok(None) => FetchOutcome::Discarded,
            Err(error) => {
                // newer records already landed; keep their state
                if !superseded {
                    slot.entry.state = EntryState::Error;
                    slot.entry.last_error = Some(error.to_string());
                }
                FetchOutcome::Failed(error)
            }
        };
        (slot.snapshot(ttl), outcome)
    }

    fn finish_in_flight(&mut self, seq: u64) {
        self.in_flight.remove(&seq);
        match self.in_flight.first().copied() {
            Some(floor) => self.commits.retain(|c| c.seq > floor),
            None => self.commits.clear(),
        }
    }

    fn log_commit(&mut self, table: &str, change: Committed) {
        let seq = self.next_seq();
        if !self.in_flight.is_empty() {
            self.commits.push(Commit {
                seq,
                table: table.to_string(),
                change,
            });
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Optimistic apply
    // ═══════════════════════════════════════════════════════════════════════

    /// First cached copy of `id` in any view of `table`.
    pub(crate) fn find_record(&self, table: &str, id: &str) -> Option<Record> {
        self.table_slots(table).find_map(|slot| slot.entry.get(id).cloned())
    }

    fn table_slots<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a Slot> + 'a {
        self.slots.values().filter(move |s| s.entry.descriptor.table == table)
    }

    fn table_slots_mut<'a>(&'a mut self, table: &'a str) -> impl Iterator<Item = &'a mut Slot> + 'a {
        self.slots.values_mut().filter(move |s| s.entry.descriptor.table == table)
    }

    pub(crate) fn apply_create(&mut self, local_id: &str, table: &str, provisional: &Record) {
        for slot in self.table_slots_mut(table) {
            let index = slot.entry.descriptor.insertion_index(&slot.entry.records, provisional);
            slot.entry.records.insert(index, provisional.clone());
        }
        self.journal.push(JournalEntry {
            mutation: PendingMutation {
                local_id: local_id.to_string(),
                kind: MutationKind::Create,
                table: table.to_string(),
                target_id: provisional.id.clone(),
                payload: provisional.fields.clone(),
                snapshot_before_change: None,
                status: MutationStatus::Applying,
            },
            memberships: Vec::new(),
        });
    }

    /// Apply a field delta to every cached copy of `id`. The rollback
    /// snapshot is the cached copy, or `fallback` when nothing is cached.
    pub(crate) fn apply_update(
        &mut self,
        local_id: &str,
        table: &str,
        id: &str,
        fields: &Fields,
        fallback: Option<Record>,
    ) {
        let snapshot = self.find_record(table, id).or(fallback);
        for slot in self.table_slots_mut(table) {
            if let Some(record) = slot.entry.records.iter_mut().find(|r| r.id == id) {
                *record = record.with_fields_applied(fields);
            }
        }
        self.journal.push(JournalEntry {
            mutation: PendingMutation {
                local_id: local_id.to_string(),
                kind: MutationKind::Update,
                table: table.to_string(),
                target_id: id.to_string(),
                payload: fields.clone(),
                snapshot_before_change: snapshot,
                status: MutationStatus::Applying,
            },
            memberships: Vec::new(),
        });
    }

    pub(crate) fn apply_delete(&mut self, local_id: &str, table: &str, id: &str) {
        let mut snapshot = None;
        let mut memberships = Vec::new();
        for slot in self.table_slots_mut(table) {
            if let Some(index) = slot.entry.position(id) {
                let removed = slot.entry.records.remove(index);
                snapshot.get_or_insert(removed);
                memberships.push((slot.entry.descriptor.clone(), index));
            }
        }
        self.journal.push(JournalEntry {
            mutation: PendingMutation {
                local_id: local_id.to_string(),
                kind: MutationKind::Delete,
                table: table.to_string(),
                target_id: id.to_string(),
                payload: Fields::new(),
                snapshot_before_change: snapshot,
                status: MutationStatus::Applying,
            },
            memberships,
        });
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Resolution
    // ═══════════════════════════════════════════════════════════════════════

    fn take_journal(&mut self, local_id: &str) -> Result<JournalEntry, StoreError> {
        let index = self
            .journal
            .iter()
            .position(|j| j.mutation.local_id == local_id)
            .ok_or_else(|| StoreError::RollbackFailed {
                local_id: local_id.to_string(),
                reason: "mutation missing from journal".to_string(),
            })?;
        Ok(self.journal.remove(index))
    }

    /// Server accepted the create: swap the provisional record for `record`.
    pub(crate) fn commit_create(&mut self, local_id: &str, record: &Record) -> Result<PendingMutation, StoreError> {
        let mut journaled = self.take_journal(local_id)?;
        let temp_id = journaled.mutation.target_id.clone();
        let table = journaled.mutation.table.clone();

        for slot in self.table_slots_mut(&table) {
            upsert(&mut slot.entry.records, &slot.entry.descriptor, Some(&temp_id), record);
        }
        self.remember_resolved(&temp_id, &record.id);
        self.log_commit(
            &table,
            Committed::Upsert {
                replaces: Some(temp_id),
                record: record.clone(),
            },
        );

        journaled.mutation.status = MutationStatus::Committed;
        Ok(journaled.mutation)
    }

    pub(crate) fn commit_update(&mut self, local_id: &str, record: &Record) -> Result<PendingMutation, StoreError> {
        let mut journaled = self.take_journal(local_id)?;
        let table = journaled.mutation.table.clone();

        for slot in self.table_slots_mut(&table) {
            if let Some(cached) = slot.entry.records.iter_mut().find(|r| r.id == record.id) {
                *cached = record.clone();
            }
        }
        self.log_commit(&table, Committed::Upsert { replaces: None, record: record.clone() });

        journaled.mutation.status = MutationStatus::Committed;
        Ok(journaled.mutation)
    }

    pub(crate) fn commit_delete(&mut self, local_id: &str) -> Result<PendingMutation, StoreError> {
        let mut journaled = self.take_journal(local_id)?;
        let table = journaled.mutation.table.clone();
        let id = journaled.mutation.target_id.clone();

        for slot in self.table_slots_mut(&table) {
            slot.entry.records.retain(|r| r.id != id);
        }
        self.log_commit(&table, Committed::Remove { id });

        journaled.mutation.status = MutationStatus::Committed;
        Ok(journaled.mutation)
    }

    /// Undo an optimistic change and record it as failed with `error`.
    pub(crate) fn rollback(&mut self, local_id: &str, error: StoreError) -> Result<PendingMutation, StoreError> {
        let journaled = self.take_journal(local_id)?;
        let JournalEntry { mut mutation, memberships } = journaled;
        let table = mutation.table.clone();
        let id = mutation.target_id.clone();

        match mutation.kind {
            MutationKind::Create => {
                for slot in self.table_slots_mut(&table) {
                    slot.entry.records.retain(|r| r.id != id);
                }
            }
            MutationKind::Update => {
                let Some(snapshot) = mutation.snapshot_before_change.clone() else {
                    return Err(StoreError::RollbackFailed {
                        local_id: local_id.to_string(),
                        reason: format!("no snapshot of {} to restore", id),
                    });
                };
                for slot in self.table_slots_mut(&table) {
                    if let Some(cached) = slot.entry.records.iter_mut().find(|r| r.id == id) {
                        *cached = snapshot.clone();
                    }
                }
            }
            MutationKind::Delete => {
                if let Some(snapshot) = &mutation.snapshot_before_change {
                    for (descriptor, index) in &memberships {
                        if let Some(slot) = self.slots.get_mut(descriptor) {
                            if !slot.entry.contains(&id) {
                                let index = (*index).min(slot.entry.records.len());
                                slot.entry.records.insert(index, snapshot.clone());
                            }
                        }
                    }
                }
            }
        }

        mutation.status = MutationStatus::RolledBack;
        self.failed.push(FailedMutation {
            mutation: mutation.clone(),
            error,
        });
        Ok(mutation)
    }

    fn remember_resolved(&mut self, temp_id: &str, real_id: &str) {
        if self.resolved_order.len() == RESOLVED_ID_CAPACITY {
            if let Some(oldest) = self.resolved_order.pop_front() {
                self.resolved.remove(&oldest);
            }
        }
        self.resolved.insert(temp_id.to_string(), real_id.to_string());
        self.resolved_order.push_back(temp_id.to_string());
    }

    /// Server id a committed temp id was replaced by.
    pub(crate) fn resolved_id(&self, temp_id: &str) -> Option<String> {
        self.resolved.get(temp_id).cloned()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Introspection
    // ═══════════════════════════════════════════════════════════════════════

    pub(crate) fn pending(&self) -> Vec<PendingMutation> {
        self.journal.iter().map(|j| j.mutation.clone()).collect()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.journal.len()
    }

    pub(crate) fn is_pending(&self, id: &str) -> bool {
        self.journal.iter().any(|j| j.mutation.target_id == id)
    }

    pub(crate) fn failed(&self) -> Vec<FailedMutation> {
        self.failed.clone()
    }

    pub(crate) fn take_failed(&mut self, local_id: &str) -> Option<FailedMutation> {
        let index = self.failed.iter().position(|f| f.mutation.local_id == local_id)?;
        Some(self.failed.remove(index))
    }

    pub(crate) fn clear_failed(&mut self) -> usize {
        let count = self.failed.len();
        self.failed.clear();
        count
    }
}

/// Put `record` in place of `replaces` or an existing copy, else insert it
/// in sort position.
fn upsert(records: &mut Vec<Record>, descriptor: &QueryDescriptor, replaces: Option<&str>, record: &Record) {
    let existing = records
        .iter()
        .position(|r| r.id == record.id)
        .or_else(|| replaces.and_then(|temp| records.iter().position(|r| r.id == temp)));

    match existing {
        Some(index) => {
            records[index] = record.clone();
            if let Some(temp) = replaces {
                // both the temp and the real copy could be present
                let mut seen = false;
                records.retain(|r| {
                    if r.id == temp {
                        return false;
                    }
                    if r.id == record.id {
                        let keep = !seen;
                        seen = true;
                        return keep;
                    }
                    true
                });
            }
        }
        None => {
            let index = descriptor.insertion_index(records, record);
            records.insert(index, record.clone());
        }
    }
}

/// Re-apply a pending optimistic change to freshly fetched records.
fn overlay(records: &mut Vec<Record>, descriptor: &QueryDescriptor, journaled: &mut JournalEntry) {
    let mutation = &mut journaled.mutation;
    let id = mutation.target_id.as_str();

    match mutation.kind {
        MutationKind::Create => {
            if !records.iter().any(|r| r.id == id) {
                let provisional = Record::new(id, mutation.payload.clone());
                let index = descriptor.insertion_index(records, &provisional);
                records.insert(index, provisional);
            }
        }
        MutationKind::Update => {
            if let Some(record) = records.iter_mut().find(|r| r.id == id) {
                // fetched copy is the newest server state to roll back to
                mutation.snapshot_before_change = Some(record.clone());
                *record = record.with_fields_applied(&mutation.payload);
            }
        }
        MutationKind::Delete => {
            journaled.memberships.retain(|(d, _)| d != descriptor);
            if let Some(index) = records.iter().position(|r| r.id == id) {
                let removed = records.remove(index);
                mutation.snapshot_before_change = Some(removed);
                journaled.memberships.push((descriptor.clone(), index));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::SortSpec;
    use serde_json::json;

    const TTL: Duration = Duration::from_secs(300);

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn rec(id: &str, score: i64) -> Record {
        Record::new(id, fields(json!({ "Score": score })))
    }

    fn ids(entry: &CacheEntry) -> Vec<&str> {
        entry.records.iter().map(|r| r.id.as_str()).collect()
    }

    fn loaded(descriptor: &QueryDescriptor, records: Vec<Record>) -> CacheState {
        let mut cache = CacheState::new();
        let seq = cache.begin_fetch(descriptor);
        cache.complete_fetch(descriptor, seq, Ok(records), TTL);
        cache
    }

    #[test]
    fn test_fetch_marks_fresh() {
        let leads = QueryDescriptor::table("leads");
        let cache = loaded(&leads, vec![rec("r1", 1)]);

        let entry = cache.entry(&leads, TTL).unwrap();
        assert_eq!(entry.state, EntryState::Fresh);
        assert!(entry.has_data());
        assert!(cache.fresh_entry(&leads, TTL).is_some());
    }

    #[test]
    fn test_failed_fetch_keeps_records() {
        let leads = QueryDescriptor::table("leads");
        let mut cache = loaded(&leads, vec![rec("r1", 1)]);

        let seq = cache.begin_fetch(&leads);
        let (entry, outcome) = cache.complete_fetch(&leads, seq, Err(RemoteError::RateLimited), TTL);

        assert!(matches!(outcome, FetchOutcome::Failed(RemoteError::RateLimited)));
        assert_eq!(entry.state, EntryState::Error);
        assert_eq!(ids(&entry), vec!["r1"]);
        assert!(entry.last_error.is_some());
        assert!(entry.is_stale_copy());
    }

    #[test]
    fn test_older_fetch_result_is_discarded() {
        let leads = QueryDescriptor::table("leads");
        let mut cache = CacheState::new();

        let older = cache.begin_fetch(&leads);
        let newer = cache.begin_fetch(&leads);
        cache.complete_fetch(&leads, newer, Ok(vec![rec("new", 1)]), TTL);
        let (entry, outcome) = cache.complete_fetch(&leads, older, Ok(vec![rec("old", 1)]), TTL);

        assert!(matches!(outcome, FetchOutcome::Discarded));
        assert_eq!(ids(&entry), vec!["new"]);
    }

    #[test]
    fn test_older_failed_fetch_is_reported_not_discarded() {
        let leads = QueryDescriptor::table("leads");
        let mut cache = CacheState::new();

        let older = cache.begin_fetch(&leads);
        let newer = cache.begin_fetch(&leads);
        cache.complete_fetch(&leads, newer, Ok(vec![rec("new", 1)]), TTL);
        let (entry, outcome) = cache.complete_fetch(&leads, older, Err(RemoteError::Forbidden), TTL);

        assert!(matches!(outcome, FetchOutcome::Failed(RemoteError::Forbidden)));
        assert_eq!(entry.state, EntryState::Fresh);
        assert_eq!(entry.last_error, None);
        assert_eq!(ids(&entry), vec!["new"]);
    }

    #[test]
    fn test_fetch_into_evicted_entry_is_not_cached() {
        let leads = QueryDescriptor::table("leads");
        let mut cache = CacheState::new();
        cache.subscribe(&leads);

        let seq = cache.begin_fetch(&leads);
        assert!(cache.unsubscribe(&leads));
        let (entry, outcome) = cache.complete_fetch(&leads, seq, Ok(vec![rec("r1", 1)]), TTL);

        assert!(matches!(outcome, FetchOutcome::Applied));
        assert_eq!(ids(&entry), vec!["r1"]);
        assert_eq!(cache.entry_count(), 0);
        assert!(cache.entry(&leads, TTL).is_none());
    }

    #[test]
    fn test_commit_during_fetch_is_replayed() {
        let leads = QueryDescriptor::table("leads");
        let mut cache = loaded(&leads, vec![rec("r1", 1)]);

        let seq = cache.begin_fetch(&leads);
        let provisional = Record::new("temp-1-a", fields(json!({"Score": 5})));
        cache.apply_create("m1", "leads", &provisional);
        cache.commit_create("m1", &rec("r2", 5)).unwrap();

        // server answered before it saw the create
        let (entry, _) = cache.complete_fetch(&leads, seq, Ok(vec![rec("r1", 1)]), TTL);
        assert_eq!(ids(&entry), vec!["r2", "r1"]);
        assert_eq!(cache.resolved_id("temp-1-a").as_deref(), Some("r2"));
    }

    #[test]
    fn test_commit_log_cleared_without_fetches() {
        let leads = QueryDescriptor::table("leads");
        let mut cache = loaded(&leads, vec![rec("r1", 1)]);

        cache.apply_delete("m1", "leads", "r1");
        cache.commit_delete("m1").unwrap();
        assert!(cache.commits.is_empty());
    }

    #[test]
    fn test_pending_update_survives_refetch() {
        let leads = QueryDescriptor::table("leads");
        let mut cache = loaded(&leads, vec![rec("r1", 1)]);

        cache.apply_update("m1", "leads", "r1", &fields(json!({"Score": 9})), None);

        let seq = cache.begin_fetch(&leads);
        let (entry, _) = cache.complete_fetch(&leads, seq, Ok(vec![rec("r1", 2)]), TTL);
        assert_eq!(entry.records[0].field("Score"), Some(&json!(9)));

        // rollback restores the newer server copy
        cache.rollback("m1", StoreError::Remote(RemoteError::Forbidden)).unwrap();
        let entry = cache.entry(&leads, TTL).unwrap();
        assert_eq!(entry.records[0].field("Score"), Some(&json!(2)));
    }

    #[test]
    fn test_delete_rollback_restores_position() {
        let by_score = QueryDescriptor::table("leads").sorted_by(SortSpec::asc("Score"));
        let mut cache = loaded(&by_score, vec![rec("r1", 1), rec("r2", 2), rec("r3", 3)]);
        let before = cache.entry(&by_score, TTL).unwrap();

        cache.apply_delete("m1", "leads", "r2");
        assert_eq!(ids(&cache.entry(&by_score, TTL).unwrap()), vec!["r1", "r3"]);
        assert!(cache.is_pending("r2"));

        let rolled = cache.rollback("m1", StoreError::Remote(RemoteError::NotFound)).unwrap();
        assert_eq!(rolled.status, MutationStatus::RolledBack);
        assert_eq!(cache.entry(&by_score, TTL).unwrap(), before);
        assert_eq!(cache.failed().len(), 1);
        assert!(!cache.is_pending("r2"));
    }

    #[test]
    fn test_create_inserts_into_every_view_of_table() {
        let plain = QueryDescriptor::table("leads");
        let by_score = QueryDescriptor::table("leads").sorted_by(SortSpec::desc("Score"));
        let mut cache = loaded(&plain, vec![rec("r1", 1)]);
        let seq = cache.begin_fetch(&by_score);
        cache.complete_fetch(&by_score, seq, Ok(vec![rec("r9", 9), rec("r1", 1)]), TTL);

        let provisional = Record::new("temp-1-a", fields(json!({"Score": 5})));
        cache.apply_create("m1", "leads", &provisional);

        assert_eq!(ids(&cache.entry(&plain, TTL).unwrap()), vec!["temp-1-a", "r1"]);
        assert_eq!(ids(&cache.entry(&by_score, TTL).unwrap()), vec!["r9", "temp-1-a", "r1"]);

        cache.commit_create("m1", &rec("r5", 5)).unwrap();
        assert_eq!(ids(&cache.entry(&by_score, TTL).unwrap()), vec!["r9", "r5", "r1"]);
        assert_eq!(cache.pending_count(), 0);
    }

    #[test]
    fn test_missing_journal_entry_fails_rollback() {
        let mut cache = CacheState::new();
        let err = cache
            .rollback("ghost", StoreError::Remote(RemoteError::NotFound))
            .unwrap_err();
        assert!(matches!(err, StoreError::RollbackFailed { .. }));
    }

    #[test]
    fn test_subscribers_evict_at_zero() {
        let leads = QueryDescriptor::table("leads");
        let mut cache = CacheState::new();

        cache.subscribe(&leads);
        cache.subscribe(&leads);
        assert!(!cache.unsubscribe(&leads));
        assert_eq!(cache.subscribers(&leads), 1);
        assert!(cache.unsubscribe(&leads));
        assert!(cache.entry(&leads, TTL).is_none());
    }

    #[test]
    fn test_invalidate_only_touches_table() {
        let leads = QueryDescriptor::table("leads");
        let orders = QueryDescriptor::table("orders");
        let mut cache = loaded(&leads, vec![]);
        let seq = cache.begin_fetch(&orders);
        cache.complete_fetch(&orders, seq, Ok(vec![]), TTL);

        assert_eq!(cache.invalidate("leads"), 1);
        assert_eq!(cache.entry(&leads, TTL).unwrap().state, EntryState::Stale);
        assert_eq!(cache.entry(&orders, TTL).unwrap().state, EntryState::Fresh);
    }

    #[test]
    fn test_resolved_ids_are_bounded() {
        let mut cache = CacheState::new();
        for i in 0..=RESOLVED_ID_CAPACITY {
            cache.remember_resolved(&format!("temp-{}", i), &format!("rec{}", i));
        }
        assert_eq!(cache.resolved.len(), RESOLVED_ID_CAPACITY);
        assert!(cache.resolved_id("temp-0").is_none());
    }
}
