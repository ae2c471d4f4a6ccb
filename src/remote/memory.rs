// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{RemoteError, RemoteTable};
use crate::query::{compare_records, ListParams};
use crate::record::{Fields, Record};

/// In-process record store with Remote Table semantics.
///
/// Server-assigned ids look like `rec00000000000001`. Sorting and
/// `max_records` are honoured; filter formulas are not evaluated.
pub struct MemoryTable {
    tables: DashMap<String, Vec<Record>>,
    next_id: AtomicU64,
}

impl MemoryTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Replace the contents of `table`.
    pub fn seed(&self, table: &str, records: Vec<Record>) {
        self.tables.insert(table.to_string(), records);
    }

    /// Current records of `table` in insertion order.
    #[must_use]
    pub fn snapshot(&self, table: &str) -> Vec<Record> {
        self.tables.get(table).map(|r| r.value().clone()).unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self, table: &str) -> usize {
        self.tables.get(table).map(|r| r.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    fn assign_id(&self) -> String {
        format!("rec{:014}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for MemoryTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteTable for MemoryTable {
    async fn list(&self, table: &str, params: &ListParams) -> Result<Vec<Record>, RemoteError> {
        let mut records = self.snapshot(table);
        if !params.sort.is_empty() {
            records.sort_by(|a, b| compare_records(a, b, &params.sort));
        }
        if let Some(max) = params.max_records {
            records.truncate(max as usize);
        }
        Ok(records)
    }

    async fn get(&self, table: &str, id: &str) -> Result<Record, RemoteError> {
        self.tables
            .get(table)
            .and_then(|records| records.iter().find(|r| r.id == id).cloned())
            .ok_or(RemoteError::NotFound)
    }

    async fn create(&self, table: &str, fields: &Fields) -> Result<Record, RemoteError> {
        let record = Record::new(self.assign_id(), fields.clone());
        self.tables
            .entry(table.to_string())
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    async fn update(&self, table: &str, id: &str, fields: &Fields) -> Result<Record, RemoteError> {
        let mut records = self.tables.get_mut(table).ok_or(RemoteError::NotFound)?;
        let slot = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(RemoteError::NotFound)?;
        *slot = slot.with_fields_applied(fields);
        Ok(slot.clone())
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError> {
        let mut records = self.tables.get_mut(table).ok_or(RemoteError::NotFound)?;
        let index = records
            .iter()
            .position(|r| r.id == id)
            .ok_or(RemoteError::NotFound)?;
        records.remove(index);
        Ok(())
    }
}
