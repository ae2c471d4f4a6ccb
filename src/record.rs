// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record data structure.
//!
//! A [`Record`] is an immutable snapshot of one remote entity: a
//! server-assigned id plus an open map of business fields. The store never
//! edits a record in place; changes produce a new value that replaces the old
//! one in every cache entry.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Open key → JSON map of business fields.
pub type Fields = serde_json::Map<String, Value>;

/// One entity instance as returned by the Remote Table API.
///
/// # Example
///
/// ```
/// use record_sync::Record;
/// use serde_json::json;
///
/// let record: Record = serde_json::from_value(json!({
///     "id": "rec123",
///     "fields": {"Name": "Ada"},
///     "createdTime": "2024-01-01T00:00:00.000Z"
/// })).unwrap();
///
/// assert_eq!(record.id, "rec123");
/// assert_eq!(record.field("Name"), Some(&json!("Ada")));
/// assert!(!record.is_provisional());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Server-assigned id (or a [`TempId`] while a create is in flight)
    pub id: String,
    #[serde(default)]
    pub fields: Fields,
    /// Server creation timestamp (ISO-8601); absent on provisional records
    #[serde(rename = "createdTime", default, skip_serializing_if = "Option::is_none")]
    pub created_time: Option<String>,
}

impl Record {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
            created_time: None,
        }
    }

    /// Placeholder inserted by an optimistic create.
    pub fn provisional(temp_id: &TempId, fields: Fields) -> Self {
        Self::new(temp_id.as_str(), fields)
    }

    /// True while the record carries a [`TempId`].
    #[must_use]
    pub fn is_provisional(&self) -> bool {
        TempId::is_temp(&self.id)
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// New snapshot with `patch` written over the current fields.
    #[must_use]
    pub fn with_fields_applied(&self, patch: &Fields) -> Self {
        let mut fields = self.fields.clone();
        for (key, value) in patch {
            fields.insert(key.clone(), value.clone());
        }
        Self {
            id: self.id.clone(),
            fields,
            created_time: self.created_time.clone(),
        }
    }
}

/// Locally generated placeholder id: `temp-<epoch-millis>-<uuid>`.
///
/// Server ids never carry the `temp-` prefix, so a temp id cannot collide
/// with a real one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TempId(String);

impl TempId {
    pub const PREFIX: &'static str = "temp-";

    #[must_use]
    pub fn generate() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(format!("{}{}-{}", Self::PREFIX, millis, Uuid::new_v4().simple()))
    }

    #[must_use]
    pub fn is_temp(id: &str) -> bool {
        id.starts_with(Self::PREFIX)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<TempId> for String {
    fn from(id: TempId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_temp_ids_are_unique_and_marked() {
        let a = TempId::generate();
        let b = TempId::generate();

        assert_ne!(a, b);
        assert!(TempId::is_temp(a.as_str()));
        assert!(!TempId::is_temp("recAbc123"));
    }

    #[test]
    fn test_provisional_record() {
        let temp = TempId::generate();
        let record = Record::provisional(&temp, fields(json!({"Name": "A"})));

        assert!(record.is_provisional());
        assert_eq!(record.id, temp.as_str());
        assert!(record.created_time.is_none());
    }

    #[test]
    fn test_apply_fields_overlays_without_mutating_original() {
        let original = Record::new("rec1", fields(json!({"Name": "A", "Stage": "new"})));
        let updated = original.with_fields_applied(&fields(json!({"Stage": "won", "Value": 10})));

        assert_eq!(original.field("Stage"), Some(&json!("new")));
        assert_eq!(updated.field("Stage"), Some(&json!("won")));
        assert_eq!(updated.field("Name"), Some(&json!("A")));
        assert_eq!(updated.field("Value"), Some(&json!(10)));
    }

    #[test]
    fn test_missing_fields_deserialize_empty() {
        let record: Record = serde_json::from_value(json!({"id": "rec9"})).unwrap();
        assert!(record.fields.is_empty());
    }
}
