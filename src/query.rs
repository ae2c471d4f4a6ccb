// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query descriptors: the identity of one cached collection view.
//!
//! Two descriptors with the same table, filter, sort and page size are the
//! same cache key. Filters are opaque server formulas; the helpers here only
//! build common formula shapes with quoting.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use crate::record::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn asc(field: impl Into<String>) -> Self {
        Self { field: field.into(), direction: SortDirection::Asc }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self { field: field.into(), direction: SortDirection::Desc }
    }
}

/// Server-side filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterExpr {
    #[default]
    All,
    Formula(String),
}

impl FilterExpr {
    pub fn formula(formula: impl Into<String>) -> Self {
        Self::Formula(formula.into())
    }

    #[must_use]
    pub fn as_formula(&self) -> Option<&str> {
        match self {
            Self::All => None,
            Self::Formula(f) => Some(f.as_str()),
        }
    }

    /// `{field} = 'v'`, or `OR(...)` over several values. Empty values are
    /// ignored; `None` when nothing is left.
    pub fn any_of<I, S>(field: &str, values: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let clauses: Vec<String> = values
            .into_iter()
            .filter(|v| !v.as_ref().is_empty())
            .map(|v| format!("{{{}}} = '{}'", field, escape_quotes(v.as_ref())))
            .collect();

        match clauses.len() {
            0 => None,
            1 => clauses.into_iter().next().map(Self::Formula),
            _ => Some(Self::Formula(format!("OR({})", clauses.join(",")))),
        }
    }

    /// Open or closed date range over `field`; `None` when both ends are absent.
    pub fn date_range(field: &str, start: Option<&str>, end: Option<&str>) -> Option<Self> {
        let mut clauses = Vec::new();
        if let Some(start) = start {
            clauses.push(format!("IS_AFTER({{{}}}, '{}')", field, escape_quotes(start)));
        }
        if let Some(end) = end {
            clauses.push(format!("IS_BEFORE({{{}}}, '{}')", field, escape_quotes(end)));
        }

        match clauses.len() {
            0 => None,
            1 => clauses.into_iter().next().map(Self::Formula),
            _ => Some(Self::Formula(format!("AND({})", clauses.join(", ")))),
        }
    }

    /// Case-insensitive substring search across `fields`; `None` for a blank query.
    pub fn search(query: &str, fields: &[&str]) -> Option<Self> {
        let query = query.trim();
        if query.is_empty() || fields.is_empty() {
            return None;
        }
        let escaped = escape_quotes(query);
        let clauses: Vec<String> = fields
            .iter()
            .map(|f| format!("FIND(LOWER('{}'), LOWER({{{}}})) > 0", escaped, f))
            .collect();
        Some(Self::Formula(format!("OR({})", clauses.join(", "))))
    }
}

/// Escape a value for a single-quoted formula string. Backslashes go first
/// so a trailing `\` cannot swallow the closing quote.
fn escape_quotes(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Identity of one cached collection: table + filter + sort + page size.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryDescriptor {
    pub table: String,
    #[serde(default)]
    pub filter: FilterExpr,
    #[serde(default)]
    pub sort: Vec<SortSpec>,
    #[serde(default)]
    pub page_size: Option<u32>,
}

impl QueryDescriptor {
    /// Unfiltered, unsorted view of `table`.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: FilterExpr::All,
            sort: Vec::new(),
            page_size: None,
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: FilterExpr) -> Self {
        self.filter = filter;
        self
    }

    #[must_use]
    pub fn sorted_by(mut self, sort: SortSpec) -> Self {
        self.sort.push(sort);
        self
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Parameters for the remote `list` call.
    #[must_use]
    pub fn list_params(&self) -> ListParams {
        ListParams {
            filter_by_formula: self.filter.as_formula().map(str::to_string),
            sort: self.sort.clone(),
            page_size: self.page_size,
            ..Default::default()
        }
    }

    /// Index at which `record` belongs in `records` under this descriptor's
    /// sort. Unsorted views insert at the head; ties go after existing equals.
    #[must_use]
    pub fn insertion_index(&self, records: &[Record], record: &Record) -> usize {
        if self.sort.is_empty() {
            return 0;
        }
        records
            .iter()
            .position(|existing| compare_records(existing, record, &self.sort) == Ordering::Greater)
            .unwrap_or(records.len())
    }
}

/// Remote `list` parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListParams {
    pub filter_by_formula: Option<String>,
    pub sort: Vec<SortSpec>,
    pub page_size: Option<u32>,
    pub max_records: Option<u32>,
    pub view: Option<String>,
    pub fields: Vec<String>,
}

/// Compare two records under a multi-key sort. Missing fields sort as null.
#[must_use]
pub fn compare_records(a: &Record, b: &Record, sort: &[SortSpec]) -> Ordering {
    for spec in sort {
        let ord = compare_values(
            a.field(&spec.field).unwrap_or(&Value::Null),
            b.field(&spec.field).unwrap_or(&Value::Null),
        );
        let ord = match spec.direction {
            SortDirection::Asc => ord,
            SortDirection::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values: null < bool < number < string < array < object.
#[must_use]
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(_), Value::Object(_)) => a.to_string().cmp(&b.to_string()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn rec(id: &str, fields: Value) -> Record {
        Record::new(id, fields.as_object().cloned().unwrap())
    }

    #[test]
    fn test_structurally_equal_descriptors_hash_equal() {
        let a = QueryDescriptor::table("leads")
            .with_filter(FilterExpr::formula("{Stage} = 'new'"))
            .sorted_by(SortSpec::desc("Created"));
        let b = QueryDescriptor::table("leads")
            .with_filter(FilterExpr::formula("{Stage} = 'new'"))
            .sorted_by(SortSpec::desc("Created"));
        let c = QueryDescriptor::table("leads");

        let set: HashSet<_> = [a.clone(), b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&a));
    }

    #[test]
    fn test_any_of_filter() {
        assert_eq!(FilterExpr::any_of("Stage", Vec::<&str>::new()), None);
        assert_eq!(
            FilterExpr::any_of("Stage", ["new", ""]),
            Some(FilterExpr::formula("{Stage} = 'new'"))
        );
        assert_eq!(
            FilterExpr::any_of("Name", ["a", "O'Brien"]),
            Some(FilterExpr::formula("OR({Name} = 'a',{Name} = 'O\\'Brien')"))
        );
    }

    #[test]
    fn test_backslashes_are_escaped_before_quotes() {
        assert_eq!(
            FilterExpr::any_of("Path", ["C:\\dir\\"]),
            Some(FilterExpr::formula("{Path} = 'C:\\\\dir\\\\'"))
        );
        assert_eq!(
            FilterExpr::search("a\\'b", &["Name"]),
            Some(FilterExpr::formula("OR(FIND(LOWER('a\\\\\\'b'), LOWER({Name})) > 0)"))
        );
    }

    #[test]
    fn test_date_range_filter() {
        assert_eq!(FilterExpr::date_range("Date", None, None), None);
        assert_eq!(
            FilterExpr::date_range("Date", Some("2024-01-01"), None),
            Some(FilterExpr::formula("IS_AFTER({Date}, '2024-01-01')"))
        );
        assert_eq!(
            FilterExpr::date_range("Date", Some("2024-01-01"), Some("2024-02-01")),
            Some(FilterExpr::formula(
                "AND(IS_AFTER({Date}, '2024-01-01'), IS_BEFORE({Date}, '2024-02-01'))"
            ))
        );
    }

    #[test]
    fn test_search_filter() {
        assert_eq!(FilterExpr::search("   ", &["Name"]), None);
        assert_eq!(
            FilterExpr::search("ada", &["Name", "Email"]),
            Some(FilterExpr::formula(
                "OR(FIND(LOWER('ada'), LOWER({Name})) > 0, FIND(LOWER('ada'), LOWER({Email})) > 0)"
            ))
        );
    }

    #[test]
    fn test_unsorted_inserts_at_head() {
        let descriptor = QueryDescriptor::table("leads");
        let records = vec![rec("a", json!({})), rec("b", json!({}))];
        assert_eq!(descriptor.insertion_index(&records, &rec("c", json!({}))), 0);
    }

    #[test]
    fn test_sorted_insert_position() {
        let asc = QueryDescriptor::table("leads").sorted_by(SortSpec::asc("Name"));
        let records = vec![
            rec("1", json!({"Name": "Ann"})),
            rec("2", json!({"Name": "Bob"})),
            rec("3", json!({"Name": "Cy"})),
        ];
        assert_eq!(asc.insertion_index(&records, &rec("x", json!({"Name": "Bea"}))), 1);
        // ties go after existing equals
        assert_eq!(asc.insertion_index(&records, &rec("x", json!({"Name": "Bob"}))), 2);
        assert_eq!(asc.insertion_index(&records, &rec("x", json!({"Name": "Zed"}))), 3);

        let desc = QueryDescriptor::table("leads").sorted_by(SortSpec::desc("Score"));
        let records = vec![rec("1", json!({"Score": 9})), rec("2", json!({"Score": 3}))];
        assert_eq!(desc.insertion_index(&records, &rec("x", json!({"Score": 5}))), 1);
    }

    #[test]
    fn test_value_ordering_across_types() {
        assert_eq!(compare_values(&Value::Null, &json!(false)), Ordering::Less);
        assert_eq!(compare_values(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(compare_values(&json!(1.5), &json!("a")), Ordering::Less);
        assert_eq!(compare_values(&json!([1, 2]), &json!([1, 2, 0])), Ordering::Less);
    }

    #[test]
    fn test_list_params_from_descriptor() {
        let params = QueryDescriptor::table("orders")
            .with_filter(FilterExpr::formula("{Paid}"))
            .sorted_by(SortSpec::asc("Date"))
            .with_page_size(50)
            .list_params();

        assert_eq!(params.filter_by_formula.as_deref(), Some("{Paid}"));
        assert_eq!(params.sort, vec![SortSpec::asc("Date")]);
        assert_eq!(params.page_size, Some(50));
    }
}
