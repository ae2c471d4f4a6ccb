// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! JSON envelopes and query-string encoding of the Remote Table API.

use serde::Deserialize;
use serde_json::{json, Value};

use super::transport::{HttpRequest, Method};
use crate::query::ListParams;
use crate::record::{Fields, Record};

/// One page of `GET /{table}`.
#[derive(Debug, Deserialize)]
pub(crate) struct ListPage {
    #[serde(default)]
    pub records: Vec<Record>,
    #[serde(default)]
    pub offset: Option<String>,
}

/// `POST` / `PATCH` response.
#[derive(Debug, Deserialize)]
pub(crate) struct RecordsEnvelope {
    #[serde(default)]
    pub records: Vec<Record>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DeletedRecord {
    pub id: String,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DeleteEnvelope {
    #[serde(default)]
    pub records: Vec<DeletedRecord>,
}

pub(crate) fn list_query(params: &ListParams, offset: Option<&str>) -> Vec<(String, String)> {
    let mut query = Vec::new();

    if let Some(formula) = &params.filter_by_formula {
        query.push(("filterByFormula".to_string(), formula.clone()));
    }
    for (index, sort) in params.sort.iter().enumerate() {
        query.push((format!("sort[{}][field]", index), sort.field.clone()));
        query.push((format!("sort[{}][direction]", index), sort.direction.as_str().to_string()));
    }
    if let Some(page_size) = params.page_size {
        query.push(("pageSize".to_string(), page_size.to_string()));
    }
    if let Some(max_records) = params.max_records {
        query.push(("maxRecords".to_string(), max_records.to_string()));
    }
    if let Some(view) = &params.view {
        query.push(("view".to_string(), view.clone()));
    }
    for field in &params.fields {
        query.push(("fields[]".to_string(), field.clone()));
    }
    if let Some(offset) = offset {
        query.push(("offset".to_string(), offset.to_string()));
    }

    query
}

pub(crate) fn list_request(table: &str, params: &ListParams, offset: Option<&str>) -> HttpRequest {
    HttpRequest::new(Method::Get, vec![table.to_string()]).with_query(list_query(params, offset))
}

pub(crate) fn get_request(table: &str, id: &str) -> HttpRequest {
    HttpRequest::new(Method::Get, vec![table.to_string(), id.to_string()])
}

pub(crate) fn create_request(table: &str, fields: &Fields) -> HttpRequest {
    HttpRequest::new(Method::Post, vec![table.to_string()])
        .with_body(json!({ "records": [{ "fields": Value::Object(fields.clone()) }] }))
}

pub(crate) fn update_request(table: &str, id: &str, fields: &Fields) -> HttpRequest {
    HttpRequest::new(Method::Patch, vec![table.to_string()])
        .with_body(json!({ "records": [{ "id": id, "fields": Value::Object(fields.clone()) }] }))
}

pub(crate) fn delete_request(table: &str, id: &str) -> HttpRequest {
    HttpRequest::new(Method::Delete, vec![table.to_string()])
        .with_query(vec![("records[]".to_string(), id.to_string())])
}
