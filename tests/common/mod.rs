// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared helpers for integration tests.
//!
//! - [`FailingTable`]: wraps any [`RemoteTable`], injecting scripted errors
//!   and delays per operation and logging every call.
//! - [`ScriptedTransport`]: a [`Transport`] that replays canned responses and
//!   records what was sent, for exercising the client without sockets.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use record_sync::{
    Fields, HttpRequest, HttpResponse, ListParams, Record, RemoteError, RemoteTable, Transport,
};

pub fn fields(value: Value) -> Fields {
    value.as_object().cloned().unwrap_or_default()
}

pub fn rec(id: &str, value: Value) -> Record {
    Record::new(id, fields(value))
}

pub fn ids(records: &[Record]) -> Vec<String> {
    records.iter().map(|r| r.id.clone()).collect()
}

/// Install a test-writer subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

// =============================================================================
// FailingTable - precise error injection
// =============================================================================

/// One completed call against a [`FailingTable`].
#[derive(Debug, Clone)]
pub struct Call {
    pub op: &'static str,
    pub target: String,
    pub started: Instant,
    pub finished: Instant,
    pub ok: bool,
}

pub struct FailingTable<S: RemoteTable> {
    inner: S,
    /// Errors returned by the next calls of an operation, in order
    failures: Mutex<HashMap<&'static str, VecDeque<RemoteError>>>,
    /// Operations that fail every call
    permanent: Mutex<HashMap<&'static str, RemoteError>>,
    delays: Mutex<HashMap<&'static str, Duration>>,
    /// Held after the inner call, so the answer reflects earlier state
    response_delays: Mutex<HashMap<&'static str, Duration>>,
    calls: Mutex<Vec<Call>>,
}

impl<S: RemoteTable> FailingTable<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            failures: Mutex::new(HashMap::new()),
            permanent: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            response_delays: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Fail the next call of `op` with `error`.
    pub fn fail_next(&self, op: &'static str, error: RemoteError) {
        self.failures.lock().entry(op).or_default().push_back(error);
    }

    /// Fail every call of `op` until [`heal`](Self::heal).
    pub fn fail_always(&self, op: &'static str, error: RemoteError) {
        self.permanent.lock().insert(op, error);
    }

    pub fn heal(&self, op: &'static str) {
        self.permanent.lock().remove(op);
        self.failures.lock().remove(op);
    }

    /// Hold every call of `op` for `delay` before answering.
    pub fn delay(&self, op: &'static str, delay: Duration) {
        self.delays.lock().insert(op, delay);
    }

    /// Run every call of `op` immediately but hold its answer for `delay`.
    pub fn delay_response(&self, op: &'static str, delay: Duration) {
        self.response_delays.lock().insert(op, delay);
    }

    pub fn clear_delays(&self, op: &'static str) {
        self.delays.lock().remove(op);
        self.response_delays.lock().remove(op);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.op == op).count()
    }

    async fn run<T, F>(&self, op: &'static str, target: &str, call: F) -> Result<T, RemoteError>
    where
        F: Future<Output = Result<T, RemoteError>>,
    {
        let started = Instant::now();
        let delay = self.delays.lock().get(op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let injected = self
            .failures
            .lock()
            .get_mut(op)
            .and_then(VecDeque::pop_front)
            .or_else(|| self.permanent.lock().get(op).cloned());
        let result = match injected {
            Some(error) => Err(error),
            None => call.await,
        };

        let hold = self.response_delays.lock().get(op).copied();
        if let Some(hold) = hold {
            tokio::time::sleep(hold).await;
        }

        self.calls.lock().push(Call {
            op,
            target: target.to_string(),
            started,
            finished: Instant::now(),
            ok: result.is_ok(),
        });
        result
    }
}

#[async_trait]
impl<S: RemoteTable> RemoteTable for FailingTable<S> {
    async fn list(&self, table: &str, params: &ListParams) -> Result<Vec<Record>, RemoteError> {
        self.run("list", table, self.inner.list(table, params)).await
    }

    async fn get(&self, table: &str, id: &str) -> Result<Record, RemoteError> {
        self.run("get", id, self.inner.get(table, id)).await
    }

    async fn create(&self, table: &str, fields: &Fields) -> Result<Record, RemoteError> {
        self.run("create", table, self.inner.create(table, fields)).await
    }

    async fn update(&self, table: &str, id: &str, fields: &Fields) -> Result<Record, RemoteError> {
        self.run("update", id, self.inner.update(table, id, fields)).await
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError> {
        self.run("delete", id, self.inner.delete(table, id)).await
    }
}

// =============================================================================
// ScriptedTransport - canned HTTP exchanges
// =============================================================================

#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<HttpResponse, RemoteError>>>,
    requests: Mutex<Vec<(Instant, HttpRequest)>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, response: Result<HttpResponse, RemoteError>) -> &Self {
        self.script.lock().push_back(response);
        self
    }

    pub fn push_status(&self, status: u16, body: &str) -> &Self {
        self.push(Ok(HttpResponse::new(status, body)))
    }

    pub fn push_json(&self, body: Value) -> &Self {
        self.push(Ok(HttpResponse::ok_json(&body)))
    }

    /// One list page; `offset` is the cursor to the next page.
    pub fn push_page(&self, records: &[Record], offset: Option<&str>) -> &Self {
        let mut body = json!({ "records": records });
        if let Some(offset) = offset {
            body["offset"] = json!(offset);
        }
        self.push_json(body)
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn request_times(&self) -> Vec<Instant> {
        self.requests.lock().iter().map(|(at, _)| *at).collect()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, RemoteError> {
        self.requests.lock().push((Instant::now(), request.clone()));
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(RemoteError::Transport("script exhausted".into())))
    }
}
