// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Rate-limited, retrying client for the Remote Table API.
//!
//! Every request goes through the same pipeline:
//!
//! ```text
//! timeout( retry( rate_limit → transport.send → classify status ) )
//! ```
//!
//! - One [`RateLimiter`] per client, shared by all tables.
//! - 429 and transport failures back off 2s, 4s, 8s; other errors fail fast.
//! - The timeout bounds a single request including its retries; expiry is
//!   reported as a transport failure.
//! - `list` drains the `offset` cursor up to `max_pages` pages.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use super::transport::{HttpRequest, ReqwestTransport, Transport};
use super::wire;
use super::{RemoteError, RemoteTable};
use crate::config::RecordSyncConfig;
use crate::query::ListParams;
use crate::record::{Fields, Record};
use crate::resilience::rate_limiter::RateLimiter;
use crate::resilience::retry::{retry, RetryConfig};

pub struct RemoteClient<T: Transport = ReqwestTransport> {
    transport: T,
    limiter: RateLimiter,
    retry: RetryConfig,
    timeout: Duration,
    max_pages: usize,
}

impl RemoteClient<ReqwestTransport> {
    /// HTTP client built from configuration.
    pub fn from_config(config: &RecordSyncConfig) -> Result<Self, RemoteError> {
        Ok(Self::new(ReqwestTransport::new(config)?, config))
    }
}

impl<T: Transport> RemoteClient<T> {
    pub fn new(transport: T, config: &RecordSyncConfig) -> Self {
        Self {
            transport,
            limiter: RateLimiter::new(config.min_request_interval()),
            retry: config.retry_config(),
            timeout: config.request_timeout(),
            max_pages: config.max_pages.max(1),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    #[must_use]
    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.limiter = RateLimiter::new(min_interval);
        self
    }

    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    #[must_use]
    pub fn max_pages(&self) -> usize {
        self.max_pages
    }

    /// Issue one request with pacing, retry and the overall timeout.
    async fn execute(&self, operation: &'static str, request: HttpRequest) -> Result<String, RemoteError> {
        let started = Instant::now();
        let attempts = retry(operation, &self.retry, RemoteError::is_transient, || self.attempt(&request));

        let result = match tokio::time::timeout(self.timeout, attempts).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, timeout_ms = self.timeout.as_millis() as u64, "Remote request timed out");
                crate::metrics::record_timeout(operation);
                Err(RemoteError::Transport(format!(
                    "{} timed out after {:?}",
                    operation, self.timeout
                )))
            }
        };

        crate::metrics::record_latency(operation, started.elapsed());
        match &result {
            Ok(_) => crate::metrics::record_request(operation, "success"),
            Err(e) => crate::metrics::record_request(operation, e.kind()),
        }
        result
    }

    async fn attempt(&self, request: &HttpRequest) -> Result<String, RemoteError> {
        self.limiter.acquire().await;
        debug!(method = request.method.as_str(), path = ?request.path, "Sending remote request");

        let response = self.transport.send(request).await?;
        if (200..300).contains(&response.status) {
            Ok(response.body)
        } else {
            Err(RemoteError::from_status(response.status, response.body))
        }
    }

    fn decode<D: DeserializeOwned>(body: &str) -> Result<D, RemoteError> {
        serde_json::from_str(body).map_err(|e| RemoteError::Decode(e.to_string()))
    }

    fn first(records: Vec<Record>, operation: &str) -> Result<Record, RemoteError> {
        records
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::Decode(format!("{} response contained no records", operation)))
    }
}

#[async_trait]
impl<T: Transport> RemoteTable for RemoteClient<T> {
    /// Drain every page. The request timeout bounds each page on its own,
    /// so a long drain is limited by `max_pages` rather than by the timeout.
    #[instrument(skip(self, params), fields(pages = tracing::field::Empty))]
    async fn list(&self, table: &str, params: &ListParams) -> Result<Vec<Record>, RemoteError> {
        let mut records = Vec::new();
        let mut offset: Option<String> = None;
        let mut pages = 0usize;

        loop {
            if pages == self.max_pages {
                warn!(table, pages, "Pagination cap reached with more pages pending");
                return Err(RemoteError::PaginationExceeded { pages: self.max_pages });
            }

            let body = self
                .execute("list", wire::list_request(table, params, offset.as_deref()))
                .await?;
            let page: wire::ListPage = Self::decode(&body)?;
            pages += 1;
            records.extend(page.records);

            match page.offset {
                Some(next) if !next.is_empty() => offset = Some(next),
                _ => break,
            }
        }

        tracing::Span::current().record("pages", pages);
        crate::metrics::record_list_pages(pages);
        debug!(table, pages, records = records.len(), "Listed records");
        Ok(records)
    }

    #[instrument(skip(self))]
    async fn get(&self, table: &str, id: &str) -> Result<Record, RemoteError> {
        let body = self.execute("get", wire::get_request(table, id)).await?;
        Self::decode(&body)
    }

    #[instrument(skip(self, fields))]
    async fn create(&self, table: &str, fields: &Fields) -> Result<Record, RemoteError> {
        let body = self.execute("create", wire::create_request(table, fields)).await?;
        let envelope: wire::RecordsEnvelope = Self::decode(&body)?;
        Self::first(envelope.records, "create")
    }

    #[instrument(skip(self, fields))]
    async fn update(&self, table: &str, id: &str, fields: &Fields) -> Result<Record, RemoteError> {
        let body = self.execute("update", wire::update_request(table, id, fields)).await?;
        let envelope: wire::RecordsEnvelope = Self::decode(&body)?;
        Self::first(envelope.records, "update")
    }

    #[instrument(skip(self))]
    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError> {
        let body = self.execute("delete", wire::delete_request(table, id)).await?;
        let envelope: wire::DeleteEnvelope = Self::decode(&body)?;
        match envelope.records.iter().find(|r| r.id == id) {
            Some(r) if r.deleted => Ok(()),
            Some(_) => Err(RemoteError::Decode(format!("record {} reported as not deleted", id))),
            // Some deployments answer with an empty envelope; a 2xx is still a delete.
            None => Ok(()),
        }
    }
}
