// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote Table API access.
//!
//! [`RemoteTable`] is the seam the entity store talks through. The HTTP
//! implementation is [`RemoteClient`], which paces, retries and paginates;
//! [`MemoryTable`] is an in-process stand-in for development and tests.

pub mod client;
pub mod memory;
pub mod transport;
mod wire;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::query::ListParams;
use crate::record::{Fields, Record};

pub use client::RemoteClient;
pub use memory::MemoryTable;
pub use transport::{HttpRequest, HttpResponse, Method, ReqwestTransport, Transport};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("unauthorized: check the API token")]
    Unauthorized,
    #[error("forbidden: insufficient permissions")]
    Forbidden,
    #[error("not found: table or record does not exist")]
    NotFound,
    #[error("invalid request: {body}")]
    InvalidRequest { body: String },
    #[error("rate limited: too many requests")]
    RateLimited,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("pagination exceeded the limit of {pages} pages")]
    PaginationExceeded { pages: usize },
    #[error("remote error {status}: {body}")]
    Remote { status: u16, body: String },
    #[error("malformed response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Classify a non-2xx response.
    #[must_use]
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            422 => Self::InvalidRequest { body },
            429 => Self::RateLimited,
            _ => Self::Remote { status, body },
        }
    }

    /// Errors worth retrying with backoff: 429 and transport failures.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Transport(_))
    }

    /// Short label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::RateLimited => "rate_limited",
            Self::Transport(_) => "transport",
            Self::PaginationExceeded { .. } => "pagination_exceeded",
            Self::Remote { .. } => "remote",
            Self::Decode(_) => "decode",
        }
    }
}

/// CRUD over a paginated remote record store.
#[async_trait]
pub trait RemoteTable: Send + Sync {
    /// Every record matching `params`, across all pages.
    async fn list(&self, table: &str, params: &ListParams) -> Result<Vec<Record>, RemoteError>;
    async fn get(&self, table: &str, id: &str) -> Result<Record, RemoteError>;
    async fn create(&self, table: &str, fields: &Fields) -> Result<Record, RemoteError>;
    async fn update(&self, table: &str, id: &str, fields: &Fields) -> Result<Record, RemoteError>;
    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError>;
}

#[async_trait]
impl<R: RemoteTable + ?Sized> RemoteTable for Arc<R> {
    async fn list(&self, table: &str, params: &ListParams) -> Result<Vec<Record>, RemoteError> {
        (**self).list(table, params).await
    }

    async fn get(&self, table: &str, id: &str) -> Result<Record, RemoteError> {
        (**self).get(table, id).await
    }

    async fn create(&self, table: &str, fields: &Fields) -> Result<Record, RemoteError> {
        (**self).create(table, fields).await
    }

    async fn update(&self, table: &str, id: &str, fields: &Fields) -> Result<Record, RemoteError> {
        (**self).update(table, id, fields).await
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError> {
        (**self).delete(table, id).await
    }
}
