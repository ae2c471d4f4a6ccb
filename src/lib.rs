// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Record Sync
//!
//! Client-side entity synchronization over a paginated remote record store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Periodic Sync Manager                     │
//! │  • Per-target timers, visibility and connectivity gating    │
//! │  • 3 consecutive failures → 120s cooldown per target        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ refresh(force = true)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Optimistic Entity Store                    │
//! │  • One cache entry per query descriptor                     │
//! │  • Optimistic create/update/delete with rollback            │
//! │  • Per-entity mutation serialization                        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Rate-Limited Remote Client                  │
//! │  • 200ms request pacing                                     │
//! │  • 2s/4s/8s backoff on 429 and transport errors             │
//! │  • Offset-cursor pagination, capped                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use record_sync::{
//!     EntityStore, QueryDescriptor, RecordSyncConfig, RemoteClient, SortSpec,
//!     StoreRefresh, SyncManager,
//! };
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RecordSyncConfig {
//!         base_url: "https://api.airtable.com/v0/appXXXXXXXX".into(),
//!         api_token: Some("pat-secret".into()),
//!         ..Default::default()
//!     };
//!
//!     let remote = Arc::new(RemoteClient::from_config(&config)?);
//!     let store = EntityStore::new(remote, &config);
//!
//!     let leads = QueryDescriptor::table("Leads").sorted_by(SortSpec::desc("Created"));
//!     let _subscription = store.subscribe(&leads);
//!     store.fetch(&leads, false).await?;
//!
//!     // Visible immediately; resolves when the server answers
//!     let created = store.create("Leads", json!({"Name": "Ada"}).as_object().cloned().unwrap_or_default());
//!     let record = created.wait().await?;
//!     println!("created {}", record.id);
//!
//!     let sync = SyncManager::from_config(&config);
//!     sync.register_target("leads", "Leads", Arc::new(StoreRefresh::new(store.clone(), leads)), None);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`remote`]: [`RemoteTable`] trait, HTTP [`RemoteClient`], in-memory [`MemoryTable`]
//! - [`store`]: [`EntityStore`], the optimistic cache
//! - [`sync`]: [`SyncManager`], the periodic refresher
//! - [`resilience`]: rate limiter, retry, per-target circuit breaker
//! - [`query`]: query descriptors, filters and sorting

pub mod config;
pub mod metrics;
pub mod query;
pub mod record;
pub mod remote;
pub mod resilience;
pub mod store;
pub mod sync;

pub use config::{RecordSyncConfig, RetrySettings};
pub use query::{FilterExpr, ListParams, QueryDescriptor, SortDirection, SortSpec};
pub use record::{Fields, Record, TempId};
pub use remote::{
    HttpRequest, HttpResponse, MemoryTable, Method, RemoteClient, RemoteError, RemoteTable,
    ReqwestTransport, Transport,
};
pub use resilience::circuit_breaker::{BreakerConfig, CircuitState};
pub use resilience::retry::RetryConfig;
pub use store::{
    CacheEntry, EntityStore, EntryState, FailedMutation, MutationHandle, MutationKind,
    MutationStatus, PendingMutation, RetriedMutation, StoreError, Subscription,
};
pub use sync::{BoxError, Refresh, StoreRefresh, SyncConfig, SyncEvent, SyncManager, TargetStats};
pub use metrics::LatencyTimer;
