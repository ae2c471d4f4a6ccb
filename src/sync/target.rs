// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync targets: the refresh seam and per-target state.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;

use crate::query::QueryDescriptor;
use crate::resilience::circuit_breaker::{BreakerConfig, CircuitState, TargetBreaker};
use crate::store::EntityStore;

/// Error type returned by refresh callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Something the sync manager can refresh.
///
/// Implemented for any `Fn(bool) -> impl Future<Output = Result<(), BoxError>>`,
/// so closures can be registered directly.
#[async_trait]
pub trait Refresh: Send + Sync {
    /// Reload data; `force` bypasses caches.
    async fn refresh(&self, force: bool) -> Result<(), BoxError>;
}

#[async_trait]
impl<F, Fut> Refresh for F
where
    F: Fn(bool) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    async fn refresh(&self, force: bool) -> Result<(), BoxError> {
        (self)(force).await
    }
}

/// Refreshes one or more store queries through [`EntityStore::fetch`].
pub struct StoreRefresh {
    store: EntityStore,
    descriptors: Vec<QueryDescriptor>,
}

impl StoreRefresh {
    pub fn new(store: EntityStore, descriptor: QueryDescriptor) -> Self {
        Self {
            store,
            descriptors: vec![descriptor],
        }
    }

    #[must_use]
    pub fn with_descriptor(mut self, descriptor: QueryDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    #[must_use]
    pub fn descriptors(&self) -> &[QueryDescriptor] {
        &self.descriptors
    }
}

#[async_trait]
impl Refresh for StoreRefresh {
    async fn refresh(&self, force: bool) -> Result<(), BoxError> {
        for descriptor in &self.descriptors {
            self.store.fetch(descriptor, force).await?;
        }
        Ok(())
    }
}

/// Notifications emitted by the sync manager.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Succeeded { id: String, name: String, duration: Duration },
    Failed { id: String, name: String, error: String },
    /// Consecutive failures disabled the target for the cooldown.
    CircuitOpened { id: String, name: String },
    /// Cooldown elapsed; the target runs again.
    CircuitClosed { id: String, name: String },
}

/// Point-in-time view of a target.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetStats {
    pub id: String,
    pub name: String,
    /// False while cooling down after consecutive failures
    pub enabled: bool,
    pub last_sync_at: Option<SystemTime>,
    pub consecutive_errors: u32,
    /// A timer is running for this target
    pub is_active: bool,
    pub state: CircuitState,
}

pub(crate) struct TargetState {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) refresh: Arc<dyn Refresh>,
    /// Per-target period; `None` follows the global interval
    pub(crate) interval: Option<Duration>,
    pub(crate) breaker: TargetBreaker,
    in_flight: AtomicBool,
    last_sync_at: Mutex<Option<SystemTime>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl TargetState {
    pub(crate) fn new(
        id: String,
        name: String,
        refresh: Arc<dyn Refresh>,
        interval: Option<Duration>,
        breaker: BreakerConfig,
    ) -> Self {
        Self {
            breaker: TargetBreaker::new(name.clone(), breaker),
            id,
            name,
            refresh,
            interval,
            in_flight: AtomicBool::new(false),
            last_sync_at: Mutex::new(None),
            timer: Mutex::new(None),
        }
    }

    /// Claim the single refresh slot. `None` if a refresh is already running.
    pub(crate) fn try_begin(self: &Arc<Self>) -> Option<InFlight> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight { target: self.clone() })
    }

    pub(crate) fn is_refreshing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn mark_synced(&self) {
        *self.last_sync_at.lock() = Some(SystemTime::now());
    }

    pub(crate) fn set_timer(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.timer.lock().replace(handle) {
            previous.abort();
        }
    }

    pub(crate) fn stop_timer(&self) -> bool {
        match self.timer.lock().take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub(crate) fn has_timer(&self) -> bool {
        self.timer.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    pub(crate) fn stats(&self) -> TargetStats {
        let state = self.breaker.state();
        TargetStats {
            id: self.id.clone(),
            name: self.name.clone(),
            enabled: state == CircuitState::Active,
            last_sync_at: *self.last_sync_at.lock(),
            consecutive_errors: self.breaker.consecutive_errors(),
            is_active: self.has_timer(),
            state,
        }
    }
}

/// Releases the refresh slot when dropped, including on panic.
pub(crate) struct InFlight {
    target: Arc<TargetState>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.target.in_flight.store(false, Ordering::Release);
    }
}
