// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic sync manager.
//!
//! Keeps registered targets fresh by calling their [`Refresh`] on a timer.
//!
//! # Trigger gating
//!
//! | Trigger            | manager enabled | visible | breaker | in flight |
//! |--------------------|-----------------|---------|---------|-----------|
//! | timer tick         | required        | required| admit   | skip      |
//! | hidden → visible   | required        | -       | admit   | skip      |
//! | offline → online   | required        | -       | admit   | skip      |
//! | [`SyncManager::sync_all`] | -        | -       | admit   | skip      |
//!
//! Refreshes are spawned, so a slow target never delays another. Each target
//! has its own [`TargetBreaker`](crate::resilience::circuit_breaker::TargetBreaker):
//! three consecutive failures skip the target for the cooldown, after which
//! the next trigger re-enables it with a clean error count.

pub mod target;

pub use target::{BoxError, Refresh, StoreRefresh, SyncEvent, TargetStats};

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::RecordSyncConfig;
use crate::resilience::circuit_breaker::{Admission, BreakerConfig};
use target::TargetState;

const EVENT_CAPACITY: usize = 256;

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Default period for targets without an override
    pub interval: Duration,
    /// When false no timers run
    pub enabled: bool,
    pub breaker: BreakerConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            enabled: true,
            breaker: BreakerConfig::default(),
        }
    }
}

impl From<&RecordSyncConfig> for SyncConfig {
    fn from(config: &RecordSyncConfig) -> Self {
        Self {
            interval: config.sync_interval(),
            enabled: config.sync_enabled,
            breaker: config.breaker_config(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Tick,
    Visible,
    Online,
    Manual,
}

impl Trigger {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Tick => "tick",
            Self::Visible => "visible",
            Self::Online => "online",
            Self::Manual => "manual",
        }
    }
}

struct Settings {
    interval: Duration,
    enabled: bool,
}

struct ManagerInner {
    targets: DashMap<String, Arc<TargetState>>,
    settings: RwLock<Settings>,
    breaker: BreakerConfig,
    visible: AtomicBool,
    online: AtomicBool,
    events: broadcast::Sender<SyncEvent>,
}

/// Owns all sync targets and their timers.
///
/// Dropping the manager stops every timer. Must be used inside a Tokio
/// runtime.
pub struct SyncManager {
    inner: Arc<ManagerInner>,
}

impl SyncManager {
    pub fn new(config: SyncConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ManagerInner {
                targets: DashMap::new(),
                settings: RwLock::new(Settings {
                    interval: config.interval,
                    enabled: config.enabled,
                }),
                breaker: config.breaker,
                visible: AtomicBool::new(true),
                online: AtomicBool::new(true),
                events,
            }),
        }
    }

    pub fn from_config(config: &RecordSyncConfig) -> Self {
        Self::new(SyncConfig::from(config))
    }

    /// Register (or replace) a target. Its first tick fires one interval
    /// from now; `interval` overrides the global period for this target.
    /// A zero period registers the target without a timer.
    pub fn register_target(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
        refresh: Arc<dyn Refresh>,
        interval: Option<Duration>,
    ) {
        let id = id.into();
        let name = name.into();
        info!(target_id = %id, name = %name, "Registering sync target");

        let state = Arc::new(TargetState::new(
            id.clone(),
            name,
            refresh,
            interval,
            self.inner.breaker.clone(),
        ));
        if let Some(previous) = self.inner.targets.insert(id, state.clone()) {
            previous.stop_timer();
        }
        if self.inner.settings.read().enabled {
            self.inner.start_timer(&state);
        }
        crate::metrics::set_sync_targets(self.inner.targets.len());
    }

    /// Stop and forget a target. Returns false if it was not registered.
    pub fn unregister_target(&self, id: &str) -> bool {
        let removed = self.inner.targets.remove(id);
        crate::metrics::set_sync_targets(self.inner.targets.len());
        match removed {
            Some((_, state)) => {
                state.stop_timer();
                info!(target_id = %id, "Unregistered sync target");
                true
            }
            None => false,
        }
    }

    /// Replace the global interval and pause or resume every timer.
    /// Running timers restart with the new period; a zero interval stops
    /// the timers of targets without an override.
    pub fn configure(&self, interval: Duration, enabled: bool) {
        {
            let mut settings = self.inner.settings.write();
            settings.interval = interval;
            settings.enabled = enabled;
        }
        info!(interval_secs = interval.as_secs_f64(), enabled, "Sync configuration updated");

        for state in self.inner.snapshot() {
            if enabled {
                self.inner.start_timer(&state);
            } else {
                state.stop_timer();
            }
        }
    }

    /// Resume all timers with the current interval.
    pub fn start_all(&self) {
        let interval = self.interval();
        self.configure(interval, true);
    }

    /// Stop all timers; targets stay registered.
    pub fn stop_all(&self) {
        let interval = self.interval();
        self.configure(interval, false);
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.inner.settings.read().interval
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.settings.read().enabled
    }

    /// Report environment visibility. Becoming visible refreshes every
    /// admitted target immediately; while hidden, ticks are skipped.
    pub fn set_visible(&self, visible: bool) {
        let was_visible = self.inner.visible.swap(visible, Ordering::AcqRel);
        if visible && !was_visible {
            info!("Became visible, refreshing all targets");
            if self.is_enabled() {
                self.inner.trigger_all(Trigger::Visible);
            }
        } else if !visible && was_visible {
            debug!("Hidden, suspending periodic refresh");
        }
    }

    #[must_use]
    pub fn is_visible(&self) -> bool {
        self.inner.visible.load(Ordering::Acquire)
    }

    /// Report connectivity. Coming back online refreshes every admitted
    /// target immediately; going offline changes nothing else.
    pub fn set_online(&self, online: bool) {
        let was_online = self.inner.online.swap(online, Ordering::AcqRel);
        if online && !was_online {
            info!("Network restored, refreshing all targets");
            if self.is_enabled() {
                self.inner.trigger_all(Trigger::Online);
            }
        } else if !online && was_online {
            info!("Network lost");
        }
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::Acquire)
    }

    /// Refresh every admitted target now and wait for all of them.
    /// Returns how many refreshes ran.
    pub async fn sync_all(&self) -> usize {
        let handles = self.inner.trigger_all(Trigger::Manual);
        let ran = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Sync refresh task failed");
            }
        }
        ran
    }

    /// Per-target statistics, ordered by id.
    #[must_use]
    pub fn stats(&self) -> Vec<TargetStats> {
        let mut stats: Vec<_> = self.inner.snapshot().iter().map(|s| s.stats()).collect();
        stats.sort_by(|a, b| a.id.cmp(&b.id));
        stats
    }

    #[must_use]
    pub fn target_count(&self) -> usize {
        self.inner.targets.len()
    }

    /// Receive success, failure and circuit events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Stop all timers and drop every target.
    pub fn shutdown(&self) {
        info!(targets = self.inner.targets.len(), "Shutting down sync manager");
        for state in self.inner.snapshot() {
            state.stop_timer();
        }
        self.inner.targets.clear();
        crate::metrics::set_sync_targets(0);
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        for state in self.inner.snapshot() {
            state.stop_timer();
        }
    }
}

impl ManagerInner {
    fn snapshot(&self) -> Vec<Arc<TargetState>> {
        self.targets.iter().map(|e| e.value().clone()).collect()
    }

    fn start_timer(self: &Arc<Self>, state: &Arc<TargetState>) {
        let period = state.interval.unwrap_or(self.settings.read().interval);
        if period.is_zero() {
            // a zero period means no timer; other triggers still apply
            warn!(target_id = %state.id, "Sync interval is zero, periodic refresh disabled");
            state.stop_timer();
            return;
        }
        debug!(target_id = %state.id, period_secs = period.as_secs_f64(), "Starting sync timer");
        let handle = tokio::spawn(run_timer(Arc::downgrade(self), state.clone(), period));
        state.set_timer(handle);
    }

    fn trigger_all(self: &Arc<Self>, trigger: Trigger) -> Vec<JoinHandle<()>> {
        self.snapshot()
            .iter()
            .filter_map(|state| self.trigger(state, trigger))
            .collect()
    }

    /// Gate one trigger and spawn the refresh if it passes.
    fn trigger(self: &Arc<Self>, state: &Arc<TargetState>, trigger: Trigger) -> Option<JoinHandle<()>> {
        if trigger == Trigger::Tick && !self.visible.load(Ordering::Acquire) {
            debug!(target_id = %state.id, "Skipping tick while hidden");
            crate::metrics::record_sync_run(&state.name, "skipped");
            return None;
        }

        match state.breaker.admit() {
            Admission::Rejected => {
                debug!(target_id = %state.id, trigger = trigger.as_str(), "Target cooling down, skipped");
                crate::metrics::record_sync_run(&state.name, "skipped");
                return None;
            }
            Admission::Allowed { recovered: true } => {
                info!(target_id = %state.id, name = %state.name, "Re-enabled target after cooldown");
                self.emit(SyncEvent::CircuitClosed {
                    id: state.id.clone(),
                    name: state.name.clone(),
                });
            }
            Admission::Allowed { recovered: false } => {}
        }

        let Some(slot) = state.try_begin() else {
            debug!(target_id = %state.id, "Refresh already in flight, skipped");
            crate::metrics::record_sync_run(&state.name, "skipped");
            return None;
        };

        let manager = self.clone();
        let state = state.clone();
        Some(tokio::spawn(async move {
            let _slot = slot;
            manager.run_refresh(&state, trigger).await;
        }))
    }

    async fn run_refresh(&self, state: &TargetState, trigger: Trigger) {
        let started = Instant::now();
        debug!(target_id = %state.id, trigger = trigger.as_str(), "Refreshing target");
        let result = state.refresh.refresh(true).await;
        let duration = started.elapsed();

        match result {
            Ok(()) => {
                state.breaker.record_success();
                state.mark_synced();
                crate::metrics::record_sync_run(&state.name, "success");
                debug!(target_id = %state.id, duration_ms = duration.as_millis() as u64, "Target synced");
                self.emit(SyncEvent::Succeeded {
                    id: state.id.clone(),
                    name: state.name.clone(),
                    duration,
                });
            }
            Err(e) => {
                let tripped = state.breaker.record_failure();
                crate::metrics::record_sync_run(&state.name, "failure");
                warn!(
                    target_id = %state.id,
                    errors = state.breaker.consecutive_errors(),
                    error = %e,
                    "Target sync failed"
                );
                self.emit(SyncEvent::Failed {
                    id: state.id.clone(),
                    name: state.name.clone(),
                    error: e.to_string(),
                });
                if tripped {
                    self.emit(SyncEvent::CircuitOpened {
                        id: state.id.clone(),
                        name: state.name.clone(),
                    });
                }
            }
        }
    }

    fn emit(&self, event: SyncEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }
}

async fn run_timer(manager: Weak<ManagerInner>, state: Arc<TargetState>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.trigger(&state, Trigger::Tick);
    }
}
