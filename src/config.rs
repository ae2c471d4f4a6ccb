// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the record sync layer.
//!
//! # Example
//!
//! ```
//! use record_sync::RecordSyncConfig;
//!
//! // Minimal config (uses defaults)
//! let config = RecordSyncConfig::default();
//! assert_eq!(config.min_request_interval_ms, 200); // 5 req/s
//!
//! // Full config
//! let config = RecordSyncConfig {
//!     base_url: "https://api.airtable.com/v0/appXXXXXXXX".into(),
//!     api_token: Some("pat-secret".into()),
//!     max_pages: 200,
//!     sync_interval_secs: 60,
//!     ..Default::default()
//! };
//! assert_eq!(config.sync_interval().as_secs(), 60);
//! ```

use serde::Deserialize;
use std::time::Duration;

use crate::resilience::circuit_breaker::BreakerConfig;
use crate::resilience::retry::RetryConfig;
use crate::sync::SyncConfig;

/// Configuration for the remote client, entity store and sync manager.
///
/// All fields have sensible defaults. At minimum, configure `base_url` and
/// `api_token` for production use.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordSyncConfig {
    /// Base URL of the Remote Table API, without trailing slash
    /// (e.g., "https://api.airtable.com/v0/appXXXXXXXX")
    #[serde(default)]
    pub base_url: String,

    /// Bearer token sent with every request
    #[serde(default)]
    pub api_token: Option<String>,

    /// User-Agent header value
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Minimum spacing between two requests from one client (default: 200ms)
    #[serde(default = "default_min_request_interval_ms")]
    pub min_request_interval_ms: u64,

    /// Overall budget for one client call, including retries (default: 30s)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Safety cap on pages drained by a single `list` (default: 1000)
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,

    /// Backoff for 429 and transport failures
    #[serde(default)]
    pub retry: RetrySettings,

    /// Age after which a Fresh cache entry is served as Stale (default: 5 min)
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// How long a queued same-id mutation waits for its predecessor (default: 30s)
    #[serde(default = "default_mutation_queue_timeout_secs")]
    pub mutation_queue_timeout_secs: u64,

    /// Global tick interval for sync targets (default: 30s, 0 disables timers)
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// Whether periodic sync starts enabled
    #[serde(default = "default_sync_enabled")]
    pub sync_enabled: bool,

    /// Consecutive failures before a target cools down (default: 3)
    #[serde(default = "default_sync_failure_threshold")]
    pub sync_failure_threshold: u32,

    /// Cooldown of a tripped target (default: 120s)
    #[serde(default = "default_sync_cooldown_secs")]
    pub sync_cooldown_secs: u64,
}

/// Retry constants for the remote client.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_retry_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_retry_factor")]
    pub factor: f64,
    #[serde(default = "default_retry_max_retries")]
    pub max_retries: usize,
}

fn default_user_agent() -> String { format!("record-sync/{}", env!("CARGO_PKG_VERSION")) }
fn default_min_request_interval_ms() -> u64 { 200 }
fn default_request_timeout_secs() -> u64 { 30 }
fn default_max_pages() -> usize { 1000 }
fn default_cache_ttl_secs() -> u64 { 300 }
fn default_mutation_queue_timeout_secs() -> u64 { 30 }
fn default_sync_interval_secs() -> u64 { 30 }
fn default_sync_enabled() -> bool { true }
fn default_sync_failure_threshold() -> u32 { 3 }
fn default_sync_cooldown_secs() -> u64 { 120 }
fn default_retry_initial_delay_ms() -> u64 { 2000 }
fn default_retry_max_delay_ms() -> u64 { 8000 }
fn default_retry_factor() -> f64 { 2.0 }
fn default_retry_max_retries() -> usize { 3 }

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_retry_initial_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
            factor: default_retry_factor(),
            max_retries: default_retry_max_retries(),
        }
    }
}

impl Default for RecordSyncConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_token: None,
            user_agent: default_user_agent(),
            min_request_interval_ms: default_min_request_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            max_pages: default_max_pages(),
            retry: RetrySettings::default(),
            cache_ttl_secs: default_cache_ttl_secs(),
            mutation_queue_timeout_secs: default_mutation_queue_timeout_secs(),
            sync_interval_secs: default_sync_interval_secs(),
            sync_enabled: default_sync_enabled(),
            sync_failure_threshold: default_sync_failure_threshold(),
            sync_cooldown_secs: default_sync_cooldown_secs(),
        }
    }
}

impl RecordSyncConfig {
    #[must_use]
    pub fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval_ms)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    #[must_use]
    pub fn mutation_queue_timeout(&self) -> Duration {
        Duration::from_secs(self.mutation_queue_timeout_secs)
    }

    #[must_use]
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    /// Backoff schedule derived from [`RetrySettings`].
    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            factor: self.retry.factor,
            max_retries: Some(self.retry.max_retries),
        }
    }

    /// Per-target breaker derived from the sync settings.
    #[must_use]
    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.sync_failure_threshold,
            cooldown: Duration::from_secs(self.sync_cooldown_secs),
        }
    }

    /// Scheduler settings for [`SyncManager`](crate::SyncManager).
    #[must_use]
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig::from(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_remote_limits() {
        let config = RecordSyncConfig::default();
        assert_eq!(config.min_request_interval(), Duration::from_millis(200));
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_pages, 1000);
        assert_eq!(config.sync_interval(), Duration::from_secs(30));
        assert!(config.sync_enabled);
    }

    #[test]
    fn test_retry_config_is_two_four_eight() {
        let retry = RecordSyncConfig::default().retry_config();
        assert_eq!(retry.max_retries, Some(3));
        assert_eq!(retry.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_secs(8));
    }

    #[test]
    fn test_deserialize_partial_json() {
        let config: RecordSyncConfig = serde_json::from_str(
            r#"{"base_url": "http://localhost:9000", "sync_cooldown_secs": 10, "retry": {"max_retries": 1}}"#,
        )
        .unwrap();

        assert_eq!(config.base_url, "http://localhost:9000");
        assert_eq!(config.breaker_config().cooldown, Duration::from_secs(10));
        assert_eq!(config.breaker_config().failure_threshold, 3);
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.initial_delay_ms, 2000);
    }
}
